//! # Versioned Dispatch
//!
//! Submission path: resolve the effective capability, pick the call variant,
//! allocate a serial, take a Work lease, register, then call the transport.
//! The record is registered before the call so a response racing ahead of
//! the call's return still finds it.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, error, warn};

use crate::completion::CompletionSink;
use crate::dispatch::{CallVariant, OpCode};
use crate::engine::{EngineInner, SubmitOptions, DEFAULT_ATTRIBUTION};
use crate::error::RilError;
use crate::health::Binding;
use crate::lease::{AttributionKey, LeaseKind};
use crate::serial::Serial;
use crate::stats::Fault;
use crate::table::{Deadline, PendingRequest};
use crate::transport::TransportCall;
use crate::version::CapabilityVersion;

/// A request on its way to the transport, either freshly submitted or being
/// re-issued at a lower capability.
pub(crate) struct Job {
    pub op: OpCode,
    pub params: Bytes,
    pub sink: CompletionSink,
    pub attribution: AttributionKey,
    pub bounded: Option<Deadline>,
    pub attempt: u8,
}

impl Job {
    /// Rebuild a job from a retired record so it can be issued again.
    pub(crate) fn retry(req: PendingRequest) -> Self {
        Job {
            op: req.op,
            params: req.params,
            sink: req.sink,
            attribution: req.attribution,
            bounded: req.bounded,
            attempt: req.attempt.saturating_add(1),
        }
    }
}

impl EngineInner {
    pub(crate) fn submit(
        &self,
        op: OpCode,
        params: Bytes,
        sink: CompletionSink,
        options: SubmitOptions,
    ) -> Option<Serial> {
        let attribution = options
            .attribution
            .unwrap_or_else(|| AttributionKey::from(DEFAULT_ATTRIBUTION));
        self.stats.submitted(&attribution);

        let bounded = options.bounded_timeout.or_else(|| {
            self.dispatch
                .get(op)
                .and_then(|spec| spec.bounded())
                .map(|b| b.window.unwrap_or(self.config.blocking_response_timeout))
        });
        let bounded = bounded.map(Deadline::starting_now);

        self.dispatch_job(Job {
            op,
            params,
            sink,
            attribution,
            bounded,
            attempt: 0,
        })
    }

    pub(crate) fn dispatch_job(&self, job: Job) -> Option<Serial> {
        let Some(binding) = self.binding.load_full() else {
            debug!(op = %job.op, "no transport, failing fast");
            self.deliver(&job.attribution, job.sink, Err(RilError::TransportUnavailable));
            return None;
        };

        let negotiated = binding.version;
        let effective = CapabilityVersion::effective(negotiated, self.overrides.get(job.op));
        let resolved = self
            .dispatch
            .get(job.op)
            .and_then(|spec| spec.resolve(effective))
            .map(|(version, variant)| (version, variant.clone()));
        let Some((version, variant)) = resolved else {
            debug!(op = %job.op, %negotiated, %effective, "no variant at or below capability");
            self.deliver(
                &job.attribution,
                job.sink,
                Err(RilError::NotSupported {
                    op: job.op,
                    negotiated,
                }),
            );
            return None;
        };

        let serial = self.serials.next();
        let lease = self.lease.acquire(LeaseKind::Work, job.attribution.clone());
        let params = job.params.clone();
        let mut request = PendingRequest::new(
            serial,
            job.op,
            job.params,
            job.sink,
            job.attribution,
            version,
            binding.cookie,
        );
        request.lease = Some(lease);
        request.attempt = job.attempt;
        request.bounded = job.bounded;
        if let Err(rejected) = self.table.register(request) {
            self.stats.fault(Fault::DuplicateSerial);
            let req = *rejected.request;
            let message = rejected.error.to_string();
            self.finish(req, Err(RilError::TransportError(message)));
            return None;
        }

        if let Some(deadline) = job.bounded {
            self.arm_timeout(serial, deadline);
        }

        // A reset that ran between loading the binding and registering has
        // already drained the table; this record would never be answered.
        if self.current_cookie() != Some(binding.cookie) {
            if let Some(req) = self.table.retire(serial) {
                debug!(%serial, op = %req.op, "connection reset during submit");
                self.finish(req, Err(RilError::TransportUnavailable));
            }
            return Some(serial);
        }

        debug!(
            %serial,
            op = %job.op,
            %version,
            %negotiated,
            attempt = job.attempt,
            "dispatching"
        );
        self.invoke(&binding, &variant, serial, job.op, version, &params);
        Some(serial)
    }

    fn invoke(
        &self,
        binding: &Arc<Binding>,
        variant: &CallVariant,
        serial: Serial,
        op: OpCode,
        version: CapabilityVersion,
        params: &Bytes,
    ) {
        let call = TransportCall {
            serial,
            op,
            version,
            params,
        };
        let Err(fault) = variant.call(binding.transport.as_ref(), &call) else {
            return;
        };

        error!(%serial, %op, cookie = %binding.cookie, error = %fault, "transport call failed");
        if let Some(req) = self.table.retire(serial) {
            self.finish(req, Err(RilError::TransportError(fault.0)));
        } else {
            warn!(%serial, "failed request was already retired");
        }
        // A synchronous failure leaves the connection state unknown.
        self.reset_connection(binding.cookie, "synchronous transport failure");
    }
}
