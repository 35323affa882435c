//! # Response Processing
//!
//! | kind | table op | lease | sink |
//! |------|----------|-------|------|
//! | `AckOnly` | peek | request's Work lease, once | never |
//! | `Plain` | retire | Work lease if still held | once |
//! | `PlainWithAckRequested` | retire | Work lease, then Ack lease around the ack | once |
//!
//! A response whose request is already gone (answered, timed out, or drained
//! by a reset) is dropped with a warning and counted as a fault.

use tracing::{debug, info, warn};

use crate::dispatcher::Job;
use crate::error::{RemoteCode, RilError};
use crate::engine::EngineInner;
use crate::lease::{AttributionKey, LeaseKind};
use crate::stats::Fault;
use crate::table::PendingRequest;
use crate::transport::{Indication, IndicationKind, IncomingResponse, ResponseKind};

const ACK_ATTRIBUTION: &str = "transport-ack";

impl EngineInner {
    pub(crate) fn on_incoming(&self, response: IncomingResponse) {
        if response.code == RemoteCode::SYSTEM_ERR {
            self.stats.fault(Fault::SystemError);
        }
        match response.kind {
            ResponseKind::AckOnly => self.on_ack(response),
            ResponseKind::Plain | ResponseKind::PlainWithAckRequested => {
                self.on_response(response)
            }
        }
    }

    fn on_ack(&self, response: IncomingResponse) {
        let serial = response.serial;
        match self.table.peek(serial, |req| (req.op, req.lease.take())) {
            None => {
                self.stats.fault(Fault::UnexpectedAck);
                warn!(%serial, "ack for unknown or retired request, dropped");
            }
            Some((op, None)) => {
                debug!(%serial, %op, "duplicate ack ignored");
            }
            Some((op, Some(handle))) => {
                debug!(%serial, %op, "request acknowledged by transport");
                self.release_lease(&handle);
            }
        }
    }

    fn on_response(&self, response: IncomingResponse) {
        let serial = response.serial;
        let Some(mut req) = self.table.retire(serial) else {
            self.stats.fault(Fault::UnexpectedResponse);
            warn!(
                %serial,
                code = %response.code,
                kind = ?response.kind,
                "response for unknown or retired request, dropped"
            );
            return;
        };

        if let Some(id) = req.timeout_timer.take() {
            self.timers.cancel(id);
        }
        if let Some(handle) = req.lease.take() {
            self.release_lease(&handle);
        }
        self.stats.record_latency(req.op, req.submitted_at.elapsed());

        if response.kind == ResponseKind::PlainWithAckRequested {
            self.send_ack();
        }

        if response.code == RemoteCode::REQUEST_NOT_SUPPORTED {
            if let Some(req) = self.try_fallback(req) {
                self.finish(req, Err(RilError::Remote(response.code)));
            }
            return;
        }

        let outcome = if response.code.is_success() {
            Ok(response.payload)
        } else {
            Err(RilError::Remote(response.code))
        };
        self.finish(req, outcome);
    }

    /// Re-issue at the operation's fallback capability when it is below the
    /// one just rejected. Hands the request back if there is nothing to try.
    /// A bounded request whose window has already closed expires instead.
    fn try_fallback(&self, req: PendingRequest) -> Option<PendingRequest> {
        let fallback = self.dispatch.get(req.op).and_then(|spec| spec.fallback());
        let Some(fallback) = fallback.filter(|v| *v < req.version_used) else {
            return Some(req);
        };

        self.overrides.set(req.op, fallback);
        if req.bounded.is_some_and(|d| d.is_spent()) {
            debug!(
                serial = %req.serial,
                op = %req.op,
                "window closed before fallback, not retrying"
            );
            self.expire(req);
            return None;
        }

        info!(
            serial = %req.serial,
            op = %req.op,
            rejected = %req.version_used,
            %fallback,
            "request not supported, retrying at fallback capability"
        );
        self.stats.fallback();
        self.dispatch_job(Job::retry(req));
        None
    }

    pub(crate) fn on_indication(&self, indication: Indication) {
        self.stats.indication();
        debug!(code = indication.code, kind = ?indication.kind, "indication");
        if indication.kind == IndicationKind::UnsolicitedAckExpected {
            self.send_ack();
        }
        if let Some(listener) = &self.indications {
            listener(&indication);
        }
    }

    /// Emit a protocol acknowledgement under an Ack lease.
    pub(crate) fn send_ack(&self) {
        let Some(binding) = self.binding.load_full() else {
            debug!("no transport, ack not sent");
            return;
        };
        let handle = self
            .lease
            .acquire(LeaseKind::Ack, AttributionKey::from(ACK_ATTRIBUTION));
        match binding.transport.acknowledge() {
            Ok(()) => self.stats.ack_sent(),
            Err(fault) => {
                self.stats.fault(Fault::AckFailed);
                warn!(cookie = %binding.cookie, error = %fault, "failed to send ack");
            }
        }
        self.release_lease(&handle);
    }
}
