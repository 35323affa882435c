//! # Pending Request Table
//!
//! Serial-keyed map of every request the transport still owes an answer for.
//! Retirement is an atomic remove: whichever path removes a record owns it
//! and is the only one allowed to fire its completion sink. The response path,
//! the bounded-wait timer and transport-death recovery all go through
//! [`PendingRequestTable::retire`] or [`PendingRequestTable::drain_all`].

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use quanta::Instant;
use serde::Serialize;
use tracing::error;

use crate::completion::CompletionSink;
use crate::dispatch::OpCode;
use crate::error::TableError;
use crate::lease::{AttributionKey, LeaseHandle};
use crate::serial::Serial;
use crate::timer::TimerId;
use crate::transport::Cookie;
use crate::version::CapabilityVersion;

/// One outstanding operation.
#[derive(Debug)]
pub struct PendingRequest {
    pub serial: Serial,
    pub op: OpCode,
    /// Kept so a downgrade fallback can re-issue the call.
    pub params: Bytes,
    pub submitted_at: Instant,
    pub(crate) sink: CompletionSink,
    /// Work lease held for this request. Taken early by an `AckOnly` notice.
    pub lease: Option<LeaseHandle>,
    pub attribution: AttributionKey,
    pub version_used: CapabilityVersion,
    /// Number of times this request was re-issued at a lower capability.
    pub attempt: u8,
    /// Fixed at first submission and carried across fallback retries.
    pub bounded: Option<Deadline>,
    pub timeout_timer: Option<TimerId>,
    /// Connection the request was issued on.
    pub cookie: Cookie,
}

/// A bounded-wait window and the instant it runs out.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    pub window: Duration,
    pub at: Instant,
}

impl Deadline {
    pub fn starting_now(window: Duration) -> Self {
        Deadline {
            window,
            at: Instant::now() + window,
        }
    }

    /// Time left before the window closes, zero once it has.
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_spent(&self) -> bool {
        Instant::now() >= self.at
    }
}

impl PendingRequest {
    /// A fresh, unleased record submitted now.
    pub fn new(
        serial: Serial,
        op: OpCode,
        params: Bytes,
        sink: CompletionSink,
        attribution: AttributionKey,
        version_used: CapabilityVersion,
        cookie: Cookie,
    ) -> Self {
        PendingRequest {
            serial,
            op,
            params,
            submitted_at: Instant::now(),
            sink,
            lease: None,
            attribution,
            version_used,
            attempt: 0,
            bounded: None,
            timeout_timer: None,
            cookie,
        }
    }
}

/// Registration refused; the record is handed back so its sink can still be
/// completed.
#[derive(Debug)]
pub struct Rejected {
    pub error: TableError,
    pub request: Box<PendingRequest>,
}

/// Diagnostic view of one pending request.
#[derive(Debug, Clone, Serialize)]
pub struct PendingSummary {
    pub serial: Serial,
    pub op: OpCode,
    pub age_ms: u64,
    pub version_used: CapabilityVersion,
    pub attribution: String,
    pub acked: bool,
    pub attempt: u8,
}

#[derive(Debug, Default)]
pub struct PendingRequestTable {
    entries: Mutex<HashMap<Serial, PendingRequest>>,
}

impl PendingRequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Serial, PendingRequest>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, request: PendingRequest) -> Result<(), Rejected> {
        let mut entries = self.lock();
        if entries.contains_key(&request.serial) {
            error!(serial = %request.serial, op = %request.op, "duplicate serial registration");
            return Err(Rejected {
                error: TableError::DuplicateSerial(request.serial),
                request: Box::new(request),
            });
        }
        entries.insert(request.serial, request);
        Ok(())
    }

    /// Remove and return the record, or `None` if another path got there first.
    pub fn retire(&self, serial: Serial) -> Option<PendingRequest> {
        self.lock().remove(&serial)
    }

    /// Non-removing access for the ack-only path.
    pub fn peek<R>(&self, serial: Serial, f: impl FnOnce(&mut PendingRequest) -> R) -> Option<R> {
        self.lock().get_mut(&serial).map(f)
    }

    pub fn contains(&self, serial: Serial) -> bool {
        self.lock().contains_key(&serial)
    }

    /// Empty the table in one step.
    pub fn drain_all(&self) -> Vec<PendingRequest> {
        let mut drained: Vec<_> = self.lock().drain().map(|(_, req)| req).collect();
        drained.sort_by_key(|req| req.serial);
        drained
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Pending requests ordered by serial.
    pub fn snapshot(&self) -> Vec<PendingSummary> {
        let now = Instant::now();
        let mut out: Vec<_> = self
            .lock()
            .values()
            .map(|req| PendingSummary {
                serial: req.serial,
                op: req.op,
                age_ms: now.duration_since(req.submitted_at).as_millis() as u64,
                version_used: req.version_used,
                attribution: req.attribution.to_string(),
                acked: req.lease.is_none(),
                attempt: req.attempt,
            })
            .collect();
        out.sort_by_key(|s| s.serial);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn request(serial: u64) -> PendingRequest {
        PendingRequest::new(
            Serial(serial),
            OpCode(1),
            Bytes::new(),
            CompletionSink::discard(),
            AttributionKey::from("test"),
            CapabilityVersion::new(1, 0),
            Cookie(1),
        )
    }

    #[test]
    fn register_then_retire_once() {
        let table = PendingRequestTable::new();
        table.register(request(1)).unwrap();
        assert_eq!(table.len(), 1);
        assert!(table.retire(Serial(1)).is_some());
        assert!(table.retire(Serial(1)).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn duplicate_registration_hands_record_back() {
        let table = PendingRequestTable::new();
        table.register(request(5)).unwrap();
        let rejected = table.register(request(5)).unwrap_err();
        assert_eq!(rejected.error, TableError::DuplicateSerial(Serial(5)));
        assert_eq!(rejected.request.serial, Serial(5));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn peek_does_not_remove() {
        let table = PendingRequestTable::new();
        table.register(request(2)).unwrap();
        let op = table.peek(Serial(2), |req| req.op);
        assert_eq!(op, Some(OpCode(1)));
        assert!(table.contains(Serial(2)));
        assert!(table.peek(Serial(3), |_| ()).is_none());
    }

    #[test]
    fn drain_empties_in_serial_order() {
        let table = PendingRequestTable::new();
        for s in [3, 1, 2] {
            table.register(request(s)).unwrap();
        }
        let drained: Vec<_> = table.drain_all().into_iter().map(|r| r.serial.0).collect();
        assert_eq!(drained, vec![1, 2, 3]);
        assert!(table.is_empty());
        assert!(table.drain_all().is_empty());
    }

    #[test]
    fn concurrent_retire_has_one_winner() {
        let table = Arc::new(PendingRequestTable::new());
        for s in 0..200 {
            table.register(request(s)).unwrap();
        }
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let table = table.clone();
                thread::spawn(move || {
                    (0..200)
                        .filter(|s| table.retire(Serial(*s)).is_some())
                        .count()
                })
            })
            .collect();
        let total: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 200);
    }
}
