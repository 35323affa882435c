//! # Bounded Waits
//!
//! Operations marked as bounded complete within their window even if the
//! transport never answers. When the window elapses first, the request is
//! retired here and the caller receives the operation's default payload, or
//! `TimedOut` when the operation has none.
//!
//! The deadline is fixed when the caller submits. A fallback retry only gets
//! what is left of it.

use tracing::info;

use crate::engine::EngineInner;
use crate::error::{Outcome, RilError};
use crate::serial::Serial;
use crate::table::{Deadline, PendingRequest};

impl EngineInner {
    pub(crate) fn arm_timeout(&self, serial: Serial, deadline: Deadline) {
        let this = self.this.clone();
        let id = self.timers.schedule(deadline.remaining(), move || {
            if let Some(inner) = this.upgrade() {
                inner.on_timeout(serial);
            }
        });
        // Already answered: nothing left to time out.
        if self
            .table
            .peek(serial, |req| req.timeout_timer = Some(id))
            .is_none()
        {
            self.timers.cancel(id);
        }
    }

    fn on_timeout(&self, serial: Serial) {
        let Some(mut req) = self.table.retire(serial) else {
            return;
        };
        req.timeout_timer = None;
        self.expire(req);
    }

    /// Complete a request whose window has closed.
    pub(crate) fn expire(&self, req: PendingRequest) {
        let window = req.bounded.map(|d| d.window).unwrap_or_default();
        let window_ms = window.as_millis() as u64;
        let default = self
            .dispatch
            .get(req.op)
            .and_then(|spec| spec.bounded())
            .and_then(|b| b.default.clone());
        let outcome: Outcome = match default {
            Some(payload) => {
                info!(
                    serial = %req.serial,
                    op = %req.op,
                    window_ms,
                    "window closed, delivering default"
                );
                Ok(payload)
            }
            None => {
                info!(serial = %req.serial, op = %req.op, window_ms, "window closed");
                Err(RilError::TimedOut(window))
            }
        };
        self.finish(req, outcome);
    }
}
