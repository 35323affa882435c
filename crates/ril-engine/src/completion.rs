//! # Completion Sinks
//!
//! Every submitted operation carries exactly one [`CompletionSink`]. Firing it
//! consumes it, so a sink can be fulfilled at most once; the engine
//! guarantees it is fulfilled at least once. The sink is either a callback run
//! on whichever thread retires the request, or a single-slot channel the
//! caller can block on through [`Completion`].

use std::fmt;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::error::{Outcome, RilError};

enum SinkInner {
    Callback(Box<dyn FnOnce(Outcome) + Send>),
    Channel(Sender<Outcome>),
    Discard,
}

/// Single-shot continuation for one submitted operation.
pub struct CompletionSink {
    inner: SinkInner,
}

impl CompletionSink {
    /// Run `f` with the outcome.
    pub fn callback(f: impl FnOnce(Outcome) + Send + 'static) -> Self {
        CompletionSink {
            inner: SinkInner::Callback(Box::new(f)),
        }
    }

    /// A sink paired with a [`Completion`] the caller can wait on.
    pub fn channel() -> (Self, Completion) {
        let (tx, rx) = bounded(1);
        (
            CompletionSink {
                inner: SinkInner::Channel(tx),
            },
            Completion { rx },
        )
    }

    /// A sink for fire-and-forget callers.
    pub fn discard() -> Self {
        CompletionSink {
            inner: SinkInner::Discard,
        }
    }

    pub(crate) fn complete(self, outcome: Outcome) {
        match self.inner {
            SinkInner::Callback(f) => f(outcome),
            // The caller may have dropped its Completion; that is how interest
            // in a result is abandoned.
            SinkInner::Channel(tx) => {
                let _ = tx.try_send(outcome);
            }
            SinkInner::Discard => {}
        }
    }
}

impl fmt::Debug for CompletionSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.inner {
            SinkInner::Callback(_) => "callback",
            SinkInner::Channel(_) => "channel",
            SinkInner::Discard => "discard",
        };
        f.debug_struct("CompletionSink").field("kind", &kind).finish()
    }
}

/// Caller-side handle of a channel sink.
#[derive(Debug)]
pub struct Completion {
    rx: Receiver<Outcome>,
}

impl Completion {
    /// Block until the outcome arrives.
    ///
    /// A sink dropped unfired (engine torn down mid-flight) reads as
    /// [`RilError::TransportUnavailable`].
    pub fn wait(&self) -> Outcome {
        self.rx
            .recv()
            .unwrap_or(Err(RilError::TransportUnavailable))
    }

    /// Block for at most `timeout`. `None` means still pending.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Outcome> {
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(RilError::TransportUnavailable)),
        }
    }

    /// Non-blocking poll.
    pub fn try_get(&self) -> Option<Outcome> {
        match self.rx.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(RilError::TransportUnavailable)),
        }
    }
}
