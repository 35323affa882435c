//! # Transport Boundary
//!
//! The engine drives a [`RadioTransport`] and listens for [`TransportEvent`]s.
//! A transport is obtained through a [`TransportConnector`], which is handed
//! a [`TransportLink`] carrying the connection cookie and the event sender
//! the transport must use for everything it reports back.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use crossbeam_channel::Sender;
use serde::Serialize;
use thiserror::Error;

use crate::dispatch::OpCode;
use crate::error::RemoteCode;
use crate::serial::Serial;
use crate::version::CapabilityVersion;

/// Identifies one acquisition of a transport handle. Death notifications carry
/// the cookie of the handle that died.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Cookie(pub u64);

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One call handed to a transport entry point.
#[derive(Debug, Clone, Copy)]
pub struct TransportCall<'a> {
    pub serial: Serial,
    pub op: OpCode,
    pub version: CapabilityVersion,
    pub params: &'a Bytes,
}

/// Synchronous invocation failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct TransportFault(pub String);

impl TransportFault {
    pub fn new(msg: impl Into<String>) -> Self {
        TransportFault(msg.into())
    }
}

/// Capability-versioned lower-level interface.
pub trait RadioTransport: Send + Sync {
    /// Capability level this handle negotiated.
    fn capability(&self) -> CapabilityVersion;

    /// Issue one call. Responses arrive later as [`TransportEvent::Response`].
    fn invoke(&self, call: &TransportCall<'_>) -> Result<(), TransportFault>;

    /// Emit a protocol acknowledgement for a response or indication that
    /// asked for one.
    fn acknowledge(&self) -> Result<(), TransportFault>;
}

/// Everything a new transport handle needs from the engine.
#[derive(Debug, Clone)]
pub struct TransportLink {
    pub cookie: Cookie,
    pub events: EventSender,
}

/// Acquires transport handles, initially and after every death.
pub trait TransportConnector: Send + Sync {
    fn connect(&self, link: TransportLink) -> anyhow::Result<Arc<dyn RadioTransport>>;
}

// ─── Events ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ResponseKind {
    /// Final answer.
    Plain,
    /// The transport received the command; the answer is still to come.
    AckOnly,
    /// Final answer that must be acknowledged back.
    PlainWithAckRequested,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingResponse {
    pub serial: Serial,
    pub kind: ResponseKind,
    pub code: RemoteCode,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum IndicationKind {
    Unsolicited,
    UnsolicitedAckExpected,
}

/// Unsolicited report from the transport, not tied to any serial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Indication {
    pub code: u32,
    pub kind: IndicationKind,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Response(IncomingResponse),
    Indication(Indication),
    Died { cookie: Cookie },
}

/// Producer side of the engine's event queue.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: Sender<TransportEvent>,
}

impl EventSender {
    pub(crate) fn new(tx: Sender<TransportEvent>) -> Self {
        EventSender { tx }
    }

    /// Queue an event, blocking while the queue is full. Returns `false`
    /// once the engine has shut down.
    pub fn send(&self, event: TransportEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    /// Queue an event without blocking. Returns `false` when the queue is
    /// full or the engine has shut down.
    pub fn try_send(&self, event: TransportEvent) -> bool {
        self.tx.try_send(event).is_ok()
    }

    pub fn response(
        &self,
        serial: Serial,
        kind: ResponseKind,
        code: RemoteCode,
        payload: Bytes,
    ) -> bool {
        self.send(TransportEvent::Response(IncomingResponse {
            serial,
            kind,
            code,
            payload,
        }))
    }

    pub fn indication(&self, code: u32, kind: IndicationKind, payload: Bytes) -> bool {
        self.send(TransportEvent::Indication(Indication {
            code,
            kind,
            payload,
        }))
    }

    pub fn died(&self, cookie: Cookie) -> bool {
        self.send(TransportEvent::Died { cookie })
    }

    pub fn queued(&self) -> usize {
        self.tx.len()
    }
}
