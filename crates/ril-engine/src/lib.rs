//! # ril-engine
//!
//! Command/response correlation engine between telephony callers and a
//! capability-versioned, possibly unreliable radio transport.
//!
//! Every submitted operation gets a serial, a Work lease and a pending
//! record, then is routed to the highest call variant the negotiated
//! capability (and any compat override) allows. Exactly one of three paths
//! retires it: a response, a bounded-wait timeout, or transport death. The
//! caller's completion sink fires exactly once either way.
//!
//! ## Crate structure
//!
//! - [`serial`] — Epoch-tagged serial allocation
//! - [`lease`] — Two-class keep-awake lease with watchdogs
//! - [`table`] — Serial-keyed pending request table
//! - [`dispatch`] — Operation catalogue and versioned call variants
//! - [`version`] — Capability versions and compat overrides
//! - [`transport`] — Transport traits and the event queue
//! - [`engine`] — Connection-scoped engine, builder and event pump
//! - [`completion`] — Single-shot completion sinks
//! - [`timer`] — Timer worker for watchdogs, timeouts and reconnects
//! - [`stats`] — Latency histograms, client tracker, diagnostics snapshot
//! - [`metrics`] — Prometheus text rendering
//! - [`config`] — TOML configuration
//! - [`error`] — Caller error taxonomy and internal faults

pub mod completion;
pub mod config;
pub mod dispatch;
mod dispatcher;
pub mod engine;
pub mod error;
mod health;
pub mod lease;
pub mod metrics;
mod response;
pub mod serial;
pub mod stats;
pub mod table;
mod timeout;
pub mod timer;
pub mod transport;
pub mod version;

pub use completion::{Completion, CompletionSink};
pub use config::EngineConfig;
pub use dispatch::{BoundedWait, CallVariant, DispatchTable, OpCode, OperationSpec};
pub use engine::{Engine, EngineBuilder, SubmitOptions};
pub use error::{Outcome, RemoteCode, RilError};
pub use health::ConnectionState;
pub use lease::{AttributionKey, LeaseKind, ResourceLease, WakeSource};
pub use serial::Serial;
pub use stats::Diagnostics;
pub use transport::{
    Cookie, EventSender, IncomingResponse, Indication, IndicationKind, RadioTransport,
    ResponseKind, TransportCall, TransportConnector, TransportEvent, TransportFault, TransportLink,
};
pub use version::CapabilityVersion;
