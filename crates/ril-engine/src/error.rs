//! Error types.
//!
//! [`RilError`] is the terminal taxonomy delivered to callers through their
//! completion sink; it never crosses the submit boundary as a return value.
//! The remaining enums describe engine-internal faults and configuration
//! problems.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;

use crate::dispatch::OpCode;
use crate::lease::LeaseKind;
use crate::serial::Serial;
use crate::version::CapabilityVersion;

/// Status code reported by the transport alongside a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct RemoteCode(pub i32);

impl RemoteCode {
    pub const NONE: RemoteCode = RemoteCode(0);
    pub const RADIO_NOT_AVAILABLE: RemoteCode = RemoteCode(1);
    pub const GENERIC_FAILURE: RemoteCode = RemoteCode(2);
    pub const REQUEST_NOT_SUPPORTED: RemoteCode = RemoteCode(6);
    pub const SYSTEM_ERR: RemoteCode = RemoteCode(39);

    pub fn is_success(self) -> bool {
        self == Self::NONE
    }
}

impl fmt::Display for RemoteCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NONE => f.write_str("NONE"),
            Self::RADIO_NOT_AVAILABLE => f.write_str("RADIO_NOT_AVAILABLE"),
            Self::GENERIC_FAILURE => f.write_str("GENERIC_FAILURE"),
            Self::REQUEST_NOT_SUPPORTED => f.write_str("REQUEST_NOT_SUPPORTED"),
            Self::SYSTEM_ERR => f.write_str("SYSTEM_ERR"),
            RemoteCode(code) => write!(f, "{code}"),
        }
    }
}

/// Terminal outcome of a submitted operation, other than success.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RilError {
    /// The operation has no variant at or below the negotiated capability.
    #[error("{op} not supported at capability {negotiated}")]
    NotSupported {
        op: OpCode,
        negotiated: CapabilityVersion,
    },
    /// The transport call failed synchronously.
    #[error("transport invocation failed: {0}")]
    TransportError(String),
    /// No transport connection, or the connection died with the request in flight.
    #[error("transport unavailable")]
    TransportUnavailable,
    /// The bounded wait window elapsed without an answer.
    #[error("no response within {0:?}")]
    TimedOut(Duration),
    /// The transport answered with a failure code.
    #[error("remote error {0}")]
    Remote(RemoteCode),
}

/// What a completion sink receives.
pub type Outcome = Result<Bytes, RilError>;

// ─── Internal Faults ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LeaseError {
    #[error("{kind:?} lease handle #{id} released twice")]
    DoubleRelease { kind: LeaseKind, id: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TableError {
    #[error("serial {0} is already registered")]
    DuplicateSerial(Serial),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid config TOML: {0}")]
    Parse(String),
    #[error("unsupported config version {0}")]
    UnsupportedVersion(u32),
    #[error("invalid capability version {0:?}, expected MAJOR.MINOR")]
    InvalidVersion(String),
    #[error("compat override names unknown operation {0:?}")]
    UnknownOperation(String),
    #[error("failed to read config: {0}")]
    Io(String),
}
