//! # Capability Versions
//!
//! A transport advertises a `major.minor` capability level once a handle is
//! acquired. Each operation may additionally carry a compat override pinning
//! it to an older level; the level actually used is the lower of the two.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use serde::{Serialize, Serializer};
use tracing::{info, warn};

use crate::dispatch::OpCode;
use crate::error::ConfigError;

/// Totally ordered `major.minor` capability level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CapabilityVersion {
    pub major: u16,
    pub minor: u16,
}

impl CapabilityVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        CapabilityVersion { major, minor }
    }

    /// Version used for a single call: the negotiated level, lowered by an
    /// override if one is present.
    pub fn effective(negotiated: Self, compat: Option<Self>) -> Self {
        match compat {
            Some(pinned) => negotiated.min(pinned),
            None => negotiated,
        }
    }
}

impl fmt::Display for CapabilityVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl FromStr for CapabilityVersion {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidVersion(s.to_string());
        let (major, minor) = s.trim().split_once('.').ok_or_else(invalid)?;
        Ok(CapabilityVersion {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
        })
    }
}

impl Serialize for CapabilityVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// ─── Compat Overrides ───────────────────────────────────────────────────────

/// Per-operation downgrade pins.
///
/// Overrides only ever move down: pinning an operation to a level equal to or
/// above its current pin is ignored.
#[derive(Debug, Default)]
pub struct CompatOverrides {
    pins: Mutex<HashMap<OpCode, CapabilityVersion>>,
}

impl CompatOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin `op` to `version`. Returns `false` if the request was ignored.
    pub fn set(&self, op: OpCode, version: CapabilityVersion) -> bool {
        let mut pins = self.pins.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = pins.get(&op) {
            if version >= *old {
                warn!(%op, %version, old = %old, "compat override not lowered, ignored");
                return false;
            }
        }
        info!(%op, %version, "compat override installed");
        pins.insert(op, version);
        true
    }

    pub fn get(&self, op: OpCode) -> Option<CapabilityVersion> {
        self.pins
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&op)
            .copied()
    }

    /// All pins, sorted by operation.
    pub fn snapshot(&self) -> Vec<(OpCode, CapabilityVersion)> {
        let pins = self.pins.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<_> = pins.iter().map(|(op, v)| (*op, *v)).collect();
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const V1_4: CapabilityVersion = CapabilityVersion::new(1, 4);
    const V1_6: CapabilityVersion = CapabilityVersion::new(1, 6);
    const V2_0: CapabilityVersion = CapabilityVersion::new(2, 0);

    #[test]
    fn ordering_is_major_then_minor() {
        assert!(V1_4 < V1_6);
        assert!(V1_6 < V2_0);
        assert!(CapabilityVersion::new(1, 10) > V1_6);
    }

    #[test]
    fn parse_and_display() {
        let v: CapabilityVersion = "2.1".parse().unwrap();
        assert_eq!(v, CapabilityVersion::new(2, 1));
        assert_eq!(v.to_string(), "2.1");
        assert!("2".parse::<CapabilityVersion>().is_err());
        assert!("a.b".parse::<CapabilityVersion>().is_err());
    }

    #[test]
    fn effective_takes_minimum() {
        assert_eq!(CapabilityVersion::effective(V2_0, None), V2_0);
        assert_eq!(CapabilityVersion::effective(V2_0, Some(V1_4)), V1_4);
        // An override above the negotiated level cannot raise it.
        assert_eq!(CapabilityVersion::effective(V1_4, Some(V2_0)), V1_4);
    }

    #[test]
    fn overrides_only_move_down() {
        let pins = CompatOverrides::new();
        let op = OpCode(20);
        assert!(pins.set(op, V1_6));
        assert!(!pins.set(op, V1_6), "equal pin is ignored");
        assert!(!pins.set(op, V2_0), "higher pin is ignored");
        assert_eq!(pins.get(op), Some(V1_6));
        assert!(pins.set(op, V1_4));
        assert_eq!(pins.get(op), Some(V1_4));
        assert_eq!(pins.get(OpCode(21)), None);
    }

    #[test]
    fn serializes_as_string() {
        assert_eq!(serde_json::to_string(&V1_6).unwrap(), "\"1.6\"");
    }
}
