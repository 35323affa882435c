//! # Dispatch Table
//!
//! Maps each operation to its capability-versioned call variants. The table is
//! built once at startup; adding a capability level for an operation is one
//! more [`OperationSpec::variant`] entry rather than another branch.
//!
//! Selection picks the highest variant at or below the effective version
//! (negotiated level lowered by any compat override). An operation whose
//! lowest variant is above the effective version is not supported.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use tracing::warn;

use crate::transport::{RadioTransport, TransportCall, TransportFault};
use crate::version::CapabilityVersion;

/// Operation identifier as understood by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct OpCode(pub u32);

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

type CallFn = dyn Fn(&dyn RadioTransport, &TransportCall<'_>) -> Result<(), TransportFault>
    + Send
    + Sync;

/// One versioned transport entry point.
#[derive(Clone)]
pub struct CallVariant(Arc<CallFn>);

impl CallVariant {
    pub fn new(
        f: impl Fn(&dyn RadioTransport, &TransportCall<'_>) -> Result<(), TransportFault>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        CallVariant(Arc::new(f))
    }

    /// Hands the call to the transport unchanged.
    pub fn passthrough() -> Self {
        CallVariant::new(|transport, call| transport.invoke(call))
    }

    pub(crate) fn call(
        &self,
        transport: &dyn RadioTransport,
        call: &TransportCall<'_>,
    ) -> Result<(), TransportFault> {
        (self.0)(transport, call)
    }
}

impl fmt::Debug for CallVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CallVariant")
    }
}

/// Bounded-wait policy for operations that must finish regardless of the
/// transport answering.
#[derive(Debug, Clone, Default)]
pub struct BoundedWait {
    /// Window length. `None` uses the engine's configured default.
    pub window: Option<Duration>,
    /// Payload delivered as a success when the window elapses. `None` means
    /// the caller receives `TimedOut` instead.
    pub default: Option<Bytes>,
}

/// Everything the engine knows about one operation.
#[derive(Debug, Clone)]
pub struct OperationSpec {
    pub op: OpCode,
    pub name: &'static str,
    variants: BTreeMap<CapabilityVersion, CallVariant>,
    bounded: Option<BoundedWait>,
    fallback: Option<CapabilityVersion>,
}

impl OperationSpec {
    pub fn new(op: OpCode, name: &'static str) -> Self {
        OperationSpec {
            op,
            name,
            variants: BTreeMap::new(),
            bounded: None,
            fallback: None,
        }
    }

    /// Register the entry point introduced at capability `version`.
    pub fn variant(mut self, version: CapabilityVersion, call: CallVariant) -> Self {
        self.variants.insert(version, call);
        self
    }

    /// Always complete within a bounded window.
    pub fn with_bounded_wait(mut self, bounded: BoundedWait) -> Self {
        self.bounded = Some(bounded);
        self
    }

    /// Version to retry at when the transport reports the request unsupported.
    pub fn with_fallback(mut self, version: CapabilityVersion) -> Self {
        self.fallback = Some(version);
        self
    }

    pub fn bounded(&self) -> Option<&BoundedWait> {
        self.bounded.as_ref()
    }

    pub fn fallback(&self) -> Option<CapabilityVersion> {
        self.fallback
    }

    /// Lowest capability this operation can run at.
    pub fn min_version(&self) -> Option<CapabilityVersion> {
        self.variants.keys().next().copied()
    }

    pub fn versions(&self) -> impl Iterator<Item = CapabilityVersion> + '_ {
        self.variants.keys().copied()
    }

    /// Highest variant at or below `effective`.
    pub fn resolve(
        &self,
        effective: CapabilityVersion,
    ) -> Option<(CapabilityVersion, &CallVariant)> {
        self.variants
            .range(..=effective)
            .next_back()
            .map(|(v, call)| (*v, call))
    }
}

/// All operations known to an engine.
#[derive(Debug, Clone, Default)]
pub struct DispatchTable {
    ops: HashMap<OpCode, OperationSpec>,
    by_name: HashMap<&'static str, OpCode>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, spec: OperationSpec) -> Self {
        self.insert(spec);
        self
    }

    pub fn insert(&mut self, spec: OperationSpec) {
        if spec.variants.is_empty() {
            warn!(op = %spec.op, name = spec.name, "operation registered without variants");
        }
        if let Some(old) = self.ops.get(&spec.op) {
            warn!(
                op = %spec.op,
                old = old.name,
                new = spec.name,
                "operation registered twice, replacing"
            );
            self.by_name.remove(old.name);
        }
        self.by_name.insert(spec.name, spec.op);
        self.ops.insert(spec.op, spec);
    }

    pub fn get(&self, op: OpCode) -> Option<&OperationSpec> {
        self.ops.get(&op)
    }

    pub fn lookup(&self, name: &str) -> Option<OpCode> {
        self.by_name.get(name).copied()
    }

    pub fn name_of(&self, op: OpCode) -> Option<&'static str> {
        self.ops.get(&op).map(|spec| spec.name)
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const V1: CapabilityVersion = CapabilityVersion::new(1, 0);
    const V2: CapabilityVersion = CapabilityVersion::new(2, 0);
    const V3: CapabilityVersion = CapabilityVersion::new(3, 0);

    fn three_level() -> OperationSpec {
        OperationSpec::new(OpCode(7), "query")
            .variant(V1, CallVariant::passthrough())
            .variant(V2, CallVariant::passthrough())
            .variant(V3, CallVariant::passthrough())
    }

    #[test]
    fn exact_version_wins() {
        let spec = three_level();
        assert_eq!(spec.resolve(V3).map(|(v, _)| v), Some(V3));
        assert_eq!(spec.resolve(V2).map(|(v, _)| v), Some(V2));
    }

    #[test]
    fn highest_below_when_no_exact_match() {
        let spec = OperationSpec::new(OpCode(7), "query")
            .variant(V1, CallVariant::passthrough())
            .variant(V3, CallVariant::passthrough());
        assert_eq!(spec.resolve(V2).map(|(v, _)| v), Some(V1));
        assert_eq!(
            spec.resolve(CapabilityVersion::new(9, 9)).map(|(v, _)| v),
            Some(V3)
        );
    }

    #[test]
    fn below_min_is_unsupported() {
        let spec = OperationSpec::new(OpCode(7), "query").variant(V2, CallVariant::passthrough());
        assert!(spec.resolve(V1).is_none());
        assert_eq!(spec.min_version(), Some(V2));
    }

    #[test]
    fn table_lookup_by_name() {
        let table = DispatchTable::new()
            .with(three_level())
            .with(OperationSpec::new(OpCode(8), "other").variant(V1, CallVariant::passthrough()));
        assert_eq!(table.len(), 2);
        assert_eq!(table.lookup("query"), Some(OpCode(7)));
        assert_eq!(table.name_of(OpCode(8)), Some("other"));
        assert!(table.lookup("missing").is_none());
    }

    #[test]
    fn reinsert_replaces_name() {
        let mut table = DispatchTable::new().with(three_level());
        table.insert(
            OperationSpec::new(OpCode(7), "renamed").variant(V1, CallVariant::passthrough()),
        );
        assert_eq!(table.len(), 1);
        assert!(table.lookup("query").is_none());
        assert_eq!(table.lookup("renamed"), Some(OpCode(7)));
    }

    #[test]
    fn opcode_display() {
        assert_eq!(OpCode(135).to_string(), "op#135");
    }
}
