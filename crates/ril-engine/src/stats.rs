//! # Engine Statistics
//!
//! Counters and histograms the engine updates on its hot paths, plus the
//! serialisable [`Diagnostics`] snapshot assembled from them.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;

use crate::dispatch::OpCode;
use crate::error::{Outcome, RilError};
use crate::health::ConnectionState;
use crate::lease::{AttributionKey, LeaseKind, LeaseSnapshot};
use crate::table::PendingSummary;
use crate::transport::Cookie;
use crate::version::CapabilityVersion;

/// Upper bounds (inclusive, milliseconds) of the latency buckets. Anything
/// slower lands in the overflow bucket.
pub const LATENCY_BUCKETS_MS: [u64; 10] = [5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000];

// ─── Latency Histogram ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LatencyHistogram {
    pub count: u64,
    pub sum_ms: u64,
    pub min_ms: u64,
    pub max_ms: u64,
    /// One slot per entry of [`LATENCY_BUCKETS_MS`] plus a trailing overflow slot.
    pub buckets: Vec<u64>,
}

impl LatencyHistogram {
    pub fn new() -> Self {
        LatencyHistogram {
            buckets: vec![0; LATENCY_BUCKETS_MS.len() + 1],
            ..Default::default()
        }
    }

    pub fn record(&mut self, latency: Duration) {
        if self.buckets.len() != LATENCY_BUCKETS_MS.len() + 1 {
            self.buckets = vec![0; LATENCY_BUCKETS_MS.len() + 1];
        }
        let ms = latency.as_millis().min(u64::MAX as u128) as u64;
        let slot = LATENCY_BUCKETS_MS
            .iter()
            .position(|&bound| ms <= bound)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        self.buckets[slot] += 1;

        if self.count == 0 || ms < self.min_ms {
            self.min_ms = ms;
        }
        self.max_ms = self.max_ms.max(ms);
        self.sum_ms = self.sum_ms.saturating_add(ms);
        self.count += 1;
    }

    pub fn mean_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum_ms as f64 / self.count as f64
        }
    }
}

// ─── Outcomes & Faults ──────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct OutcomeCounters {
    ok: AtomicU64,
    not_supported: AtomicU64,
    transport_error: AtomicU64,
    transport_unavailable: AtomicU64,
    timed_out: AtomicU64,
    remote: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub ok: u64,
    pub not_supported: u64,
    pub transport_error: u64,
    pub transport_unavailable: u64,
    pub timed_out: u64,
    pub remote: u64,
}

impl OutcomeCounts {
    pub fn total(&self) -> u64 {
        self.ok
            + self.not_supported
            + self.transport_error
            + self.transport_unavailable
            + self.timed_out
            + self.remote
    }
}

/// Things that should not happen, or that indicate an unhealthy transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    DoubleRelease,
    DuplicateSerial,
    UnexpectedResponse,
    UnexpectedAck,
    StaleDeath,
    AckFailed,
    ReconnectFailed,
    /// The transport answered or acknowledged with `SYSTEM_ERR`.
    SystemError,
}

#[derive(Debug, Default)]
struct FaultCounters {
    double_release: AtomicU64,
    duplicate_serial: AtomicU64,
    unexpected_response: AtomicU64,
    unexpected_ack: AtomicU64,
    stale_death: AtomicU64,
    ack_failed: AtomicU64,
    reconnect_failed: AtomicU64,
    system_error: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FaultCounts {
    pub double_release: u64,
    pub duplicate_serial: u64,
    pub unexpected_response: u64,
    pub unexpected_ack: u64,
    pub stale_death: u64,
    pub ack_failed: u64,
    pub reconnect_failed: u64,
    pub system_error: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActivityCounts {
    pub submitted: u64,
    pub acks_sent: u64,
    pub indications: u64,
    pub fallbacks: u64,
    pub resets: u64,
    pub connects: u64,
}

#[derive(Debug, Default)]
struct ActivityCounters {
    submitted: AtomicU64,
    acks_sent: AtomicU64,
    indications: AtomicU64,
    fallbacks: AtomicU64,
    resets: AtomicU64,
    connects: AtomicU64,
}

/// Pending and completed request counts for one caller identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClientStats {
    pub pending: u64,
    pub completed: u64,
}

/// Shared, lock-light statistics for one engine.
#[derive(Debug, Default)]
pub struct EngineStats {
    outcomes: OutcomeCounters,
    faults: FaultCounters,
    activity: ActivityCounters,
    latency: Mutex<BTreeMap<OpCode, LatencyHistogram>>,
    clients: Mutex<BTreeMap<AttributionKey, ClientStats>>,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn submitted(&self, client: &AttributionKey) {
        self.activity.submitted.fetch_add(1, Ordering::Relaxed);
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        clients.entry(client.clone()).or_default().pending += 1;
    }

    pub(crate) fn completed(&self, client: &AttributionKey, outcome: &Outcome) {
        let counter = match outcome {
            Ok(_) => &self.outcomes.ok,
            Err(RilError::NotSupported { .. }) => &self.outcomes.not_supported,
            Err(RilError::TransportError(_)) => &self.outcomes.transport_error,
            Err(RilError::TransportUnavailable) => &self.outcomes.transport_unavailable,
            Err(RilError::TimedOut(_)) => &self.outcomes.timed_out,
            Err(RilError::Remote(_)) => &self.outcomes.remote,
        };
        counter.fetch_add(1, Ordering::Relaxed);

        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
        let entry = clients.entry(client.clone()).or_default();
        entry.pending = entry.pending.saturating_sub(1);
        entry.completed += 1;
    }

    pub(crate) fn record_latency(&self, op: OpCode, latency: Duration) {
        let mut latency_map = self.latency.lock().unwrap_or_else(|e| e.into_inner());
        latency_map
            .entry(op)
            .or_insert_with(LatencyHistogram::new)
            .record(latency);
    }

    pub(crate) fn fault(&self, fault: Fault) {
        let counter = match fault {
            Fault::DoubleRelease => &self.faults.double_release,
            Fault::DuplicateSerial => &self.faults.duplicate_serial,
            Fault::UnexpectedResponse => &self.faults.unexpected_response,
            Fault::UnexpectedAck => &self.faults.unexpected_ack,
            Fault::StaleDeath => &self.faults.stale_death,
            Fault::AckFailed => &self.faults.ack_failed,
            Fault::ReconnectFailed => &self.faults.reconnect_failed,
            Fault::SystemError => &self.faults.system_error,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn ack_sent(&self) {
        self.activity.acks_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn indication(&self) {
        self.activity.indications.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn fallback(&self) {
        self.activity.fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reset(&self) {
        self.activity.resets.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connected(&self) {
        self.activity.connects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn outcomes(&self) -> OutcomeCounts {
        let o = &self.outcomes;
        OutcomeCounts {
            ok: o.ok.load(Ordering::Relaxed),
            not_supported: o.not_supported.load(Ordering::Relaxed),
            transport_error: o.transport_error.load(Ordering::Relaxed),
            transport_unavailable: o.transport_unavailable.load(Ordering::Relaxed),
            timed_out: o.timed_out.load(Ordering::Relaxed),
            remote: o.remote.load(Ordering::Relaxed),
        }
    }

    pub fn faults(&self) -> FaultCounts {
        let f = &self.faults;
        FaultCounts {
            double_release: f.double_release.load(Ordering::Relaxed),
            duplicate_serial: f.duplicate_serial.load(Ordering::Relaxed),
            unexpected_response: f.unexpected_response.load(Ordering::Relaxed),
            unexpected_ack: f.unexpected_ack.load(Ordering::Relaxed),
            stale_death: f.stale_death.load(Ordering::Relaxed),
            ack_failed: f.ack_failed.load(Ordering::Relaxed),
            reconnect_failed: f.reconnect_failed.load(Ordering::Relaxed),
            system_error: f.system_error.load(Ordering::Relaxed),
        }
    }

    pub fn activity(&self) -> ActivityCounts {
        let a = &self.activity;
        ActivityCounts {
            submitted: a.submitted.load(Ordering::Relaxed),
            acks_sent: a.acks_sent.load(Ordering::Relaxed),
            indications: a.indications.load(Ordering::Relaxed),
            fallbacks: a.fallbacks.load(Ordering::Relaxed),
            resets: a.resets.load(Ordering::Relaxed),
            connects: a.connects.load(Ordering::Relaxed),
        }
    }

    pub fn latency(&self) -> BTreeMap<OpCode, LatencyHistogram> {
        self.latency
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn clients(&self) -> BTreeMap<AttributionKey, ClientStats> {
        self.clients
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

// ─── Anomalies ──────────────────────────────────────────────────────────────

/// Counts at which a cumulative counter is reported as an anomaly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnomalyThresholds {
    /// Work lease watchdog expiries. Each one means the transport sat on
    /// every outstanding request for a full lease timeout.
    pub work_watchdog: u64,
    /// Responses or acks carrying `SYSTEM_ERR`.
    pub system_error: u64,
}

impl Default for AnomalyThresholds {
    fn default() -> Self {
        AnomalyThresholds {
            work_watchdog: 10,
            system_error: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    WorkWatchdog,
    SystemError,
    /// Lease or serial accounting broke. Any occurrence is reported.
    Accounting,
}

impl AnomalyKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AnomalyKind::WorkWatchdog => "work_watchdog",
            AnomalyKind::SystemError => "system_error",
            AnomalyKind::Accounting => "accounting",
        }
    }
}

/// A counter at or past its threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Anomaly {
    pub kind: AnomalyKind,
    pub count: u64,
    pub threshold: u64,
}

/// Compare the cumulative counters against their thresholds.
pub fn detect_anomalies(
    faults: &FaultCounts,
    leases: &[LeaseSnapshot],
    thresholds: &AnomalyThresholds,
) -> Vec<Anomaly> {
    let work_watchdog = leases
        .iter()
        .filter(|l| l.kind == LeaseKind::Work)
        .map(|l| l.watchdog_fires)
        .sum();
    let accounting = faults.double_release + faults.duplicate_serial;

    [
        (AnomalyKind::WorkWatchdog, work_watchdog, thresholds.work_watchdog),
        (AnomalyKind::SystemError, faults.system_error, thresholds.system_error),
        (AnomalyKind::Accounting, accounting, 1),
    ]
    .into_iter()
    .filter(|&(_, count, threshold)| count >= threshold.max(1))
    .map(|(kind, count, threshold)| Anomaly {
        kind,
        count,
        threshold,
    })
    .collect()
}

// ─── Diagnostics Snapshot ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct OpLatency {
    pub op: OpCode,
    pub name: &'static str,
    pub mean_ms: f64,
    #[serde(flatten)]
    pub histogram: LatencyHistogram,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientSnapshot {
    pub client: String,
    #[serde(flatten)]
    pub stats: ClientStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct OverrideSnapshot {
    pub op: OpCode,
    pub name: &'static str,
    pub version: CapabilityVersion,
}

/// Point-in-time dump of one engine.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub state: ConnectionState,
    pub negotiated_version: Option<CapabilityVersion>,
    pub cookie: Option<Cookie>,
    pub serial_epoch: u32,
    pub queued_events: usize,
    pub pending: Vec<PendingSummary>,
    pub leases: Vec<LeaseSnapshot>,
    pub latency: Vec<OpLatency>,
    pub clients: Vec<ClientSnapshot>,
    pub outcomes: OutcomeCounts,
    pub faults: FaultCounts,
    pub activity: ActivityCounts,
    pub overrides: Vec<OverrideSnapshot>,
    pub anomalies: Vec<Anomaly>,
}

impl Diagnostics {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn histogram_buckets_and_extremes() {
        let mut h = LatencyHistogram::new();
        h.record(Duration::from_millis(3));
        h.record(Duration::from_millis(40));
        h.record(Duration::from_secs(9));

        assert_eq!(h.count, 3);
        assert_eq!(h.min_ms, 3);
        assert_eq!(h.max_ms, 9000);
        assert_eq!(h.buckets[0], 1, "<=5ms");
        assert_eq!(h.buckets[3], 1, "<=50ms");
        assert_eq!(h.buckets[LATENCY_BUCKETS_MS.len()], 1, "overflow");
        assert!((h.mean_ms() - 3014.333).abs() < 0.01);
    }

    #[test]
    fn empty_histogram_mean_is_zero() {
        assert_eq!(LatencyHistogram::new().mean_ms(), 0.0);
    }

    #[test]
    fn client_tracker_moves_pending_to_completed() {
        let stats = EngineStats::new();
        let sms = AttributionKey::from("sms");
        stats.submitted(&sms);
        stats.submitted(&sms);
        stats.completed(&sms, &Ok(Bytes::new()));

        let clients = stats.clients();
        assert_eq!(
            clients[&sms],
            ClientStats {
                pending: 1,
                completed: 1
            }
        );
        assert_eq!(stats.activity().submitted, 2);
    }

    #[test]
    fn outcomes_count_by_kind() {
        let stats = EngineStats::new();
        let key = AttributionKey::from("x");
        stats.completed(&key, &Err(RilError::TransportUnavailable));
        stats.completed(&key, &Err(RilError::TimedOut(Duration::from_millis(5))));
        stats.completed(&key, &Ok(Bytes::new()));
        let o = stats.outcomes();
        assert_eq!(o.transport_unavailable, 1);
        assert_eq!(o.timed_out, 1);
        assert_eq!(o.ok, 1);
        assert_eq!(o.total(), 3);
    }

    #[test]
    fn faults_are_counted() {
        let stats = EngineStats::new();
        stats.fault(Fault::UnexpectedResponse);
        stats.fault(Fault::UnexpectedResponse);
        stats.fault(Fault::StaleDeath);
        let f = stats.faults();
        assert_eq!(f.unexpected_response, 2);
        assert_eq!(f.stale_death, 1);
        assert_eq!(f.double_release, 0);
    }

    fn work_lease(watchdog_fires: u64) -> LeaseSnapshot {
        LeaseSnapshot {
            kind: LeaseKind::Work,
            hold_count: 0,
            held: false,
            generation: watchdog_fires,
            attribution: Vec::new(),
            acquired_total: 0,
            watchdog_fires,
        }
    }

    #[test]
    fn anomalies_appear_only_at_threshold() {
        let thresholds = AnomalyThresholds {
            work_watchdog: 3,
            system_error: 5,
        };
        let mut faults = FaultCounts {
            system_error: 4,
            ..Default::default()
        };
        assert!(detect_anomalies(&faults, &[work_lease(2)], &thresholds).is_empty());

        faults.system_error = 5;
        assert_eq!(
            detect_anomalies(&faults, &[work_lease(3)], &thresholds),
            vec![
                Anomaly {
                    kind: AnomalyKind::WorkWatchdog,
                    count: 3,
                    threshold: 3,
                },
                Anomaly {
                    kind: AnomalyKind::SystemError,
                    count: 5,
                    threshold: 5,
                },
            ]
        );
    }

    #[test]
    fn any_accounting_fault_is_an_anomaly() {
        let faults = FaultCounts {
            double_release: 1,
            ..Default::default()
        };
        let found = detect_anomalies(&faults, &[], &AnomalyThresholds::default());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].kind, AnomalyKind::Accounting);
        assert_eq!(found[0].kind.as_str(), "accounting");
    }

    #[test]
    fn ack_watchdog_is_not_counted() {
        let mut ack = work_lease(50);
        ack.kind = LeaseKind::Ack;
        let found = detect_anomalies(
            &FaultCounts::default(),
            &[work_lease(0), ack],
            &AnomalyThresholds::default(),
        );
        assert!(found.is_empty());
    }
}
