//! # Keep-Awake Leases
//!
//! Reference-counted accounting for the platform keep-awake resource, split
//! into two independent classes:
//!
//! - **Work**: held while at least one request is outstanding. Long
//!   watchdog (tens of seconds).
//! - **Ack**: held around emitting a protocol acknowledgement. Short
//!   watchdog (hundreds of milliseconds).
//!
//! Every acquisition pushes the class deadline out to `now + timeout`. One
//! timer per class chases that deadline: when it fires early it re-arms for
//! the remainder. A watchdog that reaches the deadline force-releases the
//! whole class and advances its generation;
//! handles minted before that point become stale and releasing them is a
//! silent no-op. Releasing a current-generation handle twice is a
//! [`LeaseError::DoubleRelease`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use compact_str::CompactString;
use quanta::Instant;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::error::LeaseError;
use crate::timer::{TimerId, TimerService};

/// Caller identity a lease hold is accounted to.
pub type AttributionKey = CompactString;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LeaseKind {
    Work,
    Ack,
}

/// Proof of one acquisition. Consumed logically by exactly one release.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaseHandle {
    kind: LeaseKind,
    id: u64,
    generation: u64,
}

impl LeaseHandle {
    pub fn kind(&self) -> LeaseKind {
        self.kind
    }
}

/// Platform hook for the physical keep-awake resource.
pub trait WakeSource: Send + Sync {
    /// The class went from zero holders to one.
    fn hold(&self, kind: LeaseKind);
    /// The class went back to zero holders.
    fn release(&self, kind: LeaseKind);
    /// The set of identities holding the class changed.
    fn attribute(&self, _kind: LeaseKind, _holders: &[AttributionKey]) {}
}

/// Wake source for hosts without power management.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWakeSource;

impl WakeSource for NoopWakeSource {
    fn hold(&self, _kind: LeaseKind) {}
    fn release(&self, _kind: LeaseKind) {}
}

/// Watchdog timeouts per class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseTimeouts {
    pub work: Duration,
    pub ack: Duration,
}

impl Default for LeaseTimeouts {
    fn default() -> Self {
        LeaseTimeouts {
            work: Duration::from_secs(60),
            ack: Duration::from_millis(200),
        }
    }
}

/// Point-in-time view of one lease class.
#[derive(Debug, Clone, Serialize)]
pub struct LeaseSnapshot {
    pub kind: LeaseKind,
    pub hold_count: usize,
    pub held: bool,
    pub generation: u64,
    pub attribution: Vec<(String, usize)>,
    pub acquired_total: u64,
    pub watchdog_fires: u64,
}

#[derive(Default)]
struct ClassState {
    live: HashMap<u64, AttributionKey>,
    attribution: HashMap<AttributionKey, usize>,
    held: bool,
    generation: u64,
    watchdog_seq: u64,
    watchdog: Option<TimerId>,
    expires_at: Option<Instant>,
    acquired_total: u64,
    watchdog_fires: u64,
}

impl ClassState {
    fn hold_count(&self) -> usize {
        self.live.len()
    }

    fn holders(&self) -> Vec<AttributionKey> {
        let mut keys: Vec<_> = self.attribution.keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// The two-class keep-awake lease.
pub struct ResourceLease {
    work: Mutex<ClassState>,
    ack: Mutex<ClassState>,
    next_id: AtomicU64,
    timeouts: LeaseTimeouts,
    wake: Arc<dyn WakeSource>,
    timers: Arc<TimerService>,
    this: Weak<ResourceLease>,
}

impl ResourceLease {
    pub fn new(
        timeouts: LeaseTimeouts,
        wake: Arc<dyn WakeSource>,
        timers: Arc<TimerService>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| ResourceLease {
            work: Mutex::new(ClassState::default()),
            ack: Mutex::new(ClassState::default()),
            next_id: AtomicU64::new(1),
            timeouts,
            wake,
            timers,
            this: this.clone(),
        })
    }

    fn class(&self, kind: LeaseKind) -> std::sync::MutexGuard<'_, ClassState> {
        let lock = match kind {
            LeaseKind::Work => &self.work,
            LeaseKind::Ack => &self.ack,
        };
        lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn timeout_for(&self, kind: LeaseKind) -> Duration {
        match kind {
            LeaseKind::Work => self.timeouts.work,
            LeaseKind::Ack => self.timeouts.ack,
        }
    }

    /// Take one hold on `kind` on behalf of `key`, re-arming the watchdog.
    pub fn acquire(&self, kind: LeaseKind, key: AttributionKey) -> LeaseHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut state = self.class(kind);

        state.live.insert(id, key.clone());
        state.acquired_total += 1;
        let holders = state.attribution.entry(key).or_insert(0);
        *holders += 1;
        let new_holder = *holders == 1;

        if !state.held {
            state.held = true;
            self.wake.hold(kind);
        }
        if new_holder {
            self.wake.attribute(kind, &state.holders());
        }

        let timeout = self.timeout_for(kind);
        state.expires_at = Some(Instant::now() + timeout);
        if state.watchdog.is_none() {
            self.arm_watchdog(kind, &mut state, timeout);
        }

        LeaseHandle {
            kind,
            id,
            generation: state.generation,
        }
    }

    fn arm_watchdog(&self, kind: LeaseKind, state: &mut ClassState, delay: Duration) {
        state.watchdog_seq += 1;
        let seq = state.watchdog_seq;
        let this = self.this.clone();
        state.watchdog = Some(self.timers.schedule(delay, move || {
            if let Some(lease) = this.upgrade() {
                lease.on_watchdog(kind, seq);
            }
        }));
    }

    /// Give back one hold.
    ///
    /// A handle from before a watchdog expiry or a full reset is silently
    /// ignored: that event already released it.
    pub fn release(&self, handle: &LeaseHandle) -> Result<(), LeaseError> {
        let mut state = self.class(handle.kind);

        if handle.generation != state.generation {
            debug!(
                kind = ?handle.kind,
                id = handle.id,
                "stale lease handle, already force-released"
            );
            return Ok(());
        }

        let Some(key) = state.live.remove(&handle.id) else {
            error!(kind = ?handle.kind, id = handle.id, "lease handle released twice");
            return Err(LeaseError::DoubleRelease {
                kind: handle.kind,
                id: handle.id,
            });
        };

        let count = state.attribution.get(&key).copied().unwrap_or(0);
        if count > 1 {
            state.attribution.insert(key, count - 1);
        } else {
            state.attribution.remove(&key);
            self.wake.attribute(handle.kind, &state.holders());
        }

        if state.live.is_empty() {
            state.held = false;
            if let Some(id) = state.watchdog.take() {
                self.timers.cancel(id);
            }
            self.wake.release(handle.kind);
        }
        Ok(())
    }

    /// Zero both classes unconditionally. Idempotent.
    pub fn force_release_all(&self) {
        for kind in [LeaseKind::Work, LeaseKind::Ack] {
            let mut state = self.class(kind);
            if state.hold_count() > 0 {
                warn!(?kind, hold_count = state.hold_count(), "force-releasing lease");
            }
            self.clear(kind, &mut state);
        }
    }

    fn on_watchdog(&self, kind: LeaseKind, seq: u64) {
        let mut state = self.class(kind);
        if seq != state.watchdog_seq || state.watchdog.is_none() {
            return;
        }
        state.watchdog = None;
        if state.hold_count() == 0 {
            return;
        }
        // Acquired again since this timer was armed.
        let remaining = state
            .expires_at
            .map_or(Duration::ZERO, |at| at.saturating_duration_since(Instant::now()));
        if !remaining.is_zero() {
            self.arm_watchdog(kind, &mut state, remaining);
            return;
        }
        warn!(
            ?kind,
            hold_count = state.hold_count(),
            timeout_ms = self.timeout_for(kind).as_millis() as u64,
            "lease watchdog expired, forcing release"
        );
        state.watchdog_fires += 1;
        self.clear(kind, &mut state);
    }

    fn clear(&self, kind: LeaseKind, state: &mut ClassState) {
        if let Some(id) = state.watchdog.take() {
            self.timers.cancel(id);
        }
        if !state.live.is_empty() {
            state.live.clear();
            state.generation += 1;
        }
        if !state.attribution.is_empty() {
            state.attribution.clear();
            self.wake.attribute(kind, &[]);
        }
        if state.held {
            state.held = false;
            self.wake.release(kind);
        }
    }

    pub fn hold_count(&self, kind: LeaseKind) -> usize {
        self.class(kind).hold_count()
    }

    pub fn is_held(&self, kind: LeaseKind) -> bool {
        self.class(kind).held
    }

    /// Identities currently contributing to `kind`, sorted.
    pub fn holders(&self, kind: LeaseKind) -> Vec<AttributionKey> {
        self.class(kind).holders()
    }

    pub fn snapshot(&self, kind: LeaseKind) -> LeaseSnapshot {
        let state = self.class(kind);
        let mut attribution: Vec<(String, usize)> = state
            .attribution
            .iter()
            .map(|(k, n)| (k.to_string(), *n))
            .collect();
        attribution.sort();
        LeaseSnapshot {
            kind,
            hold_count: state.hold_count(),
            held: state.held,
            generation: state.generation,
            attribution,
            acquired_total: state.acquired_total,
            watchdog_fires: state.watchdog_fires,
        }
    }
}
