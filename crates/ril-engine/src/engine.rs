//! # Engine
//!
//! One [`Engine`] owns everything scoped to a logical transport connection:
//! the serial allocator, the pending request table, the keep-awake lease,
//! the compat overrides and the timer worker. They are constructed together
//! by [`EngineBuilder::start`] and torn down together by [`Engine::shutdown`].
//!
//! Incoming transport events are processed by a dedicated pump thread in
//! arrival order. [`Engine::handle_event`] runs the same handlers inline for
//! transports that deliver on their own thread, and for tests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use tracing::{debug, error, info};

use crate::completion::{Completion, CompletionSink};
use crate::config::EngineConfig;
use crate::dispatch::{DispatchTable, OpCode};
use crate::error::{ConfigError, Outcome, RilError};
use crate::health::{Binding, ConnectionState};
use crate::lease::{
    AttributionKey, LeaseHandle, LeaseKind, NoopWakeSource, ResourceLease, WakeSource,
};
use crate::serial::{Serial, SerialAllocator};
use crate::stats::{
    detect_anomalies, ClientSnapshot, Diagnostics, EngineStats, Fault, OpLatency,
    OverrideSnapshot,
};
use crate::table::{PendingRequest, PendingRequestTable};
use crate::timer::TimerService;
use crate::transport::{
    Cookie, EventSender, Indication, IncomingResponse, TransportConnector, TransportEvent,
};
use crate::version::{CapabilityVersion, CompatOverrides};

const PUMP_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub(crate) const DEFAULT_ATTRIBUTION: &str = "unattributed";

/// Receives unsolicited indications after any requested ack has been sent.
pub type IndicationListener = Arc<dyn Fn(&Indication) + Send + Sync>;

/// Per-call options for [`Engine::submit`].
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Caller identity the work lease is accounted to.
    pub attribution: Option<AttributionKey>,
    /// Complete within this window even if the transport never answers.
    /// Overrides the operation's own bounded window.
    pub bounded_timeout: Option<Duration>,
}

impl SubmitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attributed_to(mut self, key: impl Into<AttributionKey>) -> Self {
        self.attribution = Some(key.into());
        self
    }

    pub fn bounded(mut self, window: Duration) -> Self {
        self.bounded_timeout = Some(window);
        self
    }
}

// ─── Builder ────────────────────────────────────────────────────────────────

pub struct EngineBuilder {
    name: String,
    config: EngineConfig,
    dispatch: DispatchTable,
    connector: Arc<dyn TransportConnector>,
    wake: Arc<dyn WakeSource>,
    indications: Option<IndicationListener>,
}

impl EngineBuilder {
    pub fn new(dispatch: DispatchTable, connector: Arc<dyn TransportConnector>) -> Self {
        EngineBuilder {
            name: "ril".into(),
            config: EngineConfig::default(),
            dispatch,
            connector,
            wake: Arc::new(NoopWakeSource),
            indications: None,
        }
    }

    /// Prefix for worker thread names.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn wake_source(mut self, wake: Arc<dyn WakeSource>) -> Self {
        self.wake = wake;
        self
    }

    pub fn on_indication(mut self, f: impl Fn(&Indication) + Send + Sync + 'static) -> Self {
        self.indications = Some(Arc::new(f));
        self
    }

    /// Spawn the worker threads and make the first connection attempt.
    ///
    /// A failed first attempt is not an error: the engine starts
    /// disconnected and keeps retrying every `reconnect_interval`.
    pub fn start(self) -> Result<Engine, ConfigError> {
        let overrides = CompatOverrides::new();
        for o in &self.config.overrides {
            let op = self
                .dispatch
                .lookup(&o.op)
                .ok_or_else(|| ConfigError::UnknownOperation(o.op.clone()))?;
            overrides.set(op, o.version);
        }

        let timers = Arc::new(TimerService::start(&format!("{}-timer", self.name)));
        let lease = ResourceLease::new(self.config.lease_timeouts(), self.wake, timers.clone());
        let (tx, rx) = bounded(self.config.event_queue_capacity);

        let inner = Arc::new_cyclic(|this| EngineInner {
            config: self.config,
            dispatch: self.dispatch,
            overrides,
            serials: SerialAllocator::new(),
            table: PendingRequestTable::new(),
            lease,
            timers,
            binding: ArcSwapOption::empty(),
            next_cookie: AtomicU64::new(1),
            connector: self.connector,
            events: EventSender::new(tx),
            stats: EngineStats::new(),
            indications: self.indications,
            reset_lock: Mutex::new(()),
            shutdown: AtomicBool::new(false),
            this: this.clone(),
        });

        let pump_inner = inner.clone();
        let pump = thread::Builder::new()
            .name(format!("{}-events", self.name))
            .spawn(move || event_pump(pump_inner, rx))
            .expect("failed to spawn event pump");

        inner.reconnect();

        Ok(Engine {
            inner,
            pump: Some(pump),
        })
    }
}

// ─── Shared State ───────────────────────────────────────────────────────────

pub(crate) struct EngineInner {
    pub(crate) config: EngineConfig,
    pub(crate) dispatch: DispatchTable,
    pub(crate) overrides: CompatOverrides,
    pub(crate) serials: SerialAllocator,
    pub(crate) table: PendingRequestTable,
    pub(crate) lease: Arc<ResourceLease>,
    pub(crate) timers: Arc<TimerService>,
    pub(crate) binding: ArcSwapOption<Binding>,
    pub(crate) next_cookie: AtomicU64,
    pub(crate) connector: Arc<dyn TransportConnector>,
    pub(crate) events: EventSender,
    pub(crate) stats: EngineStats,
    pub(crate) indications: Option<IndicationListener>,
    /// Serialises connect and reset so the binding only changes under it.
    pub(crate) reset_lock: Mutex<()>,
    pub(crate) shutdown: AtomicBool,
    pub(crate) this: Weak<EngineInner>,
}

impl EngineInner {
    pub(crate) fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Response(response) => self.on_incoming(response),
            TransportEvent::Indication(indication) => self.on_indication(indication),
            TransportEvent::Died { cookie } => self.on_transport_died(cookie),
        }
    }

    pub(crate) fn current_cookie(&self) -> Option<Cookie> {
        self.binding.load().as_ref().map(|b| b.cookie)
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Give back a lease handle, counting a double release as a fault.
    pub(crate) fn release_lease(&self, handle: &LeaseHandle) {
        if let Err(e) = self.lease.release(handle) {
            self.stats.fault(Fault::DoubleRelease);
            error!(error = %e, "lease accounting violated");
        }
    }

    /// Hand an outcome to the caller. Every sink passes through here.
    pub(crate) fn deliver(
        &self,
        attribution: &AttributionKey,
        sink: CompletionSink,
        outcome: Outcome,
    ) {
        self.stats.completed(attribution, &outcome);
        sink.complete(outcome);
    }

    /// Terminal step for a retired request: disarm its timer, release its
    /// lease, then fire its sink.
    pub(crate) fn finish(&self, mut req: PendingRequest, outcome: Outcome) {
        if let Some(id) = req.timeout_timer.take() {
            self.timers.cancel(id);
        }
        if let Some(handle) = req.lease.take() {
            self.release_lease(&handle);
        }
        debug!(
            serial = %req.serial,
            op = %req.op,
            ok = outcome.is_ok(),
            "request retired"
        );
        self.deliver(&req.attribution, req.sink, outcome);
    }

    pub(crate) fn connection_state(&self) -> ConnectionState {
        if self.is_shut_down() {
            return ConnectionState::ShutDown;
        }
        match self.binding.load().as_ref() {
            Some(b) => ConnectionState::Connected {
                version: b.version,
                cookie: b.cookie,
            },
            None => ConnectionState::Disconnected,
        }
    }

    fn diagnostics(&self) -> Diagnostics {
        let binding = self.binding.load_full();
        let latency = self
            .stats
            .latency()
            .into_iter()
            .map(|(op, histogram)| OpLatency {
                op,
                name: self.dispatch.name_of(op).unwrap_or("unknown"),
                mean_ms: histogram.mean_ms(),
                histogram,
            })
            .collect();
        let clients = self
            .stats
            .clients()
            .into_iter()
            .map(|(client, stats)| ClientSnapshot {
                client: client.to_string(),
                stats,
            })
            .collect();
        let overrides = self
            .overrides
            .snapshot()
            .into_iter()
            .map(|(op, version)| OverrideSnapshot {
                op,
                name: self.dispatch.name_of(op).unwrap_or("unknown"),
                version,
            })
            .collect();

        let leases = vec![
            self.lease.snapshot(LeaseKind::Work),
            self.lease.snapshot(LeaseKind::Ack),
        ];
        let faults = self.stats.faults();
        let anomalies = detect_anomalies(&faults, &leases, &self.config.anomaly_thresholds);

        Diagnostics {
            state: self.connection_state(),
            negotiated_version: binding.as_ref().map(|b| b.version),
            cookie: binding.as_ref().map(|b| b.cookie),
            serial_epoch: self.serials.current_epoch(),
            queued_events: self.events.queued(),
            pending: self.table.snapshot(),
            leases,
            latency,
            clients,
            outcomes: self.stats.outcomes(),
            faults,
            activity: self.stats.activity(),
            overrides,
            anomalies,
        }
    }

    fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained = {
            let _guard = self.reset_lock.lock().unwrap_or_else(|e| e.into_inner());
            self.binding.store(None);
            self.table.drain_all()
        };
        if !drained.is_empty() {
            info!(pending = drained.len(), "engine shutting down with requests in flight");
        }
        for req in drained {
            self.finish(req, Err(RilError::TransportUnavailable));
        }
        self.lease.force_release_all();
        self.timers.shutdown();
    }
}

fn event_pump(inner: Arc<EngineInner>, rx: Receiver<TransportEvent>) {
    while !inner.is_shut_down() {
        match rx.recv_timeout(PUMP_POLL_INTERVAL) {
            Ok(event) => inner.handle_event(event),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!(dropped = rx.len(), "event pump stopped");
}

// ─── Public Handle ──────────────────────────────────────────────────────────

/// Command/response correlation engine for one logical transport connection.
///
/// Dropping the engine shuts it down: every pending request completes with
/// `TransportUnavailable` and both worker threads are joined.
pub struct Engine {
    inner: Arc<EngineInner>,
    pump: Option<thread::JoinHandle<()>>,
}

impl Engine {
    pub fn builder(
        dispatch: DispatchTable,
        connector: Arc<dyn TransportConnector>,
    ) -> EngineBuilder {
        EngineBuilder::new(dispatch, connector)
    }

    /// Submit one operation. `sink` fires exactly once with the terminal
    /// outcome, possibly before this call returns.
    ///
    /// Returns the serial the request was issued under, or `None` when it
    /// never reached the transport (not supported, or no connection).
    pub fn submit(
        &self,
        op: OpCode,
        params: Bytes,
        sink: CompletionSink,
        options: SubmitOptions,
    ) -> Option<Serial> {
        self.inner.submit(op, params, sink, options)
    }

    /// [`submit`](Self::submit) with a channel sink the caller can wait on.
    pub fn call(
        &self,
        op: OpCode,
        params: Bytes,
        options: SubmitOptions,
    ) -> (Option<Serial>, Completion) {
        let (sink, completion) = CompletionSink::channel();
        let serial = self.submit(op, params, sink, options);
        (serial, completion)
    }

    /// Process one event on the calling thread.
    pub fn handle_event(&self, event: TransportEvent) {
        self.inner.handle_event(event);
    }

    pub fn on_incoming(&self, response: IncomingResponse) {
        self.inner.on_incoming(response);
    }

    pub fn on_transport_died(&self, cookie: Cookie) {
        self.inner.on_transport_died(cookie);
    }

    /// Queue for transports that report from their own threads.
    pub fn event_sender(&self) -> EventSender {
        self.inner.events.clone()
    }

    /// Pin `op` to an older capability. Ignored unless it lowers the
    /// existing pin.
    pub fn set_compat_version(&self, op: OpCode, version: CapabilityVersion) -> bool {
        self.inner.overrides.set(op, version)
    }

    pub fn compat_version(&self, op: OpCode) -> Option<CapabilityVersion> {
        self.inner.overrides.get(op)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection_state()
    }

    pub fn negotiated_version(&self) -> Option<CapabilityVersion> {
        self.inner.binding.load().as_ref().map(|b| b.version)
    }

    pub fn cookie(&self) -> Option<Cookie> {
        self.inner.current_cookie()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.table.len()
    }

    pub fn is_pending(&self, serial: Serial) -> bool {
        self.inner.table.contains(serial)
    }

    pub fn lease(&self) -> &ResourceLease {
        &self.inner.lease
    }

    pub fn stats(&self) -> &EngineStats {
        &self.inner.stats
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn diagnostics(&self) -> Diagnostics {
        self.inner.diagnostics()
    }

    /// Fail every pending request with `TransportUnavailable` and stop the
    /// worker threads. Idempotent.
    pub fn shutdown(&mut self) {
        self.inner.shutdown();
        if let Some(handle) = self.pump.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
