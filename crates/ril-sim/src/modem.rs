//! Mock radio modem.
//!
//! Answers every call from a timer thread after a seeded random latency,
//! optionally preceded by an `AckOnly` notice, optionally asking for its
//! answer to be acknowledged, or not at all. A modem can be killed at any
//! point: it stops answering and reports its own death on the engine's
//! event queue, after which the engine reconnects and gets a fresh modem
//! from the [`MockConnector`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use rand::rngs::StdRng;
use rand::RngExt as _;
use rand::SeedableRng;
use ril_engine::timer::TimerService;
use ril_engine::{
    CapabilityVersion, Cookie, EventSender, IndicationKind, OpCode, RadioTransport, RemoteCode,
    ResponseKind, TransportCall, TransportConnector, TransportFault, TransportLink,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::catalog::{ACTIVITY_INFO_LEN, GET_ACTIVITY_INFO, V1_4, VOICE_REGISTRATION_STATE};

/// Indication code the modem uses for its periodic signal-strength reports.
pub const SIGNAL_STRENGTH_INDICATION: u32 = 1009;

/// Per-call behaviour knobs. Probabilities are in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct ModemBehavior {
    pub min_latency: Duration,
    pub max_latency: Duration,
    /// Send `AckOnly` ahead of the final answer.
    pub ack_first: f64,
    /// Final answer is `PlainWithAckRequested`.
    pub ack_requested: f64,
    /// Never answer.
    pub silent: f64,
    /// Answer with `GENERIC_FAILURE`.
    pub remote_failure: f64,
    /// Reject the call synchronously.
    pub invoke_failure: f64,
    /// Follow an answer with an unsolicited indication.
    pub indication: f64,
    /// Operations answered with `REQUEST_NOT_SUPPORTED` when called above
    /// the paired version.
    pub ceilings: Vec<(OpCode, CapabilityVersion)>,
}

impl Default for ModemBehavior {
    fn default() -> Self {
        Self {
            min_latency: Duration::from_millis(1),
            max_latency: Duration::from_millis(5),
            ack_first: 0.2,
            ack_requested: 0.2,
            silent: 0.01,
            remote_failure: 0.05,
            invoke_failure: 0.0,
            indication: 0.05,
            ceilings: vec![(VOICE_REGISTRATION_STATE, V1_4)],
        }
    }
}

impl ModemBehavior {
    /// Every call answered promptly with a plain success.
    pub fn reliable() -> Self {
        Self {
            ack_first: 0.0,
            ack_requested: 0.0,
            silent: 0.0,
            remote_failure: 0.0,
            invoke_failure: 0.0,
            indication: 0.0,
            ceilings: Vec::new(),
            ..Self::default()
        }
    }

    fn ceiling(&self, op: OpCode) -> Option<CapabilityVersion> {
        self.ceilings
            .iter()
            .find(|(candidate, _)| *candidate == op)
            .map(|(_, version)| *version)
    }
}

#[derive(Debug, Default)]
struct ModemCounters {
    calls: AtomicU64,
    rejected: AtomicU64,
    answered: AtomicU64,
    silent: AtomicU64,
    acks_received: AtomicU64,
    indications: AtomicU64,
    kills: AtomicU64,
}

/// Totals across every modem a connector has handed out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ModemStats {
    pub connects: u64,
    pub calls: u64,
    pub rejected: u64,
    pub answered: u64,
    pub silent: u64,
    pub acks_received: u64,
    pub indications: u64,
    pub kills: u64,
}

/// What the modem decided to do with one call.
#[derive(Debug)]
struct Plan {
    ack_after: Option<Duration>,
    answer: Option<Answer>,
    indication: Option<IndicationKind>,
}

#[derive(Debug)]
struct Answer {
    after: Duration,
    kind: ResponseKind,
    code: RemoteCode,
    payload: Bytes,
}

pub struct MockModem {
    cookie: Cookie,
    version: CapabilityVersion,
    events: EventSender,
    behavior: ModemBehavior,
    rng: Mutex<StdRng>,
    timers: Arc<TimerService>,
    alive: Arc<AtomicBool>,
    counters: Arc<ModemCounters>,
}

impl MockModem {
    fn new(
        link: TransportLink,
        version: CapabilityVersion,
        behavior: ModemBehavior,
        seed: u64,
        timers: Arc<TimerService>,
        counters: Arc<ModemCounters>,
    ) -> Self {
        MockModem {
            cookie: link.cookie,
            version,
            events: link.events,
            behavior,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            timers,
            alive: Arc::new(AtomicBool::new(true)),
            counters,
        }
    }

    pub fn cookie(&self) -> Cookie {
        self.cookie
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Stop answering and report the death. Returns `false` if the modem
    /// was already dead.
    pub fn kill(&self) -> bool {
        if !self.alive.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.counters.kills.fetch_add(1, Ordering::Relaxed);
        info!(cookie = %self.cookie, "modem killed");
        self.events.died(self.cookie);
        true
    }

    /// Stop answering without reporting anything.
    fn silence(&self) {
        self.alive.store(false, Ordering::Release);
    }

    fn plan(&self, call: &TransportCall<'_>) -> Plan {
        let b = &self.behavior;
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());

        let latency = if b.max_latency > b.min_latency {
            b.min_latency + (b.max_latency - b.min_latency).mul_f64(rng.random::<f64>())
        } else {
            b.min_latency
        };

        if rng.random::<f64>() < b.silent {
            return Plan {
                ack_after: None,
                answer: None,
                indication: None,
            };
        }

        let ack_after = (rng.random::<f64>() < b.ack_first).then(|| latency / 2);
        let kind = if rng.random::<f64>() < b.ack_requested {
            ResponseKind::PlainWithAckRequested
        } else {
            ResponseKind::Plain
        };
        let unsupported = b.ceiling(call.op).is_some_and(|ceiling| call.version > ceiling);
        let code = if unsupported {
            RemoteCode::REQUEST_NOT_SUPPORTED
        } else if rng.random::<f64>() < b.remote_failure {
            RemoteCode::GENERIC_FAILURE
        } else {
            RemoteCode::NONE
        };
        let payload = if code.is_success() {
            answer_payload(call, &mut rng)
        } else {
            Bytes::new()
        };
        let indication = (rng.random::<f64>() < b.indication).then(|| {
            if rng.random::<bool>() {
                IndicationKind::UnsolicitedAckExpected
            } else {
                IndicationKind::Unsolicited
            }
        });

        Plan {
            ack_after,
            answer: Some(Answer {
                after: latency,
                kind,
                code,
                payload,
            }),
            indication,
        }
    }

    /// Run `f` on the timer thread after `delay`, unless the modem dies first.
    fn emit(&self, delay: Duration, f: impl FnOnce(&EventSender) + Send + 'static) {
        let alive = self.alive.clone();
        let events = self.events.clone();
        self.timers.schedule(delay, move || {
            if alive.load(Ordering::Acquire) {
                f(&events);
            }
        });
    }
}

impl RadioTransport for MockModem {
    fn capability(&self) -> CapabilityVersion {
        self.version
    }

    fn invoke(&self, call: &TransportCall<'_>) -> Result<(), TransportFault> {
        if !self.is_alive() {
            return Err(TransportFault::new(format!("modem {} is dead", self.cookie)));
        }
        self.counters.calls.fetch_add(1, Ordering::Relaxed);

        let rejected = {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            rng.random::<f64>() < self.behavior.invoke_failure
        };
        if rejected {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(TransportFault::new(format!("{} rejected by modem", call.op)));
        }

        let plan = self.plan(call);
        let serial = call.serial;

        if let Some(delay) = plan.ack_after {
            self.emit(delay, move |events| {
                events.response(serial, ResponseKind::AckOnly, RemoteCode::NONE, Bytes::new());
            });
        }

        let Some(answer) = plan.answer else {
            self.counters.silent.fetch_add(1, Ordering::Relaxed);
            debug!(serial = %serial, op = %call.op, "modem staying silent");
            return Ok(());
        };

        let counters = self.counters.clone();
        let indication = plan.indication;
        self.emit(answer.after, move |events| {
            counters.answered.fetch_add(1, Ordering::Relaxed);
            events.response(serial, answer.kind, answer.code, answer.payload);
            if let Some(kind) = indication {
                counters.indications.fetch_add(1, Ordering::Relaxed);
                events.indication(SIGNAL_STRENGTH_INDICATION, kind, Bytes::from_static(b"-71"));
            }
        });
        Ok(())
    }

    fn acknowledge(&self) -> Result<(), TransportFault> {
        if !self.is_alive() {
            return Err(TransportFault::new(format!("modem {} is dead", self.cookie)));
        }
        self.counters.acks_received.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

fn answer_payload(call: &TransportCall<'_>, rng: &mut StdRng) -> Bytes {
    if call.op == GET_ACTIVITY_INFO {
        let mut buf = BytesMut::with_capacity(ACTIVITY_INFO_LEN);
        for _ in 0..ACTIVITY_INFO_LEN / 4 {
            buf.put_u32_le(rng.random_range(0..10_000u32));
        }
        return buf.freeze();
    }
    Bytes::from(format!("{}@{}:{}", call.op, call.version, call.params.len()))
}

// ─── Connector ──────────────────────────────────────────────────────────────

/// Hands out a fresh [`MockModem`] on every connect.
pub struct MockConnector {
    version: Mutex<CapabilityVersion>,
    behavior: ModemBehavior,
    seed: u64,
    timers: Arc<TimerService>,
    current: Mutex<Option<Arc<MockModem>>>,
    counters: Arc<ModemCounters>,
    connects: AtomicU64,
    refusals: AtomicU64,
}

impl MockConnector {
    pub fn new(version: CapabilityVersion, behavior: ModemBehavior, seed: u64) -> Self {
        MockConnector {
            version: Mutex::new(version),
            behavior,
            seed,
            timers: Arc::new(TimerService::start("mock-modem")),
            current: Mutex::new(None),
            counters: Arc::new(ModemCounters::default()),
            connects: AtomicU64::new(0),
            refusals: AtomicU64::new(0),
        }
    }

    /// Capability the next modem will report.
    pub fn set_version(&self, version: CapabilityVersion) {
        *self.version.lock().unwrap_or_else(|e| e.into_inner()) = version;
    }

    /// Fail the next `n` connection attempts.
    pub fn refuse_next(&self, n: u64) {
        self.refusals.store(n, Ordering::Release);
    }

    pub fn current(&self) -> Option<Arc<MockModem>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Kill the live modem, if any. Returns the cookie it was bound to.
    pub fn kill_current(&self) -> Option<Cookie> {
        let modem = self.current()?;
        modem.kill().then(|| modem.cookie())
    }

    pub fn stats(&self) -> ModemStats {
        let c = &self.counters;
        ModemStats {
            connects: self.connects.load(Ordering::Relaxed),
            calls: c.calls.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            answered: c.answered.load(Ordering::Relaxed),
            silent: c.silent.load(Ordering::Relaxed),
            acks_received: c.acks_received.load(Ordering::Relaxed),
            indications: c.indications.load(Ordering::Relaxed),
            kills: c.kills.load(Ordering::Relaxed),
        }
    }

    /// Silence the live modem and stop the answer timer.
    pub fn shutdown(&self) {
        if let Some(modem) = self.current() {
            modem.silence();
        }
        self.timers.shutdown();
    }
}

impl TransportConnector for MockConnector {
    fn connect(&self, link: TransportLink) -> anyhow::Result<Arc<dyn RadioTransport>> {
        let refused = self
            .refusals
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            warn!(cookie = %link.cookie, "mock modem refusing connection");
            anyhow::bail!("modem refused connection {}", link.cookie);
        }

        let n = self.connects.fetch_add(1, Ordering::Relaxed);
        let version = *self.version.lock().unwrap_or_else(|e| e.into_inner());
        let modem = Arc::new(MockModem::new(
            link,
            version,
            self.behavior.clone(),
            self.seed.wrapping_add(n),
            self.timers.clone(),
            self.counters.clone(),
        ));
        info!(cookie = %modem.cookie(), version = %version, "mock modem connected");

        let previous = self
            .current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(modem.clone());
        if let Some(previous) = previous {
            previous.silence();
        }
        Ok(modem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ril_engine::{CompletionSink, DispatchTable, Engine, OperationSpec, SubmitOptions};

    use crate::catalog::{self, DIAL, V1_6};

    fn engine(connector: Arc<MockConnector>, table: DispatchTable) -> Engine {
        Engine::builder(table, connector).name("modem-test").start().unwrap()
    }

    #[test]
    fn reliable_modem_answers_every_call() {
        let connector = Arc::new(MockConnector::new(V1_6, ModemBehavior::reliable(), 7));
        let engine = engine(connector.clone(), catalog::dispatch_table());

        for _ in 0..20 {
            let (serial, completion) =
                engine.call(DIAL, Bytes::from_static(b"5551234"), SubmitOptions::new());
            assert!(serial.is_some());
            let payload = completion.wait_timeout(Duration::from_secs(2)).unwrap().unwrap();
            assert_eq!(&payload[..], b"op#10@1.0:7");
        }
        let stats = connector.stats();
        assert_eq!(stats.connects, 1);
        assert_eq!(stats.calls, 20);
        assert_eq!(stats.answered, 20);
    }

    #[test]
    fn ceiling_drives_engine_fallback() {
        let behavior = ModemBehavior {
            ceilings: vec![(VOICE_REGISTRATION_STATE, V1_4)],
            ..ModemBehavior::reliable()
        };
        let connector = Arc::new(MockConnector::new(V1_6, behavior, 3));
        let engine = engine(connector, catalog::dispatch_table());

        let (_, completion) =
            engine.call(VOICE_REGISTRATION_STATE, Bytes::new(), SubmitOptions::new());
        let payload = completion.wait_timeout(Duration::from_secs(2)).unwrap().unwrap();
        assert_eq!(&payload[..], b"op#20@1.4:0");
        assert_eq!(engine.stats().activity().fallbacks, 1);
    }

    #[test]
    fn kill_reports_death_and_reconnects() {
        let connector = Arc::new(MockConnector::new(V1_6, ModemBehavior::reliable(), 11));
        let engine = engine(connector.clone(), catalog::dispatch_table());
        let first = engine.cookie().unwrap();

        let first_modem = connector.current().unwrap();
        assert_eq!(connector.kill_current(), Some(first));
        assert!(!first_modem.is_alive());
        assert!(!first_modem.kill());

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while engine.cookie().map_or(true, |c| c == first) {
            assert!(std::time::Instant::now() < deadline, "engine never reconnected");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(connector.stats().connects, 2);
        assert_eq!(connector.stats().kills, 1);
    }

    #[test]
    fn silent_modem_leaves_request_pending_until_death() {
        let behavior = ModemBehavior {
            silent: 1.0,
            ..ModemBehavior::reliable()
        };
        let connector = Arc::new(MockConnector::new(V1_6, behavior, 5));
        let engine = engine(connector.clone(), catalog::dispatch_table());

        let (serial, completion) = engine.call(DIAL, Bytes::new(), SubmitOptions::new());
        assert!(completion.wait_timeout(Duration::from_millis(50)).is_none());
        assert!(engine.is_pending(serial.unwrap()));

        connector.kill_current();
        let outcome = completion.wait_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(outcome, Err(ril_engine::RilError::TransportUnavailable));
    }

    #[test]
    fn legacy_scan_variant_trims_request() {
        let connector = Arc::new(MockConnector::new(V1_4, ModemBehavior::reliable(), 9));
        let engine = engine(connector, catalog::dispatch_table());

        let (_, completion) = engine.call(
            catalog::START_NETWORK_SCAN,
            Bytes::from(vec![1u8; 24]),
            SubmitOptions::new(),
        );
        let payload = completion.wait_timeout(Duration::from_secs(2)).unwrap().unwrap();
        assert_eq!(&payload[..], b"op#142@1.4:8");
    }

    #[test]
    fn refused_connect_is_retried() {
        let connector = Arc::new(MockConnector::new(V1_6, ModemBehavior::reliable(), 1));
        connector.refuse_next(1);
        let table = DispatchTable::new().with(
            OperationSpec::new(DIAL, "dial")
                .variant(catalog::V1_0, ril_engine::CallVariant::passthrough()),
        );
        let config = ril_engine::EngineConfig {
            reconnect_interval: Duration::from_millis(20),
            ..Default::default()
        };
        let engine = Engine::builder(table, connector.clone())
            .config(config)
            .start()
            .unwrap();
        assert!(engine.cookie().is_none());

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while engine.cookie().is_none() {
            assert!(std::time::Instant::now() < deadline, "engine never connected");
            std::thread::sleep(Duration::from_millis(5));
        }
        engine.submit(DIAL, Bytes::new(), CompletionSink::discard(), SubmitOptions::new());
        assert_eq!(connector.stats().connects, 1);
    }
}
