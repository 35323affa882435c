//! Seeded load driver.
//!
//! Several submitter threads issue randomly chosen catalogue operations
//! against one engine backed by a [`MockConnector`], killing the modem every
//! `kill_every` submissions. Each submission owns a slot that its completion
//! sink bumps; once the run settles every slot must read exactly one.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::RngExt as _;
use rand::SeedableRng;
use ril_engine::{
    CapabilityVersion, CompletionSink, Diagnostics, Engine, EngineConfig, Outcome, RilError,
    SubmitOptions,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::catalog::{self, ALL_OPS, V1_6};
use crate::modem::{MockConnector, ModemBehavior, ModemStats};

#[derive(Debug, Clone)]
pub struct LoadConfig {
    pub seed: u64,
    pub requests: usize,
    pub threads: usize,
    /// Capability every modem reports.
    pub version: CapabilityVersion,
    /// Kill the modem after every this many submissions.
    pub kill_every: Option<usize>,
    /// Pause between submissions on each thread.
    pub submit_interval: Duration,
    /// How long to wait for in-flight requests before shutting down.
    pub settle: Duration,
    pub behavior: ModemBehavior,
    pub engine: EngineConfig,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            seed: 1,
            requests: 1_000,
            threads: 4,
            version: V1_6,
            kill_every: None,
            submit_interval: Duration::from_micros(200),
            settle: Duration::from_secs(5),
            behavior: ModemBehavior::default(),
            engine: EngineConfig::default(),
        }
    }
}

/// Result of one run.
#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    pub submitted: usize,
    /// Submissions whose sink fired at least once.
    pub completed: usize,
    /// Submissions whose sink fired more than once.
    pub duplicates: usize,
    /// Submissions whose sink never fired.
    pub missing: usize,
    pub kills: usize,
    /// Submissions still pending when the settle window closed.
    pub unsettled: usize,
    pub elapsed_ms: u64,
    pub outcomes: BTreeMap<&'static str, u64>,
    pub modem: ModemStats,
    pub diagnostics: Diagnostics,
}

impl LoadReport {
    pub fn is_exactly_once(&self) -> bool {
        self.duplicates == 0 && self.missing == 0 && self.completed == self.submitted
    }
}

pub fn outcome_label(outcome: &Outcome) -> &'static str {
    match outcome {
        Ok(_) => "ok",
        Err(RilError::NotSupported { .. }) => "not_supported",
        Err(RilError::TransportError(_)) => "transport_error",
        Err(RilError::TransportUnavailable) => "transport_unavailable",
        Err(RilError::TimedOut(_)) => "timed_out",
        Err(RilError::Remote(_)) => "remote",
    }
}

type Tally = Arc<Mutex<BTreeMap<&'static str, u64>>>;

pub fn run(cfg: LoadConfig) -> anyhow::Result<LoadReport> {
    let connector = Arc::new(MockConnector::new(cfg.version, cfg.behavior.clone(), cfg.seed));
    let mut engine = Engine::builder(catalog::dispatch_table(), connector.clone())
        .name("ril-sim")
        .config(cfg.engine.clone())
        .on_indication(|ind| debug!(code = ind.code, kind = ?ind.kind, "indication"))
        .start()?;

    let slots: Arc<Vec<AtomicU32>> =
        Arc::new((0..cfg.requests).map(|_| AtomicU32::new(0)).collect());
    let tally: Tally = Arc::new(Mutex::new(BTreeMap::new()));
    let next = AtomicUsize::new(0);
    let kills = AtomicUsize::new(0);
    let threads = cfg.threads.max(1);

    info!(
        requests = cfg.requests,
        threads,
        version = %cfg.version,
        kill_every = ?cfg.kill_every,
        seed = cfg.seed,
        "load run starting"
    );
    let started = Instant::now();

    thread::scope(|scope| {
        for t in 0..threads {
            let engine = &engine;
            let connector = &connector;
            let (next, kills) = (&next, &kills);
            let (slots, tally) = (&slots, &tally);
            let cfg = &cfg;
            thread::Builder::new()
                .name(format!("ril-sim-submit-{t}"))
                .spawn_scoped(scope, move || {
                    let mut rng = StdRng::seed_from_u64(cfg.seed.wrapping_add(t as u64 + 1));
                    let attribution = format!("client-{t}");
                    loop {
                        let idx = next.fetch_add(1, Ordering::Relaxed);
                        if idx >= cfg.requests {
                            break;
                        }
                        if let Some(every) = cfg.kill_every {
                            if every > 0 && idx > 0 && idx % every == 0 {
                                if let Some(cookie) = connector.kill_current() {
                                    debug!(%cookie, idx, "killed modem mid-run");
                                    kills.fetch_add(1, Ordering::Relaxed);
                                }
                            }
                        }

                        let op = ALL_OPS[rng.random_range(0..ALL_OPS.len())];
                        let params = Bytes::from((idx as u32).to_le_bytes().repeat(6));
                        let slots = slots.clone();
                        let tally = tally.clone();
                        let sink = CompletionSink::callback(move |outcome| {
                            slots[idx].fetch_add(1, Ordering::AcqRel);
                            let mut tally = tally.lock().unwrap_or_else(|e| e.into_inner());
                            *tally.entry(outcome_label(&outcome)).or_insert(0) += 1;
                        });
                        engine.submit(
                            op,
                            params,
                            sink,
                            SubmitOptions::new().attributed_to(attribution.as_str()),
                        );

                        if !cfg.submit_interval.is_zero() {
                            thread::sleep(cfg.submit_interval);
                        }
                    }
                })
                .expect("failed to spawn submitter thread");
        }
    });

    let deadline = Instant::now() + cfg.settle;
    while engine.pending_count() > 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    let unsettled = engine.pending_count();
    if unsettled > 0 {
        warn!(unsettled, "requests still pending after settle window, shutting down");
    }

    let diagnostics = engine.diagnostics();
    engine.shutdown();
    connector.shutdown();
    let elapsed_ms = started.elapsed().as_millis() as u64;

    let mut completed = 0;
    let mut duplicates = 0;
    let mut missing = 0;
    for slot in slots.iter() {
        match slot.load(Ordering::Acquire) {
            0 => missing += 1,
            1 => completed += 1,
            _ => {
                completed += 1;
                duplicates += 1;
            }
        }
    }
    let outcomes = tally.lock().unwrap_or_else(|e| e.into_inner()).clone();

    let report = LoadReport {
        submitted: cfg.requests,
        completed,
        duplicates,
        missing,
        kills: kills.load(Ordering::Relaxed),
        unsettled,
        elapsed_ms,
        outcomes,
        modem: connector.stats(),
        diagnostics,
    };
    info!(
        submitted = report.submitted,
        completed = report.completed,
        duplicates = report.duplicates,
        missing = report.missing,
        kills = report.kills,
        elapsed_ms = report.elapsed_ms,
        "load run finished"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick(requests: usize) -> LoadConfig {
        LoadConfig {
            requests,
            threads: 2,
            submit_interval: Duration::ZERO,
            settle: Duration::from_secs(3),
            engine: EngineConfig {
                blocking_response_timeout: Duration::from_millis(100),
                reconnect_interval: Duration::from_millis(10),
                ..EngineConfig::default()
            },
            ..LoadConfig::default()
        }
    }

    #[test]
    fn outcome_labels_cover_every_error() {
        assert_eq!(outcome_label(&Ok(Bytes::new())), "ok");
        assert_eq!(outcome_label(&Err(RilError::TransportUnavailable)), "transport_unavailable");
        assert_eq!(outcome_label(&Err(RilError::TimedOut(Duration::from_secs(1)))), "timed_out");
        assert_eq!(
            outcome_label(&Err(RilError::Remote(ril_engine::RemoteCode::GENERIC_FAILURE))),
            "remote"
        );
    }

    #[test]
    fn reliable_run_completes_everything_ok() {
        let report = run(LoadConfig {
            behavior: ModemBehavior::reliable(),
            ..quick(200)
        })
        .unwrap();
        assert!(report.is_exactly_once(), "{report:?}");
        assert_eq!(report.outcomes.get("ok"), Some(&200));
        assert_eq!(report.kills, 0);
        assert_eq!(report.modem.connects, 1);
    }

    #[test]
    fn kills_mid_run_still_complete_exactly_once() {
        let report = run(LoadConfig {
            kill_every: Some(50),
            ..quick(300)
        })
        .unwrap();
        assert!(report.is_exactly_once(), "{report:?}");
        assert!(report.kills >= 1);
        assert_eq!(report.diagnostics.faults.double_release, 0);
        assert_eq!(report.diagnostics.faults.duplicate_serial, 0);
    }
}
