//! End-to-end load runs against the mock modem.
//!
//! Each run drives the full engine (event pump, timers, reconnects) and
//! checks the exactly-once ledger plus the counters on both sides of the
//! transport boundary.

use std::time::Duration;

use ril_engine::{CapabilityVersion, EngineConfig};
use ril_sim::catalog::{V1_0, V1_4, VOICE_REGISTRATION_STATE};
use ril_sim::modem::ModemBehavior;
use ril_sim::scenario::{run, LoadConfig};
use serde_json::Value;

fn fast(requests: usize) -> LoadConfig {
    LoadConfig {
        requests,
        threads: 3,
        submit_interval: Duration::from_micros(50),
        settle: Duration::from_secs(3),
        engine: EngineConfig {
            blocking_response_timeout: Duration::from_millis(100),
            reconnect_interval: Duration::from_millis(10),
            ..EngineConfig::default()
        },
        ..LoadConfig::default()
    }
}

// ─── Capability ─────────────────────────────────────────────────────────────

#[test]
fn downgrade_fallback_is_invisible_to_callers() {
    let report = run(LoadConfig {
        behavior: ModemBehavior {
            ceilings: vec![(VOICE_REGISTRATION_STATE, V1_4)],
            ..ModemBehavior::reliable()
        },
        ..fast(150)
    })
    .unwrap();

    assert!(report.is_exactly_once(), "{report:?}");
    assert_eq!(report.outcomes.get("ok"), Some(&150));
    assert!(report.outcomes.get("remote").is_none());
    assert!(report.diagnostics.activity.fallbacks > 0);
}

#[test]
fn old_modem_rejects_newer_ops_locally() {
    let report = run(LoadConfig {
        version: V1_0,
        behavior: ModemBehavior::reliable(),
        ..fast(150)
    })
    .unwrap();

    assert!(report.is_exactly_once(), "{report:?}");
    let ok = report.outcomes.get("ok").copied().unwrap_or(0);
    let not_supported = report.outcomes.get("not_supported").copied().unwrap_or(0);
    assert!(not_supported > 0);
    assert_eq!(ok + not_supported, 150);
    // Unsupported operations never reach the modem.
    assert_eq!(report.modem.calls, ok);
}

// ─── Acknowledgements ───────────────────────────────────────────────────────

#[test]
fn every_requested_ack_reaches_the_modem() {
    let report = run(LoadConfig {
        behavior: ModemBehavior {
            ack_first: 1.0,
            ack_requested: 1.0,
            ..ModemBehavior::reliable()
        },
        ..fast(120)
    })
    .unwrap();

    assert!(report.is_exactly_once(), "{report:?}");
    assert!(report.modem.acks_received >= 120);
    assert_eq!(report.diagnostics.faults.unexpected_ack, 0);
    assert_eq!(report.diagnostics.faults.double_release, 0);
}

// ─── Death Recovery ─────────────────────────────────────────────────────────

#[test]
fn repeated_kills_with_lossy_modem_stay_exactly_once() {
    let report = run(LoadConfig {
        kill_every: Some(40),
        behavior: ModemBehavior {
            silent: 0.05,
            ..ModemBehavior::default()
        },
        ..fast(400)
    })
    .unwrap();

    assert!(report.is_exactly_once(), "{report:?}");
    assert!(report.kills >= 1);
    assert!(report.outcomes.get("transport_unavailable").copied().unwrap_or(0) > 0);
}

#[test]
fn report_serializes_with_diagnostics() {
    let report = run(LoadConfig {
        version: CapabilityVersion::new(2, 0),
        behavior: ModemBehavior::reliable(),
        ..fast(30)
    })
    .unwrap();

    let json: Value = serde_json::to_value(&report).unwrap();
    assert_eq!(json["submitted"], 30);
    assert_eq!(json["diagnostics"]["negotiated_version"], "2.0");
    assert_eq!(json["outcomes"]["ok"], 30);
    assert!(json["modem"]["calls"].as_u64().unwrap() >= 30);
}
