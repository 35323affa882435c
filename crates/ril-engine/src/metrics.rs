//! # Prometheus Metrics
//!
//! Renders a [`Diagnostics`] snapshot in Prometheus text exposition format.

use std::fmt::Write;

use crate::stats::{Diagnostics, LATENCY_BUCKETS_MS};

/// Render a diagnostics snapshot as Prometheus text exposition format.
pub fn render_prometheus(d: &Diagnostics) -> String {
    let mut out = String::with_capacity(4096);

    // ── Connection ──────────────────────────────────────────────

    writeln!(
        out,
        "# HELP ril_connected Whether a transport handle is bound (1) or not (0)."
    )
    .unwrap();
    writeln!(out, "# TYPE ril_connected gauge").unwrap();
    let connected = if d.state.is_connected() { 1 } else { 0 };
    match d.negotiated_version {
        Some(v) => writeln!(out, "ril_connected{{version=\"{v}\"}} {connected}").unwrap(),
        None => writeln!(out, "ril_connected {connected}").unwrap(),
    }

    writeln!(out, "# HELP ril_serial_epoch Current serial epoch.").unwrap();
    writeln!(out, "# TYPE ril_serial_epoch gauge").unwrap();
    writeln!(out, "ril_serial_epoch {}", d.serial_epoch).unwrap();

    writeln!(
        out,
        "# HELP ril_pending_requests Requests awaiting a terminal outcome."
    )
    .unwrap();
    writeln!(out, "# TYPE ril_pending_requests gauge").unwrap();
    writeln!(out, "ril_pending_requests {}", d.pending.len()).unwrap();

    writeln!(
        out,
        "# HELP ril_queued_events Transport events waiting for the pump."
    )
    .unwrap();
    writeln!(out, "# TYPE ril_queued_events gauge").unwrap();
    writeln!(out, "ril_queued_events {}", d.queued_events).unwrap();

    // ── Leases ──────────────────────────────────────────────────

    writeln!(
        out,
        "# HELP ril_lease_hold_count Outstanding holds per lease class."
    )
    .unwrap();
    writeln!(out, "# TYPE ril_lease_hold_count gauge").unwrap();
    for l in &d.leases {
        writeln!(
            out,
            "ril_lease_hold_count{{class=\"{:?}\"}} {}",
            l.kind, l.hold_count
        )
        .unwrap();
    }

    writeln!(
        out,
        "# HELP ril_lease_watchdog_fires_total Lease watchdog expiries per class."
    )
    .unwrap();
    writeln!(out, "# TYPE ril_lease_watchdog_fires_total counter").unwrap();
    for l in &d.leases {
        writeln!(
            out,
            "ril_lease_watchdog_fires_total{{class=\"{:?}\"}} {}",
            l.kind, l.watchdog_fires
        )
        .unwrap();
    }

    // ── Outcomes ────────────────────────────────────────────────

    writeln!(
        out,
        "# HELP ril_completions_total Terminal outcomes delivered, by kind."
    )
    .unwrap();
    writeln!(out, "# TYPE ril_completions_total counter").unwrap();
    let o = &d.outcomes;
    for (kind, n) in [
        ("ok", o.ok),
        ("not_supported", o.not_supported),
        ("transport_error", o.transport_error),
        ("transport_unavailable", o.transport_unavailable),
        ("timed_out", o.timed_out),
        ("remote", o.remote),
    ] {
        writeln!(out, "ril_completions_total{{outcome=\"{kind}\"}} {n}").unwrap();
    }

    writeln!(
        out,
        "# HELP ril_faults_total Engine-internal faults and transport anomalies."
    )
    .unwrap();
    writeln!(out, "# TYPE ril_faults_total counter").unwrap();
    let f = &d.faults;
    for (kind, n) in [
        ("double_release", f.double_release),
        ("duplicate_serial", f.duplicate_serial),
        ("unexpected_response", f.unexpected_response),
        ("unexpected_ack", f.unexpected_ack),
        ("stale_death", f.stale_death),
        ("ack_failed", f.ack_failed),
        ("reconnect_failed", f.reconnect_failed),
        ("system_error", f.system_error),
    ] {
        writeln!(out, "ril_faults_total{{fault=\"{kind}\"}} {n}").unwrap();
    }

    writeln!(
        out,
        "# HELP ril_anomaly Counters at or past their alarm threshold."
    )
    .unwrap();
    writeln!(out, "# TYPE ril_anomaly gauge").unwrap();
    for a in &d.anomalies {
        writeln!(
            out,
            "ril_anomaly{{kind=\"{}\",threshold=\"{}\"}} {}",
            a.kind.as_str(),
            a.threshold,
            a.count
        )
        .unwrap();
    }

    writeln!(out, "# HELP ril_resets_total Full connection resets.").unwrap();
    writeln!(out, "# TYPE ril_resets_total counter").unwrap();
    writeln!(out, "ril_resets_total {}", d.activity.resets).unwrap();

    writeln!(
        out,
        "# HELP ril_acks_sent_total Protocol acknowledgements emitted."
    )
    .unwrap();
    writeln!(out, "# TYPE ril_acks_sent_total counter").unwrap();
    writeln!(out, "ril_acks_sent_total {}", d.activity.acks_sent).unwrap();

    // ── Latency ─────────────────────────────────────────────────

    writeln!(
        out,
        "# HELP ril_request_latency_ms Submit to response latency per operation."
    )
    .unwrap();
    writeln!(out, "# TYPE ril_request_latency_ms histogram").unwrap();
    for op in &d.latency {
        let h = &op.histogram;
        let mut cumulative = 0;
        for (bound, n) in LATENCY_BUCKETS_MS.iter().zip(&h.buckets) {
            cumulative += n;
            writeln!(
                out,
                "ril_request_latency_ms_bucket{{op=\"{}\",le=\"{bound}\"}} {cumulative}",
                op.name
            )
            .unwrap();
        }
        writeln!(
            out,
            "ril_request_latency_ms_bucket{{op=\"{}\",le=\"+Inf\"}} {}",
            op.name, h.count
        )
        .unwrap();
        writeln!(
            out,
            "ril_request_latency_ms_sum{{op=\"{}\"}} {}",
            op.name, h.sum_ms
        )
        .unwrap();
        writeln!(
            out,
            "ril_request_latency_ms_count{{op=\"{}\"}} {}",
            op.name, h.count
        )
        .unwrap();
    }

    // ── Clients ─────────────────────────────────────────────────

    writeln!(
        out,
        "# HELP ril_client_pending Pending requests per caller identity."
    )
    .unwrap();
    writeln!(out, "# TYPE ril_client_pending gauge").unwrap();
    for c in &d.clients {
        writeln!(
            out,
            "ril_client_pending{{client=\"{}\"}} {}",
            c.client, c.stats.pending
        )
        .unwrap();
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::OpCode;
    use crate::health::ConnectionState;
    use crate::lease::{LeaseKind, LeaseSnapshot};
    use crate::stats::{
        ActivityCounts, Anomaly, AnomalyKind, ClientSnapshot, ClientStats, FaultCounts,
        LatencyHistogram, OpLatency, OutcomeCounts,
    };
    use crate::transport::Cookie;
    use crate::version::CapabilityVersion;
    use std::time::Duration;

    fn lease(kind: LeaseKind, hold_count: usize) -> LeaseSnapshot {
        LeaseSnapshot {
            kind,
            hold_count,
            held: hold_count > 0,
            generation: 0,
            attribution: Vec::new(),
            acquired_total: hold_count as u64,
            watchdog_fires: 0,
        }
    }

    fn sample() -> Diagnostics {
        let mut histogram = LatencyHistogram::new();
        histogram.record(Duration::from_millis(4));
        histogram.record(Duration::from_millis(30));
        let version = CapabilityVersion::new(1, 6);
        Diagnostics {
            state: ConnectionState::Connected {
                version,
                cookie: Cookie(3),
            },
            negotiated_version: Some(version),
            cookie: Some(Cookie(3)),
            serial_epoch: 2,
            queued_events: 0,
            pending: Vec::new(),
            leases: vec![lease(LeaseKind::Work, 2), lease(LeaseKind::Ack, 0)],
            latency: vec![OpLatency {
                op: OpCode(20),
                name: "voice_registration_state",
                mean_ms: histogram.mean_ms(),
                histogram,
            }],
            clients: vec![ClientSnapshot {
                client: "phone".into(),
                stats: ClientStats {
                    pending: 2,
                    completed: 7,
                },
            }],
            outcomes: OutcomeCounts {
                ok: 7,
                ..Default::default()
            },
            faults: FaultCounts::default(),
            activity: ActivityCounts::default(),
            overrides: Vec::new(),
            anomalies: Vec::new(),
        }
    }

    #[test]
    fn render_prometheus_contains_help_lines() {
        let out = render_prometheus(&sample());
        assert!(out.contains("# HELP ril_connected"));
        assert!(out.contains("# TYPE ril_lease_hold_count gauge"));
        assert!(out.contains("# TYPE ril_request_latency_ms histogram"));
        assert!(out.contains("# HELP ril_faults_total"));
    }

    #[test]
    fn render_prometheus_values() {
        let out = render_prometheus(&sample());
        assert!(out.contains("ril_connected{version=\"1.6\"} 1"));
        assert!(out.contains("ril_serial_epoch 2"));
        assert!(out.contains("ril_lease_hold_count{class=\"Work\"} 2"));
        assert!(out.contains("ril_completions_total{outcome=\"ok\"} 7"));
        assert!(out.contains("ril_client_pending{client=\"phone\"} 2"));
    }

    #[test]
    fn latency_buckets_are_cumulative() {
        let out = render_prometheus(&sample());
        let op = "op=\"voice_registration_state\"";
        assert!(out.contains(&format!("ril_request_latency_ms_bucket{{{op},le=\"5\"}} 1")));
        assert!(out.contains(&format!("ril_request_latency_ms_bucket{{{op},le=\"50\"}} 2")));
        assert!(out.contains(&format!("ril_request_latency_ms_bucket{{{op},le=\"+Inf\"}} 2")));
        assert!(out.contains(&format!("ril_request_latency_ms_count{{{op}}} 2")));
    }

    #[test]
    fn anomalies_are_rendered_with_threshold() {
        let mut d = sample();
        assert!(!render_prometheus(&d).contains("ril_anomaly{"));

        d.anomalies.push(Anomaly {
            kind: AnomalyKind::WorkWatchdog,
            count: 12,
            threshold: 10,
        });
        let out = render_prometheus(&d);
        assert!(out.contains("ril_anomaly{kind=\"work_watchdog\",threshold=\"10\"} 12"));
    }

    #[test]
    fn disconnected_has_no_version_label() {
        let mut d = sample();
        d.state = ConnectionState::Disconnected;
        d.negotiated_version = None;
        let out = render_prometheus(&d);
        assert!(out.contains("ril_connected 0"));
    }
}
