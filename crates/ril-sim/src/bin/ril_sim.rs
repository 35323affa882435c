//! Radio interface load simulator.
//!
//! Drives a ril-engine instance against a mock modem and checks that every
//! submission completes exactly once, optionally killing the modem at a
//! fixed cadence to exercise death recovery.
//!
//! Usage:
//!   ril-sim --requests 5000 --threads 8 --kill-every 500
//!   ril-sim --version 1.4 --config engine.toml --json

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use ril_engine::metrics::render_prometheus;
use ril_engine::{CapabilityVersion, EngineConfig};
use ril_sim::modem::ModemBehavior;
use ril_sim::scenario::{self, LoadConfig};
use tracing_subscriber::EnvFilter;

/// Mock-modem load driver for the radio interface engine.
#[derive(Parser, Debug)]
#[command(name = "ril-sim", about = "Radio interface engine load simulator")]
struct Cli {
    /// Total operations to submit.
    #[arg(long, default_value_t = 1_000)]
    requests: usize,

    /// Submitter threads.
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// Capability the mock modem negotiates.
    #[arg(long, default_value = "1.6")]
    version: CapabilityVersion,

    /// Kill the modem after every N submissions.
    #[arg(long)]
    kill_every: Option<usize>,

    /// Engine TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// RNG seed for submitters and the modem.
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Probability the modem never answers a call.
    #[arg(long, default_value_t = 0.01)]
    silent: f64,

    /// Microseconds each submitter sleeps between submissions.
    #[arg(long, default_value_t = 200)]
    interval_us: u64,

    /// Print the full report as JSON instead of a summary plus metrics.
    #[arg(long, default_value_t = false)]
    json: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    let cli = Cli::parse();

    let engine = match &cli.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("loading engine config from {}", path.display()))?,
        None => EngineConfig::default(),
    };

    let report = scenario::run(LoadConfig {
        seed: cli.seed,
        requests: cli.requests,
        threads: cli.threads,
        version: cli.version,
        kill_every: cli.kill_every,
        submit_interval: Duration::from_micros(cli.interval_us),
        behavior: ModemBehavior {
            silent: cli.silent.clamp(0.0, 1.0),
            ..ModemBehavior::default()
        },
        engine,
        ..LoadConfig::default()
    })?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "submitted={} completed={} duplicates={} missing={} kills={} unsettled={} \
             elapsed_ms={}",
            report.submitted,
            report.completed,
            report.duplicates,
            report.missing,
            report.kills,
            report.unsettled,
            report.elapsed_ms,
        );
        for (outcome, count) in &report.outcomes {
            println!("  {outcome:<24}{count}");
        }
        println!();
        print!("{}", render_prometheus(&report.diagnostics));
    }

    if !report.is_exactly_once() {
        anyhow::bail!(
            "exactly-once delivery violated: {} duplicates, {} missing",
            report.duplicates,
            report.missing
        );
    }
    Ok(())
}
