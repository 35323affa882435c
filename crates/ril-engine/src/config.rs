use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::lease::LeaseTimeouts;
use crate::stats::AnomalyThresholds;
use crate::version::CapabilityVersion;

pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfigInput {
    pub version: u32,
    pub work_lease_timeout_ms: Option<u64>,
    pub ack_lease_timeout_ms: Option<u64>,
    pub blocking_response_timeout_ms: Option<u64>,
    pub reconnect_interval_ms: Option<u64>,
    pub event_queue_capacity: Option<usize>,
    pub work_watchdog_anomaly_threshold: Option<u64>,
    pub system_error_anomaly_threshold: Option<u64>,
    pub overrides: Vec<OverrideInput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OverrideInput {
    pub op: String,
    pub version: String,
}

/// Compat override named by operation. Resolved against the dispatch table
/// when the engine starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverrideConfig {
    pub op: String,
    pub version: CapabilityVersion,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub version: u32,
    pub work_lease_timeout: Duration,
    pub ack_lease_timeout: Duration,
    /// Window for bounded operations that do not declare their own.
    pub blocking_response_timeout: Duration,
    pub reconnect_interval: Duration,
    pub event_queue_capacity: usize,
    /// When cumulative counters are flagged in diagnostics.
    pub anomaly_thresholds: AnomalyThresholds,
    pub overrides: Vec<OverrideConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            work_lease_timeout: Duration::from_millis(60_000),
            ack_lease_timeout: Duration::from_millis(200),
            blocking_response_timeout: Duration::from_millis(2_000),
            reconnect_interval: Duration::from_millis(1_000),
            event_queue_capacity: 1024,
            anomaly_thresholds: AnomalyThresholds::default(),
            overrides: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn lease_timeouts(&self) -> LeaseTimeouts {
        LeaseTimeouts {
            work: self.work_lease_timeout,
            ack: self.ack_lease_timeout,
        }
    }

    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(EngineConfig::default());
        }
        let parsed: EngineConfigInput =
            toml::from_str(input).map_err(|e| ConfigError::Parse(e.to_string()))?;
        parsed.resolve()
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }
}

fn millis_at_least_one(value: Option<u64>, default: Duration) -> Duration {
    match value {
        Some(ms) => Duration::from_millis(ms.max(1)),
        None => default,
    }
}

impl EngineConfigInput {
    pub fn resolve(self) -> Result<EngineConfig, ConfigError> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(ConfigError::UnsupportedVersion(version));
        }

        let defaults = EngineConfig::default();

        let mut overrides = Vec::with_capacity(self.overrides.len());
        for o in self.overrides {
            let op = o.op.trim().to_string();
            if op.is_empty() {
                return Err(ConfigError::UnknownOperation(o.op));
            }
            overrides.push(OverrideConfig {
                op,
                version: o.version.parse()?,
            });
        }

        Ok(EngineConfig {
            version,
            work_lease_timeout: millis_at_least_one(
                self.work_lease_timeout_ms,
                defaults.work_lease_timeout,
            ),
            ack_lease_timeout: millis_at_least_one(
                self.ack_lease_timeout_ms,
                defaults.ack_lease_timeout,
            ),
            blocking_response_timeout: millis_at_least_one(
                self.blocking_response_timeout_ms,
                defaults.blocking_response_timeout,
            ),
            reconnect_interval: millis_at_least_one(
                self.reconnect_interval_ms,
                defaults.reconnect_interval,
            ),
            event_queue_capacity: self
                .event_queue_capacity
                .unwrap_or(defaults.event_queue_capacity)
                .max(1),
            anomaly_thresholds: AnomalyThresholds {
                work_watchdog: self
                    .work_watchdog_anomaly_threshold
                    .unwrap_or(defaults.anomaly_thresholds.work_watchdog)
                    .max(1),
                system_error: self
                    .system_error_anomaly_threshold
                    .unwrap_or(defaults.anomaly_thresholds.system_error)
                    .max(1),
            },
            overrides,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_is_default() {
        let cfg = EngineConfig::from_toml_str("  \n").unwrap();
        assert_eq!(cfg, EngineConfig::default());
        assert_eq!(cfg.lease_timeouts(), LeaseTimeouts::default());
    }

    #[test]
    fn parse_toml_config_basic() {
        let toml = r#"
            version = 1
            work_lease_timeout_ms = 30000
            ack_lease_timeout_ms = 150
            blocking_response_timeout_ms = 500
            reconnect_interval_ms = 250
            event_queue_capacity = 64

            [[overrides]]
            op = "voice_registration_state"
            version = "1.4"
        "#;

        let cfg = EngineConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.work_lease_timeout, Duration::from_secs(30));
        assert_eq!(cfg.ack_lease_timeout, Duration::from_millis(150));
        assert_eq!(cfg.blocking_response_timeout, Duration::from_millis(500));
        assert_eq!(cfg.reconnect_interval, Duration::from_millis(250));
        assert_eq!(cfg.event_queue_capacity, 64);
        assert_eq!(
            cfg.overrides,
            vec![OverrideConfig {
                op: "voice_registration_state".into(),
                version: CapabilityVersion::new(1, 4),
            }]
        );
    }

    #[test]
    fn timeouts_clamped_to_one_ms() {
        let toml = "ack_lease_timeout_ms = 0\nevent_queue_capacity = 0";
        let cfg = EngineConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.ack_lease_timeout, Duration::from_millis(1));
        assert_eq!(cfg.event_queue_capacity, 1);
    }

    #[test]
    fn anomaly_thresholds_from_toml() {
        let toml = "work_watchdog_anomaly_threshold = 3\nsystem_error_anomaly_threshold = 0";
        let cfg = EngineConfig::from_toml_str(toml).unwrap();
        assert_eq!(
            cfg.anomaly_thresholds,
            AnomalyThresholds {
                work_watchdog: 3,
                system_error: 1,
            }
        );
    }

    #[test]
    fn rejects_unknown_version() {
        assert_eq!(
            EngineConfig::from_toml_str("version = 2"),
            Err(ConfigError::UnsupportedVersion(2))
        );
    }

    #[test]
    fn rejects_bad_override_version() {
        let toml = r#"
            [[overrides]]
            op = "dial"
            version = "latest"
        "#;
        assert!(matches!(
            EngineConfig::from_toml_str(toml),
            Err(ConfigError::InvalidVersion(_))
        ));
    }

    #[test]
    fn rejects_malformed_toml() {
        assert!(matches!(
            EngineConfig::from_toml_str("work_lease_timeout_ms = \"soon\""),
            Err(ConfigError::Parse(_))
        ));
    }
}
