//! # Coordinator configuration.
//!
//! Provides [`Config`], loaded from a TOML file. Every field has a default so
//! an empty file (or no file at all) yields a working four-bench setup.
//!
//! ```toml
//! data_dir = "/srv/bench/data"
//! benches = ["bench1", "bench2"]
//! confirm_window_secs = 15
//! watchdog_timeout_secs = 30
//!
//! [mqtt]
//! host = "localhost"
//! port = 1883
//! ```
//!
//! ## Field semantics
//! - durations are stored as integer seconds/milliseconds; use the accessors
//!   ([`Config::confirm_window`], [`Config::watchdog_timeout`], ...) instead of
//!   converting at call sites
//! - `persistence_attempts` is clamped to at least 1

use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::policies::{BackoffPolicy, JitterPolicy};

/// Console words that can never name a bench.
const RESERVED_INPUTS: [&str; 4] = ["reset", "end", "cancel", "status"];

/// Global configuration for the coordinator and its test tasks.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of the per-bench test folders (`<data_dir>/<bench>/<DDMMYYYY>-<serial>`).
    pub data_dir: PathBuf,
    /// Shared bench registry file. Its lock file sits next to it.
    pub registry_path: PathBuf,
    /// Bench names, in display order.
    pub benches: Vec<String>,
    /// Regex a battery serial must match. Scanned text is searched, not anchored.
    pub serial_pattern: String,

    /// Maximum time between the first bench scan and the confirmation scan.
    pub confirm_window_secs: u64,
    /// Minimum business hours between two tests of the same serial.
    pub cooldown_business_hours: u32,
    /// Sensor silence after which a security alert is published.
    pub watchdog_timeout_secs: u64,

    /// Bounded local retries for a failing store write.
    pub persistence_attempts: u32,
    /// Delay before the first retry; doubles per attempt.
    pub persistence_backoff_ms: u64,

    /// Capacity of the internal event bus and of the in-process message bus.
    pub bus_capacity: usize,
    /// Time to wait for test tasks on shutdown.
    pub grace_secs: u64,

    /// Optional charge-duration profile (CSV `Voltage,DurationSeconds`).
    pub charge_profile_path: Option<PathBuf>,
    /// Optional temperature-coefficient table (JSON object).
    pub temperature_coefficients_path: Option<PathBuf>,

    pub mqtt: MqttConfig,
}

/// Broker settings, only read with the `mqtt` feature.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "benchvisor".to_string(),
            keep_alive_secs: 60,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            registry_path: PathBuf::from("data/benches.json"),
            benches: (1..=4).map(|n| format!("bench{n}")).collect(),
            serial_pattern: "RW-48v271[A-Za-z0-9]{4}".to_string(),
            confirm_window_secs: 15,
            cooldown_business_hours: 48,
            watchdog_timeout_secs: 30,
            persistence_attempts: 3,
            persistence_backoff_ms: 200,
            bus_capacity: 1024,
            grace_secs: 10,
            charge_profile_path: None,
            temperature_coefficients_path: None,
            mqtt: MqttConfig::default(),
        }
    }
}

impl Config {
    /// Reads and validates a TOML config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&raw)
    }

    /// Parses and validates a TOML document.
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.benches.is_empty() {
            return Err(ConfigError::Invalid {
                reason: "at least one bench is required".into(),
            });
        }
        let mut seen = std::collections::HashSet::new();
        for name in &self.benches {
            let normalized = name.trim().to_ascii_lowercase();
            if normalized.is_empty()
                || normalized.contains('/')
                || RESERVED_INPUTS.contains(&normalized.as_str())
            {
                return Err(ConfigError::Invalid {
                    reason: format!("invalid bench name '{name}'"),
                });
            }
            if !seen.insert(normalized) {
                return Err(ConfigError::Invalid {
                    reason: format!("duplicate bench '{name}'"),
                });
            }
        }
        Regex::new(&self.serial_pattern).map_err(|e| ConfigError::Invalid {
            reason: format!("serial_pattern: {e}"),
        })?;
        Ok(())
    }

    /// Bench names normalized to lowercase.
    pub fn bench_names(&self) -> Vec<String> {
        self.benches
            .iter()
            .map(|b| b.trim().to_ascii_lowercase())
            .collect()
    }

    #[inline]
    pub fn confirm_window(&self) -> Duration {
        Duration::from_secs(self.confirm_window_secs)
    }

    #[inline]
    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_secs(self.watchdog_timeout_secs.max(1))
    }

    #[inline]
    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }

    /// Returns a bus capacity clamped to a minimum of 1.
    #[inline]
    pub fn bus_capacity_clamped(&self) -> usize {
        self.bus_capacity.max(1)
    }

    /// Retry policy for store writes inside a running test.
    pub fn persistence_retry(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.persistence_attempts.max(1),
            backoff: BackoffPolicy {
                first: Duration::from_millis(self.persistence_backoff_ms),
                max: Duration::from_secs(5),
                factor: 2.0,
                jitter: JitterPolicy::Equal,
            },
        }
    }
}

/// Bounded retry: `attempts` tries total, sleeping `backoff.next(n)` between them.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Config::default().persistence_retry()
    }
}
