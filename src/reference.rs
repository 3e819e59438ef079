//! # Read-only reference data.
//!
//! - [`ChargeProfile`]: CSV `Voltage,DurationSeconds`, estimated remaining
//!   charge time for a pack voltage (linear interpolation, clamped at the ends)
//! - [`TemperatureCoefficients`]: JSON map `"°C" → factor` used to correct
//!   diffusion averages for pack temperature (nearest integer, default 1.0)
//!
//! Both are loaded once at startup and shared with every test task.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::config::Config;
use crate::error::ConfigError;

#[derive(Debug, Deserialize)]
struct ProfileRow {
    #[serde(rename = "Voltage")]
    voltage: f64,
    #[serde(rename = "DurationSeconds")]
    duration_secs: u64,
}

/// Voltage → remaining charge duration, sorted by voltage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChargeProfile {
    points: Vec<(f64, u64)>,
}

impl ChargeProfile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let reference = |reason: String| ConfigError::Reference {
            path: path.to_path_buf(),
            reason,
        };
        let mut reader = csv::Reader::from_path(path).map_err(|e| reference(e.to_string()))?;
        let mut points = Vec::new();
        for (line, row) in reader.deserialize::<ProfileRow>().enumerate() {
            match row {
                Ok(row) if row.voltage.is_finite() => points.push((row.voltage, row.duration_secs)),
                Ok(_) | Err(_) => {
                    tracing::warn!(path = %path.display(), line = line + 2, "skipping invalid charge profile row");
                }
            }
        }
        if points.is_empty() {
            return Err(reference("no valid rows".to_string()));
        }
        Ok(Self::from_points(points))
    }

    pub fn from_points(mut points: Vec<(f64, u64)>) -> Self {
        points.sort_by(|a, b| a.0.total_cmp(&b.0));
        Self { points }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Estimated remaining charge time at `volts`; `None` for an empty profile.
    pub fn remaining(&self, volts: f64) -> Option<Duration> {
        let (first, last) = (self.points.first()?, self.points.last()?);
        if volts <= first.0 {
            return Some(Duration::from_secs(first.1));
        }
        if volts >= last.0 {
            return Some(Duration::from_secs(last.1));
        }
        let idx = self.points.partition_point(|(v, _)| *v < volts);
        let (v2, d2) = self.points[idx];
        let (v1, d1) = self.points[idx - 1];
        if v2 == volts {
            return Some(Duration::from_secs(d2));
        }
        if v2 == v1 {
            return Some(Duration::from_secs(d1));
        }
        let ratio = (volts - v1) / (v2 - v1);
        let secs = d1 as f64 + (d2 as f64 - d1 as f64) * ratio;
        Some(Duration::from_secs(secs.max(0.0) as u64))
    }
}

/// Temperature (°C, integer) → diffusion correction factor.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemperatureCoefficients {
    table: HashMap<i64, f64>,
}

impl TemperatureCoefficients {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let reference = |reason: String| ConfigError::Reference {
            path: path.to_path_buf(),
            reason,
        };
        let raw = fs::read_to_string(path).map_err(|e| reference(e.to_string()))?;
        let parsed: HashMap<String, f64> =
            serde_json::from_str(&raw).map_err(|e| reference(e.to_string()))?;
        let mut table = HashMap::with_capacity(parsed.len());
        for (key, factor) in parsed {
            let celsius = key
                .trim()
                .parse::<i64>()
                .map_err(|_| reference(format!("temperature key '{key}' is not an integer")))?;
            table.insert(celsius, factor);
        }
        Ok(Self { table })
    }

    pub fn from_table(table: HashMap<i64, f64>) -> Self {
        Self { table }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Factor for the nearest integer temperature; 1.0 when unknown.
    pub fn factor(&self, celsius: f64) -> f64 {
        if !celsius.is_finite() {
            return 1.0;
        }
        self.table
            .get(&(celsius.round() as i64))
            .copied()
            .unwrap_or(1.0)
    }
}

/// Reference data bundle handed to test tasks.
#[derive(Debug, Clone, Default)]
pub struct ReferenceData {
    pub charge_profile: ChargeProfile,
    pub temperature: TemperatureCoefficients,
}

impl ReferenceData {
    /// Loads whatever paths `cfg` names; missing entries stay empty.
    pub fn load(cfg: &Config) -> Result<Self, ConfigError> {
        let charge_profile = match &cfg.charge_profile_path {
            Some(path) => ChargeProfile::load(path)?,
            None => ChargeProfile::default(),
        };
        let temperature = match &cfg.temperature_coefficients_path {
            Some(path) => TemperatureCoefficients::load(path)?,
            None => TemperatureCoefficients::default(),
        };
        tracing::info!(
            charge_points = charge_profile.len(),
            temperature_points = temperature.len(),
            "reference data loaded"
        );
        Ok(Self {
            charge_profile,
            temperature,
        })
    }

    /// Mean of the non-zero diffusion averages, scaled by the temperature factor.
    pub fn corrected_diffusion(
        &self,
        discharge: Option<f64>,
        charge: Option<f64>,
        celsius: f64,
    ) -> Option<f64> {
        let values: Vec<f64> = [discharge, charge]
            .into_iter()
            .flatten()
            .filter(|v| *v != 0.0)
            .collect();
        if values.is_empty() {
            return None;
        }
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        Some(mean * self.temperature.factor(celsius))
    }
}
