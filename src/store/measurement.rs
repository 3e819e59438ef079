//! # Measurement log: append-only CSV of raw BMS samples.
//!
//! `benchX/bms/data` carries 27 comma-separated numbers:
//!
//! ```text
//! idx  0 Voltage         1 Current          2 SOC            3 Temperature
//!      4 MaxCellNum      5 MaxCellV         6 MinCellNum     7 MinCellV
//!      8 DischargedCapacity (Ah)            9 DischargedEnergy (Wh)
//!  10..24 Cell_1mV .. Cell_15mV
//!     25 HeartBeat      26 AverageNurseSOC
//! ```
//!
//! Each row is prefixed with the wall-clock timestamp and the mode derived
//! from the step in effect at write time, then flushed immediately.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;

use crate::error::{ParseError, StoreError};
use crate::step::Mode;

pub const CELL_COUNT: usize = 15;
pub const BMS_FIELD_COUNT: usize = 12 + CELL_COUNT;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One decoded `bms/data` sample.
#[derive(Debug, Clone, PartialEq)]
pub struct BmsSample {
    values: [f64; BMS_FIELD_COUNT],
}

impl BmsSample {
    /// Parses a payload with exactly [`BMS_FIELD_COUNT`] numeric fields.
    pub fn parse(payload: &str) -> Result<Self, ParseError> {
        let fields: Vec<&str> = payload.trim().split(',').map(str::trim).collect();
        if fields.len() != BMS_FIELD_COUNT {
            return Err(ParseError::BmsFieldCount {
                got: fields.len(),
                expected: BMS_FIELD_COUNT,
            });
        }
        let mut values = [0.0; BMS_FIELD_COUNT];
        for (index, (slot, raw)) in values.iter_mut().zip(&fields).enumerate() {
            *slot = raw
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .ok_or_else(|| ParseError::BmsField {
                    index,
                    value: raw.to_string(),
                })?;
        }
        Ok(Self { values })
    }

    pub fn voltage(&self) -> f64 {
        self.values[0]
    }

    pub fn temperature(&self) -> f64 {
        self.values[3]
    }

    /// Cumulative discharged capacity in Ah.
    pub fn capacity_ah(&self) -> f64 {
        self.values[8]
    }

    /// Cumulative discharged energy in Wh.
    pub fn energy_wh(&self) -> f64 {
        self.values[9]
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }
}

/// CSV header, including the timestamp and mode columns.
pub fn header() -> Vec<String> {
    let mut cols: Vec<String> = [
        "Timestamp",
        "Mode",
        "Voltage",
        "Current",
        "SOC",
        "Temperature",
        "MaxCellNum",
        "MaxCellV",
        "MinCellNum",
        "MinCellV",
        "DischargedCapacity",
        "DischargedEnergy",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    cols.extend((1..=CELL_COUNT).map(|i| format!("Cell_{i}mV")));
    cols.push("HeartBeat".into());
    cols.push("AverageNurseSOC".into());
    cols
}

/// Append-only writer for `data.csv`.
pub struct MeasurementLog {
    path: PathBuf,
    writer: csv::Writer<File>,
}

impl MeasurementLog {
    /// Opens the log for append, writing the header when the file is new or empty.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| StoreError::io(format!("opening {}", path.display()), e))?;
        let empty = file
            .metadata()
            .map_err(|e| StoreError::io(format!("stat {}", path.display()), e))?
            .len()
            == 0;

        let writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        let mut log = Self { path, writer };
        if empty {
            log.write_row(header())?;
        }
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one sample and flushes it to the OS.
    pub fn append(
        &mut self,
        at: NaiveDateTime,
        mode: Mode,
        sample: &BmsSample,
    ) -> Result<(), StoreError> {
        let mut row = Vec::with_capacity(BMS_FIELD_COUNT + 2);
        row.push(at.format(TIMESTAMP_FORMAT).to_string());
        row.push(mode.as_str().to_string());
        row.extend(sample.values().iter().map(|v| v.to_string()));
        self.write_row(row)
    }

    fn write_row(&mut self, row: Vec<String>) -> Result<(), StoreError> {
        self.writer
            .write_record(&row)
            .map_err(|e| StoreError::csv(format!("writing {}", self.path.display()), e))?;
        self.writer
            .flush()
            .map_err(|e| StoreError::io(format!("flushing {}", self.path.display()), e))
    }

    /// Flushes and syncs the log to disk.
    pub fn close(mut self) -> Result<(), StoreError> {
        self.writer
            .flush()
            .map_err(|e| StoreError::io(format!("flushing {}", self.path.display()), e))?;
        self.writer
            .get_ref()
            .sync_all()
            .map_err(|e| StoreError::io(format!("syncing {}", self.path.display()), e))
    }
}
