//! # Per-test record and test folders.
//!
//! Each bench/serial test lives in its own folder:
//!
//! ```text
//! <data_dir>/<bench>/<DDMMYYYY>-<serial>/
//!     config.json   ← TestRecord (rewritten atomically)
//!     data.csv      ← measurement log (append-only)
//! ```
//!
//! Folders are never deleted. A folder for the same serial on the same bench
//! whose record is not completed is resumed instead of creating a new one.
//! Only the test task owning the folder writes to it.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ParseError, StoreError};
use crate::step::Step;
use crate::store::fsutil::{read_json, write_json};

pub const RECORD_FILE: &str = "config.json";
pub const MEASUREMENT_FILE: &str = "data.csv";

/// Durable result document of one test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRecord {
    #[serde(rename = "battery_serial")]
    pub serial: String,
    pub bench: String,
    /// Last valid step reached.
    pub current_step: Step,
    #[serde(rename = "first_handle")]
    pub first_handled_at: NaiveDateTime,
    #[serde(rename = "timestamp_last_update")]
    pub last_updated_at: NaiveDateTime,
    /// Set when step 5 is reached; the folder is then archived in place.
    #[serde(default)]
    pub completed_at: Option<NaiveDateTime>,

    #[serde(default)]
    pub capacity_ah: Option<f64>,
    #[serde(default)]
    pub capacity_wh: Option<f64>,

    #[serde(default, rename = "ri_discharge_average")]
    pub ri_discharge_avg: Option<f64>,
    #[serde(default, rename = "ri_charge_average")]
    pub ri_charge_avg: Option<f64>,
    #[serde(default, rename = "diffusion_discharge_average")]
    pub diffusion_discharge_avg: Option<f64>,
    #[serde(default, rename = "diffusion_charge_average")]
    pub diffusion_charge_avg: Option<f64>,

    #[serde(default, rename = "delta_ri_average")]
    pub delta_ri_avg: Option<f64>,
    #[serde(default, rename = "delta_diffusion_average")]
    pub delta_diffusion_avg: Option<f64>,
    /// Per-cell deltas as reported; unreadable entries are kept as `null`.
    #[serde(default)]
    pub delta_ri_cells: Option<Vec<Option<f64>>>,
    #[serde(default)]
    pub delta_diffusion_cells: Option<Vec<Option<f64>>>,
}

impl TestRecord {
    pub fn new(bench: impl Into<String>, serial: impl Into<String>, now: NaiveDateTime) -> Self {
        Self {
            serial: serial.into(),
            bench: bench.into(),
            current_step: Step::InternalResistance,
            first_handled_at: now,
            last_updated_at: now,
            completed_at: None,
            capacity_ah: None,
            capacity_wh: None,
            ri_discharge_avg: None,
            ri_charge_avg: None,
            diffusion_discharge_avg: None,
            diffusion_charge_avg: None,
            delta_ri_avg: None,
            delta_diffusion_avg: None,
            delta_ri_cells: None,
            delta_diffusion_cells: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some() || self.current_step == Step::Completed
    }

    /// Merges resistance/diffusion results. Absent fields are left untouched.
    pub fn merge_ri(&mut self, ri: &RiResults) {
        fn set<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
            if let Some(v) = value {
                *slot = Some(v.clone());
            }
        }
        set(&mut self.ri_discharge_avg, &ri.ri_discharge_average);
        set(&mut self.ri_charge_avg, &ri.ri_charge_average);
        set(&mut self.diffusion_discharge_avg, &ri.diffusion_discharge_average);
        set(&mut self.diffusion_charge_avg, &ri.diffusion_charge_average);
        set(&mut self.delta_ri_avg, &ri.delta_ri_average);
        set(&mut self.delta_diffusion_avg, &ri.delta_diffusion_average);
        set(&mut self.delta_ri_cells, &ri.delta_ri_cells);
        set(&mut self.delta_diffusion_cells, &ri.delta_diffusion_cells);
    }
}

/// `benchX/ri/results` payload.
///
/// Keys are read one at a time: a value that is not a number (or a numeric
/// string) drops only that key, and the cell lists are taken only when they
/// are arrays.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RiResults {
    pub ri_discharge_average: Option<f64>,
    pub ri_charge_average: Option<f64>,
    pub diffusion_discharge_average: Option<f64>,
    pub diffusion_charge_average: Option<f64>,
    pub delta_ri_average: Option<f64>,
    pub delta_diffusion_average: Option<f64>,
    pub delta_ri_cells: Option<Vec<Option<f64>>>,
    pub delta_diffusion_cells: Option<Vec<Option<f64>>>,
}

impl RiResults {
    /// Fails only when the payload is not a JSON object.
    pub fn parse(payload: &str) -> Result<Self, ParseError> {
        let fields: Map<String, Value> =
            serde_json::from_str(payload).map_err(|source| ParseError::RiResults { source })?;
        Ok(Self {
            ri_discharge_average: average(&fields, "ri_discharge_average"),
            ri_charge_average: average(&fields, "ri_charge_average"),
            diffusion_discharge_average: average(&fields, "diffusion_discharge_average"),
            diffusion_charge_average: average(&fields, "diffusion_charge_average"),
            delta_ri_average: average(&fields, "delta_ri_average"),
            delta_diffusion_average: average(&fields, "delta_diffusion_average"),
            delta_ri_cells: cells(&fields, "delta_ri_cells"),
            delta_diffusion_cells: cells(&fields, "delta_diffusion_cells"),
        })
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

fn number(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

fn average(fields: &Map<String, Value>, key: &str) -> Option<f64> {
    let value = fields.get(key)?;
    let parsed = number(value);
    if parsed.is_none() {
        tracing::warn!(key, value = %value, "invalid ri value ignored");
    }
    parsed
}

fn cells(fields: &Map<String, Value>, key: &str) -> Option<Vec<Option<f64>>> {
    match fields.get(key)? {
        Value::Array(items) => Some(items.iter().map(number).collect()),
        other => {
            tracing::warn!(key, value = %other, "ri cell list is not an array; ignored");
            None
        }
    }
}

/// Owner of one test folder.
#[derive(Debug, Clone)]
pub struct RecordStore {
    dir: PathBuf,
}

/// Result of [`RecordStore::open`].
#[derive(Debug)]
pub struct OpenedRecord {
    pub store: RecordStore,
    pub record: TestRecord,
    /// `true` when an incomplete prior run was picked up.
    pub resumed: bool,
}

impl RecordStore {
    /// Resumes the latest incomplete folder for `serial` on `bench`, or creates a new one.
    pub fn open(
        data_dir: &Path,
        bench: &str,
        serial: &str,
        now: NaiveDateTime,
    ) -> Result<OpenedRecord, StoreError> {
        let bench_dir = data_dir.join(bench);
        fs::create_dir_all(&bench_dir)
            .map_err(|e| StoreError::io(format!("creating {}", bench_dir.display()), e))?;

        let resumable = load_records_for_serial(&bench_dir, serial)?
            .into_iter()
            .filter(|(_, rec)| !rec.is_completed())
            .max_by_key(|(_, rec)| rec.last_updated_at);

        if let Some((dir, record)) = resumable {
            tracing::info!(bench, serial, folder = %dir.display(), step = record.current_step.code(), "resuming test folder");
            return Ok(OpenedRecord {
                store: RecordStore { dir },
                record,
                resumed: true,
            });
        }

        let dir = fresh_folder(&bench_dir, serial, now);
        fs::create_dir_all(&dir)
            .map_err(|e| StoreError::io(format!("creating {}", dir.display()), e))?;
        let store = RecordStore { dir };
        let record = TestRecord::new(bench, serial, now);
        store.save(&record)?;
        tracing::info!(bench, serial, folder = %store.dir.display(), "created test folder");
        Ok(OpenedRecord {
            store,
            record,
            resumed: false,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record_path(&self) -> PathBuf {
        self.dir.join(RECORD_FILE)
    }

    pub fn measurement_path(&self) -> PathBuf {
        self.dir.join(MEASUREMENT_FILE)
    }

    pub fn load(&self) -> Result<TestRecord, StoreError> {
        let path = self.record_path();
        read_json(&path)?.ok_or_else(|| {
            StoreError::io(
                format!("reading {}", path.display()),
                io::Error::new(io::ErrorKind::NotFound, "test record missing"),
            )
        })
    }

    pub fn save(&self, record: &TestRecord) -> Result<(), StoreError> {
        write_json(&self.record_path(), record)
    }
}

/// Most recently updated record for `serial` across every bench.
pub fn latest_record_for_serial(
    data_dir: &Path,
    serial: &str,
) -> Result<Option<TestRecord>, StoreError> {
    let mut latest: Option<TestRecord> = None;
    for bench_dir in subdirs(data_dir)? {
        for (_, record) in load_records_for_serial(&bench_dir, serial)? {
            if latest
                .as_ref()
                .is_none_or(|l| record.last_updated_at > l.last_updated_at)
            {
                latest = Some(record);
            }
        }
    }
    Ok(latest)
}

fn fresh_folder(bench_dir: &Path, serial: &str, now: NaiveDateTime) -> PathBuf {
    let date = now.format("%d%m%Y").to_string();
    let first = bench_dir.join(format!("{date}-{serial}"));
    if !first.exists() {
        return first;
    }
    (2u32..)
        .map(|n| bench_dir.join(format!("{date}.{n}-{serial}")))
        .find(|p| !p.exists())
        .unwrap_or(first)
}

fn subdirs(dir: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(format!("listing {}", dir.display()), e)),
    };
    let mut out = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::io(format!("listing {}", dir.display()), e))?;
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            out.push(entry.path());
        }
    }
    out.sort();
    Ok(out)
}

/// Folders in `bench_dir` named `*-<serial>` with a readable record.
fn load_records_for_serial(
    bench_dir: &Path,
    serial: &str,
) -> Result<Vec<(PathBuf, TestRecord)>, StoreError> {
    let suffix = format!("-{serial}");
    let mut out = Vec::new();
    for dir in subdirs(bench_dir)? {
        let matches = dir
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(&suffix));
        if !matches {
            continue;
        }
        match read_json::<TestRecord>(&dir.join(RECORD_FILE)) {
            Ok(Some(record)) => out.push((dir, record)),
            Ok(None) => {
                tracing::warn!(folder = %dir.display(), "test folder without record, ignored");
            }
            Err(e) => {
                tracing::warn!(folder = %dir.display(), error = %e, "unreadable test record, ignored");
            }
        }
    }
    Ok(out)
}
