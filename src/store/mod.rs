//! Durable state: the shared bench registry and the per-test folder.
//!
//! - [`RegistryStore`] shared by every task; every mutation is an atomic
//!   read-modify-write under a file lock
//! - [`RecordStore`] / [`TestRecord`] owned by one test task
//! - [`MeasurementLog`] append-only CSV owned by one test task

mod fsutil;
mod measurement;
mod record;
mod registry;

pub use measurement::{BMS_FIELD_COUNT, BmsSample, CELL_COUNT, MeasurementLog};
pub use record::{
    MEASUREMENT_FILE, OpenedRecord, RECORD_FILE, RecordStore, RiResults, TestRecord,
    latest_record_for_serial,
};
pub use registry::{BenchState, BenchStatus, BenchTable, ClaimRequest, RegistryStore};
