//! Error types used by the coordination runtime.
//!
//! - [`ReservationError`]: operator-facing failures of the bench handshake
//!   (validation, conflict, cooldown). None of them mutate state.
//! - [`StoreError`]: registry / record / log persistence failures.
//! - [`ParseError`]: malformed inbound bus payloads.
//! - [`BusError`]: transport failures.
//! - [`SessionError`]: failures surfaced by a running test.
//! - [`ConfigError`]: configuration loading and validation.
//! - [`BuildError`]: supervisor assembly (config, reference data, registry).
//! - [`RuntimeError`]: failures of the coordinator itself (shutdown).
//!
//! Every enum exposes `as_label()` (stable snake_case) for structured logs.

use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveDateTime;
use thiserror::Error;

/// # Errors produced by the coordinator runtime.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// Shutdown grace period was exceeded; some tests remained stuck.
    #[error("shutdown timeout {grace:?} exceeded; stuck: {stuck:?}; forcing termination")]
    GraceExceeded {
        /// The configured grace duration.
        grace: Duration,
        /// Benches whose test task did not stop in time.
        stuck: Vec<String>,
    },
}

impl RuntimeError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            RuntimeError::GraceExceeded { .. } => "runtime_grace_exceeded",
        }
    }
}

/// Input rejected by the handshake; surfaced to the operator, nothing mutated.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("unknown bench '{input}'")]
    UnknownBench { input: String },

    #[error("'{input}' does not contain a valid battery serial")]
    MalformedSerial { input: String },

    /// The bench is occupied by another serial.
    #[error("bench {bench} holds serial {pending}, scanned {scanned}")]
    SerialMismatch {
        bench: String,
        pending: String,
        scanned: String,
    },

    /// Confirm scan names a different bench than the first scan.
    #[error("confirmation scanned {scanned}, expected {expected}")]
    BenchMismatch { expected: String, scanned: String },

    #[error("confirmation window of {window:?} expired")]
    WindowExpired { window: Duration },

    /// A step of the handshake was attempted before the previous one.
    #[error("unexpected scan: {expected} expected first")]
    OutOfOrder { expected: &'static str },

    /// Anything but a second `reset` after the bench to reset was scanned.
    #[error("reset of {bench} not confirmed (scanned '{scanned}')")]
    ResetNotConfirmed { bench: String, scanned: String },
}

/// Bench or serial already claimed.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConflictError {
    #[error("a test is already running on {bench}")]
    BenchLive { bench: String },

    #[error("serial {serial} is already pending on {bench}")]
    SerialClaimed { serial: String, bench: String },

    /// The registry entry moved between the first scan and the confirmation.
    #[error("{bench} was modified concurrently (revision {observed} -> {current})")]
    BenchChanged {
        bench: String,
        observed: u64,
        current: u64,
    },

    /// Operator reset refused because the bench has a live test.
    #[error("{bench} cannot be reset while its test is running")]
    BenchBusy { bench: String },
}

/// # Errors produced by the reservation handshake.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ReservationError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Conflict(#[from] ConflictError),

    /// Serial was tested too recently.
    #[error("serial {serial} last tested at {last_update}; eligible again at {eligible_at}")]
    Cooldown {
        serial: String,
        last_update: NaiveDateTime,
        eligible_at: NaiveDateTime,
    },

    #[error("registry unavailable: {0}")]
    Store(#[from] StoreError),

    /// Test could not be spawned after a successful claim (claim rolled back).
    #[error("failed to launch test on {bench}: {reason}")]
    Launch { bench: String, reason: String },
}

impl ReservationError {
    pub fn as_label(&self) -> &'static str {
        match self {
            ReservationError::Validation(_) => "reservation_validation",
            ReservationError::Conflict(_) => "reservation_conflict",
            ReservationError::Cooldown { .. } => "reservation_cooldown",
            ReservationError::Store(_) => "reservation_store",
            ReservationError::Launch { .. } => "reservation_launch",
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ReservationError::Conflict(_))
    }
}

/// # Persistence failures of the registry, test record, and measurement log.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{context}: {source}")]
    Csv {
        context: String,
        #[source]
        source: csv::Error,
    },

    #[error("unknown bench '{bench}'")]
    UnknownBench { bench: String },

    /// Refused to persist a registry table that breaks an invariant.
    #[error("registry invariant violated: {detail}")]
    Invariant { detail: String },
}

impl StoreError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        StoreError::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        StoreError::Json {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn csv(context: impl Into<String>, source: csv::Error) -> Self {
        StoreError::Csv {
            context: context.into(),
            source,
        }
    }

    pub fn as_label(&self) -> &'static str {
        match self {
            StoreError::Io { .. } => "store_io",
            StoreError::Json { .. } => "store_json",
            StoreError::Csv { .. } => "store_csv",
            StoreError::UnknownBench { .. } => "store_unknown_bench",
            StoreError::Invariant { .. } => "store_invariant",
        }
    }
}

/// # Malformed inbound payloads.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("invalid step payload '{payload}'")]
    Step { payload: String },

    #[error("bms payload has {got} fields, expected {expected}")]
    BmsFieldCount { got: usize, expected: usize },

    #[error("bms field {index} ('{value}') is not numeric")]
    BmsField { index: usize, value: String },

    #[error("ri results payload: {source}")]
    RiResults {
        #[source]
        source: serde_json::Error,
    },
}

impl ParseError {
    pub fn as_label(&self) -> &'static str {
        match self {
            ParseError::Step { .. } => "parse_step",
            ParseError::BmsFieldCount { .. } => "parse_bms_field_count",
            ParseError::BmsField { .. } => "parse_bms_field",
            ParseError::RiResults { .. } => "parse_ri_results",
        }
    }
}

/// # Transport failures of a [`BusClient`](crate::bus::BusClient).
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum BusError {
    #[error("bus closed")]
    Closed,

    #[error("bus transport error: {reason}")]
    Transport { reason: String },
}

impl BusError {
    pub fn as_label(&self) -> &'static str {
        match self {
            BusError::Closed => "bus_closed",
            BusError::Transport { .. } => "bus_transport",
        }
    }
}

/// # Errors that end a running test abnormally.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Bus(#[from] BusError),
}

impl SessionError {
    pub fn as_label(&self) -> &'static str {
        match self {
            SessionError::Store(e) => e.as_label(),
            SessionError::Bus(e) => e.as_label(),
        }
    }
}

/// # Configuration loading errors.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid config: {reason}")]
    Invalid { reason: String },

    #[error("reference data {path}: {reason}")]
    Reference { path: PathBuf, reason: String },
}

impl ConfigError {
    pub fn as_label(&self) -> &'static str {
        match self {
            ConfigError::Io { .. } => "config_io",
            ConfigError::Toml(_) => "config_toml",
            ConfigError::Invalid { .. } => "config_invalid",
            ConfigError::Reference { .. } => "config_reference",
        }
    }
}

/// # Errors raised while assembling the supervisor.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to open bench registry: {0}")]
    Store(#[from] StoreError),
}
