//! # benchvisor
//!
//! **Benchvisor** coordinates battery test benches. Each bench runs an
//! embedded controller that reports progress as numbered steps over a
//! publish/subscribe bus; benchvisor decides which bench holds which battery,
//! runs one supervised test task per claimed bench, persists the test's
//! results, and raises an alert when a bench's sensor feed goes silent.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!   operator scans                                 bench controllers
//!        │                                                │  ▲
//!        ▼                                    benchX/step │  │ benchX/command
//! ┌──────────────┐  claim (flock)  ┌──────────────┐  bms/data │  │ benchX/security
//! │ Reservation  │ ──────────────► │   Registry   │ ri/results│  │ printer/test_done
//! │ bench→serial │                 │ benches.json │ ◄──┐      ▼  │
//! │   →confirm   │                 └──────────────┘    │ ┌──────────────┐
//! └──────┬───────┘                         ▲ mirror /  │ │  BusClient   │
//!        │ launch                          │ release   │ │ Local / MQTT │
//!        ▼                                 │           │ └──────┬───────┘
//! ┌───────────────────────────────────────────────────────────────┼──────┐
//! │  Supervisor                                                   │      │
//! │  - ActiveTests (one task per bench, liveness)                 │      │
//! │  - Bus (runtime events) ──► SubscriberSet ──► LogWriter, ...  │      │
//! │  - end broadcast, graceful shutdown                           │      │
//! └──────┬────────────────────────────────────────────────────────┼──────┘
//!        ▼                                                        │
//! ┌──────────────────────────────┐                                │
//! │ TestRunner (per bench)       │ ◄──────────────────────────────┘
//! │  ├─ TestSession (steps 1–9)  │──► data/<bench>/<DDMMYYYY>-<serial>/config.json
//! │  │                           │──► data/<bench>/<DDMMYYYY>-<serial>/data.csv
//! │  └─ Watchdog (30 s silence)  │
//! └──────────────────────────────┘
//! ```
//!
//! ### Test lifecycle
//! ```text
//! claim ──► TestRunner::run()
//!   ├─► open/resume test folder, publish command {current_step, capacity_ah, capacity_wh}
//!   └─► loop {
//!         step 1–4, 6–8 ─► record + registry mirror, continue
//!         step 5        ─► completed_at, close log, printer/test_done, release bench, exit
//!         step 9        ─► close log, exit (bench stays occupied)
//!         bms/data      ─► feed watchdog, append row, update capacity unless step 5/9
//!         ri/results    ─► merge averages
//!         cancelled     ─► exit (bench stays occupied, resumed after restart)
//!       }
//! ```
//!
//! ## Features
//! | Area            | Description                                               | Key types                                   |
//! |-----------------|-----------------------------------------------------------|---------------------------------------------|
//! | **Coordinator** | Spawn, supervise and shut down test tasks.                | [`Supervisor`], [`SupervisorBuilder`]       |
//! | **Reservation** | Three-scan bench claim and reset, cooldown, conflicts.    | [`Reservation`], [`ScanOutcome`]            |
//! | **Tests**       | Step state machine, measurement log, watchdog.            | [`TestSession`], [`TestRunner`], [`Watchdog`] |
//! | **Storage**     | Locked shared registry, per-test record and CSV log.      | [`RegistryStore`], [`RecordStore`], [`MeasurementLog`] |
//! | **Transport**   | Topic pub/sub, in-process or MQTT (`mqtt` feature).       | [`BusClient`], [`LocalBus`]                 |
//! | **Events**      | Runtime notifications fanned out to subscribers.          | [`Event`], [`Subscribe`], [`LogWriter`]     |
//! | **Errors**      | Typed errors with stable labels.                          | [`ReservationError`], [`StoreError`], ...   |
//!
//! ## Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use benchvisor::{Config, LogWriter, ScanOutcome, Subscribe, Supervisor};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let subs: Vec<Arc<dyn Subscribe>> = vec![Arc::new(LogWriter::new())];
//!     let sup = Supervisor::builder(Config::default())
//!         .with_subscribers(subs)
//!         .build()?;
//!
//!     let mut reservation = sup.reservation();
//!     for scan in ["bench1", "RW-48v2710001", "bench1"] {
//!         if let ScanOutcome::Claimed(state) = reservation.process_scan(scan).await? {
//!             println!("{} claimed", state.name);
//!         }
//!     }
//!
//!     sup.run().await?;
//!     Ok(())
//! }
//! ```
mod bus;
mod business_hours;
mod clock;
mod config;
mod core;
mod error;
mod events;
mod policies;
mod reference;
mod reservation;
mod session;
mod step;
mod store;
mod subscribers;

// ---- Public re-exports ----

pub use bus::{BenchTopics, BusClient, END_COMMAND, LocalBus, Message, Qos, Subscription, TEST_DONE_TOPIC, qos_for};
pub use business_hours::{add_business_hours, cooldown_ends, within_cooldown};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, MqttConfig, RetryPolicy};
pub use core::{Supervisor, SupervisorBuilder};
pub use error::{
    BuildError, BusError, ConfigError, ConflictError, ParseError, ReservationError, RuntimeError,
    SessionError, StoreError, ValidationError,
};
pub use events::{Bus, Event, EventKind};
pub use policies::{BackoffPolicy, JitterPolicy};
pub use reference::{ChargeProfile, ReferenceData, TemperatureCoefficients};
pub use reservation::{
    RESET_COMMAND, Reservation, ReservationSettings, ScanOutcome, SerialFormat, TestHost,
};
pub use session::{ExitReason, Flow, TestContext, TestRunner, TestSession, Watchdog, WatchdogSpec};
pub use step::{Mode, Step};
pub use store::{
    BMS_FIELD_COUNT, BenchState, BenchStatus, BenchTable, BmsSample, CELL_COUNT, ClaimRequest,
    MEASUREMENT_FILE, MeasurementLog, OpenedRecord, RECORD_FILE, RecordStore, RegistryStore,
    RiResults, TestRecord, latest_record_for_serial,
};
pub use subscribers::{LogWriter, Subscribe, SubscriberSet};

// MQTT transport.
// Enable with: `--features mqtt`
#[cfg(feature = "mqtt")]
pub use bus::MqttBus;
