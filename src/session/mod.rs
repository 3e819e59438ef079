//! Running tests: one supervised task per bench.
//!
//! ```text
//! TestRunner::run(token)
//!   ├─ subscribe benchX/{step, bms/data, ri/results}
//!   ├─ TestSession::open        (resume or create the test folder)
//!   ├─ announce on benchX/command
//!   ├─ Watchdog::spawn          (background timer, fed by bms/data)
//!   └─ loop select!
//!        ├─ token.cancelled()   → Cancelled (bench stays occupied)
//!        └─ message             → TestSession::handle
//!                                   ├─ step 1–4, 6–8 → persist record + registry mirror
//!                                   ├─ step 5        → archive, close log, release bench, exit
//!                                   └─ step 9        → close log, exit (bench stays occupied)
//! ```

mod machine;
mod retry;
mod runner;
mod watchdog;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::bus::{BenchTopics, BusClient};
use crate::clock::Clock;
use crate::config::RetryPolicy;
use crate::events::Bus;
use crate::reference::ReferenceData;
use crate::store::RegistryStore;

pub use machine::{Flow, TestSession};
pub use runner::TestRunner;
pub use watchdog::{Watchdog, WatchdogSpec};

/// How a test task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Step 5: bench released.
    Completed,
    /// Step 9: bench left occupied for an operator decision.
    ManualStop,
    /// Coordinator shutdown; bench left occupied for resume.
    Cancelled,
}

impl ExitReason {
    pub fn as_label(&self) -> &'static str {
        match self {
            ExitReason::Completed => "completed",
            ExitReason::ManualStop => "manual_stop",
            ExitReason::Cancelled => "cancelled",
        }
    }
}

/// Everything a test task needs; built by the supervisor per claim.
#[derive(Clone)]
pub struct TestContext {
    pub bench: String,
    pub serial: String,
    pub topics: BenchTopics,
    pub bus: Arc<dyn BusClient>,
    pub events: Bus,
    pub registry: RegistryStore,
    pub data_dir: PathBuf,
    pub retry: RetryPolicy,
    pub watchdog_timeout: Duration,
    pub clock: Arc<dyn Clock>,
    pub reference: Arc<ReferenceData>,
}
