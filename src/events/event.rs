//! # Runtime events emitted by the coordinator and test tasks.
//!
//! [`EventKind`] groups:
//! - **Reservation**: claims, rollbacks, operator resets
//! - **Test lifecycle**: start, step changes, completion, manual stop, failure
//! - **Alerts**: sensor silence, persistence escalation
//! - **Shutdown** and **subscriber** housekeeping
//!
//! Each event carries a globally unique, monotonically increasing `seq`.
//!
//! ```rust
//! use benchvisor::{Event, EventKind, Step};
//!
//! let ev = Event::new(EventKind::StepChanged)
//!     .with_bench("bench1")
//!     .with_serial("RW-48v2710001")
//!     .with_step(Step::Discharge);
//!
//! assert_eq!(ev.bench.as_deref(), Some("bench1"));
//! assert_eq!(ev.step, Some(Step::Discharge));
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::SystemTime;

use crate::step::Step;

static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    // === Subscriber events ===
    /// Subscriber panicked. Sets `reason` (panic message) and `bench` (subscriber name).
    SubscriberPanicked,
    /// Subscriber dropped an event. Sets `reason`.
    SubscriberOverflow,

    // === Shutdown ===
    ShutdownRequested,
    AllStoppedWithin,
    GraceExceeded,

    // === Reservation ===
    /// Confirm succeeded. Sets `bench`, `serial`.
    BenchClaimed,
    /// Launch failed after a claim; registry restored. Sets `bench`, `serial`, `reason`.
    ClaimRolledBack,
    /// Operator reset a stale bench. Sets `bench`.
    BenchReset,
    /// Operator asked every controller to stop.
    EndBroadcast,

    // === Test lifecycle ===
    /// Test task started. Sets `bench`, `serial`, `step`; `reason` is "resumed" or "new".
    TestStarting,
    /// Valid step received. Sets `bench`, `serial`, `step`.
    StepChanged,
    /// Step 5: bench released. Sets `bench`, `serial`.
    TestCompleted,
    /// Step 9: test ended, bench left occupied. Sets `bench`, `serial`.
    TestStopped,
    /// Test task cancelled by shutdown. Sets `bench`, `serial`.
    TestCancelled,
    /// Test task ended abnormally. Sets `bench`, `serial`, `reason`.
    TestFailed,

    // === Alerts ===
    /// Sensor data silent past the watchdog timeout. Sets `bench`, `serial`.
    LivenessAlert,
    /// Store write retries exhausted. Sets `bench`, `serial`, `reason`.
    PersistenceEscalated,
}

/// Runtime event with optional metadata.
#[derive(Clone, Debug)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    pub at: SystemTime,
    pub kind: EventKind,
    pub bench: Option<Arc<str>>,
    pub serial: Option<Arc<str>>,
    pub step: Option<Step>,
    pub reason: Option<Arc<str>>,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            bench: None,
            serial: None,
            step: None,
            reason: None,
        }
    }

    #[inline]
    pub fn with_bench(mut self, bench: impl Into<Arc<str>>) -> Self {
        self.bench = Some(bench.into());
        self
    }

    #[inline]
    pub fn with_serial(mut self, serial: impl Into<Arc<str>>) -> Self {
        self.serial = Some(serial.into());
        self
    }

    #[inline]
    pub fn with_step(mut self, step: Step) -> Self {
        self.step = Some(step);
        self
    }

    #[inline]
    pub fn with_reason(mut self, reason: impl Into<Arc<str>>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    #[inline]
    pub fn subscriber_overflow(subscriber: &'static str, reason: &'static str) -> Self {
        Event::new(EventKind::SubscriberOverflow)
            .with_bench(subscriber)
            .with_reason(format!("subscriber={subscriber} reason={reason}"))
    }

    #[inline]
    pub fn subscriber_panicked(subscriber: &'static str, info: String) -> Self {
        Event::new(EventKind::SubscriberPanicked)
            .with_bench(subscriber)
            .with_reason(info)
    }
}
