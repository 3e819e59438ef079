//! # LogWriter: renders runtime events through `tracing`.
//!
//! ```text
//! INFO  bench claimed bench="bench1" serial="RW-48v271ABCD"
//! INFO  step changed bench="bench1" serial="RW-48v271ABCD" step=3
//! WARN  sensor data silent bench="bench1" serial="RW-48v271ABCD"
//! ```

use async_trait::async_trait;

use crate::events::{Event, EventKind};
use crate::subscribers::Subscribe;

#[derive(Default)]
pub struct LogWriter;

impl LogWriter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Subscribe for LogWriter {
    async fn on_event(&self, e: &Event) {
        let bench = e.bench.as_deref().unwrap_or("-");
        let serial = e.serial.as_deref().unwrap_or("-");
        let step = e.step.map(|s| s.code()).unwrap_or(0);
        let reason = e.reason.as_deref().unwrap_or("");

        match e.kind {
            EventKind::BenchClaimed => tracing::info!(bench, serial, seq = e.seq, "bench claimed"),
            EventKind::ClaimRolledBack => {
                tracing::warn!(bench, serial, reason, "claim rolled back")
            }
            EventKind::BenchReset => tracing::warn!(bench, "bench reset by operator"),
            EventKind::EndBroadcast => tracing::info!("end requested on all benches"),
            EventKind::TestStarting => {
                tracing::info!(bench, serial, step, mode = reason, "test starting")
            }
            EventKind::StepChanged => tracing::info!(bench, serial, step, "step changed"),
            EventKind::TestCompleted => {
                tracing::info!(bench, serial, "test completed; bench released")
            }
            EventKind::TestStopped => {
                tracing::info!(bench, serial, "test stopped manually; bench left occupied")
            }
            EventKind::TestCancelled => tracing::info!(bench, serial, "test cancelled"),
            EventKind::TestFailed => tracing::error!(bench, serial, reason, "test failed"),
            EventKind::LivenessAlert => tracing::warn!(bench, serial, "sensor data silent"),
            EventKind::PersistenceEscalated => {
                tracing::error!(bench, serial, reason, "persistence retries exhausted")
            }
            EventKind::ShutdownRequested => tracing::info!("shutdown requested"),
            EventKind::AllStoppedWithin => tracing::info!("all tests stopped within grace"),
            EventKind::GraceExceeded => tracing::warn!("shutdown grace exceeded"),
            EventKind::SubscriberOverflow => tracing::warn!(reason, "subscriber overflow"),
            EventKind::SubscriberPanicked => {
                tracing::error!(subscriber = bench, reason, "subscriber panicked")
            }
        }
    }

    fn name(&self) -> &'static str {
        "log_writer"
    }
}
