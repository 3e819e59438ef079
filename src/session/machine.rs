//! # Step state machine for one test.
//!
//! [`TestSession`] owns the test folder (record + measurement log) and keeps
//! its own `step`, which feeds the record and the registry mirror but is not
//! the same thing: step 9 only moves the in-memory step.
//!
//! | step     | record            | registry mirror | log   | outcome                 |
//! |----------|-------------------|-----------------|-------|-------------------------|
//! | 1–4, 6–8 | `current_step`    | `current_step`  | open  | continue                |
//! | 5        | + `completed_at`  | released        | close | `Exit(Completed)`       |
//! | 9        | untouched         | untouched       | close | `Exit(ManualStop)`      |
//!
//! `bms/data` rows are tagged with the mode of the step in effect when they
//! are written. Summary fields (capacity, energy, timestamp) stop moving once
//! the step is 5 or 9.

use serde_json::json;

use crate::bus::{Message, TEST_DONE_TOPIC};
use crate::error::StoreError;
use crate::events::{Event, EventKind};
use crate::session::retry::persist;
use crate::session::{ExitReason, TestContext};
use crate::step::Step;
use crate::store::{BmsSample, MeasurementLog, RecordStore, RiResults, TestRecord};

const DONE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// What the runner does after a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit(ExitReason),
}

pub struct TestSession {
    ctx: TestContext,
    store: RecordStore,
    record: TestRecord,
    log: Option<MeasurementLog>,
    step: Step,
    resumed: bool,
    /// Pack temperature from the latest sample, for diffusion correction.
    temperature: Option<f64>,
}

impl TestSession {
    /// Resumes or creates the test folder and opens its measurement log.
    pub async fn open(ctx: TestContext) -> Result<Self, StoreError> {
        let now = ctx.clock.now();
        let opened = persist(&ctx, "test folder", || {
            RecordStore::open(&ctx.data_dir, &ctx.bench, &ctx.serial, now)
        })
        .await?;
        let log = persist(&ctx, "measurement log", || {
            MeasurementLog::open(opened.store.measurement_path())
        })
        .await?;

        let step = opened.record.current_step;
        if opened.resumed {
            // The claim cleared the mirror; put the resumed step back.
            persist(&ctx, "registry step", || {
                ctx.registry.mirror_step(&ctx.bench, &ctx.serial, step)
            })
            .await?;
        }

        Ok(Self {
            ctx,
            store: opened.store,
            record: opened.record,
            log: Some(log),
            step,
            resumed: opened.resumed,
            temperature: None,
        })
    }

    pub fn step(&self) -> Step {
        self.step
    }

    pub fn record(&self) -> &TestRecord {
        &self.record
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn resumed(&self) -> bool {
        self.resumed
    }

    /// Tells the bench controller where to resume.
    pub async fn announce(&self) {
        let payload = json!({
            "current_step": self.record.current_step.code(),
            "capacity_ah": self.record.capacity_ah.unwrap_or(0.0),
            "capacity_wh": self.record.capacity_wh.unwrap_or(0.0),
        });
        self.publish(Message::on(
            self.ctx.topics.command.clone(),
            payload.to_string(),
        ))
        .await;
    }

    /// Routes one inbound message by topic.
    pub async fn handle(&mut self, message: &Message) -> Flow {
        let topic = message.topic.as_ref();
        if topic == self.ctx.topics.step {
            self.on_step(&message.payload).await
        } else if topic == self.ctx.topics.bms_data {
            self.on_bms_data(&message.payload).await;
            Flow::Continue
        } else if topic == self.ctx.topics.ri_results {
            self.on_ri_results(&message.payload).await;
            Flow::Continue
        } else {
            tracing::debug!(bench = %self.ctx.bench, topic, "ignoring message on unexpected topic");
            Flow::Continue
        }
    }

    async fn on_step(&mut self, payload: &str) -> Flow {
        let step = match Step::parse(payload) {
            Ok(step) => step,
            Err(e) => {
                tracing::warn!(bench = %self.ctx.bench, payload, error = %e, "ignoring invalid step");
                return Flow::Continue;
            }
        };
        tracing::info!(bench = %self.ctx.bench, serial = %self.ctx.serial, step = step.code(), from = self.step.code(), "step received");
        self.step = step;

        if step.releases_bench() {
            self.complete().await;
            return Flow::Exit(ExitReason::Completed);
        }
        if step.ends_test() {
            self.close_log();
            self.emit(EventKind::TestStopped);
            return Flow::Exit(ExitReason::ManualStop);
        }

        self.record.current_step = step;
        self.record.last_updated_at = self.ctx.clock.now();
        self.save_record().await;
        let ctx = &self.ctx;
        let _ = persist(ctx, "registry step", || {
            ctx.registry.mirror_step(&ctx.bench, &ctx.serial, step)
        })
        .await;
        self.emit(EventKind::StepChanged);
        Flow::Continue
    }

    async fn complete(&mut self) {
        let now = self.ctx.clock.now();
        self.record.current_step = Step::Completed;
        self.record.last_updated_at = now;
        self.record.completed_at = Some(now);
        self.save_record().await;
        self.close_log();

        let done = json!({
            "serial_number": self.ctx.serial,
            "timestamp_test_done": now.format(DONE_TIMESTAMP_FORMAT).to_string(),
        });
        self.publish(Message::on(TEST_DONE_TOPIC, done.to_string()))
            .await;

        let ctx = &self.ctx;
        let _ = persist(ctx, "bench release", || {
            ctx.registry.release(&ctx.bench, &ctx.serial)
        })
        .await;
        self.emit(EventKind::TestCompleted);
    }

    async fn on_bms_data(&mut self, payload: &str) {
        let sample = match BmsSample::parse(payload) {
            Ok(sample) => sample,
            Err(e) => {
                tracing::warn!(bench = %self.ctx.bench, error = %e, label = e.as_label(), "dropping malformed bms sample");
                return;
            }
        };
        let now = self.ctx.clock.now();
        let mode = self.step.mode();
        self.temperature = Some(sample.temperature());
        if matches!(self.step, Step::Charge | Step::FinalCharge) {
            if let Some(eta) = self.ctx.reference.charge_profile.remaining(sample.voltage()) {
                tracing::debug!(bench = %self.ctx.bench, voltage = sample.voltage(), remaining_s = eta.as_secs(), "charge estimate");
            }
        }

        match self.log.as_mut() {
            Some(log) => {
                let _ = persist(&self.ctx, "measurement row", || {
                    log.append(now, mode, &sample)
                })
                .await;
            }
            None => {
                tracing::debug!(bench = %self.ctx.bench, "measurement log closed; sample not logged");
            }
        }

        if self.step.freezes_summary() {
            return;
        }
        self.record.capacity_ah = Some(sample.capacity_ah());
        self.record.capacity_wh = Some(sample.energy_wh());
        self.record.last_updated_at = now;
        self.save_record().await;
    }

    async fn on_ri_results(&mut self, payload: &str) {
        let ri = match RiResults::parse(payload) {
            Ok(ri) => ri,
            Err(e) => {
                tracing::warn!(bench = %self.ctx.bench, error = %e, "ignoring invalid ri results");
                return;
            }
        };
        if ri.is_empty() {
            tracing::warn!(bench = %self.ctx.bench, "ri results carry no usable value");
            return;
        }
        let before = self.record.clone();
        self.record.merge_ri(&ri);
        if self.record == before {
            return;
        }
        self.save_record().await;
        let corrected = self.ctx.reference.corrected_diffusion(
            self.record.diffusion_discharge_avg,
            self.record.diffusion_charge_avg,
            self.temperature.unwrap_or(f64::NAN),
        );
        if let Some(diffusion) = corrected {
            tracing::info!(bench = %self.ctx.bench, serial = %self.ctx.serial, diffusion, "temperature-corrected diffusion");
        }
    }

    async fn save_record(&self) {
        let _ = persist(&self.ctx, "test record", || self.store.save(&self.record)).await;
    }

    fn close_log(&mut self) {
        if let Some(log) = self.log.take() {
            if let Err(e) = log.close() {
                tracing::error!(bench = %self.ctx.bench, error = %e, "closing measurement log failed");
            }
        }
    }

    async fn publish(&self, message: Message) {
        let topic = message.topic.clone();
        if let Err(e) = self.ctx.bus.publish(message).await {
            tracing::error!(bench = %self.ctx.bench, topic = %topic, error = %e, "publish failed");
        }
    }

    fn emit(&self, kind: EventKind) {
        self.ctx.events.publish(
            Event::new(kind)
                .with_bench(self.ctx.bench.as_str())
                .with_serial(self.ctx.serial.as_str())
                .with_step(self.step),
        );
    }

    /// Flushes and closes the measurement log if still open.
    pub fn close(mut self) {
        self.close_log();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::NaiveDate;

    use crate::bus::{BenchTopics, BusClient, LocalBus, Subscription};
    use crate::clock::ManualClock;
    use crate::config::RetryPolicy;
    use crate::events::Bus;
    use crate::reference::ReferenceData;
    use crate::store::{BenchStatus, ClaimRequest, RegistryStore};

    const SERIAL: &str = "RW-48v2710001";

    struct Fixture {
        _dir: tempfile::TempDir,
        ctx: TestContext,
        bus: LocalBus,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let registry = RegistryStore::open(
            dir.path().join("benches.json"),
            &["bench1".to_string()],
        )
        .unwrap();
        let observed = registry.bench("bench1").unwrap().revision;
        registry
            .claim(&ClaimRequest {
                bench: "bench1".into(),
                serial: SERIAL.into(),
                observed_revision: observed,
            })
            .unwrap();

        let bus = LocalBus::new(64);
        let clock = Arc::new(ManualClock::new(
            NaiveDate::from_ymd_opt(2025, 3, 4)
                .unwrap()
                .and_hms_opt(9, 0, 0)
                .unwrap(),
        ));
        let ctx = TestContext {
            bench: "bench1".into(),
            serial: SERIAL.into(),
            topics: BenchTopics::new("bench1"),
            bus: Arc::new(bus.clone()),
            events: Bus::new(64),
            registry,
            data_dir: dir.path().join("data"),
            retry: RetryPolicy {
                attempts: 1,
                ..RetryPolicy::default()
            },
            watchdog_timeout: Duration::from_secs(30),
            clock: clock.clone(),
            reference: Arc::new(ReferenceData::default()),
        };
        Fixture {
            _dir: dir,
            ctx,
            bus,
            clock,
        }
    }

    fn bms(capacity: f64, energy: f64) -> String {
        let mut fields: Vec<String> = ["52.1", "-10.5", "80", "25.5", "3", "3.65", "7", "3.55"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        fields.push(capacity.to_string());
        fields.push(energy.to_string());
        fields.extend((0..15).map(|i| (3600 + i).to_string()));
        fields.push("1".into());
        fields.push("79.5".into());
        fields.join(",")
    }

    fn on(topic: &str, payload: impl Into<String>) -> Message {
        Message::on(topic.to_string(), payload.into())
    }

    fn csv_rows(path: &Path) -> Vec<csv::StringRecord> {
        csv::Reader::from_path(path)
            .unwrap()
            .records()
            .map(|r| r.unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_announce_publishes_resume_command() {
        let fx = fixture();
        let mut sub: Subscription = fx
            .bus
            .subscribe(&["bench1/command".to_string()])
            .await
            .unwrap();
        let session = TestSession::open(fx.ctx.clone()).await.unwrap();
        assert!(!session.resumed());

        session.announce().await;

        let msg = sub.try_recv().unwrap();
        let body: serde_json::Value = serde_json::from_str(&msg.payload).unwrap();
        assert_eq!(body["current_step"], 1);
        assert_eq!(body["capacity_ah"], 0.0);
    }

    #[tokio::test]
    async fn test_steps_persist_to_record_and_registry() {
        let fx = fixture();
        let mut session = TestSession::open(fx.ctx.clone()).await.unwrap();

        for step in ["2", "3", "7"] {
            assert_eq!(session.handle(&on("bench1/step", step)).await, Flow::Continue);
        }

        assert_eq!(session.step(), Step::SafetyStop);
        assert_eq!(session.store().load().unwrap().current_step, Step::SafetyStop);
        let bench = fx.ctx.registry.bench("bench1").unwrap();
        assert_eq!(bench.current_step, Some(Step::SafetyStop));
        assert_eq!(bench.status, BenchStatus::Occupied);
    }

    #[tokio::test]
    async fn test_invalid_step_is_ignored() {
        let fx = fixture();
        let mut session = TestSession::open(fx.ctx.clone()).await.unwrap();
        session.handle(&on("bench1/step", "3")).await;

        for bad in ["0", "10", "three", ""] {
            assert_eq!(session.handle(&on("bench1/step", bad)).await, Flow::Continue);
        }
        assert_eq!(session.step(), Step::Discharge);
    }

    #[tokio::test]
    async fn test_rows_are_tagged_with_mode_in_effect() {
        let fx = fixture();
        let mut session = TestSession::open(fx.ctx.clone()).await.unwrap();
        let csv_path = session.store().measurement_path();

        session.handle(&on("bench1/bms/data", bms(0.0, 0.0))).await;
        session.handle(&on("bench1/step", "3")).await;
        fx.clock.advance(Duration::from_secs(60));
        session.handle(&on("bench1/bms/data", bms(4.2, 210.0))).await;
        session.handle(&on("bench1/bms/data", "garbage")).await;

        let rows = csv_rows(&csv_path);
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[0][1], "phase_ri");
        assert_eq!(&rows[1][1], "discharge");
        assert_eq!(&rows[1][0], "2025-03-04 09:01:00");

        let record = session.store().load().unwrap();
        assert_eq!(record.capacity_ah, Some(4.2));
        assert_eq!(record.capacity_wh, Some(210.0));
    }

    #[tokio::test]
    async fn test_completion_archives_and_releases() {
        let fx = fixture();
        let mut done = fx
            .bus
            .subscribe(&[TEST_DONE_TOPIC.to_string()])
            .await
            .unwrap();
        let mut session = TestSession::open(fx.ctx.clone()).await.unwrap();
        session.handle(&on("bench1/step", "3")).await;
        session.handle(&on("bench1/bms/data", bms(50.0, 2600.0))).await;

        let flow = session.handle(&on("bench1/step", "5")).await;
        assert_eq!(flow, Flow::Exit(ExitReason::Completed));

        let record = session.store().load().unwrap();
        assert_eq!(record.current_step, Step::Completed);
        assert!(record.completed_at.is_some());
        assert_eq!(record.capacity_ah, Some(50.0));

        let bench = fx.ctx.registry.bench("bench1").unwrap();
        assert_eq!(bench.status, BenchStatus::Available);
        assert_eq!(bench.pending_serial, None);
        assert_eq!(bench.current_step, None);

        let msg = done.try_recv().unwrap();
        let body: serde_json::Value = serde_json::from_str(&msg.payload).unwrap();
        assert_eq!(body["serial_number"], SERIAL);
        assert_eq!(body["timestamp_test_done"], "2025-03-04 09:00:00");
    }

    #[tokio::test]
    async fn test_manual_stop_keeps_bench_and_freezes_summary() {
        let fx = fixture();
        let mut session = TestSession::open(fx.ctx.clone()).await.unwrap();
        session.handle(&on("bench1/step", "3")).await;
        session.handle(&on("bench1/bms/data", bms(20.0, 1000.0))).await;

        let flow = session.handle(&on("bench1/step", "9")).await;
        assert_eq!(flow, Flow::Exit(ExitReason::ManualStop));

        session.handle(&on("bench1/bms/data", bms(99.0, 9999.0))).await;

        let record = session.store().load().unwrap();
        assert_eq!(record.current_step, Step::Discharge);
        assert_eq!(record.capacity_ah, Some(20.0));
        assert_eq!(record.capacity_wh, Some(1000.0));

        let bench = fx.ctx.registry.bench("bench1").unwrap();
        assert_eq!(bench.status, BenchStatus::Occupied);
        assert_eq!(bench.pending_serial.as_deref(), Some(SERIAL));
        assert_eq!(bench.current_step, Some(Step::Discharge));
    }

    #[tokio::test]
    async fn test_ri_results_replay_is_idempotent() {
        let fx = fixture();
        let mut session = TestSession::open(fx.ctx.clone()).await.unwrap();
        let payload = r#"{"ri_discharge_average": 1.5, "ri_charge_average": 1.4,
            "diffusion_discharge_average": 0.3, "diffusion_charge_average": 0.2}"#;

        session.handle(&on("bench1/step", "2")).await;
        session.handle(&on("bench1/ri/results", payload)).await;
        let first = session.store().load().unwrap();
        fx.clock.advance(Duration::from_secs(5));
        session.handle(&on("bench1/ri/results", payload)).await;
        let second = session.store().load().unwrap();

        assert_eq!(first, second);
        assert_eq!(second.ri_discharge_avg, Some(1.5));
        assert_eq!(second.current_step, Step::Charge);
    }

    #[tokio::test]
    async fn test_ri_results_keep_valid_averages_next_to_bad_keys() {
        let fx = fixture();
        let mut session = TestSession::open(fx.ctx.clone()).await.unwrap();
        let payload = r#"{"ri_discharge_average": 1.5, "ri_charge_average": "1.4",
            "diffusion_discharge_average": 0.3, "diffusion_charge_average": 0.2,
            "delta_ri_average": "n/a", "delta_ri_cells": [0.1, null]}"#;

        session.handle(&on("bench1/ri/results", payload)).await;

        let record = session.store().load().unwrap();
        assert_eq!(record.ri_discharge_avg, Some(1.5));
        assert_eq!(record.ri_charge_avg, Some(1.4));
        assert_eq!(record.diffusion_charge_avg, Some(0.2));
        assert_eq!(record.delta_ri_avg, None);
        assert_eq!(record.delta_ri_cells, Some(vec![Some(0.1), None]));
    }

    #[tokio::test]
    async fn test_reopen_resumes_incomplete_folder() {
        let fx = fixture();
        let mut session = TestSession::open(fx.ctx.clone()).await.unwrap();
        session.handle(&on("bench1/step", "4")).await;
        let dir = session.store().dir().to_path_buf();
        session.close();

        let resumed = TestSession::open(fx.ctx.clone()).await.unwrap();
        assert!(resumed.resumed());
        assert_eq!(resumed.store().dir(), dir.as_path());
        assert_eq!(resumed.step(), Step::FinalCharge);
    }
}
