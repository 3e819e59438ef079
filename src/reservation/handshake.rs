//! # Three-scan bench reservation.
//!
//! 1. **bench**: must be configured and have no live test; its registry entry
//!    (including `revision`) is remembered.
//! 2. **serial**: must match [`SerialFormat`] and not be pending on another
//!    bench. An available bench additionally requires the serial to be out of
//!    its business-hours cooldown; an occupied bench requires the serial to be
//!    the one it holds (resume).
//! 3. **bench again**: same bench, within `confirm_window` of step 1. The claim
//!    is a single locked read-check-write that fails if the entry moved since
//!    step 1, so two operators racing for one bench get one success and one
//!    [`ConflictError`].
//!
//! Any error drops the handshake back to step 1 without touching the registry.
//!
//! A stale occupied bench is released with its own three scans: `reset`, the
//! bench (must have no live test), then `reset` again within
//! `confirm_window`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::business_hours::{cooldown_ends, within_cooldown};
use crate::clock::Clock;
use crate::config::Config;
use crate::error::{ConflictError, ReservationError, ValidationError};
use crate::events::{Bus, Event, EventKind};
use crate::reservation::{SerialFormat, TestHost};
use crate::store::{BenchState, BenchStatus, ClaimRequest, RegistryStore, latest_record_for_serial};

/// Operator input that starts and confirms a bench reset.
pub const RESET_COMMAND: &str = "reset";

fn is_reset(input: &str) -> bool {
    input.trim().eq_ignore_ascii_case(RESET_COMMAND)
}

/// Static inputs of the handshake.
#[derive(Debug, Clone)]
pub struct ReservationSettings {
    pub benches: Vec<String>,
    pub confirm_window: Duration,
    pub cooldown_business_hours: u32,
    pub data_dir: PathBuf,
}

impl ReservationSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            benches: cfg.bench_names(),
            confirm_window: cfg.confirm_window(),
            cooldown_business_hours: cfg.cooldown_business_hours,
            data_dir: cfg.data_dir.clone(),
        }
    }
}

/// Result of a successful scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Bench accepted; scan the battery serial next.
    AwaitSerial { bench: BenchState },
    /// Serial accepted; re-scan the bench to confirm.
    AwaitConfirm { bench: String, serial: String },
    /// Bench claimed and test launched.
    Claimed(BenchState),
    /// `reset` accepted; scan the bench to reset.
    AwaitResetBench,
    /// Bench accepted for reset; scan `reset` again to confirm.
    AwaitResetConfirm { bench: String },
    /// Bench returned to available.
    Reset(BenchState),
}

#[derive(Debug, Default)]
enum Stage {
    #[default]
    Idle,
    AwaitSerial {
        observed: BenchState,
        scanned_at: Instant,
    },
    AwaitConfirm {
        observed: BenchState,
        serial: String,
        scanned_at: Instant,
    },
    AwaitResetBench,
    AwaitResetConfirm {
        bench: String,
        scanned_at: Instant,
    },
}

pub struct Reservation {
    settings: ReservationSettings,
    serials: SerialFormat,
    registry: RegistryStore,
    host: Arc<dyn TestHost>,
    events: Bus,
    clock: Arc<dyn Clock>,
    stage: Stage,
}

impl Reservation {
    pub fn new(
        settings: ReservationSettings,
        serials: SerialFormat,
        registry: RegistryStore,
        host: Arc<dyn TestHost>,
        events: Bus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            settings,
            serials,
            registry,
            host,
            events,
            clock,
            stage: Stage::Idle,
        }
    }

    /// Name of the scan the handshake expects next.
    pub fn expecting(&self) -> &'static str {
        match self.stage {
            Stage::Idle => "bench",
            Stage::AwaitSerial { .. } => "serial",
            Stage::AwaitConfirm { .. } => "bench confirmation",
            Stage::AwaitResetBench => "bench to reset",
            Stage::AwaitResetConfirm { .. } => "reset confirmation",
        }
    }

    /// Abandons the handshake.
    pub fn cancel(&mut self) {
        if !matches!(self.stage, Stage::Idle) {
            tracing::info!("reservation handshake cancelled");
        }
        self.stage = Stage::Idle;
    }

    /// Feeds one scan to whichever step is pending.
    pub async fn process_scan(&mut self, input: &str) -> Result<ScanOutcome, ReservationError> {
        let result = match std::mem::take(&mut self.stage) {
            Stage::Idle if is_reset(input) => {
                tracing::info!("bench reset requested");
                self.stage = Stage::AwaitResetBench;
                Ok(ScanOutcome::AwaitResetBench)
            }
            Stage::Idle => self.scan_bench(input).await,
            Stage::AwaitSerial {
                observed,
                scanned_at,
            } => self.scan_serial(observed, scanned_at, input),
            Stage::AwaitConfirm {
                observed,
                serial,
                scanned_at,
            } => self.confirm_bench(observed, serial, scanned_at, input).await,
            Stage::AwaitResetBench => self.scan_reset_bench(input).await,
            Stage::AwaitResetConfirm { bench, scanned_at } => {
                self.confirm_reset(bench, scanned_at, input).await
            }
        };
        if let Err(e) = &result {
            tracing::warn!(input, error = %e, label = e.as_label(), "scan rejected; handshake reset");
            self.stage = Stage::Idle;
        }
        result
    }

    /// Step 1.
    pub async fn scan_bench(&mut self, input: &str) -> Result<ScanOutcome, ReservationError> {
        let bench = self.bench_name(input)?;
        if self.host.is_live(&bench).await {
            return Err(ConflictError::BenchLive { bench }.into());
        }
        let observed = self.registry.bench(&bench)?;
        tracing::info!(bench = %observed.name, status = ?observed.status, revision = observed.revision, "bench scanned");

        self.stage = Stage::AwaitSerial {
            observed: observed.clone(),
            scanned_at: self.clock.monotonic(),
        };
        Ok(ScanOutcome::AwaitSerial { bench: observed })
    }

    fn scan_serial(
        &mut self,
        observed: BenchState,
        scanned_at: Instant,
        input: &str,
    ) -> Result<ScanOutcome, ReservationError> {
        self.check_window(scanned_at)?;
        let serial = self.serials.extract(input)?;

        if let Some(holder) = self.registry.bench_for_serial(&serial)? {
            if holder != observed.name {
                return Err(ConflictError::SerialClaimed {
                    serial,
                    bench: holder,
                }
                .into());
            }
        }

        match observed.status {
            BenchStatus::Available => self.check_cooldown(&serial)?,
            BenchStatus::Occupied => {
                let pending = observed.pending_serial.as_deref().unwrap_or_default();
                if pending != serial {
                    return Err(ValidationError::SerialMismatch {
                        bench: observed.name.clone(),
                        pending: pending.to_string(),
                        scanned: serial,
                    }
                    .into());
                }
            }
        }

        tracing::info!(bench = %observed.name, serial = %serial, "serial scanned");
        let outcome = ScanOutcome::AwaitConfirm {
            bench: observed.name.clone(),
            serial: serial.clone(),
        };
        self.stage = Stage::AwaitConfirm {
            observed,
            serial,
            scanned_at,
        };
        Ok(outcome)
    }

    async fn confirm_bench(
        &mut self,
        observed: BenchState,
        serial: String,
        scanned_at: Instant,
        input: &str,
    ) -> Result<ScanOutcome, ReservationError> {
        self.check_window(scanned_at)?;
        let bench = self.bench_name(input)?;
        if bench != observed.name {
            return Err(ValidationError::BenchMismatch {
                expected: observed.name,
                scanned: bench,
            }
            .into());
        }
        if self.host.is_live(&bench).await {
            return Err(ConflictError::BenchLive { bench }.into());
        }

        let claimed = self.registry.claim(&ClaimRequest {
            bench: bench.clone(),
            serial: serial.clone(),
            observed_revision: observed.revision,
        })?;

        if let Err(reason) = self.host.launch(&bench, &serial).await {
            let restored = self.registry.rollback_claim(&claimed, &observed)?;
            tracing::error!(bench = %bench, serial = %serial, reason = %reason, restored, "launch failed; claim rolled back");
            self.events.publish(
                Event::new(EventKind::ClaimRolledBack)
                    .with_bench(bench.as_str())
                    .with_serial(serial.as_str())
                    .with_reason(reason.as_str()),
            );
            return Err(ReservationError::Launch { bench, reason });
        }

        self.events.publish(
            Event::new(EventKind::BenchClaimed)
                .with_bench(bench.as_str())
                .with_serial(serial.as_str()),
        );
        Ok(ScanOutcome::Claimed(claimed))
    }

    async fn scan_reset_bench(&mut self, input: &str) -> Result<ScanOutcome, ReservationError> {
        let bench = self.bench_name(input)?;
        if self.host.is_live(&bench).await {
            return Err(ConflictError::BenchBusy { bench }.into());
        }
        tracing::info!(bench = %bench, "bench scanned for reset");
        self.stage = Stage::AwaitResetConfirm {
            bench: bench.clone(),
            scanned_at: self.clock.monotonic(),
        };
        Ok(ScanOutcome::AwaitResetConfirm { bench })
    }

    async fn confirm_reset(
        &mut self,
        bench: String,
        scanned_at: Instant,
        input: &str,
    ) -> Result<ScanOutcome, ReservationError> {
        if !is_reset(input) {
            return Err(ValidationError::ResetNotConfirmed {
                bench,
                scanned: input.to_string(),
            }
            .into());
        }
        self.check_window(scanned_at)?;
        // The test may have been launched from elsewhere since the bench scan.
        if self.host.is_live(&bench).await {
            return Err(ConflictError::BenchBusy { bench }.into());
        }
        let state = self.registry.force_reset(&bench)?;
        tracing::warn!(bench = %bench, "bench reset by operator");
        self.events
            .publish(Event::new(EventKind::BenchReset).with_bench(bench.as_str()));
        Ok(ScanOutcome::Reset(state))
    }

    fn bench_name(&self, input: &str) -> Result<String, ValidationError> {
        let name = input.trim().to_lowercase();
        if self.settings.benches.contains(&name) {
            Ok(name)
        } else {
            Err(ValidationError::UnknownBench {
                input: input.to_string(),
            })
        }
    }

    fn check_window(&self, scanned_at: Instant) -> Result<(), ValidationError> {
        let elapsed = self.clock.monotonic().saturating_duration_since(scanned_at);
        if elapsed > self.settings.confirm_window {
            return Err(ValidationError::WindowExpired {
                window: self.settings.confirm_window,
            });
        }
        Ok(())
    }

    fn check_cooldown(&self, serial: &str) -> Result<(), ReservationError> {
        let Some(last) = latest_record_for_serial(&self.settings.data_dir, serial)? else {
            return Ok(());
        };
        let hours = self.settings.cooldown_business_hours;
        if within_cooldown(last.last_updated_at, self.clock.now(), hours) {
            return Err(ReservationError::Cooldown {
                serial: serial.to_string(),
                last_update: last.last_updated_at,
                eligible_at: cooldown_ends(last.last_updated_at, hours),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::{NaiveDate, NaiveDateTime};

    use crate::clock::ManualClock;
    use crate::store::RecordStore;

    const SERIAL: &str = "RW-48v2710001";
    const OTHER: &str = "RW-48v2710002";

    #[derive(Default)]
    struct FakeHost {
        live: Mutex<HashSet<String>>,
        launched: Mutex<Vec<(String, String)>>,
        fail_launch: bool,
    }

    #[async_trait]
    impl TestHost for FakeHost {
        async fn is_live(&self, bench: &str) -> bool {
            self.live.lock().unwrap().contains(bench)
        }

        async fn launch(&self, bench: &str, serial: &str) -> Result<(), String> {
            if self.fail_launch {
                return Err("spawn refused".into());
            }
            self.launched
                .lock()
                .unwrap()
                .push((bench.to_string(), serial.to_string()));
            Ok(())
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        registry: RegistryStore,
        clock: Arc<ManualClock>,
    }

    fn tuesday_morning() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 4)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap()
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let registry = RegistryStore::open(
            dir.path().join("benches.json"),
            &["bench1".to_string(), "bench2".to_string()],
        )
        .unwrap();
        Fixture {
            dir,
            registry,
            clock: Arc::new(ManualClock::new(tuesday_morning())),
        }
    }

    impl Fixture {
        fn reservation(&self, host: Arc<FakeHost>) -> Reservation {
            Reservation::new(
                ReservationSettings {
                    benches: vec!["bench1".into(), "bench2".into()],
                    confirm_window: Duration::from_secs(15),
                    cooldown_business_hours: 48,
                    data_dir: self.dir.path().join("data"),
                },
                SerialFormat::new("RW-48v271[A-Za-z0-9]{4}").unwrap(),
                self.registry.clone(),
                host,
                Bus::new(16),
                self.clock.clone(),
            )
        }

        fn past_test(&self, serial: &str, last_update: NaiveDateTime) {
            let opened =
                RecordStore::open(&self.dir.path().join("data"), "bench2", serial, last_update)
                    .unwrap();
            let mut record = opened.record;
            record.last_updated_at = last_update;
            opened.store.save(&record).unwrap();
        }
    }

    async fn reserve(r: &mut Reservation, bench: &str, serial: &str) -> Result<ScanOutcome, ReservationError> {
        r.process_scan(bench).await?;
        r.process_scan(serial).await?;
        r.process_scan(bench).await
    }

    #[tokio::test]
    async fn test_full_handshake_claims_and_launches() {
        let fx = fixture();
        let host = Arc::new(FakeHost::default());
        let mut r = fx.reservation(host.clone());

        assert!(matches!(
            r.process_scan("BENCH1").await.unwrap(),
            ScanOutcome::AwaitSerial { .. }
        ));
        assert_eq!(r.expecting(), "serial");
        assert_eq!(
            r.process_scan(SERIAL).await.unwrap(),
            ScanOutcome::AwaitConfirm {
                bench: "bench1".into(),
                serial: SERIAL.into()
            }
        );
        let ScanOutcome::Claimed(state) = r.process_scan("bench1").await.unwrap() else {
            panic!("expected claim");
        };

        assert_eq!(state.status, BenchStatus::Occupied);
        assert_eq!(state.pending_serial.as_deref(), Some(SERIAL));
        assert_eq!(fx.registry.bench("bench1").unwrap(), state);
        assert_eq!(
            *host.launched.lock().unwrap(),
            vec![("bench1".to_string(), SERIAL.to_string())]
        );
        assert_eq!(r.expecting(), "bench");
    }

    #[tokio::test]
    async fn test_confirm_after_window_is_rejected_without_mutation() {
        let fx = fixture();
        let host = Arc::new(FakeHost::default());
        let mut r = fx.reservation(host.clone());
        let before = fx.registry.snapshot().unwrap();

        r.process_scan("bench1").await.unwrap();
        r.process_scan(SERIAL).await.unwrap();
        fx.clock.advance(Duration::from_secs(16));
        let err = r.process_scan("bench1").await.unwrap_err();

        assert!(matches!(
            err,
            ReservationError::Validation(ValidationError::WindowExpired { .. })
        ));
        assert_eq!(fx.registry.snapshot().unwrap(), before);
        assert!(host.launched.lock().unwrap().is_empty());
        assert_eq!(r.expecting(), "bench");
    }

    #[tokio::test]
    async fn test_confirm_inside_window_succeeds() {
        let fx = fixture();
        let mut r = fx.reservation(Arc::new(FakeHost::default()));

        r.process_scan("bench1").await.unwrap();
        r.process_scan(SERIAL).await.unwrap();
        fx.clock.advance(Duration::from_secs(14));

        assert!(matches!(
            r.process_scan("bench1").await.unwrap(),
            ScanOutcome::Claimed(_)
        ));
    }

    #[tokio::test]
    async fn test_recent_serial_is_in_cooldown() {
        let fx = fixture();
        fx.past_test(SERIAL, tuesday_morning() - chrono::Duration::hours(24));
        let mut r = fx.reservation(Arc::new(FakeHost::default()));

        r.process_scan("bench1").await.unwrap();
        let err = r.process_scan(SERIAL).await.unwrap_err();

        let ReservationError::Cooldown { eligible_at, .. } = err else {
            panic!("expected cooldown, got {err:?}");
        };
        assert_eq!(eligible_at, tuesday_morning() + chrono::Duration::hours(24));
    }

    #[tokio::test]
    async fn test_old_serial_passes_cooldown() {
        let fx = fixture();
        // Previous Tuesday: 48 business hours ended on Thursday.
        fx.past_test(SERIAL, tuesday_morning() - chrono::Duration::days(7));
        let mut r = fx.reservation(Arc::new(FakeHost::default()));

        assert!(matches!(
            reserve(&mut r, "bench1", SERIAL).await.unwrap(),
            ScanOutcome::Claimed(_)
        ));
    }

    #[tokio::test]
    async fn test_serial_pending_on_other_bench_conflicts() {
        let fx = fixture();
        let mut r = fx.reservation(Arc::new(FakeHost::default()));
        reserve(&mut r, "bench2", SERIAL).await.unwrap();

        r.process_scan("bench1").await.unwrap();
        let err = r.process_scan(SERIAL).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(matches!(
            err,
            ReservationError::Conflict(ConflictError::SerialClaimed { .. })
        ));
    }

    #[tokio::test]
    async fn test_occupied_bench_requires_its_serial() {
        let fx = fixture();
        let mut r = fx.reservation(Arc::new(FakeHost::default()));
        reserve(&mut r, "bench1", SERIAL).await.unwrap();

        r.process_scan("bench1").await.unwrap();
        let err = r.process_scan(OTHER).await.unwrap_err();
        assert!(matches!(
            err,
            ReservationError::Validation(ValidationError::SerialMismatch { .. })
        ));

        // Matching serial resumes a bench whose test is not live.
        assert!(matches!(
            reserve(&mut r, "bench1", SERIAL).await.unwrap(),
            ScanOutcome::Claimed(_)
        ));
    }

    #[tokio::test]
    async fn test_live_bench_is_rejected() {
        let fx = fixture();
        let host = Arc::new(FakeHost::default());
        host.live.lock().unwrap().insert("bench1".into());
        let mut r = fx.reservation(host);

        let err = r.process_scan("bench1").await.unwrap_err();
        assert!(matches!(
            err,
            ReservationError::Conflict(ConflictError::BenchLive { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_bench_and_wrong_confirmation() {
        let fx = fixture();
        let mut r = fx.reservation(Arc::new(FakeHost::default()));

        assert!(matches!(
            r.process_scan("bench9").await.unwrap_err(),
            ReservationError::Validation(ValidationError::UnknownBench { .. })
        ));

        r.process_scan("bench1").await.unwrap();
        r.process_scan(SERIAL).await.unwrap();
        assert!(matches!(
            r.process_scan("bench2").await.unwrap_err(),
            ReservationError::Validation(ValidationError::BenchMismatch { .. })
        ));
        assert!(!fx.registry.bench("bench1").unwrap().is_occupied());
    }

    #[tokio::test]
    async fn test_concurrent_confirms_one_wins() {
        let fx = fixture();
        let mut a = fx.reservation(Arc::new(FakeHost::default()));
        let mut b = fx.reservation(Arc::new(FakeHost::default()));

        a.process_scan("bench1").await.unwrap();
        b.process_scan("bench1").await.unwrap();
        a.process_scan(SERIAL).await.unwrap();
        b.process_scan(OTHER).await.unwrap();

        assert!(matches!(
            a.process_scan("bench1").await.unwrap(),
            ScanOutcome::Claimed(_)
        ));
        let err = b.process_scan("bench1").await.unwrap_err();
        assert!(matches!(
            err,
            ReservationError::Conflict(ConflictError::BenchChanged { .. })
        ));

        let bench = fx.registry.bench("bench1").unwrap();
        assert_eq!(bench.pending_serial.as_deref(), Some(SERIAL));
    }

    #[tokio::test]
    async fn test_launch_failure_rolls_back_claim() {
        let fx = fixture();
        let host = Arc::new(FakeHost {
            fail_launch: true,
            ..FakeHost::default()
        });
        let mut r = fx.reservation(host);

        let err = reserve(&mut r, "bench1", SERIAL).await.unwrap_err();
        assert!(matches!(err, ReservationError::Launch { .. }));

        let bench = fx.registry.bench("bench1").unwrap();
        assert_eq!(bench.status, BenchStatus::Available);
        assert_eq!(bench.pending_serial, None);
    }

    #[tokio::test]
    async fn test_reset_needs_bench_then_confirmation() {
        let fx = fixture();
        let mut r = fx.reservation(Arc::new(FakeHost::default()));
        reserve(&mut r, "bench1", SERIAL).await.unwrap();

        assert_eq!(r.process_scan("RESET").await.unwrap(), ScanOutcome::AwaitResetBench);
        assert_eq!(r.expecting(), "bench to reset");
        assert_eq!(
            r.process_scan("bench1").await.unwrap(),
            ScanOutcome::AwaitResetConfirm {
                bench: "bench1".into()
            }
        );
        assert!(fx.registry.bench("bench1").unwrap().is_occupied());

        let ScanOutcome::Reset(state) = r.process_scan("reset").await.unwrap() else {
            panic!("expected reset");
        };
        assert_eq!(state.status, BenchStatus::Available);
        assert_eq!(fx.registry.bench("bench1").unwrap().pending_serial, None);
        assert_eq!(r.expecting(), "bench");
    }

    #[tokio::test]
    async fn test_reset_other_scan_cancels_without_mutation() {
        let fx = fixture();
        let mut r = fx.reservation(Arc::new(FakeHost::default()));
        reserve(&mut r, "bench1", SERIAL).await.unwrap();

        r.process_scan("reset").await.unwrap();
        r.process_scan("bench1").await.unwrap();
        let err = r.process_scan("bench2").await.unwrap_err();
        assert!(matches!(
            err,
            ReservationError::Validation(ValidationError::ResetNotConfirmed { .. })
        ));
        assert!(fx.registry.bench("bench1").unwrap().is_occupied());
        assert_eq!(r.expecting(), "bench");
    }

    #[tokio::test]
    async fn test_reset_confirmation_expires() {
        let fx = fixture();
        let mut r = fx.reservation(Arc::new(FakeHost::default()));
        reserve(&mut r, "bench1", SERIAL).await.unwrap();

        r.process_scan("reset").await.unwrap();
        r.process_scan("bench1").await.unwrap();
        fx.clock.advance(Duration::from_secs(16));
        let err = r.process_scan("reset").await.unwrap_err();
        assert!(matches!(
            err,
            ReservationError::Validation(ValidationError::WindowExpired { .. })
        ));
        assert!(fx.registry.bench("bench1").unwrap().is_occupied());
    }

    #[tokio::test]
    async fn test_reset_of_live_bench_is_refused() {
        let fx = fixture();
        let host = Arc::new(FakeHost::default());
        let mut r = fx.reservation(host.clone());
        reserve(&mut r, "bench1", SERIAL).await.unwrap();
        host.live.lock().unwrap().insert("bench1".into());

        r.process_scan("reset").await.unwrap();
        let err = r.process_scan("bench1").await.unwrap_err();
        assert!(matches!(
            err,
            ReservationError::Conflict(ConflictError::BenchBusy { .. })
        ));

        // Live between the bench scan and the confirmation.
        host.live.lock().unwrap().clear();
        r.process_scan("reset").await.unwrap();
        r.process_scan("bench1").await.unwrap();
        host.live.lock().unwrap().insert("bench1".into());
        assert!(r.process_scan("reset").await.is_err());
        assert!(fx.registry.bench("bench1").unwrap().is_occupied());
    }
}
