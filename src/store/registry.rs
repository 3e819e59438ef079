//! # Bench registry: the shared, durable table of bench states.
//!
//! One JSON document lists every bench. It is the only state touched by more
//! than one task (the operator handshake and each running test), so every
//! mutation is a read-modify-write under an exclusive `flock` on a sibling
//! lock file, and the document itself is replaced atomically.
//!
//! ```text
//! with_exclusive(op):
//!   lock(benches.json.lock, EX)
//!     ├─ load benches.json (missing → empty table)
//!     ├─ op(&mut table)            ← claim / mirror_step / release / reset
//!     ├─ check invariants          ← occupied ⇔ pending serial, serial unique
//!     └─ atomic_write(benches.json) when changed
//!   unlock
//! ```
//!
//! Each mutation bumps the bench's `revision`. The handshake records the
//! revision it saw at the first scan and [`RegistryStore::claim`] refuses to
//! proceed if it moved, which turns a concurrent claim into a conflict instead
//! of a silent overwrite.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::error::{ConflictError, ReservationError, StoreError, ValidationError};
use crate::step::Step;
use crate::store::fsutil::{open_lock_file, read_json, write_json};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BenchStatus {
    Available,
    Occupied,
}

/// Registry entry for one physical bench.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BenchState {
    pub name: String,
    pub status: BenchStatus,
    #[serde(default)]
    pub pending_serial: Option<String>,
    /// Mirror of the owning test's current step.
    #[serde(default)]
    pub current_step: Option<Step>,
    /// Bumped on every mutation of this entry.
    #[serde(default)]
    pub revision: u64,
}

impl BenchState {
    pub fn available(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: BenchStatus::Available,
            pending_serial: None,
            current_step: None,
            revision: 0,
        }
    }

    pub fn is_occupied(&self) -> bool {
        self.status == BenchStatus::Occupied
    }

    fn is_held_by(&self, serial: &str) -> bool {
        self.is_occupied() && self.pending_serial.as_deref() == Some(serial)
    }

    fn reset(&mut self) {
        self.status = BenchStatus::Available;
        self.pending_serial = None;
        self.current_step = None;
        self.revision += 1;
    }
}

/// The whole registry document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BenchTable {
    pub benches: Vec<BenchState>,
}

impl BenchTable {
    pub fn get(&self, name: &str) -> Option<&BenchState> {
        self.benches.iter().find(|b| b.name == name)
    }

    fn get_mut(&mut self, name: &str) -> Option<&mut BenchState> {
        self.benches.iter_mut().find(|b| b.name == name)
    }

    /// Bench currently holding `serial` as its pending serial.
    pub fn bench_for_serial(&self, serial: &str) -> Option<&BenchState> {
        self.benches
            .iter()
            .find(|b| b.pending_serial.as_deref() == Some(serial))
    }

    /// Verifies the registry invariants.
    pub fn check(&self) -> Result<(), StoreError> {
        let mut serials = HashSet::new();
        let mut names = HashSet::new();
        for bench in &self.benches {
            if !names.insert(bench.name.as_str()) {
                return Err(StoreError::Invariant {
                    detail: format!("bench {} listed twice", bench.name),
                });
            }
            if bench.is_occupied() != bench.pending_serial.is_some() {
                return Err(StoreError::Invariant {
                    detail: format!(
                        "bench {} is {:?} with pending serial {:?}",
                        bench.name, bench.status, bench.pending_serial
                    ),
                });
            }
            if let Some(serial) = &bench.pending_serial {
                if !serials.insert(serial.as_str()) {
                    return Err(StoreError::Invariant {
                        detail: format!("serial {serial} pending on more than one bench"),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Claim issued by the confirm step of the handshake.
#[derive(Debug, Clone)]
pub struct ClaimRequest {
    pub bench: String,
    pub serial: String,
    /// Revision observed at the first scan.
    pub observed_revision: u64,
}

/// File-backed registry shared by every task and process on the host.
#[derive(Debug, Clone)]
pub struct RegistryStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl RegistryStore {
    /// Opens the registry, creating it (or adding missing benches as available).
    pub fn open(path: impl Into<PathBuf>, benches: &[String]) -> Result<Self, StoreError> {
        let path = path.into();
        let mut lock = path.as_os_str().to_owned();
        lock.push(".lock");
        let store = Self {
            lock_path: PathBuf::from(lock),
            path,
        };

        store.with_exclusive(|table| {
            for name in benches {
                if table.get(name).is_none() {
                    tracing::info!(bench = %name, "adding bench to registry");
                    table.benches.push(BenchState::available(name.clone()));
                }
            }
            Ok::<_, StoreError>(())
        })?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs `op` on a consistent snapshot under a shared lock.
    pub fn with_shared<T>(&self, op: impl FnOnce(&BenchTable) -> T) -> Result<T, StoreError> {
        let lock = open_lock_file(&self.lock_path)?;
        FileExt::lock_shared(&lock).map_err(|e| {
            StoreError::io(format!("locking {}", self.lock_path.display()), e)
        })?;
        let table = self.load()?;
        let out = op(&table);
        drop(lock);
        Ok(out)
    }

    /// Atomic read-modify-write of the whole table under an exclusive lock.
    ///
    /// The table is written back only when `op` succeeds and changed it.
    pub fn with_exclusive<T, E>(
        &self,
        op: impl FnOnce(&mut BenchTable) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let lock = open_lock_file(&self.lock_path)?;
        FileExt::lock_exclusive(&lock).map_err(|e| {
            StoreError::io(format!("locking {}", self.lock_path.display()), e)
        })?;

        let before = self.load()?;
        let mut table = before.clone();
        let out = op(&mut table)?;
        if table != before || !self.path.exists() {
            table.check()?;
            write_json(&self.path, &table)?;
        }
        drop(lock);
        Ok(out)
    }

    fn load(&self) -> Result<BenchTable, StoreError> {
        Ok(read_json(&self.path)?.unwrap_or_default())
    }

    pub fn snapshot(&self) -> Result<BenchTable, StoreError> {
        self.with_shared(Clone::clone)
    }

    pub fn bench(&self, name: &str) -> Result<BenchState, StoreError> {
        self.with_shared(|t| t.get(name).cloned())?
            .ok_or_else(|| StoreError::UnknownBench {
                bench: name.to_string(),
            })
    }

    /// Bench name holding `serial`, if any.
    pub fn bench_for_serial(&self, serial: &str) -> Result<Option<String>, StoreError> {
        self.with_shared(|t| t.bench_for_serial(serial).map(|b| b.name.clone()))
    }

    /// Marks `bench` occupied by `serial` if nothing moved since the first scan.
    ///
    /// Clears any stale mirrored step. Returns the new state.
    pub fn claim(&self, req: &ClaimRequest) -> Result<BenchState, ReservationError> {
        self.with_exclusive(|table| {
            if let Some(holder) = table.bench_for_serial(&req.serial) {
                if holder.name != req.bench {
                    return Err(ConflictError::SerialClaimed {
                        serial: req.serial.clone(),
                        bench: holder.name.clone(),
                    }
                    .into());
                }
            }

            let bench = table
                .get_mut(&req.bench)
                .ok_or_else(|| ValidationError::UnknownBench {
                    input: req.bench.clone(),
                })?;
            if bench.revision != req.observed_revision {
                return Err(ConflictError::BenchChanged {
                    bench: bench.name.clone(),
                    observed: req.observed_revision,
                    current: bench.revision,
                }
                .into());
            }
            if let Some(pending) = bench.pending_serial.as_deref() {
                if pending != req.serial {
                    return Err(ValidationError::SerialMismatch {
                        bench: bench.name.clone(),
                        pending: pending.to_string(),
                        scanned: req.serial.clone(),
                    }
                    .into());
                }
            }

            bench.status = BenchStatus::Occupied;
            bench.pending_serial = Some(req.serial.clone());
            bench.current_step = None;
            bench.revision += 1;
            Ok(bench.clone())
        })
    }

    /// Restores the pre-claim state after a failed launch.
    ///
    /// No-op if the entry changed since `claimed` was returned.
    pub fn rollback_claim(
        &self,
        claimed: &BenchState,
        prior: &BenchState,
    ) -> Result<bool, StoreError> {
        self.with_exclusive(|table| {
            let Some(bench) = table.get_mut(&claimed.name) else {
                return Ok(false);
            };
            if bench.revision != claimed.revision {
                return Ok(false);
            }
            bench.status = prior.status;
            bench.pending_serial = prior.pending_serial.clone();
            bench.current_step = prior.current_step;
            bench.revision += 1;
            Ok(true)
        })
    }

    /// Mirrors the owning test's step. Ignored when `serial` no longer holds the bench.
    pub fn mirror_step(&self, bench: &str, serial: &str, step: Step) -> Result<bool, StoreError> {
        self.with_exclusive(|table| {
            let entry = table
                .get_mut(bench)
                .ok_or_else(|| StoreError::UnknownBench {
                    bench: bench.to_string(),
                })?;
            if !entry.is_held_by(serial) {
                tracing::warn!(bench, serial, step = step.code(), "step mirror skipped: bench not held by this serial");
                return Ok(false);
            }
            if entry.current_step != Some(step) {
                entry.current_step = Some(step);
                entry.revision += 1;
            }
            Ok(true)
        })
    }

    /// Returns the bench to `available` at the end of a completed test.
    ///
    /// Only the holder of the bench may release it.
    pub fn release(&self, bench: &str, serial: &str) -> Result<bool, StoreError> {
        self.with_exclusive(|table| {
            let entry = table
                .get_mut(bench)
                .ok_or_else(|| StoreError::UnknownBench {
                    bench: bench.to_string(),
                })?;
            if !entry.is_held_by(serial) {
                tracing::warn!(bench, serial, "release skipped: bench not held by this serial");
                return Ok(false);
            }
            entry.reset();
            Ok(true)
        })
    }

    /// Operator reset. The caller must have verified no test is live on `bench`.
    pub fn force_reset(&self, bench: &str) -> Result<BenchState, StoreError> {
        self.with_exclusive(|table| {
            let entry = table
                .get_mut(bench)
                .ok_or_else(|| StoreError::UnknownBench {
                    bench: bench.to_string(),
                })?;
            if entry.is_occupied() || entry.current_step.is_some() {
                entry.reset();
            }
            Ok(entry.clone())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};

    fn benches() -> Vec<String> {
        vec!["bench1".into(), "bench2".into()]
    }

    fn open(dir: &tempfile::TempDir) -> RegistryStore {
        RegistryStore::open(dir.path().join("benches.json"), &benches()).unwrap()
    }

    fn claim(store: &RegistryStore, bench: &str, serial: &str) -> Result<BenchState, ReservationError> {
        let observed = store.bench(bench).unwrap().revision;
        store.claim(&ClaimRequest {
            bench: bench.into(),
            serial: serial.into(),
            observed_revision: observed,
        })
    }

    #[test]
    fn test_open_creates_available_benches() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let table = store.snapshot().unwrap();
        assert_eq!(table.benches.len(), 2);
        assert!(table.benches.iter().all(|b| !b.is_occupied()));
        assert!(store.path().exists());
    }

    #[test]
    fn test_reopen_keeps_state_and_adds_new_bench() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        claim(&store, "bench1", "RW-48v2710001").unwrap();

        let more = vec!["bench1".into(), "bench2".into(), "bench3".into()];
        let store = RegistryStore::open(dir.path().join("benches.json"), &more).unwrap();
        let table = store.snapshot().unwrap();
        assert_eq!(table.benches.len(), 3);
        assert_eq!(
            table.get("bench1").unwrap().pending_serial.as_deref(),
            Some("RW-48v2710001")
        );
    }

    #[test]
    fn test_claim_sets_occupied_and_clears_step() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let state = claim(&store, "bench1", "RW-48v2710001").unwrap();
        assert!(state.is_occupied());
        assert_eq!(state.pending_serial.as_deref(), Some("RW-48v2710001"));
        assert_eq!(state.current_step, None);
        assert_eq!(state.revision, 1);
    }

    #[test]
    fn test_claim_rejects_serial_pending_elsewhere() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        claim(&store, "bench1", "RW-48v2710001").unwrap();
        let err = claim(&store, "bench2", "RW-48v2710001").unwrap_err();
        assert!(err.is_conflict());
        assert!(!store.bench("bench2").unwrap().is_occupied());
    }

    #[test]
    fn test_claim_rejects_stale_revision() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let req = ClaimRequest {
            bench: "bench1".into(),
            serial: "RW-48v2710001".into(),
            observed_revision: 0,
        };
        store.claim(&req).unwrap();

        let second = ClaimRequest {
            serial: "RW-48v2710002".into(),
            ..req
        };
        let err = store.claim(&second).unwrap_err();
        assert!(matches!(
            err,
            ReservationError::Conflict(ConflictError::BenchChanged { observed: 0, current: 1, .. })
        ));
        assert_eq!(
            store.bench("bench1").unwrap().pending_serial.as_deref(),
            Some("RW-48v2710001")
        );
    }

    #[test]
    fn test_concurrent_claims_exactly_one_wins() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = ["RW-48v271AAAA", "RW-48v271BBBB"]
            .into_iter()
            .map(|serial| {
                let store = store.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    store.claim(&ClaimRequest {
                        bench: "bench1".into(),
                        serial: serial.into(),
                        observed_revision: 0,
                    })
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results.iter().any(|r| matches!(r, Err(e) if e.is_conflict())));
        store.snapshot().unwrap().check().unwrap();
    }

    #[test]
    fn test_mirror_and_release_require_holder() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        claim(&store, "bench1", "RW-48v2710001").unwrap();

        assert!(!store.mirror_step("bench1", "RW-48v2710009", Step::Charge).unwrap());
        assert!(store.mirror_step("bench1", "RW-48v2710001", Step::Charge).unwrap());
        assert_eq!(store.bench("bench1").unwrap().current_step, Some(Step::Charge));

        assert!(!store.release("bench1", "RW-48v2710009").unwrap());
        assert!(store.bench("bench1").unwrap().is_occupied());
        assert!(store.release("bench1", "RW-48v2710001").unwrap());

        let bench = store.bench("bench1").unwrap();
        assert_eq!(bench.status, BenchStatus::Available);
        assert_eq!(bench.pending_serial, None);
        assert_eq!(bench.current_step, None);
    }

    #[test]
    fn test_rollback_restores_prior_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let prior = store.bench("bench2").unwrap();
        let claimed = claim(&store, "bench2", "RW-48v2710001").unwrap();

        assert!(store.rollback_claim(&claimed, &prior).unwrap());
        let bench = store.bench("bench2").unwrap();
        assert!(!bench.is_occupied());
        assert!(bench.revision > claimed.revision);

        assert!(!store.rollback_claim(&claimed, &prior).unwrap());
    }

    #[test]
    fn test_force_reset_clears_occupied() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        claim(&store, "bench1", "RW-48v2710001").unwrap();
        store.mirror_step("bench1", "RW-48v2710001", Step::Discharge).unwrap();

        let state = store.force_reset("bench1").unwrap();
        assert!(!state.is_occupied());
        assert_eq!(state.current_step, None);
        assert!(matches!(
            store.force_reset("bench9"),
            Err(StoreError::UnknownBench { .. })
        ));
    }

    #[test]
    fn test_check_detects_broken_invariants() {
        let mut table = BenchTable {
            benches: vec![BenchState::available("bench1"), BenchState::available("bench2")],
        };
        table.check().unwrap();

        table.benches[0].status = BenchStatus::Occupied;
        assert!(table.check().is_err());

        table.benches[0].pending_serial = Some("S".into());
        table.check().unwrap();

        table.benches[1].status = BenchStatus::Occupied;
        table.benches[1].pending_serial = Some("S".into());
        assert!(table.check().is_err());
    }

    #[test]
    fn test_corrupt_registry_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        std::fs::write(store.path(), b"garbage").unwrap();
        assert!(matches!(store.snapshot(), Err(StoreError::Json { .. })));
    }
}
