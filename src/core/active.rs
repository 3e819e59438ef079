//! # Active-test table: the coordinator's view of running test tasks.
//!
//! One entry per bench holding the task's join handle and cancellation
//! token. A bench is *live* while its entry exists and the task has not
//! finished; this is the liveness answer the reservation handshake uses.
//!
//! ## Rules
//! - at most one live task per bench
//! - a finished entry is reaped (joined and reported) before its bench is reused
//! - cancellation never releases the bench in the registry

use std::collections::HashMap;

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::SessionError;
use crate::events::{Bus, Event, EventKind};
use crate::session::{ExitReason, TestContext, TestRunner};

pub(crate) type TestJoin = JoinHandle<Result<ExitReason, SessionError>>;

/// Handle to a running test task.
struct Handle {
    serial: String,
    join: TestJoin,
    cancel: CancellationToken,
}

impl Handle {
    fn is_live(&self) -> bool {
        !self.join.is_finished()
    }
}

pub(crate) struct ActiveTests {
    tasks: RwLock<HashMap<String, Handle>>,
    events: Bus,
    runtime_token: CancellationToken,
}

impl ActiveTests {
    pub(crate) fn new(events: Bus, runtime_token: CancellationToken) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            events,
            runtime_token,
        }
    }

    pub(crate) async fn is_live(&self, bench: &str) -> bool {
        self.tasks
            .read()
            .await
            .get(bench)
            .is_some_and(Handle::is_live)
    }

    /// Sorted `(bench, serial)` of every live test.
    pub(crate) async fn list(&self) -> Vec<(String, String)> {
        let tasks = self.tasks.read().await;
        let mut live: Vec<(String, String)> = tasks
            .iter()
            .filter(|(_, h)| h.is_live())
            .map(|(bench, h)| (bench.clone(), h.serial.clone()))
            .collect();
        live.sort_unstable();
        live
    }

    /// Spawns the test task for `ctx.bench`; refused while one is live there.
    pub(crate) async fn spawn(&self, ctx: TestContext) -> Result<(), String> {
        if self.runtime_token.is_cancelled() {
            return Err("coordinator is shutting down".to_string());
        }
        let bench = ctx.bench.clone();
        let serial = ctx.serial.clone();

        let mut tasks = self.tasks.write().await;
        if let Some(existing) = tasks.get(&bench) {
            if existing.is_live() {
                return Err(format!(
                    "a test for {} is already running on {bench}",
                    existing.serial
                ));
            }
        }
        let stale = tasks.remove(&bench);

        let cancel = self.runtime_token.child_token();
        let token = cancel.clone();
        let join = tokio::spawn(async move { TestRunner::new(ctx).run(token).await });
        tasks.insert(
            bench.clone(),
            Handle {
                serial: serial.clone(),
                join,
                cancel,
            },
        );
        drop(tasks);

        if let Some(stale) = stale {
            report(&self.events, &bench, &stale.serial, stale.join.await);
        }
        tracing::info!(bench = %bench, serial = %serial, "test task spawned");
        Ok(())
    }

    /// Cancels every task and hands back the join handles.
    pub(crate) async fn drain(&self) -> Vec<(String, String, TestJoin)> {
        let handles: Vec<(String, Handle)> = self.tasks.write().await.drain().collect();
        for (_, h) in &handles {
            h.cancel.cancel();
        }
        handles
            .into_iter()
            .map(|(bench, h)| (bench, h.serial, h.join))
            .collect()
    }
}

/// Logs a finished task; a panic becomes `TestFailed`.
pub(crate) fn report(
    events: &Bus,
    bench: &str,
    serial: &str,
    outcome: Result<Result<ExitReason, SessionError>, tokio::task::JoinError>,
) {
    match outcome {
        Ok(Ok(reason)) => {
            tracing::debug!(bench, serial, exit = reason.as_label(), "test task joined");
        }
        Ok(Err(e)) => {
            tracing::debug!(bench, serial, error = %e, "test task joined with error");
        }
        Err(e) => {
            tracing::error!(bench, serial, error = %e, "test task panicked");
            events.publish(
                Event::new(EventKind::TestFailed)
                    .with_bench(bench)
                    .with_serial(serial)
                    .with_reason("task_panicked"),
            );
        }
    }
}
