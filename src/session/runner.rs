//! Message loop of one test task.

use tokio_util::sync::CancellationToken;

use crate::error::SessionError;
use crate::events::{Event, EventKind};
use crate::session::machine::{Flow, TestSession};
use crate::session::watchdog::{Watchdog, WatchdogSpec};
use crate::session::{ExitReason, TestContext};

/// Drives a [`TestSession`] from the bus until step 5, step 9 or cancellation.
pub struct TestRunner {
    ctx: TestContext,
}

impl TestRunner {
    pub fn new(ctx: TestContext) -> Self {
        Self { ctx }
    }

    pub async fn run(self, token: CancellationToken) -> Result<ExitReason, SessionError> {
        let ctx = self.ctx;
        let bench = ctx.bench.clone();
        let serial = ctx.serial.clone();

        // Subscribe before announcing so the controller's first reply is not lost.
        let mut sub = ctx.bus.subscribe(&ctx.topics.inbound()).await?;
        let mut session = match TestSession::open(ctx.clone()).await {
            Ok(session) => session,
            Err(e) => {
                ctx.events.publish(
                    Event::new(EventKind::TestFailed)
                        .with_bench(bench.as_str())
                        .with_serial(serial.as_str())
                        .with_reason(e.to_string()),
                );
                return Err(e.into());
            }
        };
        ctx.events.publish(
            Event::new(EventKind::TestStarting)
                .with_bench(bench.as_str())
                .with_serial(serial.as_str())
                .with_step(session.step())
                .with_reason(if session.resumed() { "resumed" } else { "new" }),
        );
        session.announce().await;

        let watchdog = Watchdog::spawn(
            WatchdogSpec {
                bench: bench.clone(),
                serial: serial.clone(),
                security_topic: ctx.topics.security.clone(),
                timeout: ctx.watchdog_timeout,
            },
            ctx.bus.clone(),
            ctx.events.clone(),
            token.child_token(),
        );

        let outcome = loop {
            tokio::select! {
                _ = token.cancelled() => {
                    ctx.events.publish(
                        Event::new(EventKind::TestCancelled)
                            .with_bench(bench.as_str())
                            .with_serial(serial.as_str()),
                    );
                    break Ok(ExitReason::Cancelled);
                }
                msg = sub.recv() => {
                    let msg = match msg {
                        Ok(msg) => msg,
                        Err(e) => break Err(SessionError::from(e)),
                    };
                    if msg.topic.as_ref() == ctx.topics.bms_data {
                        watchdog.feed();
                    }
                    if let Flow::Exit(reason) = session.handle(&msg).await {
                        break Ok(reason);
                    }
                }
            }
        };

        watchdog.stop();
        session.close();
        match &outcome {
            Ok(reason) => {
                tracing::info!(bench = %bench, serial = %serial, exit = reason.as_label(), "test task finished");
            }
            Err(e) => {
                tracing::error!(bench = %bench, serial = %serial, error = %e, "test task failed");
                ctx.events.publish(
                    Event::new(EventKind::TestFailed)
                        .with_bench(bench.as_str())
                        .with_serial(serial.as_str())
                        .with_reason(e.to_string()),
                );
            }
        }
        outcome
    }
}
