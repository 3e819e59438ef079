//! Bounded local retry for store writes, escalated as a security alert.

use crate::bus::Message;
use crate::error::StoreError;
use crate::events::{Event, EventKind};
use crate::session::TestContext;

/// Runs `op` up to `ctx.retry.attempts` times.
///
/// On exhaustion publishes `Persistence failure <bench>: <what>` on the
/// bench's security topic and returns the last error.
pub(crate) async fn persist<T>(
    ctx: &TestContext,
    what: &str,
    mut op: impl FnMut() -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    let attempts = ctx.retry.attempts.max(1);
    let mut attempt = 0;
    loop {
        match op() {
            Ok(v) => return Ok(v),
            Err(e) if attempt + 1 < attempts => {
                let delay = ctx.retry.backoff.next(attempt);
                tracing::warn!(
                    bench = %ctx.bench,
                    what,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "store write failed; retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                escalate(ctx, what, &e).await;
                return Err(e);
            }
        }
    }
}

async fn escalate(ctx: &TestContext, what: &str, err: &StoreError) {
    tracing::error!(bench = %ctx.bench, serial = %ctx.serial, what, error = %err, label = err.as_label(), "store write retries exhausted");
    let alert = format!("Persistence failure {}: {what}", ctx.bench);
    if let Err(e) = ctx
        .bus
        .publish(Message::on(ctx.topics.security.clone(), alert))
        .await
    {
        tracing::error!(bench = %ctx.bench, error = %e, "failed to publish persistence alert");
    }
    ctx.events.publish(
        Event::new(EventKind::PersistenceEscalated)
            .with_bench(ctx.bench.as_str())
            .with_serial(ctx.serial.as_str())
            .with_reason(format!("{what}: {err}")),
    );
}
