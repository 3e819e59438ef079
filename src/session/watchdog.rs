//! # Liveness watchdog for the sensor feed.
//!
//! One timer per test, restarted by every `bms/data` message. When it expires
//! it publishes `Timeout BMS <bench>` on `benchX/security` and re-arms; it
//! never ends the test, so alerts repeat every `timeout` while data stays absent.
//!
//! ```text
//! loop select!
//!   ├─ token.cancelled()  → exit
//!   ├─ feed.notified()    → restart timer
//!   └─ sleep(timeout)     → publish alert, restart timer
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::bus::{BusClient, Message};
use crate::events::{Bus, Event, EventKind};

/// What to watch and where to alert.
#[derive(Debug, Clone)]
pub struct WatchdogSpec {
    pub bench: String,
    pub serial: String,
    pub security_topic: String,
    pub timeout: Duration,
}

pub struct Watchdog {
    feed: Arc<Notify>,
    token: CancellationToken,
}

impl Watchdog {
    /// Starts the timer task; it stops when `token` (or [`Watchdog::stop`]) cancels.
    pub fn spawn(
        spec: WatchdogSpec,
        bus: Arc<dyn BusClient>,
        events: Bus,
        token: CancellationToken,
    ) -> Self {
        let feed = Arc::new(Notify::new());
        let fed = Arc::clone(&feed);
        let stop = token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = fed.notified() => continue,
                    _ = tokio::time::sleep(spec.timeout) => {
                        tracing::warn!(bench = %spec.bench, serial = %spec.serial, timeout_s = spec.timeout.as_secs(), "no bms data; raising alert");
                        let alert = Message::on(spec.security_topic.clone(), format!("Timeout BMS {}", spec.bench));
                        if let Err(e) = bus.publish(alert).await {
                            tracing::error!(bench = %spec.bench, error = %e, "failed to publish watchdog alert");
                        }
                        events.publish(
                            Event::new(EventKind::LivenessAlert)
                                .with_bench(spec.bench.as_str())
                                .with_serial(spec.serial.as_str()),
                        );
                    }
                }
            }
        });

        Self { feed, token }
    }

    /// Restarts the timer.
    pub fn feed(&self) {
        self.feed.notify_one();
    }

    pub fn stop(&self) {
        self.token.cancel();
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{LocalBus, Subscription};

    async fn start(bus: &LocalBus) -> (Watchdog, Subscription) {
        let sub = bus
            .subscribe(&["bench1/security".to_string()])
            .await
            .unwrap();
        let dog = Watchdog::spawn(
            WatchdogSpec {
                bench: "bench1".into(),
                serial: "RW-48v2710001".into(),
                security_topic: "bench1/security".into(),
                timeout: Duration::from_secs(30),
            },
            Arc::new(bus.clone()),
            Bus::new(16),
            CancellationToken::new(),
        );
        tokio::task::yield_now().await;
        (dog, sub)
    }

    fn drain(sub: &mut Subscription) -> Vec<String> {
        std::iter::from_fn(|| sub.try_recv())
            .map(|m| m.payload.to_string())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_data_after_29s_suppresses_alert() {
        let bus = LocalBus::new(16);
        let (dog, mut sub) = start(&bus).await;

        tokio::time::sleep(Duration::from_secs(29)).await;
        dog.feed();
        tokio::time::sleep(Duration::from_secs(29)).await;

        assert!(drain(&mut sub).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_data_after_31s_raises_exactly_one_alert() {
        let bus = LocalBus::new(16);
        let (dog, mut sub) = start(&bus).await;

        tokio::time::sleep(Duration::from_secs(31)).await;
        dog.feed();
        tokio::time::sleep(Duration::from_secs(29)).await;

        assert_eq!(drain(&mut sub), vec!["Timeout BMS bench1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_alerts_repeat_while_silent() {
        let bus = LocalBus::new(16);
        let (_dog, mut sub) = start(&bus).await;

        tokio::time::sleep(Duration::from_secs(95)).await;

        assert_eq!(drain(&mut sub).len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_ends_alerts() {
        let bus = LocalBus::new(16);
        let (dog, mut sub) = start(&bus).await;

        dog.stop();
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert!(drain(&mut sub).is_empty());
    }
}
