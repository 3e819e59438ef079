//! # Internal event bus.
//!
//! [`Bus`] wraps [`tokio::sync::broadcast`]: publishing never blocks, events
//! sent while nobody listens are dropped, and receivers that fall more than
//! `capacity` events behind observe `RecvError::Lagged(n)`.
//!
//! ```text
//!   Reservation ──┐
//!   TestRunner  ──┼──► Bus ──► subscriber_listener ──► SubscriberSet
//!   Watchdog    ──┤
//!   Supervisor  ──┘
//! ```

use tokio::sync::broadcast;

use super::event::Event;

/// Broadcast channel for runtime events. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Bus {
    tx: broadcast::Sender<Event>,
}

impl Bus {
    /// Creates a bus; capacity is clamped to at least 1.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel::<Event>(capacity.max(1));
        Self { tx }
    }

    /// Fire-and-forget publish.
    pub fn publish(&self, ev: Event) {
        let _ = self.tx.send(ev);
    }

    /// Receiver observing events sent after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}
