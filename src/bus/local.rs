//! # In-process bus.
//!
//! [`LocalBus`] connects the coordinator, test tasks, and any in-process
//! collaborator.
//!
//! ## Rules
//! - **Non-blocking publish**: never waits on receivers.
//! - **No persistence**: a message published while nobody subscribes to its topic is lost.
//! - **Bounded ring for at-most-once**: slow receivers skip the oldest samples (logged).
//! - **Lossless at-least-once**: each subscription queues its own copy.

use async_trait::async_trait;
use super::client::{BusClient, Fanout, Message, Subscription};
use crate::error::BusError;

#[derive(Clone, Debug)]
pub struct LocalBus {
    fanout: Fanout,
}

impl LocalBus {
    /// Creates a bus whose at-most-once ring holds `capacity` messages (min 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            fanout: Fanout::new(capacity),
        }
    }
}

#[async_trait]
impl BusClient for LocalBus {
    async fn publish(&self, message: Message) -> Result<(), BusError> {
        self.fanout.send(message).await;
        Ok(())
    }

    async fn subscribe(&self, topics: &[String]) -> Result<Subscription, BusError> {
        Ok(self.fanout.subscribe(topics).await)
    }

    fn name(&self) -> &'static str {
        "local"
    }
}
