//! # Subscriber trait
//!
//! Each subscriber is driven by a dedicated worker fed by a bounded queue
//! owned by the [`SubscriberSet`](crate::subscribers::SubscriberSet). A slow
//! subscriber never blocks the publisher or the other subscribers; when its
//! queue is full its events are dropped.

use async_trait::async_trait;

use crate::events::Event;

#[async_trait]
pub trait Subscribe: Send + Sync + 'static {
    async fn on_event(&self, event: &Event);

    /// Human-readable name (for logs).
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Preferred capacity of this subscriber's queue.
    fn queue_capacity(&self) -> usize {
        1024
    }
}
