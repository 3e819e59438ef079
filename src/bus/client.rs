//! # Bus client contract.
//!
//! [`BusClient`] is the seam between the coordination core and the transport.
//! Implementations deliver [`Message`]s by topic name; there is no ordering
//! guarantee across topics.
//!
//! ```text
//!                       ┌─ AtMostOnce  ──► broadcast ring (shared, may lag) ─┐
//! publish(Message) ──►  │                                                    ├─► Subscription::recv()
//!                       └─ AtLeastOnce ──► per-subscription queue (lossless) ┘
//! ```
//!
//! A burst of sensor samples can overrun the shared ring; step, result and
//! command messages never share it.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, broadcast, mpsc};

use crate::error::BusError;

/// Delivery guarantee requested for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qos {
    AtMostOnce,
    AtLeastOnce,
}

/// A payload on a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: Arc<str>,
    pub payload: Arc<str>,
    pub qos: Qos,
}

impl Message {
    pub fn new(topic: impl Into<Arc<str>>, payload: impl Into<Arc<str>>, qos: Qos) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
        }
    }

    /// Message on `topic` using that topic's default guarantee.
    pub fn on(topic: impl Into<Arc<str>>, payload: impl Into<Arc<str>>) -> Self {
        let topic = topic.into();
        let qos = super::qos_for(&topic);
        Self::new(topic, payload, qos)
    }
}

/// Transport abstraction used by the coordinator and test tasks.
#[async_trait]
pub trait BusClient: Send + Sync + 'static {
    /// Publishes a message. Returns once the transport accepted it.
    async fn publish(&self, message: Message) -> Result<(), BusError>;

    /// Receives messages published on any of `topics` from now on.
    async fn subscribe(&self, topics: &[String]) -> Result<Subscription, BusError>;

    /// Human-readable name (for logs).
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Receiver side of [`BusClient::subscribe`].
pub struct Subscription {
    lossy: broadcast::Receiver<Message>,
    reliable: mpsc::UnboundedReceiver<Message>,
    topics: HashSet<String>,
}

impl Subscription {
    /// Waits for the next matching message.
    ///
    /// At-least-once messages are served first. A lagging receiver skips
    /// overwritten at-most-once messages and keeps going.
    pub async fn recv(&mut self) -> Result<Message, BusError> {
        loop {
            tokio::select! {
                biased;
                reliable = self.reliable.recv() => {
                    return reliable.ok_or(BusError::Closed);
                }
                lossy = self.lossy.recv() => match lossy {
                    Ok(message) if self.topics.contains(message.topic.as_ref()) => return Ok(message),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "bus subscription lagged; at-most-once messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Err(BusError::Closed),
                },
            }
        }
    }

    /// Next already-delivered matching message, without waiting.
    pub fn try_recv(&mut self) -> Option<Message> {
        if let Ok(message) = self.reliable.try_recv() {
            return Some(message);
        }
        loop {
            match self.lossy.try_recv() {
                Ok(message) if self.topics.contains(message.topic.as_ref()) => return Some(message),
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

#[derive(Debug)]
struct Route {
    topics: HashSet<String>,
    tx: mpsc::UnboundedSender<Message>,
}

/// Delivery fan-out shared by the transports.
///
/// At-most-once messages go through one bounded broadcast ring. At-least-once
/// messages are copied into the queue of every subscription that wants the
/// topic, so a slow reader never loses them.
#[derive(Debug, Clone)]
pub(crate) struct Fanout {
    lossy: broadcast::Sender<Message>,
    routes: Arc<Mutex<Vec<Route>>>,
}

impl Fanout {
    pub(crate) fn new(capacity: usize) -> Self {
        let (lossy, _rx) = broadcast::channel(capacity.max(1));
        Self {
            lossy,
            routes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) async fn send(&self, message: Message) {
        match message.qos {
            Qos::AtMostOnce => {
                let _ = self.lossy.send(message);
            }
            Qos::AtLeastOnce => {
                let mut routes = self.routes.lock().await;
                routes.retain(|route| !route.tx.is_closed());
                for route in routes.iter() {
                    if route.topics.contains(message.topic.as_ref()) {
                        let _ = route.tx.send(message.clone());
                    }
                }
            }
        }
    }

    pub(crate) async fn subscribe(&self, topics: &[String]) -> Subscription {
        let topics: HashSet<String> = topics.iter().cloned().collect();
        let (tx, reliable) = mpsc::unbounded_channel();
        // Register both halves before returning so nothing published after
        // `subscribe` is missed.
        let lossy = self.lossy.subscribe();
        self.routes.lock().await.push(Route {
            topics: topics.clone(),
            tx,
        });
        Subscription {
            lossy,
            reliable,
            topics,
        }
    }

    #[cfg(test)]
    pub(crate) async fn routes_len(&self) -> usize {
        self.routes.lock().await.len()
    }
}
