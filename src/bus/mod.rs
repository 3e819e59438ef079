//! Bus client: publish/subscribe to named topics.
//!
//! - [`BusClient`] transport trait, [`Message`], [`Qos`], [`Subscription`]
//! - [`LocalBus`] in-process transport
//! - [`MqttBus`] MQTT transport (feature `mqtt`)
//! - [`BenchTopics`] per-bench topic names

mod client;
mod local;
#[cfg(feature = "mqtt")]
mod mqtt;
mod topic;

pub use client::{BusClient, Message, Qos, Subscription};
pub use local::LocalBus;
#[cfg(feature = "mqtt")]
pub use mqtt::MqttBus;
pub use topic::{BenchTopics, END_COMMAND, TEST_DONE_TOPIC, qos_for};
