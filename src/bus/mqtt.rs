//! # MQTT transport.
//!
//! The broker connection is driven by a background task polling the
//! `rumqttc` event loop; incoming publishes go through the same fan-out as
//! [`LocalBus`](super::LocalBus), keyed on each topic's delivery contract
//! ([`qos_for`]) so step, result and command messages take the lossless
//! path. The session is persistent (`clean_session = false`) so
//! subscriptions survive reconnects.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::task::JoinHandle;

use super::client::{BusClient, Fanout, Message, Qos, Subscription};
use super::qos_for;
use crate::config::MqttConfig;
use crate::error::BusError;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

pub struct MqttBus {
    client: AsyncClient,
    fanout: Fanout,
    poller: JoinHandle<()>,
}

fn to_wire(qos: Qos) -> QoS {
    match qos {
        Qos::AtMostOnce => QoS::AtMostOnce,
        Qos::AtLeastOnce => QoS::AtLeastOnce,
    }
}

impl MqttBus {
    /// Starts the connection task. Must be called inside a tokio runtime.
    pub fn connect(cfg: &MqttConfig, capacity: usize) -> Self {
        let mut opts = MqttOptions::new(cfg.client_id.clone(), cfg.host.clone(), cfg.port);
        opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs.max(5)));
        opts.set_clean_session(false);

        let (client, mut eventloop) = AsyncClient::new(opts, 64);
        let fanout = Fanout::new(capacity);
        let tx = fanout.clone();

        let poller = tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let payload = String::from_utf8_lossy(&publish.payload).into_owned();
                        tx.send(Message::on(publish.topic, payload)).await;
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        tracing::info!("mqtt connected");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "mqtt connection error; reconnecting");
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        });

        Self {
            client,
            fanout,
            poller,
        }
    }
}

#[async_trait]
impl BusClient for MqttBus {
    async fn publish(&self, message: Message) -> Result<(), BusError> {
        self.client
            .publish(
                message.topic.to_string(),
                to_wire(message.qos),
                false,
                message.payload.as_bytes().to_vec(),
            )
            .await
            .map_err(|e| BusError::Transport {
                reason: e.to_string(),
            })
    }

    async fn subscribe(&self, topics: &[String]) -> Result<Subscription, BusError> {
        let sub = self.fanout.subscribe(topics).await;
        for topic in topics {
            self.client
                .subscribe(topic.clone(), to_wire(qos_for(topic)))
                .await
                .map_err(|e| BusError::Transport {
                    reason: e.to_string(),
                })?;
        }
        Ok(sub)
    }

    fn name(&self) -> &'static str {
        "mqtt"
    }
}

impl Drop for MqttBus {
    fn drop(&mut self) {
        self.poller.abort();
    }
}
