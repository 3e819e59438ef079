//! # Supervisor: the coordinator.
//!
//! The [`Supervisor`] owns the bench registry, the message bus, the internal
//! event bus with its [`SubscriberSet`], and the table of running test tasks.
//! It is the [`TestHost`] the reservation handshake launches tests through.
//!
//! ## Responsibilities
//! - spawn one supervised test task per accepted claim
//! - answer liveness from the active-test table
//! - operator `end` (broadcast on every command topic); bench resets go
//!   through the [`Reservation`] handshake and this liveness answer
//! - fan runtime events out to subscribers
//! - on OS signal: cancel every test and wait up to [`Config::grace`]
//!
//! ```text
//! Reservation ──launch(bench, serial)──► Supervisor::spawn_test
//!                                           └─► ActiveTests::spawn
//!                                                 └─► child token ─► TestRunner::run
//!
//! Test tasks / Reservation ── publish(Event) ──► Bus ──► subscriber_listener ──► SubscriberSet
//!
//! Shutdown:
//!   wait_for_shutdown_signal()
//!     └─► ShutdownRequested
//!     └─► runtime_token.cancel()   (benches stay occupied for resume)
//!     └─► join all within grace ─┬─ Ok      → AllStoppedWithin
//!                                └─ timeout → GraceExceeded + RuntimeError
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::bus::{BenchTopics, BusClient, END_COMMAND, Message};
use crate::clock::Clock;
use crate::config::Config;
use crate::core::active::{ActiveTests, report};
use crate::core::builder::SupervisorBuilder;
use crate::core::shutdown;
use crate::error::{BusError, RuntimeError, StoreError};
use crate::events::{Bus, Event, EventKind};
use crate::reference::ReferenceData;
use crate::reservation::{Reservation, ReservationSettings, SerialFormat, TestHost};
use crate::session::TestContext;
use crate::store::{BenchTable, RegistryStore};
use crate::subscribers::SubscriberSet;

pub struct Supervisor {
    cfg: Config,
    bus: Arc<dyn BusClient>,
    events: Bus,
    subs: Arc<SubscriberSet>,
    registry: RegistryStore,
    active: ActiveTests,
    clock: Arc<dyn Clock>,
    reference: Arc<ReferenceData>,
    serials: SerialFormat,
    runtime_token: CancellationToken,
}

pub(crate) struct SupervisorParts {
    pub cfg: Config,
    pub bus: Arc<dyn BusClient>,
    pub events: Bus,
    pub subs: Arc<SubscriberSet>,
    pub registry: RegistryStore,
    pub clock: Arc<dyn Clock>,
    pub reference: Arc<ReferenceData>,
    pub serials: SerialFormat,
}

impl Supervisor {
    pub fn builder(cfg: Config) -> SupervisorBuilder {
        SupervisorBuilder::new(cfg)
    }

    pub(crate) fn from_parts(parts: SupervisorParts) -> Self {
        let runtime_token = CancellationToken::new();
        Self {
            active: ActiveTests::new(parts.events.clone(), runtime_token.clone()),
            cfg: parts.cfg,
            bus: parts.bus,
            events: parts.events,
            subs: parts.subs,
            registry: parts.registry,
            clock: parts.clock,
            reference: parts.reference,
            serials: parts.serials,
            runtime_token,
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn events(&self) -> &Bus {
        &self.events
    }

    pub fn bus(&self) -> &Arc<dyn BusClient> {
        &self.bus
    }

    pub fn registry(&self) -> &RegistryStore {
        &self.registry
    }

    pub fn reference(&self) -> &ReferenceData {
        &self.reference
    }

    /// A fresh handshake that launches through this supervisor.
    pub fn reservation(self: &Arc<Self>) -> Reservation {
        Reservation::new(
            ReservationSettings::from_config(&self.cfg),
            self.serials.clone(),
            self.registry.clone(),
            Arc::clone(self) as Arc<dyn TestHost>,
            self.events.clone(),
            Arc::clone(&self.clock),
        )
    }

    /// Starts the test task for a claimed bench.
    pub async fn spawn_test(&self, bench: &str, serial: &str) -> Result<(), String> {
        let ctx = TestContext {
            bench: bench.to_string(),
            serial: serial.to_string(),
            topics: BenchTopics::new(bench),
            bus: Arc::clone(&self.bus),
            events: self.events.clone(),
            registry: self.registry.clone(),
            data_dir: self.cfg.data_dir.clone(),
            retry: self.cfg.persistence_retry(),
            watchdog_timeout: self.cfg.watchdog_timeout(),
            clock: Arc::clone(&self.clock),
            reference: Arc::clone(&self.reference),
        };
        self.active.spawn(ctx).await
    }

    /// `(bench, serial)` of every running test.
    pub async fn live_tests(&self) -> Vec<(String, String)> {
        self.active.list().await
    }

    pub fn benches(&self) -> Result<BenchTable, StoreError> {
        self.registry.snapshot()
    }

    /// Publishes `end` on every bench's command topic.
    pub async fn broadcast_end(&self) -> Result<(), BusError> {
        for bench in self.cfg.bench_names() {
            let topic = BenchTopics::new(&bench).command;
            self.bus.publish(Message::on(topic, END_COMMAND)).await?;
        }
        self.events.publish(Event::new(EventKind::EndBroadcast));
        Ok(())
    }

    /// Subscribes to the event bus and forwards events to the subscriber set.
    pub(crate) fn subscriber_listener(&self) {
        let mut rx = self.events.subscribe();
        let set = Arc::clone(&self.subs);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(ev) => set.emit(&ev),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "subscriber listener lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Runs until a termination signal, then shuts down gracefully.
    pub async fn run(&self) -> Result<(), RuntimeError> {
        if let Err(e) = shutdown::wait_for_shutdown_signal().await {
            tracing::error!(error = %e, "signal handlers unavailable; shutting down");
        }
        self.shutdown().await
    }

    /// Cancels every test task and waits up to the grace period.
    ///
    /// Benches are left occupied so the tests resume after restart.
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        self.events.publish(Event::new(EventKind::ShutdownRequested));
        self.runtime_token.cancel();
        self.wait_all_with_grace().await
    }

    async fn wait_all_with_grace(&self) -> Result<(), RuntimeError> {
        let grace = self.cfg.grace();
        let mut handles = self.active.drain().await;

        let done = async {
            for (bench, serial, join) in handles.iter_mut() {
                report(&self.events, bench, serial, join.await);
            }
        };

        let finished = tokio::time::timeout(grace, done).await;
        match finished {
            Ok(()) => {
                self.events.publish(Event::new(EventKind::AllStoppedWithin));
                Ok(())
            }
            Err(_) => {
                let stuck: Vec<String> = handles
                    .iter()
                    .filter(|(_, _, join)| !join.is_finished())
                    .map(|(bench, _, _)| bench.clone())
                    .collect();
                for (_, _, join) in &handles {
                    join.abort();
                }
                self.events.publish(
                    Event::new(EventKind::GraceExceeded).with_reason(stuck.join(",")),
                );
                Err(RuntimeError::GraceExceeded { grace, stuck })
            }
        }
    }
}

#[async_trait]
impl TestHost for Supervisor {
    async fn is_live(&self, bench: &str) -> bool {
        self.active.is_live(bench).await
    }

    async fn launch(&self, bench: &str, serial: &str) -> Result<(), String> {
        self.spawn_test(bench, serial).await
    }
}
