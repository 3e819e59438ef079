use std::sync::Arc;

use crate::{
    bus::{BusClient, LocalBus},
    clock::{Clock, SystemClock},
    config::Config,
    error::{BuildError, ConfigError},
    events::Bus,
    reference::ReferenceData,
    reservation::SerialFormat,
    store::RegistryStore,
    subscribers::{Subscribe, SubscriberSet},
};

use super::supervisor::{Supervisor, SupervisorParts};

/// Builder for a [`Supervisor`].
///
/// Defaults: in-process [`LocalBus`], [`SystemClock`], no subscribers.
pub struct SupervisorBuilder {
    cfg: Config,
    subscribers: Vec<Arc<dyn Subscribe>>,
    bus: Option<Arc<dyn BusClient>>,
    clock: Option<Arc<dyn Clock>>,
}

impl SupervisorBuilder {
    pub fn new(cfg: Config) -> Self {
        Self {
            cfg,
            subscribers: Vec::new(),
            bus: None,
            clock: None,
        }
    }

    /// Sets event subscribers (each gets its own bounded queue and worker).
    pub fn with_subscribers(mut self, subscribers: Vec<Arc<dyn Subscribe>>) -> Self {
        self.subscribers = subscribers;
        self
    }

    /// Sets the transport the bench topics travel on.
    pub fn with_bus(mut self, bus: Arc<dyn BusClient>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validates the config, loads reference data, opens the registry and
    /// starts the subscriber workers. Must be called inside a tokio runtime.
    pub fn build(self) -> Result<Arc<Supervisor>, BuildError> {
        self.cfg.validate()?;
        let serials =
            SerialFormat::new(&self.cfg.serial_pattern).map_err(|e| ConfigError::Invalid {
                reason: format!("serial_pattern: {e}"),
            })?;
        let reference = Arc::new(ReferenceData::load(&self.cfg)?);
        let registry = RegistryStore::open(&self.cfg.registry_path, &self.cfg.bench_names())?;

        let capacity = self.cfg.bus_capacity_clamped();
        let events = Bus::new(capacity);
        let subs = Arc::new(SubscriberSet::new(self.subscribers, events.clone()));
        let bus = self
            .bus
            .unwrap_or_else(|| Arc::new(LocalBus::new(capacity)));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let sup = Arc::new(Supervisor::from_parts(SupervisorParts {
            cfg: self.cfg,
            bus,
            events,
            subs,
            registry,
            clock,
            reference,
            serials,
        }));
        sup.subscriber_listener();
        tracing::info!(bus = sup.bus().name(), benches = ?sup.config().bench_names(), "supervisor ready");
        Ok(sup)
    }
}
