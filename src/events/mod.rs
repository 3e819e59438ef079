//! Runtime events: types and broadcast bus.
//!
//! These are the coordinator's own notifications (claims, step changes,
//! alerts, shutdown), distinct from the bench topics carried by
//! [`BusClient`](crate::bus::BusClient).
//!
//! - **Publishers**: `Supervisor`, `Reservation`, test tasks, watchdogs,
//!   `SubscriberSet` workers (overflow/panic).
//! - **Consumers**: `Supervisor::subscriber_listener()` fans out to the
//!   `SubscriberSet`.

mod bus;
mod event;

pub use bus::Bus;
pub use event::{Event, EventKind};
