//! Coordinator core.
//!
//! The public entry point is [`Supervisor`] (built with [`SupervisorBuilder`]).
//!
//! Internal modules:
//! - [`active`]: table of running test tasks, the source of bench liveness;
//! - [`supervisor`]: spawning, operator commands, graceful shutdown;
//! - [`builder`]: assembly from a [`Config`](crate::Config);
//! - [`shutdown`]: OS signal handling.

mod active;
mod builder;
mod shutdown;
mod supervisor;

pub use builder::SupervisorBuilder;
pub use supervisor::Supervisor;
