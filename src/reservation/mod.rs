//! Reservation protocol: claiming a bench for a battery.
//!
//! ```text
//! Idle ──scan bench──► AwaitSerial ──scan serial──► AwaitConfirm ──scan bench──► claimed
//!   ▲                      │                             │                          │
//!   └──────── any error ───┴─────────────────────────────┘                 TestHost::launch
//! ```
//!
//! - [`Reservation`] the handshake, one per operator console
//! - [`SerialFormat`] serial validation/extraction
//! - [`TestHost`] liveness and launch seam, implemented by the supervisor

mod handshake;
mod serial;

use async_trait::async_trait;

pub use handshake::{RESET_COMMAND, Reservation, ReservationSettings, ScanOutcome};
pub use serial::SerialFormat;

/// What the handshake needs from whoever runs the tests.
#[async_trait]
pub trait TestHost: Send + Sync + 'static {
    /// `true` when a test task for `bench` is currently running.
    async fn is_live(&self, bench: &str) -> bool;

    /// Starts the test task for a freshly claimed bench.
    async fn launch(&self, bench: &str, serial: &str) -> Result<(), String>;
}
