//! Event subscribers.
//!
//! ```text
//! Bus ──► Supervisor::subscriber_listener ──► SubscriberSet::emit
//!                                              ├──► [queue] ──► LogWriter
//!                                              └──► [queue] ──► custom (display feed, metrics, ...)
//! ```

mod log;
mod subscribe;
mod subscriber_set;

pub use log::LogWriter;
pub use subscribe::Subscribe;
pub use subscriber_set::SubscriberSet;
