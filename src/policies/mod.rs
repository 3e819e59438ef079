//! Retry timing for store writes.
//!
//! A running test retries a failed registry/record write a bounded number of
//! times before escalating to a security alert. This module holds the delay
//! math; the attempt bound lives in [`RetryPolicy`](crate::config::RetryPolicy).
//!
//! - [`BackoffPolicy`] how retry delays evolve (first / factor / max + jitter)
//! - [`JitterPolicy`]  randomization so several benches failing on the same
//!   disk do not retry in lockstep

mod backoff;
mod jitter;

pub use backoff::BackoffPolicy;
pub use jitter::JitterPolicy;
