//! # Jitter policy for retry delays.
//!
//! - [`JitterPolicy::None`]: exact backoff delay
//! - [`JitterPolicy::Full`]: random delay in [0, delay]
//! - [`JitterPolicy::Equal`]: delay/2 + random[0, delay/2]

use rand::Rng;
use std::time::Duration;

/// Randomization applied on top of a computed backoff delay.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum JitterPolicy {
    /// Use the delay as computed. Predictable; used by tests.
    #[default]
    None,
    /// Random delay in [0, delay].
    Full,
    /// delay/2 + random[0, delay/2]; keeps roughly 75% of the delay on average.
    Equal,
}

impl JitterPolicy {
    pub fn apply(&self, delay: Duration) -> Duration {
        let ms = delay.as_millis() as u64;
        if ms == 0 {
            return Duration::ZERO;
        }
        let mut rng = rand::rng();
        match self {
            JitterPolicy::None => delay,
            JitterPolicy::Full => Duration::from_millis(rng.random_range(0..=ms)),
            JitterPolicy::Equal => {
                let half = ms / 2;
                let jitter = if half == 0 {
                    0
                } else {
                    rng.random_range(0..=half)
                };
                Duration::from_millis(half + jitter)
            }
        }
    }
}
