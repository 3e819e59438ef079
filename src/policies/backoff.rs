//! # Backoff between persistence retries.
//!
//! The delay for attempt `n` is `first × factor^n`, clamped to `max`, then
//! jitter is applied. The base is derived from the attempt number only, so
//! jitter never feeds back into later delays.
//!
//! ```rust
//! use std::time::Duration;
//! use benchvisor::{BackoffPolicy, JitterPolicy};
//!
//! let backoff = BackoffPolicy {
//!     first: Duration::from_millis(200),
//!     max: Duration::from_secs(5),
//!     factor: 2.0,
//!     jitter: JitterPolicy::None,
//! };
//! assert_eq!(backoff.next(0), Duration::from_millis(200));
//! assert_eq!(backoff.next(2), Duration::from_millis(800));
//! assert_eq!(backoff.next(10), Duration::from_secs(5));
//! ```

use std::time::Duration;

use crate::policies::jitter::JitterPolicy;

/// Retry backoff policy.
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub first: Duration,
    /// Upper bound for any single delay.
    pub max: Duration,
    /// Multiplicative growth factor (`>= 1.0` recommended).
    pub factor: f64,
    pub jitter: JitterPolicy,
}

impl Default for BackoffPolicy {
    /// `first = 100ms`, `factor = 2.0`, `max = 5s`, no jitter.
    fn default() -> Self {
        Self {
            first: Duration::from_millis(100),
            max: Duration::from_secs(5),
            factor: 2.0,
            jitter: JitterPolicy::None,
        }
    }
}

impl BackoffPolicy {
    /// Computes the delay after the given failed attempt (0-indexed).
    pub fn next(&self, attempt: u32) -> Duration {
        let max_secs = self.max.as_secs_f64();
        let exp = attempt.min(i32::MAX as u32) as i32;
        let unclamped = self.first.as_secs_f64() * self.factor.powi(exp);

        let base = if !unclamped.is_finite() || unclamped < 0.0 || unclamped > max_secs {
            self.max
        } else {
            Duration::from_secs_f64(unclamped)
        };
        self.jitter.apply(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(first_ms: u64, max_ms: u64, factor: f64) -> BackoffPolicy {
        BackoffPolicy {
            first: Duration::from_millis(first_ms),
            max: Duration::from_millis(max_ms),
            factor,
            jitter: JitterPolicy::None,
        }
    }

    #[test]
    fn test_exponential_growth() {
        let p = policy(100, 30_000, 2.0);
        assert_eq!(p.next(0), Duration::from_millis(100));
        assert_eq!(p.next(1), Duration::from_millis(200));
        assert_eq!(p.next(3), Duration::from_millis(800));
    }

    #[test]
    fn test_constant_factor() {
        let p = policy(500, 30_000, 1.0);
        for attempt in 0..5 {
            assert_eq!(p.next(attempt), Duration::from_millis(500));
        }
    }

    #[test]
    fn test_first_exceeds_max() {
        let p = policy(10_000, 5_000, 2.0);
        assert_eq!(p.next(0), Duration::from_secs(5));
    }

    #[test]
    fn test_overflow_clamps_to_max() {
        let p = policy(100, 10_000, 2.0);
        assert_eq!(p.next(u32::MAX), Duration::from_secs(10));
    }

    #[test]
    fn test_equal_jitter_stays_within_base() {
        let p = BackoffPolicy {
            jitter: JitterPolicy::Equal,
            ..policy(1000, 30_000, 1.0)
        };
        for attempt in 0..20 {
            let d = p.next(attempt);
            assert!(d >= Duration::from_millis(500));
            assert!(d <= Duration::from_millis(1000));
        }
    }
}
