//! Reconnect and rejoin delay policy.
//!
//! Each attempt has a nominal delay that starts at `base` and doubles until
//! it reaches a ceiling of `max / (1 + jitter_ratio)`. The actual delay adds
//! up to `jitter_ratio` of the nominal delay on top, so it stays within
//! `max` and keeps its spread once the ceiling is reached.
//!
//! Nominal delays never decrease until [`Backoff::reset`]. While doubling,
//! actual delays never decrease either; at the ceiling they vary within
//! `[ceiling, max]`.

use crate::config::BackoffConfig;
use std::time::Duration;

/// Exponent beyond which the doubled delay is always past any sane cap
const MAX_EXPONENT: u32 = 20;

/// Jittered exponential backoff with a capped delay sequence
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    /// Largest nominal delay; jitter on top of it still fits under `max`
    ceiling: Duration,
    jitter_ratio: f64,
    attempts: u32,
}

impl Backoff {
    /// Create a backoff from configuration
    pub fn new(config: &BackoffConfig) -> Self {
        let jitter_ratio = if config.jitter_ratio.is_finite() {
            config.jitter_ratio.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let base = Duration::from_millis(config.base_ms.max(1));
        let max = Duration::from_millis(config.max_ms).max(base);
        let ceiling = if jitter_ratio > 0.0 {
            max.div_f64(1.0 + jitter_ratio).max(base)
        } else {
            max
        };

        Self {
            base,
            max,
            ceiling,
            jitter_ratio,
            attempts: 0,
        }
    }

    /// Delay before the next attempt. Advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let exponent = self.attempts.min(MAX_EXPONENT);
        let nominal = self
            .base
            .saturating_mul(2_u32.saturating_pow(exponent))
            .min(self.ceiling);
        let jitter = self.jitter_ratio * rand::random::<f64>();

        self.attempts = self.attempts.saturating_add(1);
        nominal.saturating_add(nominal.mul_f64(jitter)).min(self.max)
    }

    /// Number of delays handed out since the last reset
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Start over from the base delay
    pub const fn reset(&mut self) {
        self.attempts = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn config(base_ms: u64, max_ms: u64, jitter_ratio: f64) -> BackoffConfig {
        BackoffConfig {
            base_ms,
            max_ms,
            jitter_ratio,
        }
    }

    #[test]
    fn test_doubles_without_jitter() {
        let mut backoff = Backoff::new(&config(100, 10_000, 0.0));
        let delays: Vec<u64> = (0..5)
            .map(|_| u64::try_from(backoff.next_delay().as_millis()).unwrap_or(u64::MAX))
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1600]);
        assert_eq!(backoff.attempts(), 5);
    }

    #[test]
    fn test_caps_at_max() {
        let mut backoff = Backoff::new(&config(500, 2_000, 0.0));
        for _ in 0..40 {
            assert!(backoff.next_delay() <= Duration::from_millis(2_000));
        }
        assert_eq!(backoff.next_delay(), Duration::from_millis(2_000));
    }

    #[test]
    fn test_jitter_persists_at_the_cap() {
        let mut backoff = Backoff::new(&config(500, 2_000, 0.25));
        for _ in 0..10 {
            backoff.next_delay();
        }

        let steady: Vec<Duration> = (0..200).map(|_| backoff.next_delay()).collect();
        for delay in &steady {
            assert!(*delay >= Duration::from_millis(1_599), "{delay:?}");
            assert!(*delay <= Duration::from_millis(2_000), "{delay:?}");
        }
        let first = steady[0];
        assert!(steady.iter().any(|delay| *delay != first));
    }

    #[test]
    fn test_reset_returns_to_base_range() {
        let mut backoff = Backoff::new(&config(500, 10_000, 0.25));
        for _ in 0..6 {
            backoff.next_delay();
        }
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);

        let delay = backoff.next_delay();
        assert!(delay >= Duration::from_millis(500));
        assert!(delay <= Duration::from_millis(625));
    }

    #[test]
    fn test_non_finite_jitter_is_ignored() {
        let mut backoff = Backoff::new(&config(100, 1_000, f64::NAN));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    proptest! {
        #[test]
        fn delays_grow_and_stay_bounded(
            base_ms in 1_u64..5_000,
            extra_ms in 0_u64..60_000,
            jitter_ratio in 0.0_f64..=1.0,
            steps in 1_usize..64,
        ) {
            let max_ms = base_ms + extra_ms;
            let mut backoff = Backoff::new(&config(base_ms, max_ms, jitter_ratio));
            let mut previous = Duration::ZERO;
            let slack = Duration::from_millis(1);

            for _ in 0..steps {
                let delay = backoff.next_delay();
                // Never shrinks by more than the jitter band
                prop_assert!(delay.mul_f64(1.0 + jitter_ratio) + slack >= previous);
                prop_assert!(delay >= Duration::from_millis(base_ms));
                prop_assert!(delay <= Duration::from_millis(max_ms));
                previous = delay;
            }
        }

        #[test]
        fn delays_without_jitter_never_decrease(
            base_ms in 1_u64..5_000,
            extra_ms in 0_u64..60_000,
            steps in 1_usize..64,
        ) {
            let mut backoff = Backoff::new(&config(base_ms, base_ms + extra_ms, 0.0));
            let mut previous = Duration::ZERO;

            for _ in 0..steps {
                let delay = backoff.next_delay();
                prop_assert!(delay >= previous);
                previous = delay;
            }
        }
    }
}
