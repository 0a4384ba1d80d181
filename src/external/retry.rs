//! Exponential backoff with optional jitter.
//!
//! Shared by the HTTP client's retry loop and the queue consumer's
//! rescheduling of transient failures.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialBackoff {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Randomize each delay within `[delay / 2, delay]`.
    pub jitter: bool,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl ExponentialBackoff {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            ..Self::default()
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = if secs.is_finite() {
            Duration::from_secs_f64(secs.max(0.0)).min(self.max_delay)
        } else {
            self.max_delay
        };

        if !self.jitter || capped.is_zero() {
            return capped;
        }
        let half = capped / 2;
        let spread = capped - half;
        half + spread.mul_f64(rand::thread_rng().gen_range(0.0..=1.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth_and_cap() {
        let backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(1000))
                .without_jitter();
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(backoff.delay_for_attempt(5), Duration::from_millis(1000));
        assert_eq!(backoff.delay_for_attempt(500), Duration::from_millis(1000));
    }

    #[test]
    fn test_attempt_zero_treated_as_first() {
        let backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(1)).without_jitter();
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let backoff = ExponentialBackoff::new(Duration::from_millis(400), Duration::from_secs(10));
        for _ in 0..50 {
            let d = backoff.delay_for_attempt(1);
            assert!(d >= Duration::from_millis(200) && d <= Duration::from_millis(400));
        }
    }
}
