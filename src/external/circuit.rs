//! Circuit breaker for the external service.
//!
//! After `failure_threshold` consecutive transient failures the circuit
//! opens and calls fail fast for `cooldown`. After the cooldown one probe
//! call is let through (half-open); its outcome closes or re-opens the
//! circuit.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitStatus {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Default)]
struct CircuitState {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    /// 0 disables the breaker.
    failure_threshold: u32,
    cooldown: Duration,
    state: Mutex<CircuitState>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold,
            cooldown,
            state: Mutex::new(CircuitState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, CircuitState> {
        // The state is a handful of counters; a poisoned lock still holds a usable value.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn status(&self) -> CircuitStatus {
        let state = self.state();
        match state.opened_at {
            None => CircuitStatus::Closed,
            Some(_) if state.probe_in_flight => CircuitStatus::HalfOpen,
            Some(opened) if opened.elapsed() >= self.cooldown => CircuitStatus::HalfOpen,
            Some(_) => CircuitStatus::Open,
        }
    }

    /// Whether a call may proceed. Claims the probe slot when half-open.
    pub fn allow_request(&self) -> bool {
        if self.failure_threshold == 0 {
            return true;
        }
        let mut state = self.state();
        match state.opened_at {
            None => true,
            Some(opened) if opened.elapsed() >= self.cooldown && !state.probe_in_flight => {
                state.probe_in_flight = true;
                true
            }
            Some(_) => false,
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state();
        if state.opened_at.is_some() {
            tracing::info!("External lookup circuit closed after successful probe");
        }
        *state = CircuitState::default();
    }

    pub fn record_failure(&self) {
        if self.failure_threshold == 0 {
            return;
        }
        let mut state = self.state();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);

        if state.probe_in_flight {
            state.probe_in_flight = false;
            state.opened_at = Some(Instant::now());
            tracing::warn!("External lookup probe failed, circuit re-opened");
        } else if state.opened_at.is_none() && state.consecutive_failures >= self.failure_threshold
        {
            state.opened_at = Some(Instant::now());
            tracing::warn!(
                consecutive_failures = state.consecutive_failures,
                cooldown_secs = self.cooldown.as_secs(),
                "External lookup circuit opened"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.allow_request());
        breaker.record_failure();
        assert_eq!(breaker.status(), CircuitStatus::Open);
        assert!(!breaker.allow_request());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new(2, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        assert_eq!(breaker.status(), CircuitStatus::Closed);
    }

    #[test]
    fn test_half_open_allows_single_probe() {
        let breaker = CircuitBreaker::new(1, Duration::ZERO);
        breaker.record_failure();
        assert_eq!(breaker.status(), CircuitStatus::HalfOpen);
        assert!(breaker.allow_request());
        // probe in flight: nobody else gets through
        assert!(!breaker.allow_request());

        breaker.record_success();
        assert_eq!(breaker.status(), CircuitStatus::Closed);
        assert!(breaker.allow_request());
    }

    #[test]
    fn test_failed_probe_reopens() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(0));
        breaker.record_failure();
        assert!(breaker.allow_request());
        breaker.record_failure();
        assert!(breaker.state().opened_at.is_some());
        assert!(!breaker.state().probe_in_flight);
    }

    #[test]
    fn test_zero_threshold_disables_breaker() {
        let breaker = CircuitBreaker::new(0, Duration::from_secs(60));
        for _ in 0..10 {
            breaker.record_failure();
        }
        assert!(breaker.allow_request());
        assert_eq!(breaker.status(), CircuitStatus::Closed);
    }
}
