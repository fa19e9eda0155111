//! Per-sink circuit breaker (`spec.md` §4.9): `closed -> open -> half_open
//! -> closed`, driven purely by consecutive failures and a cooldown timer.
//! No runtime injection here — the cooldown only needs wall-clock elapsed
//! time, not deterministic virtual time, since tests drive it by
//! constructing instants directly rather than sleeping.

use std::time::{
    Duration,
    Instant,
};

use parking_lot::Mutex;
use streamship_common::metrics::metrics;
use streamship_config::CircuitBreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    fn gauge_value(self) -> i64 {
        match self {
            BreakerState::Closed => 0,
            BreakerState::Open => 1,
            BreakerState::HalfOpen => 2,
        }
    }
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Tracks one sink's health. `allow_request` is the single gate every batch
/// dispatch consults before including this sink; `half_open` only ever lets
/// one trial request through at a time.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        metrics()
            .circuit_breaker_state
            .with_label_values(&[&name])
            .set(BreakerState::Closed.gauge_value());
        Self {
            name,
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    /// Whether a batch may currently be sent through this sink. Transitions
    /// `open -> half_open` here, on the calling thread, the moment the
    /// cooldown has elapsed.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.config.cooldown {
                    inner.state = BreakerState::HalfOpen;
                    self.set_gauge(BreakerState::HalfOpen);
                    true
                } else {
                    false
                }
            },
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        if inner.state != BreakerState::Closed {
            inner.state = BreakerState::Closed;
            inner.opened_at = None;
            self.set_gauge(BreakerState::Closed);
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        if inner.state == BreakerState::HalfOpen {
            // The trial request failed: back to fully open for another cooldown.
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
            inner.consecutive_failures = self.config.failure_threshold;
            self.set_gauge(BreakerState::Open);
            return;
        }
        inner.consecutive_failures += 1;
        if inner.consecutive_failures >= self.config.failure_threshold {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
            self.set_gauge(BreakerState::Open);
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    fn set_gauge(&self, state: BreakerState) {
        metrics()
            .circuit_breaker_state
            .with_label_values(&[&self.name])
            .set(state.gauge_value());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(threshold: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            cooldown: Duration::from_millis(20),
        }
    }

    #[test]
    fn opens_after_threshold_consecutive_failures() {
        let breaker = CircuitBreaker::new("t1", config(3));
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow_request());
    }

    #[test]
    fn half_opens_after_cooldown_and_closes_on_trial_success() {
        let breaker = CircuitBreaker::new("t2", config(1));
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        std::thread::sleep(Duration::from_millis(25));
        assert!(breaker.allow_request());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn failed_trial_reopens_the_breaker() {
        let breaker = CircuitBreaker::new("t3", config(1));
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(25));
        assert!(breaker.allow_request());
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn success_resets_failure_count() {
        let breaker = CircuitBreaker::new("t4", config(3));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}
