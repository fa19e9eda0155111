//! Adaptive per-sink batch size (`spec.md` §4.9): shrink on 413/429/timeout,
//! grow on sustained success, always bounded by `[min_batch, max_batch]`.

use parking_lot::Mutex;

/// Consecutive successes required before a grow step, so a single lucky
/// send after a shrink doesn't immediately ping-pong the size back up.
const GROW_AFTER_SUCCESSES: u32 = 5;

struct Inner {
    current: usize,
    consecutive_successes: u32,
}

pub struct BatchSizeController {
    min: usize,
    max: usize,
    inner: Mutex<Inner>,
}

impl BatchSizeController {
    pub fn new(min: usize, max: usize, initial: usize) -> Self {
        Self {
            min,
            max,
            inner: Mutex::new(Inner {
                current: initial.clamp(min, max),
                consecutive_successes: 0,
            }),
        }
    }

    pub fn current(&self) -> usize {
        self.inner.lock().current
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_successes += 1;
        if inner.consecutive_successes >= GROW_AFTER_SUCCESSES {
            inner.consecutive_successes = 0;
            inner.current = (inner.current * 2).min(self.max);
        }
    }

    /// Halves the batch size, grounding the growth-rate symmetry (halve
    /// rather than decrement by one) in the same multiplicative-backoff
    /// shape as `streamship_common::Backoff`.
    pub fn record_shrink_trigger(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_successes = 0;
        inner.current = (inner.current / 2).max(self.min);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_clamped_initial() {
        let c = BatchSizeController::new(10, 1000, 5_000);
        assert_eq!(c.current(), 1000);
    }

    #[test]
    fn shrinks_on_trigger_bounded_by_min() {
        let c = BatchSizeController::new(10, 1000, 20);
        c.record_shrink_trigger();
        assert_eq!(c.current(), 10);
        c.record_shrink_trigger();
        assert_eq!(c.current(), 10);
    }

    #[test]
    fn grows_only_after_sustained_successes_bounded_by_max() {
        let c = BatchSizeController::new(10, 100, 50);
        for _ in 0..4 {
            c.record_success();
            assert_eq!(c.current(), 50);
        }
        c.record_success();
        assert_eq!(c.current(), 100);
    }
}
