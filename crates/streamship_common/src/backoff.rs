use std::{
    cmp,
    time::Duration,
};

use rand::Rng;

/// Exponential backoff with full jitter.
///
/// Used by every component that retries a fallible operation against an
/// external resource (file open, sink send, position-store flush): the
/// retry manager's per-item schedule (`spec.md` §4.8) and every sink's
/// connection-retry loop build on the same primitive.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    initial_backoff: Duration,
    max_backoff: Duration,
    num_failures: u32,
}

impl Backoff {
    pub fn new(initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            initial_backoff,
            max_backoff,
            num_failures: 0,
        }
    }

    pub fn reset(&mut self) {
        self.num_failures = 0;
    }

    pub fn fail(&mut self, rng: &mut impl Rng) -> Duration {
        // https://aws.amazon.com/blogs/architecture/exponential-backoff-and-jitter/
        let p = 2u32.checked_pow(self.num_failures).unwrap_or(u32::MAX);
        self.num_failures += 1;
        let jitter = rng.gen::<f32>();
        let backoff = self
            .initial_backoff
            .checked_mul(p)
            .unwrap_or(self.max_backoff);
        cmp::min(backoff, self.max_backoff).mul_f32(jitter)
    }

    /// Computes the delay for a given attempt count without mutating any
    /// internal state, for callers (the retry manager) that track `attempts`
    /// on the record itself rather than in a per-source `Backoff`.
    pub fn delay_for_attempt(
        initial: Duration,
        max: Duration,
        multiplier: f64,
        attempt: u32,
        rng: &mut impl Rng,
    ) -> Duration {
        let unjittered = initial.mul_f64(multiplier.powi(attempt as i32));
        let capped = cmp::min(unjittered, max);
        // +/-10% jitter per spec.md 4.8.
        let jitter = rng.gen_range(0.9..1.1);
        capped.mul_f64(jitter)
    }

    pub fn failures(&self) -> u32 {
        self.num_failures
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    #[test]
    fn backoff_is_monotone_up_to_max() {
        let mut b = Backoff::new(Duration::from_millis(10), Duration::from_secs(1));
        let mut rng = StdRng::seed_from_u64(42);
        let mut last_cap = Duration::ZERO;
        for _ in 0..20 {
            let d = b.fail(&mut rng);
            assert!(d <= Duration::from_secs(1));
            last_cap = d;
        }
        let _ = last_cap;
        assert_eq!(b.failures(), 20);
    }

    #[test]
    fn reset_clears_failure_count() {
        let mut b = Backoff::new(Duration::from_millis(1), Duration::from_secs(1));
        let mut rng = StdRng::seed_from_u64(1);
        b.fail(&mut rng);
        b.fail(&mut rng);
        assert_eq!(b.failures(), 2);
        b.reset();
        assert_eq!(b.failures(), 0);
    }

    #[test]
    fn delay_for_attempt_respects_max() {
        let mut rng = StdRng::seed_from_u64(7);
        let d = Backoff::delay_for_attempt(
            Duration::from_secs(1),
            Duration::from_secs(5),
            2.0,
            10,
            &mut rng,
        );
        assert!(d <= Duration::from_secs(5).mul_f64(1.1));
    }
}
