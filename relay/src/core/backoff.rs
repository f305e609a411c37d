//! Exponential backoff schedule for model call retries.

use std::time::Duration;

/// `delay(i) = min(base * 2^i, max)` for the 0-indexed attempt `i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Build from fractional seconds as written in `config.toml`.
    pub fn from_secs_f64(base_secs: f64, max_secs: f64) -> Self {
        Self::new(
            Duration::from_secs_f64(base_secs.max(0.0)),
            Duration::from_secs_f64(max_secs.max(0.0)),
        )
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Delay to wait after the failed attempt `attempt` (0-indexed).
    pub fn delay(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_until_capped() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(1000));
        let delays: Vec<u128> = (0..6).map(|i| backoff.delay(i).as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn delay_is_monotonic_and_never_overflows() {
        let backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30));
        let mut previous = Duration::ZERO;
        for attempt in 0..80 {
            let delay = backoff.delay(attempt);
            assert!(delay >= previous, "attempt {attempt} decreased");
            assert!(delay <= Duration::from_secs(30));
            previous = delay;
        }
        assert_eq!(backoff.delay(79), Duration::from_secs(30));
    }

    #[test]
    fn zero_base_never_sleeps() {
        let backoff = Backoff::from_secs_f64(0.0, 5.0);
        assert_eq!(backoff.delay(10), Duration::ZERO);
    }
}
