use rand::Rng;
use std::time::Duration;
use tokio::time::Instant;

/// Longest delay between two intake attempts, in seconds.
pub const MAX_BACKOFF_SECS: u64 = 36;

/// Delay before the next intake request after `consecutive_errors` failures
/// in a row: none for the first, then `(k - 1)^2` seconds capped at 36.
pub fn delay_for(consecutive_errors: u32) -> Duration {
    if consecutive_errors <= 1 {
        return Duration::ZERO;
    }
    let base = u64::from(consecutive_errors - 1);
    Duration::from_secs(base.saturating_mul(base).min(MAX_BACKOFF_SECS))
}

/// Consecutive-failure accounting for the intake channel.
///
/// READY while `next_allowed_at` is unset or in the past, BACKING-OFF otherwise.
#[derive(Debug, Clone, Default)]
pub struct Backoff {
    consecutive_errors: u32,
    next_allowed_at: Option<Instant>,
    jitter: bool,
}

impl Backoff {
    pub fn new(jitter: bool) -> Self {
        Self {
            jitter,
            ..Self::default()
        }
    }

    pub fn set_jitter(&mut self, jitter: bool) {
        self.jitter = jitter;
    }

    /// Records a failed request and returns how long to wait before the next one.
    pub fn record_failure(&mut self) -> Duration {
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        let delay = delay_for(self.consecutive_errors);
        let delay = if self.jitter { apply_jitter(delay) } else { delay };

        self.next_allowed_at = if delay.is_zero() {
            None
        } else {
            Some(Instant::now() + delay)
        };
        delay
    }

    pub fn record_success(&mut self) {
        self.consecutive_errors = 0;
        self.next_allowed_at = None;
    }

    pub fn is_ready(&self, now: Instant) -> bool {
        self.next_allowed_at.is_none_or(|at| now >= at)
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub fn next_allowed_at(&self) -> Option<Instant> {
        self.next_allowed_at
    }
}

fn apply_jitter(delay: Duration) -> Duration {
    if delay.is_zero() {
        return delay;
    }
    let mut rng = rand::rng();
    let jitter_factor = rng.random_range(0.9..=1.1); // ±10%
    delay.mul_f64(jitter_factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_series() {
        let delays: Vec<u64> = (0..=8).map(|k| delay_for(k).as_secs()).collect();
        assert_eq!(delays, vec![0, 0, 1, 4, 9, 16, 25, 36, 36]);
        assert_eq!(delay_for(u32::MAX), Duration::from_secs(MAX_BACKOFF_SECS));
    }

    #[test]
    fn test_failures_then_success() {
        let mut backoff = Backoff::new(false);
        let now = Instant::now();

        assert_eq!(backoff.record_failure(), Duration::ZERO);
        assert!(backoff.is_ready(now));

        assert_eq!(backoff.record_failure(), Duration::from_secs(1));
        assert_eq!(backoff.consecutive_errors(), 2);
        assert!(!backoff.is_ready(Instant::now()));

        assert_eq!(backoff.record_failure(), Duration::from_secs(4));

        backoff.record_success();
        assert_eq!(backoff.consecutive_errors(), 0);
        assert!(backoff.is_ready(Instant::now()));
        assert_eq!(backoff.record_failure(), Duration::ZERO);
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        let mut backoff = Backoff::new(true);
        for _ in 0..4 {
            backoff.record_failure();
        }
        for _ in 0..100 {
            let mut probe = backoff.clone();
            let delay = probe.record_failure();
            assert!(delay >= Duration::from_secs(16).mul_f64(0.9));
            assert!(delay <= Duration::from_secs(16).mul_f64(1.1));
        }
    }
}
