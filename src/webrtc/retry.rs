//! Exponential backoff shared by reconnection and consumer retries

use std::time::Duration;

/// Doubling delay schedule with a bounded number of attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max_attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, max_attempts: u32) -> Self {
        Self { base, max_attempts }
    }

    /// Delay before attempt `attempt` (0-based): `base * 2^attempt`.
    /// `None` once the attempt budget is spent.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(attempt)?;
        self.base.checked_mul(factor)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// Counts consecutive reconnect attempts against a backoff schedule
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    backoff: Backoff,
    attempts: u32,
}

impl ReconnectPolicy {
    pub fn new(backoff: Backoff) -> Self {
        Self { backoff, attempts: 0 }
    }

    /// Delay for the next attempt, consuming it; `None` when exhausted
    pub fn next_delay(&mut self) -> Option<Duration> {
        let delay = self.backoff.delay(self.attempts)?;
        self.attempts += 1;
        Some(delay)
    }

    /// Forget past failures after a successful connection
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_schedule_is_two_to_the_k_seconds() {
        let mut policy = ReconnectPolicy::new(Backoff::new(Duration::from_secs(1), 5));
        let delays: Vec<_> = std::iter::from_fn(|| policy.next_delay()).collect();
        assert_eq!(
            delays,
            vec![1, 2, 4, 8, 16].into_iter().map(Duration::from_secs).collect::<Vec<_>>()
        );
        // No sixth attempt
        assert_eq!(policy.next_delay(), None);
        assert_eq!(policy.attempts(), 5);
    }

    #[test]
    fn test_reset_restarts_schedule() {
        let mut policy = ReconnectPolicy::new(Backoff::new(Duration::from_secs(1), 5));
        policy.next_delay();
        policy.next_delay();
        policy.reset();
        assert_eq!(policy.next_delay(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_consumer_retry_backoff() {
        let backoff = Backoff::new(Duration::from_millis(1000), 5);
        assert_eq!(backoff.delay(0), Some(Duration::from_millis(1000)));
        assert_eq!(backoff.delay(3), Some(Duration::from_millis(8000)));
        assert_eq!(backoff.delay(5), None);
    }
}
