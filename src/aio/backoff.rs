//! Bounded exponential backoff for transient submission failures.
//!
//! With the default policy the delays run 125us, 250us, ... doubling for at
//! most 16 retries: the last sleep is ~4s and the total wait is ~8s.

use std::time::Duration;

/// Default number of retries before `EAGAIN` is surfaced.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 16;

/// Default first retry delay.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_micros(125);

/// Retry limits for `EAGAIN` from `io_submit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum number of retries.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Backoff state for one recovery loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempts_left: u32,
    delay: Duration,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempts_left: policy.max_attempts,
            delay: policy.initial_delay,
        }
    }

    /// Take the next delay, doubling the one after it.
    ///
    /// Returns `None` once the retry budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts_left == 0 {
            return None;
        }
        self.attempts_left -= 1;
        let delay = self.delay;
        self.delay = delay.saturating_mul(2);
        Some(delay)
    }

    /// Sleep for the next delay. Returns `false` without sleeping when exhausted.
    pub fn wait(&mut self) -> bool {
        match self.next_delay() {
            Some(delay) => {
                std::thread::sleep(delay);
                true
            }
            None => false,
        }
    }

    /// Restore the full retry budget and the initial delay.
    pub fn reset(&mut self) {
        self.attempts_left = self.policy.max_attempts;
        self.delay = self.policy.initial_delay;
    }

    /// Retries still available.
    pub fn attempts_left(&self) -> u32 {
        self.attempts_left
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_sequence_doubles() {
        let mut backoff = Backoff::new(RetryPolicy::default());
        let delays: Vec<Duration> = std::iter::from_fn(|| backoff.next_delay()).collect();

        assert_eq!(delays.len(), 16);
        assert_eq!(delays[0], Duration::from_micros(125));
        for pair in delays.windows(2) {
            assert_eq!(pair[1], pair[0] * 2);
        }
        assert_eq!(delays[15], Duration::from_micros(125 << 15));

        // Whole schedule stays bounded
        let total: Duration = delays.iter().sum();
        assert!(total < Duration::from_secs(9));
    }

    #[test]
    fn test_exhausted_stays_exhausted() {
        let mut backoff = Backoff::new(RetryPolicy {
            initial_delay: Duration::from_micros(1),
            max_attempts: 2,
        });
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        assert!(backoff.next_delay().is_none());
        assert!(!backoff.wait());
    }

    #[test]
    fn test_reset_restores_budget() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_micros(10),
            max_attempts: 3,
        };
        let mut backoff = Backoff::new(policy);
        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempts_left(), 1);

        backoff.reset();
        assert_eq!(backoff.attempts_left(), 3);
        assert_eq!(backoff.next_delay(), Some(Duration::from_micros(10)));
    }

    #[test]
    fn test_zero_attempts() {
        let mut backoff = Backoff::new(RetryPolicy {
            initial_delay: Duration::from_micros(125),
            max_attempts: 0,
        });
        assert_eq!(backoff.next_delay(), None);
    }
}
