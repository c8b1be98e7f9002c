//! Retry pacing for transient relay errors.
//!
//! Delays double from 500 ms up to an 8 s cap; the whole retry loop shares
//! one 30 s budget measured from the first attempt.  A retry that would
//! start past the budget is not made.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Total budget across all attempts of one logical call.
    pub budget: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            budget: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// No retries at all; the first terminal outcome is surfaced as-is.
    pub fn none() -> Self {
        Self {
            budget: Duration::ZERO,
            ..Self::default()
        }
    }
}

/// Delay generator for one logical call.
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay to sleep before the next retry, given how long the call has
    /// been running.  `None` means the budget is exhausted and the last
    /// transient error should be surfaced.
    pub fn next_delay(&mut self, elapsed: Duration) -> Option<Duration> {
        let exp = self.attempt.min(16);
        let delay = self
            .policy
            .initial_delay
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.policy.max_delay);
        if elapsed + delay >= self.policy.budget {
            return None;
        }
        self.attempt += 1;
        Some(delay)
    }
}
