use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

/// What to do after recording a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Try again after `delay`.
    Retry { attempt: u8, delay: Duration },
    /// No attempts left.
    Exhausted,
}

/// Attempt budget for one stage of a run.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    max_attempts: u8,
    backoff: BackoffConfig,
    failures: u8,
}

impl RetryBudget {
    /// `max_attempts` counts the first try; values below 1 are treated as 1.
    pub fn new(max_attempts: u8, backoff: BackoffConfig) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            failures: 0,
        }
    }

    /// Record a failure and decide whether another attempt is allowed.
    pub fn record_failure(&mut self) -> RetryDecision {
        self.failures = self.failures.saturating_add(1);
        let attempt = self.failures;

        if attempt < self.max_attempts {
            RetryDecision::Retry {
                attempt,
                delay: calculate_backoff(
                    attempt,
                    self.backoff.base_delay_ms,
                    self.backoff.max_delay_ms,
                ),
            }
        } else {
            RetryDecision::Exhausted
        }
    }

    /// Number of failures recorded so far.
    pub fn failures(&self) -> u8 {
        self.failures
    }
}

/// Calculate exponential backoff delay with jitter.
///
/// Formula: `min(base_ms * 2^(attempt-1) + jitter, max_ms)` (0-25% jitter)
pub fn calculate_backoff(attempt: u8, base_ms: u64, max_ms: u64) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }

    let exp_factor = 2u64.saturating_pow((attempt - 1) as u32);
    let delay_ms = base_ms.saturating_mul(exp_factor);

    let jitter = if delay_ms > 0 {
        rand::rng().random_range(0..=delay_ms / 4)
    } else {
        0
    };

    let total_delay = delay_ms.saturating_add(jitter).min(max_ms);
    Duration::from_millis(total_delay)
}
