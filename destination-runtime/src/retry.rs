//! Retry policy and error classification.
//!
//! [`classify`] is pure: it only looks at the error, the attempt number and
//! the policy, so the dispatcher's retry loop is tested without a network.

use actionkit::config::DispatchConfig;
use actionkit::ActionError;
use std::time::Duration;

/// Exponential backoff with a bounded number of attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, the first one included
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub factor: u32,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&DispatchConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            factor: config.backoff_factor.max(2),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before the attempt following `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let multiplier = self.factor.saturating_pow(exponent);
        self.initial_backoff
            .checked_mul(multiplier)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Outcome of classifying one failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryDecision {
    pub retryable: bool,
    pub backoff: Duration,
    pub attempts_remaining: u32,
}

impl RetryDecision {
    pub fn should_retry(&self) -> bool {
        self.retryable && self.attempts_remaining > 0
    }
}

/// Decides whether attempt number `attempt` (1-based) may be followed by
/// another one.
pub fn classify(error: &ActionError, attempt: u32, policy: &RetryPolicy) -> RetryDecision {
    let retryable = error.is_retryable();
    let attempts_remaining = policy.max_attempts.saturating_sub(attempt);

    RetryDecision {
        retryable,
        backoff: if retryable && attempts_remaining > 0 {
            policy.backoff_for(attempt)
        } else {
            Duration::ZERO
        },
        attempts_remaining,
    }
}
