//! Retry policy for failed jobs.

use std::time::Duration;

use crate::defaults::{JOB_MAX_ATTEMPTS, JOB_RETRY_BASE_DELAY_MS, JOB_RETRY_MAX_DELAY_MS};

/// Bounded exponential backoff.
///
/// A job is delivered at most `max_attempts` times. After failed attempt `n`
/// (1-based) the next delivery waits `base_delay * 2^(n-1)`, capped at
/// `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: i32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: JOB_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(JOB_RETRY_BASE_DELAY_MS),
            max_delay: Duration::from_millis(JOB_RETRY_MAX_DELAY_MS),
        }
    }
}

impl RetryPolicy {
    /// Create policy from environment variables (with defaults).
    ///
    /// | Variable | Default | Description |
    /// |----------|---------|-------------|
    /// | `JOB_MAX_ATTEMPTS` | `2` | Deliveries per job, first included |
    /// | `JOB_RETRY_BASE_DELAY_MS` | `30000` | Backoff base delay |
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let max_attempts = std::env::var("JOB_MAX_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse::<i32>().ok())
            .unwrap_or(defaults.max_attempts)
            .max(1);

        let base_delay = std::env::var("JOB_RETRY_BASE_DELAY_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.base_delay);

        Self {
            max_attempts,
            base_delay,
            ..defaults
        }
    }

    /// Set the attempt cap.
    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the backoff base delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Whether a job that just failed its `attempts`-th delivery gets another.
    pub fn should_retry(&self, attempts: i32) -> bool {
        attempts < self.max_attempts
    }

    /// Delay before the delivery following failed attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: i32) -> Duration {
        let exponent = attempt.saturating_sub(1).clamp(0, 30) as u32;
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }
}
