//! Alarm retry policy.

use std::time::Duration;

use crate::types::AlarmConfig;

/// Exponential backoff with a cap: `min(base * 2^retry, max)`.
///
/// With the defaults a failing handler is retried after 2s, 4s, 8s, 16s,
/// 32s and 64s, seven invocations in total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &AlarmConfig) -> Self {
        Self {
            base_delay: config.retry_base_delay,
            max_delay: config.retry_max_delay,
            max_retries: config.max_retries,
        }
    }

    /// Delay before retry number `retry_count + 1`.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let factor = 1u32.checked_shl(retry_count).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Whether a handler that just failed at `retry_count` gets another attempt.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&AlarmConfig::default())
    }
}
