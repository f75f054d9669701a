//! Retry policy: bounded exponential backoff.

use std::time::Duration;

/// Backoff for transient delivery failures.
///
/// The delay doubles from `floor` on every failed attempt and never exceeds
/// `cap`. After more than `max_retries` failures the item is failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub floor: Duration,
    pub cap: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            floor: Duration::from_secs(1),
            cap: Duration::from_secs(300),
            max_retries: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following failure number `retry_count`
    /// (1-indexed): `floor * 2^(retry_count - 1)`, capped.
    pub fn next_delay(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1);
        let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.floor
            .checked_mul(factor)
            .unwrap_or(self.cap)
            .min(self.cap)
    }

    /// Has `retry_count` gone past the budget?
    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count > self.max_retries
    }
}
