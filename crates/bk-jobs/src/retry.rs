//! Exponential backoff schedule for failed jobs.

use rand::Rng;
use std::time::Duration;

/// `delay(n) = min(cap, base · 2^n)` plus up to 50% uniform jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based: the first retry after
    /// the first failure passes 0).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_with_jitter(attempt, rand::thread_rng().gen_range(0.0..0.5))
    }

    /// Deterministic variant; `jitter` must be in `[0, 0.5)`.
    pub fn backoff_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        let exp = self
            .base
            .checked_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX))
            .unwrap_or(self.cap);
        let capped = exp.min(self.cap);
        capped.mul_f64(1.0 + jitter)
    }
}
