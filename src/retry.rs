use crate::utils::mix;
use std::time::Duration;

/// Largest relative jitter applied to a retry delay (±20%).
pub const JITTER_RATIO: f64 = 0.2;

/// Exponential backoff with a cap and a bounded number of attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            max_attempts: 8,
        }
    }
}

impl RetryPolicy {
    /// `min(base * 2^attempt, max_delay)`, before jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Backoff for `attempt` with jitter derived from `seed`.
    ///
    /// The jitter is a pure function of seed and attempt, so different
    /// objects failing at the same time land on different delays.
    pub fn delay(&self, attempt: u32, seed: u64) -> Duration {
        let base = self.base_delay(attempt);
        let unit = (mix(seed, u64::from(attempt)) % 10_001) as f64 / 10_000.0;
        let factor = 1.0 + JITTER_RATIO * (2.0 * unit - 1.0);
        base.mul_f64(factor)
    }

    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}
