//! Exponential retry backoff.

use std::time::Duration;

use rand::Rng;

/// `base * factor^(retry - 1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub factor: u32,
    /// Draw the delay uniformly from `[0, computed]`.
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(600),
            factor: 2,
            jitter: false,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `retry` (1-based). The first retry waits
    /// `base`.
    #[must_use]
    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1);
        let multiplier = self.factor.max(1).checked_pow(exponent).unwrap_or(u32::MAX);
        let computed = self.base.checked_mul(multiplier).unwrap_or(self.max).min(self.max);
        if self.jitter && !computed.is_zero() {
            rand::rng().random_range(Duration::ZERO..=computed)
        } else {
            computed
        }
    }
}
