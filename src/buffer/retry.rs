//! Capped exponential backoff.

use std::time::Duration;

/// Delay schedule for consecutive failures: `base * 2^(n-1)`, capped at `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base: Duration,
    max: Duration,
}

impl RetryPolicy {
    /// A policy starting at `base` and capped at `max`.
    #[must_use]
    pub const fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay after the first failure.
    #[must_use]
    pub const fn base(&self) -> Duration {
        self.base
    }

    /// Upper bound of the delay.
    #[must_use]
    pub const fn max(&self) -> Duration {
        self.max
    }

    /// Delay to wait after `consecutive_failures` failures in a row.
    ///
    /// Zero failures means no delay.
    #[must_use]
    pub fn delay_for(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(consecutive_failures - 1).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_capped() {
        let policy = RetryPolicy::new(Duration::from_millis(100), Duration::from_millis(1_000));
        let delays: Vec<u64> = (0..7).map(|n| policy.delay_for(n).as_millis() as u64).collect();
        assert_eq!(delays, vec![0, 100, 200, 400, 800, 1_000, 1_000]);
    }

    #[test]
    fn huge_failure_counts_saturate() {
        let policy = RetryPolicy::new(Duration::from_secs(1), Duration::from_secs(60));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(60));
    }
}
