// File: portal-sync/src/retry.rs
// Purpose: Exponential backoff with jitter for transient sync failures

use rand::Rng;
use std::time::Duration;

/// Retry schedule for queue items
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Failed attempts after which the item stops auto-retrying
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn new(base: Duration, cap: Duration, max_retries: u32) -> Self {
        Self {
            base,
            cap,
            max_retries,
        }
    }

    /// Whether an item with this many failed attempts should be parked as failed
    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.max_retries
    }

    /// Un-jittered delay before attempt number `retry_count + 1`
    pub fn ceiling_for(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(16);
        let delay = self.base.saturating_mul(1u32 << exponent);
        delay.min(self.cap)
    }

    /// Delay with "equal jitter": uniformly between half and all of the ceiling
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let ceiling = self.ceiling_for(retry_count);
        let ceiling_ms = ceiling.as_millis() as u64;
        if ceiling_ms < 2 {
            return ceiling;
        }

        let jittered = rand::thread_rng().gen_range(ceiling_ms / 2..=ceiling_ms);
        Duration::from_millis(jittered)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), 5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(1, 1_000)]
    #[case(2, 2_000)]
    #[case(3, 4_000)]
    #[case(5, 16_000)]
    #[case(6, 30_000)]
    #[case(40, 30_000)]
    fn test_ceiling_doubles_until_cap(#[case] retry_count: u32, #[case] expected_ms: u64) {
        let policy = RetryPolicy::default();
        assert_eq!(policy.ceiling_for(retry_count), Duration::from_millis(expected_ms));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::default();
        for retry_count in 1..10 {
            let ceiling = policy.ceiling_for(retry_count);
            for _ in 0..50 {
                let delay = policy.delay_for(retry_count);
                assert!(delay <= ceiling);
                assert!(delay >= ceiling / 2);
            }
        }
    }

    #[test]
    fn test_exhaustion_at_ceiling() {
        let policy = RetryPolicy::default();
        assert!(!policy.is_exhausted(4));
        assert!(policy.is_exhausted(5));
    }
}
