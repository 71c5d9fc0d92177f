//! Retry policy: exponential backoff with full jitter.
//!
//! `delay(k)` is drawn uniformly from `[0, min(cap, base * 2^k)]`. An
//! endpoint-provided `Retry-After` takes precedence over the computed
//! backoff when it is longer.

use rand::Rng;
use std::time::Duration;

/// Default backoff base (1s)
pub const DEFAULT_BASE: Duration = Duration::from_secs(1);
/// Default backoff cap (5 min)
pub const DEFAULT_CAP: Duration = Duration::from_secs(300);
/// Default max attempts beyond the first try
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Retry policy for one integration
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Backoff base
    pub base:        Duration,
    /// Backoff ceiling
    pub cap:         Duration,
    /// Retries after the first attempt
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base:        DEFAULT_BASE,
            cap:         DEFAULT_CAP,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl RetryPolicy {
    /// Policy with the integration's configured retry count.
    #[must_use]
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Whether another attempt is allowed after `attempt` failures.
    /// `attempt` is 1-based: after the first failed try, `attempt = 1`.
    #[must_use]
    pub const fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }

    /// Upper bound of the backoff window for retry `attempt` (1-based).
    #[must_use]
    pub fn backoff_ceiling(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(32);
        let factor = 2u64.saturating_pow(exponent);
        let ceiling_ms = self.base.as_millis() as u64;
        Duration::from_millis(ceiling_ms.saturating_mul(factor)).min(self.cap)
    }

    /// Draw a full-jitter delay for retry `attempt`, honoring an
    /// endpoint-provided `Retry-After` as a floor.
    #[must_use]
    pub fn delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let ceiling = self.backoff_ceiling(attempt);
        let jittered = if ceiling.is_zero() {
            Duration::ZERO
        } else {
            let ms = rand::thread_rng().gen_range(0..=ceiling.as_millis() as u64);
            Duration::from_millis(ms)
        };
        match retry_after {
            Some(hint) => jittered.max(hint),
            None => jittered,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_should_retry_bounds() {
        let policy = RetryPolicy::with_max_retries(3);
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(3));
        assert!(!policy.should_retry(4));

        let zero = RetryPolicy::with_max_retries(0);
        assert!(!zero.should_retry(1));
    }

    #[test]
    fn test_ceiling_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_ceiling(1), Duration::from_secs(2));
        assert_eq!(policy.backoff_ceiling(2), Duration::from_secs(4));
        assert_eq!(policy.backoff_ceiling(3), Duration::from_secs(8));
        // Caps at 5 minutes
        assert_eq!(policy.backoff_ceiling(10), Duration::from_secs(300));
        assert_eq!(policy.backoff_ceiling(32), Duration::from_secs(300));
    }

    #[test]
    fn test_retry_after_is_a_floor() {
        let policy = RetryPolicy::default();
        let delay = policy.delay(1, Some(Duration::from_secs(30)));
        assert!(delay >= Duration::from_secs(30));
    }

    proptest! {
        // delay(k) <= min(cap, base * 2^k) for any attempt
        #[test]
        fn prop_delay_bounded_by_ceiling(attempt in 1u32..20) {
            let policy = RetryPolicy::default();
            let delay = policy.delay(attempt, None);
            prop_assert!(delay <= policy.backoff_ceiling(attempt));
            prop_assert!(delay <= DEFAULT_CAP);
        }

        #[test]
        fn prop_ceiling_monotonic(attempt in 1u32..19) {
            let policy = RetryPolicy::default();
            prop_assert!(policy.backoff_ceiling(attempt) <= policy.backoff_ceiling(attempt + 1));
        }
    }
}
