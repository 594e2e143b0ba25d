//! Exponential backoff with mandatory jitter.
//!
//! The delay for retry `n` (0-indexed) is
//! `min(cap, base * 2^n) * uniform(0.5, 1.5)`. Jitter is not optional:
//! synchronized retries after a shared failure would otherwise re-stampede
//! the dependency that just fell over.

use std::time::Duration;

use rand::Rng;

/// Default backoff base.
pub const DEFAULT_BASE: Duration = Duration::from_secs(1);

/// Default backoff cap (`TASK_BACKOFF_MAX_SEC`).
pub const DEFAULT_CAP: Duration = Duration::from_secs(60);

/// Exponential backoff policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Cap applied to the exponential term before jitter.
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE,
            cap: DEFAULT_CAP,
        }
    }
}

impl BackoffPolicy {
    /// Creates a policy with the given base and cap.
    #[must_use]
    pub const fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap }
    }

    /// Returns the jittered delay before retry number `retry_count`
    /// (0-indexed: the first retry passes 0).
    #[must_use]
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let exp = self.base.as_secs_f64() * 2f64.powi(retry_count.min(30) as i32);
        let capped = exp.min(self.cap.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(capped * jitter)
    }

    /// Returns the un-jittered delay, useful for bounding waits in callers.
    #[must_use]
    pub fn nominal_delay_for(&self, retry_count: u32) -> Duration {
        let exp = self.base.as_secs_f64() * 2f64.powi(retry_count.min(30) as i32);
        Duration::from_secs_f64(exp.min(self.cap.as_secs_f64()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_and_stay_within_jitter_bounds() {
        let policy = BackoffPolicy::default();

        for retry_count in 0..6u32 {
            let nominal = policy.nominal_delay_for(retry_count).as_secs_f64();
            assert!((nominal - (2f64.powi(retry_count as i32)).min(60.0)).abs() < f64::EPSILON);

            for _ in 0..50 {
                let delay = policy.delay_for(retry_count).as_secs_f64();
                assert!(delay >= nominal * 0.5, "delay {delay} below jitter floor");
                assert!(delay < nominal * 1.5, "delay {delay} above jitter ceiling");
            }
        }
    }

    #[test]
    fn cap_bounds_the_exponential_term() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(60));

        // 2^10 = 1024s, far past the cap.
        let nominal = policy.nominal_delay_for(10);
        assert_eq!(nominal, Duration::from_secs(60));

        for _ in 0..50 {
            let delay = policy.delay_for(10);
            assert!(delay <= Duration::from_secs(90));
            assert!(delay >= Duration::from_secs(30));
        }
    }

    #[test]
    fn zero_policy_is_instant() {
        let policy = BackoffPolicy::new(Duration::ZERO, Duration::ZERO);
        assert_eq!(policy.delay_for(3), Duration::ZERO);
    }

    #[test]
    fn large_retry_counts_do_not_overflow() {
        let policy = BackoffPolicy::default();
        let delay = policy.delay_for(u32::MAX);
        assert!(delay <= Duration::from_secs(90));
    }
}
