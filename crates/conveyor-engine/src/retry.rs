//! Retry backoff policy
//!
//! Exponential backoff with jitter for automatic retry of failed runs.
//! The base interval comes from the run's `retry_delay_seconds`; the
//! policy caps growth and adds randomness to avoid thundering herds.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Backoff configuration for retried runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Backoff multiplier per retry
    pub backoff_coefficient: f64,

    /// Upper bound on any single delay
    pub max_interval_seconds: u64,

    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff_coefficient: 2.0,
            max_interval_seconds: 300,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Delay before the given attempt (2-based: the first retry is
    /// attempt 2). Attempt 1 is the initial execution and has no delay.
    pub fn delay_for_attempt(&self, base_seconds: u64, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let retry_num = attempt - 2;
        let base = base_seconds as f64 * self.backoff_coefficient.powi(retry_num as i32);
        let capped = base.min(self.max_interval_seconds as f64);

        let jittered = if self.jitter > 0.0 {
            let mut rng = rand::thread_rng();
            let range = capped * self.jitter;
            if range > 0.0 {
                (capped + rng.gen_range(-range..range)).max(0.0)
            } else {
                capped
            }
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> RetryPolicy {
        RetryPolicy {
            jitter: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn test_first_attempt_has_no_delay() {
        assert_eq!(no_jitter().delay_for_attempt(30, 1), Duration::ZERO);
    }

    #[test]
    fn test_exponential_growth() {
        let policy = no_jitter();
        assert_eq!(policy.delay_for_attempt(30, 2), Duration::from_secs(30));
        assert_eq!(policy.delay_for_attempt(30, 3), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(30, 4), Duration::from_secs(120));
    }

    #[test]
    fn test_max_interval_cap() {
        let policy = no_jitter();
        assert_eq!(policy.delay_for_attempt(30, 10), Duration::from_secs(300));
    }

    #[test]
    fn test_jitter_stays_near_base() {
        let policy = RetryPolicy::default();
        let delay = policy.delay_for_attempt(30, 2).as_secs_f64();
        assert!((27.0..=33.0).contains(&delay), "delay {delay} outside jitter band");
    }
}
