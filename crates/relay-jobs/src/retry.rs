//! Retry decisions and exponential backoff.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::job::{FailureReason, JobRecord};

/// Exponent cap; keeps `base * 2^n` from overflowing long before the ceiling
/// applies.
const MAX_EXPONENT: u32 = 30;

/// Backoff settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay after the first failed attempt, in milliseconds.
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,

    /// Ceiling for any single delay, in milliseconds.
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,

    /// Spread delays by ±25% so retries of many jobs do not line up.
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_base_ms() -> u64 {
    1_000
}

fn default_max_ms() -> u64 {
    60_000
}

fn default_jitter() -> bool {
    true
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: default_base_ms(),
            max_ms: default_max_ms(),
            jitter: default_jitter(),
        }
    }
}

impl BackoffConfig {
    /// Fixed-ceiling exponential backoff without jitter.
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self {
            base_ms: u64::try_from(base.as_millis()).unwrap_or(u64::MAX),
            max_ms: u64::try_from(max.as_millis()).unwrap_or(u64::MAX),
            jitter: false,
        }
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }
}

/// What to do with a job whose run just failed.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Run again once `next_run_at` has passed.
    Retry {
        delay: Duration,
        next_run_at: DateTime<Utc>,
    },

    /// Give up.
    Fail(FailureReason),
}

/// Generic retry mechanism shared by every job type.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    backoff: BackoffConfig,
}

impl RetryPolicy {
    pub fn new(backoff: BackoffConfig) -> Self {
        Self { backoff }
    }

    pub fn backoff(&self) -> &BackoffConfig {
        &self.backoff
    }

    /// Delay before the next run, after `attempts` runs have failed.
    ///
    /// `min(base * 2^(attempts - 1), max)`, optionally scaled by a factor in
    /// `[0.75, 1.25)` and clamped to `max` again.
    pub fn backoff_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(MAX_EXPONENT);
        let raw = self
            .backoff
            .base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.backoff.max_ms);

        let millis = if self.backoff.jitter {
            let factor: f64 = rand::thread_rng().gen_range(0.75..1.25);
            ((raw as f64 * factor) as u64).min(self.backoff.max_ms)
        } else {
            raw
        };

        Duration::from_millis(millis)
    }

    /// Decide between retrying and failing for good.
    ///
    /// `record.attempt_count` already includes the run that just failed.
    pub fn decide(
        &self,
        record: &JobRecord,
        retryable: bool,
        error: &str,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        if !retryable {
            return RetryDecision::Fail(FailureReason::Error(error.to_string()));
        }
        if !record.has_attempts_remaining() {
            return RetryDecision::Fail(FailureReason::AttemptsExhausted);
        }

        let delay = self.backoff_delay(record.attempt_count);
        let next_run_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(now);

        RetryDecision::Retry { delay, next_run_at }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Data;
    use crate::job::{JobId, Parameters};
    use proptest::prelude::*;

    fn policy(base_ms: u64, max_ms: u64, jitter: bool) -> RetryPolicy {
        RetryPolicy::new(BackoffConfig {
            base_ms,
            max_ms,
            jitter,
        })
    }

    fn record_with(parameters: Parameters, attempt_count: u32) -> JobRecord {
        let mut record = JobRecord::new(JobId::new(), 0, "TestJob", &parameters, Data::empty());
        record.attempt_count = attempt_count;
        record
    }

    #[test]
    fn test_exponential_delays() {
        let policy = policy(100, 1_000, false);
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_delay(4), Duration::from_millis(800));
        assert_eq!(policy.backoff_delay(5), Duration::from_millis(1_000));
        assert_eq!(policy.backoff_delay(u32::MAX), Duration::from_millis(1_000));
    }

    #[test]
    fn test_decide_retry() {
        let policy = policy(100, 1_000, false);
        let record = record_with(Parameters::new().max_attempts(3), 1);
        let now = Utc::now();

        match policy.decide(&record, true, "timeout", now) {
            RetryDecision::Retry { delay, next_run_at } => {
                assert_eq!(delay, Duration::from_millis(100));
                assert_eq!(next_run_at, now + chrono::Duration::milliseconds(100));
            }
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn test_decide_exhausted() {
        let policy = RetryPolicy::default();
        let record = record_with(Parameters::new().max_attempts(3), 3);
        assert_eq!(
            policy.decide(&record, true, "timeout", Utc::now()),
            RetryDecision::Fail(FailureReason::AttemptsExhausted)
        );
    }

    #[test]
    fn test_decide_fatal() {
        let policy = RetryPolicy::default();
        let record = record_with(Parameters::new().unlimited_attempts(), 1);
        assert_eq!(
            policy.decide(&record, false, "rejected", Utc::now()),
            RetryDecision::Fail(FailureReason::Error("rejected".to_string()))
        );
    }

    #[test]
    fn test_unlimited_never_exhausts() {
        let policy = policy(10, 20, false);
        let record = record_with(Parameters::new().unlimited_attempts(), 10_000);
        assert!(matches!(
            policy.decide(&record, true, "offline", Utc::now()),
            RetryDecision::Retry { .. }
        ));
    }

    proptest! {
        #[test]
        fn prop_delay_never_exceeds_ceiling(
            base in 0u64..10_000,
            max in 0u64..120_000,
            attempts in 0u32..100,
            jitter in any::<bool>(),
        ) {
            let delay = policy(base, max, jitter).backoff_delay(attempts);
            prop_assert!(delay <= Duration::from_millis(max));
        }

        #[test]
        fn prop_delay_is_monotonic_without_jitter(
            base in 1u64..10_000,
            max in 1u64..120_000,
            attempts in 1u32..60,
        ) {
            let policy = policy(base, max, false);
            prop_assert!(policy.backoff_delay(attempts) <= policy.backoff_delay(attempts + 1));
        }
    }
}
