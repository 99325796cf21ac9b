//! Retry delays and the retry-or-give-up decision.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::job::Job;

// ═══════════════════════════════════════════════════════════════════════════════
// Backoff Strategy
// ═══════════════════════════════════════════════════════════════════════════════

/// Strategy for calculating retry delays.
///
/// Every strategy starts from the job's own `retry_delay`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Always wait `retry_delay`
    #[default]
    Fixed,
    /// `retry_delay + increment * (n - 1)`
    Linear {
        #[serde(with = "humantime_serde")]
        increment: Duration,
    },
    /// `retry_delay * multiplier^(n - 1)`, capped
    Exponential {
        multiplier: f64,
        #[serde(with = "humantime_serde")]
        max_delay: Duration,
    },
    /// Exponential with +/- `jitter_factor` random spread
    ExponentialWithJitter {
        multiplier: f64,
        #[serde(with = "humantime_serde")]
        max_delay: Duration,
        jitter_factor: f64,
    },
}

impl BackoffStrategy {
    /// Delay before retry number `retry` (1-indexed).
    pub fn delay_for(&self, base: Duration, retry: u32) -> Duration {
        let n = retry.saturating_sub(1);
        match self {
            Self::Fixed => base,
            Self::Linear { increment } => base.saturating_add(increment.saturating_mul(n)),
            Self::Exponential {
                multiplier,
                max_delay,
            } => exponential(base, *multiplier, n, *max_delay),
            Self::ExponentialWithJitter {
                multiplier,
                max_delay,
                jitter_factor,
            } => {
                let capped = exponential(base, *multiplier, n, *max_delay).as_secs_f64();
                let spread = capped * jitter_factor.clamp(0.0, 1.0);
                let jitter = (rand::random::<f64>() * 2.0 - 1.0) * spread;
                Duration::from_secs_f64((capped + jitter).max(0.0))
            }
        }
    }

    pub fn exponential() -> Self {
        Self::Exponential {
            multiplier: 2.0,
            max_delay: Duration::from_secs(3600),
        }
    }

    pub fn exponential_with_jitter() -> Self {
        Self::ExponentialWithJitter {
            multiplier: 2.0,
            max_delay: Duration::from_secs(3600),
            jitter_factor: 0.2,
        }
    }
}

fn exponential(base: Duration, multiplier: f64, n: u32, max_delay: Duration) -> Duration {
    let secs = base.as_secs_f64() * multiplier.max(1.0).powi(n.min(i32::MAX as u32) as i32);
    if !secs.is_finite() || secs >= max_delay.as_secs_f64() {
        max_delay
    } else {
        Duration::from_secs_f64(secs)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Retry Policy
// ═══════════════════════════════════════════════════════════════════════════════

/// What happens to a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-queue as retry number `retry`, eligible at `at`
    RetryAt { retry: u32, at: DateTime<Utc> },
    GiveUp,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(flatten)]
    pub backoff: BackoffStrategy,
}

impl RetryPolicy {
    pub fn new(backoff: BackoffStrategy) -> Self {
        Self { backoff }
    }

    /// Decide whether `job` gets another attempt. Fatal failures never do.
    pub fn decide(&self, job: &Job, fatal: bool, now: DateTime<Utc>) -> RetryDecision {
        if fatal || !job.has_retries_left() {
            return RetryDecision::GiveUp;
        }
        let retry = job.retries + 1;
        let delay = self.backoff.delay_for(job.retry_delay, retry);
        let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(36_500));
        RetryDecision::RetryAt {
            retry,
            at: now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::NewJob;

    const BASE: Duration = Duration::from_secs(10);

    #[test]
    fn test_fixed_backoff() {
        let backoff = BackoffStrategy::Fixed;
        assert_eq!(backoff.delay_for(BASE, 1), BASE);
        assert_eq!(backoff.delay_for(BASE, 7), BASE);
    }

    #[test]
    fn test_linear_backoff() {
        let backoff = BackoffStrategy::Linear {
            increment: Duration::from_secs(5),
        };
        assert_eq!(backoff.delay_for(BASE, 1), Duration::from_secs(10));
        assert_eq!(backoff.delay_for(BASE, 3), Duration::from_secs(20));
    }

    #[test]
    fn test_exponential_backoff_capped() {
        let backoff = BackoffStrategy::Exponential {
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
        };
        assert_eq!(backoff.delay_for(BASE, 1), Duration::from_secs(10));
        assert_eq!(backoff.delay_for(BASE, 2), Duration::from_secs(20));
        assert_eq!(backoff.delay_for(BASE, 3), Duration::from_secs(40));
        assert_eq!(backoff.delay_for(BASE, 4), Duration::from_secs(60));
        assert_eq!(backoff.delay_for(BASE, 50), Duration::from_secs(60));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let backoff = BackoffStrategy::exponential_with_jitter();
        for _ in 0..50 {
            let d = backoff.delay_for(BASE, 2).as_secs_f64();
            assert!((16.0..=24.0).contains(&d), "delay {} out of range", d);
        }
    }

    #[test]
    fn test_policy_decisions() {
        let now = Utc::now();
        let policy = RetryPolicy::default();
        let mut job = NewJob::new("t")
            .max_retries(2)
            .retry_delay(Duration::from_secs(30))
            .into_job(now);

        match policy.decide(&job, false, now) {
            RetryDecision::RetryAt { retry, at } => {
                assert_eq!(retry, 1);
                assert_eq!(at, now + chrono::Duration::seconds(30));
            }
            RetryDecision::GiveUp => panic!("expected a retry"),
        }

        assert_eq!(policy.decide(&job, true, now), RetryDecision::GiveUp);

        job.retries = 2;
        assert_eq!(policy.decide(&job, false, now), RetryDecision::GiveUp);
    }

    #[test]
    fn test_zero_max_retries_never_retries() {
        let now = Utc::now();
        let job = NewJob::new("t").max_retries(0).into_job(now);
        assert_eq!(RetryPolicy::default().decide(&job, false, now), RetryDecision::GiveUp);
    }

    #[test]
    fn test_backoff_deserializes_from_tagged_form() {
        let backoff: BackoffStrategy = serde_json::from_str(
            r#"{"strategy":"exponential","multiplier":3.0,"max_delay":"5m"}"#,
        )
        .unwrap();
        assert_eq!(
            backoff,
            BackoffStrategy::Exponential {
                multiplier: 3.0,
                max_delay: Duration::from_secs(300),
            }
        );
    }
}
