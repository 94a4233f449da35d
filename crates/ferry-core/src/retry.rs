//! Bounded exponential backoff for transient failures.
//!
//! Used at the source-connection boundary: acquiring a connection and running
//! a query. Reconcile statements are never retried through this module.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Always at least 1.
    pub max_attempts: usize,
    /// Delay before the second attempt.
    pub initial_backoff: Duration,
    /// Ceiling for any single delay.
    pub max_backoff: Duration,
    /// Backoff multiplier between attempts.
    pub multiplier: f64,
    /// Jitter factor (0.0-1.0); each delay is randomized by up to this fraction.
    pub jitter: f64,
}

impl RetryPolicy {
    /// Doubling backoff with 10% jitter, capped at one minute.
    #[must_use]
    pub fn exponential(max_attempts: usize, initial_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff,
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }

    /// A single attempt with no retries.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    /// Delay to wait after `attempt` (1-based) failed, before the next one.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn delay_after(&self, attempt: usize) -> Duration {
        if attempt == 0 || self.initial_backoff.is_zero() {
            return Duration::ZERO;
        }

        let exponent = (attempt as i32).saturating_sub(1);
        let base = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        let clamped = base.min(self.max_backoff.as_secs_f64());

        let spread = clamped * self.jitter;
        let offset = if spread > 0.0 {
            rand::rng().random_range(-spread..=spread)
        } else {
            0.0
        };

        Duration::from_secs_f64((clamped + offset).max(0.0))
    }

    /// Whether another attempt is allowed after `attempt` (1-based) failed.
    #[must_use]
    pub fn should_retry(&self, attempt: usize) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryConfig::default().policy()
    }
}

/// YAML form of a [`RetryPolicy`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> usize {
    3
}

fn default_initial_backoff_ms() -> u64 {
    2_000
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            ..RetryPolicy::exponential(
                self.max_attempts,
                Duration::from_millis(self.initial_backoff_ms),
            )
        }
    }
}

/// Run `op` until it succeeds, `is_retryable` rejects the error, or attempts
/// run out. `on_retry` sees the failed attempt number and error before each wait.
pub async fn with_retry<T, E, F, Fut, R, H>(
    policy: &RetryPolicy,
    mut op: F,
    is_retryable: R,
    mut on_retry: H,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    H: FnMut(usize, &E),
{
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !is_retryable(&e) || !policy.should_retry(attempt) => return Err(e),
            Err(e) => {
                on_retry(attempt, &e);
                let delay = policy.delay_after(attempt);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast(max_attempts: usize) -> RetryPolicy {
        RetryPolicy {
            jitter: 0.0,
            ..RetryPolicy::exponential(max_attempts, Duration::from_millis(1))
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy {
            jitter: 0.0,
            max_backoff: Duration::from_secs(5),
            ..RetryPolicy::exponential(10, Duration::from_secs(2))
        };
        assert_eq!(policy.delay_after(1), Duration::from_secs(2));
        assert_eq!(policy.delay_after(2), Duration::from_secs(4));
        assert_eq!(policy.delay_after(3), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::exponential(3, Duration::from_secs(1));
        for _ in 0..100 {
            let delay = policy.delay_after(1);
            assert!(delay >= Duration::from_millis(900) && delay <= Duration::from_millis(1100));
        }
    }

    #[test]
    fn test_config_defaults() {
        let config: RetryConfig = serde_yaml::from_str("{}").unwrap();
        let policy = config.policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_backoff, Duration::from_secs(2));
        assert_eq!(policy.max_backoff, Duration::from_secs(60));
    }

    #[test]
    fn test_zero_attempts_means_one() {
        assert_eq!(RetryPolicy::exponential(0, Duration::ZERO).max_attempts, 1);
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let calls = AtomicUsize::new(0);
        let mut retried = Vec::new();

        let result: Result<&str, &str> = with_retry(
            &fast(3),
            || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("busy")
                } else {
                    Ok("done")
                }
            },
            |_| true,
            |attempt, _| retried.push(attempt),
        )
        .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(retried, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), &str> = with_retry(
            &fast(3),
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("down")
            },
            |_| true,
            |_, _| {},
        )
        .await;

        assert_eq!(result, Err("down"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), &str> = with_retry(
            &fast(5),
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("syntax error")
            },
            |e| *e != "syntax error",
            |_, _| {},
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
