//! Exponential backoff for broker reconnection.
//!
//! Attempts are numbered from 1. The delay before attempt `n` is
//! `min(initial_delay * 2^(n-1), max_delay)`:
//!
//! ```text
//! attempt:  1    2    3    4    5    6    7     ...
//! delay:    1s   2s   4s   8s   16s  32s  60s   (initial 1s, cap 60s)
//! ```
//!
//! # Example
//!
//! ```rust
//! use certgate_runtime::retry::{BackoffPolicy, retry_with_backoff};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), String> {
//! let policy = BackoffPolicy::builder()
//!     .max_retries(5)
//!     .initial_delay(Duration::from_millis(100))
//!     .max_delay(Duration::from_secs(10))
//!     .build();
//!
//! assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
//!
//! let result = retry_with_backoff(&policy, || async {
//!     Ok::<_, String>(42)
//! }).await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;
use tokio::time::sleep;

/// Backoff policy configuration.
///
/// # Default Values
///
/// - `max_retries`: 20
/// - `initial_delay`: 1 second
/// - `max_delay`: 60 seconds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Attempts after which the connection manager escalates to a fatal log
    /// (and `retry_with_backoff` gives up).
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries (cap for exponential backoff)
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 20,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> BackoffPolicyBuilder {
        BackoffPolicyBuilder {
            max_retries: None,
            initial_delay: None,
            max_delay: None,
        }
    }

    /// Calculate the delay before a given attempt (1-based).
    ///
    /// Attempt `0` is treated as attempt `1`. Overflow saturates at `max_delay`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = 1_u32.checked_shl(exponent).unwrap_or(u32::MAX);

        self.initial_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Builder for [`BackoffPolicy`].
#[derive(Debug, Clone)]
pub struct BackoffPolicyBuilder {
    max_retries: Option<u32>,
    initial_delay: Option<Duration>,
    max_delay: Option<Duration>,
}

impl BackoffPolicyBuilder {
    /// Set maximum number of retries.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Set initial delay before first retry.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = Some(delay);
        self
    }

    /// Set maximum delay (cap for exponential backoff).
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Build the [`BackoffPolicy`].
    #[must_use]
    pub fn build(self) -> BackoffPolicy {
        let defaults = BackoffPolicy::default();
        BackoffPolicy {
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            initial_delay: self.initial_delay.unwrap_or(defaults.initial_delay),
            max_delay: self.max_delay.unwrap_or(defaults.max_delay),
        }
    }
}

/// Retry an async operation with exponential backoff.
///
/// Runs `operation` once, then up to `policy.max_retries` more times, sleeping
/// `delay_for_attempt(n)` before retry `n`.
///
/// # Errors
///
/// Returns the last error once all retries are exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(policy: &BackoffPolicy, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            },
            Err(err) => {
                if attempt >= policy.max_retries {
                    tracing::error!(
                        attempt,
                        error = %err,
                        "Operation failed after max retries"
                    );
                    return Err(err);
                }

                attempt += 1;
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    attempt,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis(),
                    error = %err,
                    "Operation failed, retrying..."
                );

                sleep(delay).await;
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_delay_doubles_from_initial() {
        let policy = BackoffPolicy::builder()
            .initial_delay(Duration::from_millis(1000))
            .max_delay(Duration::from_secs(60))
            .build();

        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(6), Duration::from_secs(32));
        assert_eq!(policy.delay_for_attempt(7), Duration::from_secs(60));
    }

    #[test]
    fn test_attempt_zero_uses_initial_delay() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), policy.initial_delay);
    }

    #[test]
    fn test_huge_attempt_saturates_at_cap() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(60));
    }

    proptest! {
        #[test]
        fn delay_matches_formula(initial_ms in 1_u64..5_000, cap_ms in 1_u64..600_000, attempt in 1_u32..30) {
            let policy = BackoffPolicy::builder()
                .initial_delay(Duration::from_millis(initial_ms))
                .max_delay(Duration::from_millis(cap_ms))
                .build();

            let expected = initial_ms.saturating_mul(1_u64 << (attempt - 1)).min(cap_ms);
            prop_assert_eq!(policy.delay_for_attempt(attempt), Duration::from_millis(expected));
        }

        #[test]
        fn delay_never_decreases(attempt in 1_u32..64) {
            let policy = BackoffPolicy::default();
            prop_assert!(policy.delay_for_attempt(attempt + 1) >= policy.delay_for_attempt(attempt));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_failures() {
        let policy = BackoffPolicy::builder()
            .max_retries(3)
            .initial_delay(Duration::from_millis(10))
            .build();

        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);

        let result = retry_with_backoff(&policy, || {
            let c = Arc::clone(&counter_clone);
            async move {
                let attempt = c.fetch_add(1, Ordering::SeqCst);
                if attempt < 2 {
                    Err(format!("Attempt {attempt} failed"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(counter.load(Ordering::SeqCst), 3); // 2 failures + 1 success
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausts_retries() {
        let policy = BackoffPolicy::builder()
            .max_retries(2)
            .initial_delay(Duration::from_millis(10))
            .build();

        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = Arc::clone(&counter);

        let result = retry_with_backoff(&policy, || {
            let c = Arc::clone(&counter_clone);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>("Persistent failure")
            }
        })
        .await;

        assert_eq!(result, Err("Persistent failure"));
        assert_eq!(counter.load(Ordering::SeqCst), 3); // Initial + 2 retries
    }
}
