//! Bounded retry with backoff, modelled as an explicit state machine.
//!
//! Lock acquisition and broker publishing both retry a small, fixed number of
//! times and then fail fast. [`Backoff`] tracks the attempt counter and reaches
//! a terminal [`BackoffStep::Exhausted`] state instead of recursing, which keeps
//! every retry loop trivially cancellable and testable.
//!
//! # Example
//!
//! ```rust
//! use flash_sale_core::retry::{Backoff, BackoffStep, RetryPolicy};
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::builder()
//!     .max_attempts(3)
//!     .initial_delay(Duration::from_millis(50))
//!     .build();
//!
//! let mut backoff = Backoff::new(policy);
//! assert_eq!(backoff.next_step(), BackoffStep::Retry { attempt: 1, delay: Duration::from_millis(50) });
//! assert_eq!(backoff.next_step(), BackoffStep::Retry { attempt: 2, delay: Duration::from_millis(100) });
//! assert_eq!(backoff.next_step(), BackoffStep::Exhausted { attempts: 3 });
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Retry policy configuration.
///
/// # Default Values
///
/// - `max_attempts`: 3 (including the first try)
/// - `initial_delay`: 100ms
/// - `max_delay`: 5 seconds
/// - `multiplier`: 2.0 (delay doubles each retry)
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Cap for the delay between attempts
    pub max_delay: Duration,
    /// Growth factor applied to the delay after every retry
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            max_attempts: None,
            initial_delay: None,
            max_delay: None,
            multiplier: None,
        }
    }

    /// Fixed delay between a bounded number of attempts.
    #[must_use]
    pub const fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
        }
    }

    /// Delay to wait after the `failed`-th failed attempt (1-based).
    ///
    /// `initial_delay * multiplier^(failed - 1)`, capped at `max_delay`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_possible_wrap)]
    pub fn delay_after(&self, failed: u32) -> Duration {
        let exponent = failed.saturating_sub(1).min(63) as i32;
        let delay_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let max_ms = self.max_delay.as_millis() as f64;

        if delay_ms >= max_ms {
            self.max_delay
        } else {
            Duration::from_millis(delay_ms as u64)
        }
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_attempts: Option<u32>,
    initial_delay: Option<Duration>,
    max_delay: Option<Duration>,
    multiplier: Option<f64>,
}

impl RetryPolicyBuilder {
    /// Set the maximum number of attempts (values below 1 are treated as 1).
    #[must_use]
    pub const fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Set the delay before the first retry.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = Some(delay);
        self
    }

    /// Set the delay cap.
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Set the growth factor.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.unwrap_or(3).max(1),
            initial_delay: self.initial_delay.unwrap_or(Duration::from_millis(100)),
            max_delay: self.max_delay.unwrap_or(Duration::from_secs(5)),
            multiplier: self.multiplier.unwrap_or(2.0),
        }
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffStep {
    /// Sleep for `delay`, then make attempt number `attempt + 1`
    Retry {
        /// Number of attempts that have failed so far
        attempt: u32,
        /// How long to wait before the next attempt
        delay: Duration,
    },
    /// The attempt budget is spent
    Exhausted {
        /// Total number of attempts made
        attempts: u32,
    },
}

/// Attempt counter for one retry loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    failed: u32,
}

impl Backoff {
    /// Start a fresh retry loop.
    #[must_use]
    pub const fn new(policy: RetryPolicy) -> Self {
        Self { policy, failed: 0 }
    }

    /// Record a failed attempt and decide what happens next.
    ///
    /// Once [`BackoffStep::Exhausted`] is returned, every later call returns it too.
    pub fn next_step(&mut self) -> BackoffStep {
        self.failed = self.failed.saturating_add(1).min(self.policy.max_attempts);
        if self.failed >= self.policy.max_attempts {
            BackoffStep::Exhausted {
                attempts: self.failed,
            }
        } else {
            BackoffStep::Retry {
                attempt: self.failed,
                delay: self.policy.delay_after(self.failed),
            }
        }
    }

    /// Number of failed attempts recorded so far.
    #[must_use]
    pub const fn failed_attempts(&self) -> u32 {
        self.failed
    }
}

/// Retry an async operation until it succeeds or the policy is exhausted.
///
/// Only errors for which `is_retryable` returns `true` are retried; anything
/// else is returned immediately.
///
/// # Errors
///
/// Returns the last error once the attempt budget is spent, or the first
/// non-retryable error.
pub async fn retry_with_backoff<F, Fut, T, E, P>(
    policy: RetryPolicy,
    mut operation: F,
    is_retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut backoff = Backoff::new(policy);

    loop {
        match operation().await {
            Ok(value) => {
                if backoff.failed_attempts() > 0 {
                    tracing::info!(
                        attempts = backoff.failed_attempts() + 1,
                        "Operation succeeded after retry"
                    );
                }
                return Ok(value);
            }
            Err(err) if !is_retryable(&err) => {
                tracing::warn!(error = %err, "Error is not retryable, failing immediately");
                return Err(err);
            }
            Err(err) => match backoff.next_step() {
                BackoffStep::Retry { attempt, delay } => {
                    tracing::warn!(
                        attempt,
                        delay_ms = delay.as_millis(),
                        error = %err,
                        "Operation failed, retrying"
                    );
                    sleep(delay).await;
                }
                BackoffStep::Exhausted { attempts } => {
                    tracing::error!(attempts, error = %err, "Operation failed after max attempts");
                    return Err(err);
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn exponential_delays_are_capped() {
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_millis(100))
            .multiplier(2.0)
            .max_delay(Duration::from_millis(300))
            .build();

        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(300));
        assert_eq!(policy.delay_after(40), Duration::from_millis(300));
    }

    #[test]
    fn fixed_policy_exhausts_after_budget() {
        let mut backoff = Backoff::new(RetryPolicy::fixed(5, Duration::from_millis(50)));

        for attempt in 1..5 {
            assert_eq!(
                backoff.next_step(),
                BackoffStep::Retry {
                    attempt,
                    delay: Duration::from_millis(50)
                }
            );
        }
        assert_eq!(backoff.next_step(), BackoffStep::Exhausted { attempts: 5 });
        assert_eq!(backoff.next_step(), BackoffStep::Exhausted { attempts: 5 });
    }

    #[test]
    fn single_attempt_policy_never_retries() {
        let mut backoff = Backoff::new(RetryPolicy::builder().max_attempts(0).build());
        assert_eq!(backoff.next_step(), BackoffStep::Exhausted { attempts: 1 });
    }

    #[tokio::test]
    async fn retry_succeeds_after_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result = retry_with_backoff(
            RetryPolicy::fixed(3, Duration::from_millis(1)),
            || {
                let c = Arc::clone(&counter);
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("transient")
                    } else {
                        Ok(42)
                    }
                }
            },
            |_| true,
        )
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_stops_on_non_retryable_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<u32, &str> = retry_with_backoff(
            RetryPolicy::fixed(5, Duration::from_millis(1)),
            || {
                let c = Arc::clone(&counter);
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("permanent")
                }
            },
            |err| err.contains("transient"),
        )
        .await;

        assert_eq!(result, Err("permanent"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
