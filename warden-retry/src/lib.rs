//! Bounded retry and backoff logic for Warden
//!
//! Lifecycle transitions serialize on a per-artifact lock. When the lock is
//! held by another transition the caller retries here, with exponential
//! backoff and a hard cap on attempts, before surfacing the contention.

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use std::fmt::Display;
use std::time::Duration;
use tracing::{debug, warn};

/// Trait for categorizing errors as transient or permanent
pub trait RetryableError {
    /// Returns true if the error is transient and the operation should be retried
    fn is_transient(&self) -> bool;

    /// Returns true if the error is permanent and retries should stop
    fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

/// Retry policy: an exponential backoff schedule capped by an attempt count
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one
    pub max_attempts: usize,
    /// Delay schedule between attempts
    pub backoff: ExponentialBackoff,
}

impl RetryPolicy {
    /// Create a policy with the given attempt cap and backoff schedule
    pub fn new(max_attempts: usize, backoff: ExponentialBackoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// Policy that never retries
    pub fn no_retry() -> Self {
        Self::new(1, lock_contention_backoff_policy())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, lock_contention_backoff_policy())
    }
}

/// Backoff policy for per-identity lock contention (short, local waits)
pub fn lock_contention_backoff_policy() -> ExponentialBackoff {
    backoff_policy(Duration::from_millis(25), Duration::from_millis(500))
}

/// Build an exponential backoff with the given bounds
pub fn backoff_policy(initial: Duration, max: Duration) -> ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_initial_interval(initial)
        .with_max_interval(max)
        .with_max_elapsed_time(Some(max * 20))
        .with_multiplier(2.0)
        .build()
}

/// Execute an operation, retrying transient failures according to `policy`
///
/// The closure receives the 1-based attempt number. Permanent errors are
/// returned immediately. When attempts (or the backoff's elapsed-time budget)
/// run out, the last transient error is returned unchanged so the caller keeps
/// its own error type.
pub fn retry_with_policy<T, E, F>(op_name: &str, policy: &RetryPolicy, mut f: F) -> Result<T, E>
where
    E: RetryableError + Display,
    F: FnMut(usize) -> Result<T, E>,
{
    let mut schedule = policy.backoff.clone();
    schedule.reset();
    let mut attempt = 1;

    loop {
        debug!("Attempting operation '{}' (attempt {})", op_name, attempt);

        match f(attempt) {
            Ok(value) => {
                if attempt > 1 {
                    debug!(
                        "Operation '{}' succeeded after {} attempts",
                        op_name, attempt
                    );
                }
                return Ok(value);
            }
            Err(err) if err.is_permanent() => {
                debug!(
                    "Operation '{}' failed permanently on attempt {}: {}",
                    op_name, attempt, err
                );
                return Err(err);
            }
            Err(err) => {
                if attempt >= policy.max_attempts {
                    warn!(
                        "Operation '{}' gave up after {} attempts: {}",
                        op_name, attempt, err
                    );
                    return Err(err);
                }

                let Some(delay) = schedule.next_backoff() else {
                    warn!(
                        "Operation '{}' exhausted its backoff budget on attempt {}: {}",
                        op_name, attempt, err
                    );
                    return Err(err);
                };

                debug!(
                    "Operation '{}' failed on attempt {} ({}), retrying in {:?}",
                    op_name, attempt, err, delay
                );
                std::thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[derive(Debug, PartialEq)]
    enum TestError {
        Busy,
        Broken,
    }

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                TestError::Busy => write!(f, "busy"),
                TestError::Broken => write!(f, "broken"),
            }
        }
    }

    impl RetryableError for TestError {
        fn is_transient(&self) -> bool {
            matches!(self, TestError::Busy)
        }
    }

    fn fast_policy(max_attempts: usize) -> RetryPolicy {
        RetryPolicy::new(
            max_attempts,
            backoff_policy(Duration::from_millis(1), Duration::from_millis(2)),
        )
    }

    #[test]
    fn test_successful_operation() {
        let result: Result<&str, TestError> =
            retry_with_policy("test_op", &fast_policy(3), |_attempt| Ok("success"));
        assert_eq!(result.unwrap(), "success");
    }

    #[test]
    fn test_transient_failure_then_success() {
        let calls = Cell::new(0);
        let result = retry_with_policy("test_op", &fast_policy(5), |attempt| {
            calls.set(calls.get() + 1);
            if attempt < 3 {
                Err(TestError::Busy)
            } else {
                Ok(attempt)
            }
        });

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_permanent_failure_is_not_retried() {
        let calls = Cell::new(0);
        let result: Result<(), TestError> = retry_with_policy("test_op", &fast_policy(5), |_| {
            calls.set(calls.get() + 1);
            Err(TestError::Broken)
        });

        assert_eq!(result.unwrap_err(), TestError::Broken);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_attempt_cap_returns_last_error() {
        let calls = Cell::new(0);
        let result: Result<(), TestError> = retry_with_policy("test_op", &fast_policy(4), |_| {
            calls.set(calls.get() + 1);
            Err(TestError::Busy)
        });

        assert_eq!(result.unwrap_err(), TestError::Busy);
        assert_eq!(calls.get(), 4);
    }

    #[test]
    fn test_no_retry_policy_makes_single_attempt() {
        let calls = Cell::new(0);
        let _: Result<(), TestError> = retry_with_policy("test_op", &RetryPolicy::no_retry(), |_| {
            calls.set(calls.get() + 1);
            Err(TestError::Busy)
        });
        assert_eq!(calls.get(), 1);
    }
}
