//! Bounded retry with a fixed interval
//!
//! Hardware settle times are fixed, so there is no backoff growth: every
//! attempt after the first waits exactly `interval`.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::error::WorkerError;

/// Retry policy for an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (values below 1 are treated as 1)
    pub max_attempts: u32,
    /// Suspension between two attempts
    pub interval: Duration,
    /// Surface the final attempt's error instead of [`RetryError::Exhausted`]
    pub propagate_last_error: bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
            propagate_last_error: false,
        }
    }

    pub fn propagate_last_error(mut self, propagate: bool) -> Self {
        self.propagate_last_error = propagate;
        self
    }

    /// Policy for loading images onto the control board (10 x 1s)
    pub fn firmware() -> Self {
        Self::new(10, Duration::from_millis(1000)).propagate_last_error(true)
    }

    /// Policy for waiting on a storage device node after a mux switch (5 x 5s)
    pub fn device_resolution() -> Self {
        Self::new(5, Duration::from_millis(5000)).propagate_last_error(true)
    }
}

/// Failure of a retried operation
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Final attempt's error, surfaced as-is (`propagate_last_error`)
    #[error("{0}")]
    Cause(E),

    /// Generic exhaustion wrapping the final attempt's error
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    /// The error of the last attempt
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Cause(e) => e,
            RetryError::Exhausted { last, .. } => last,
        }
    }
}

impl From<RetryError<WorkerError>> for WorkerError {
    fn from(err: RetryError<WorkerError>) -> Self {
        match err {
            RetryError::Cause(e) => e,
            RetryError::Exhausted { attempts, last } => WorkerError::RetryExhausted {
                attempts,
                last: Box::new(last),
            },
        }
    }
}

/// Run `operation` until it succeeds or `policy.max_attempts` is reached.
///
/// The operation receives the 1-based attempt number. Between attempts the
/// calling task sleeps for `policy.interval`, which only suspends this task.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if attempt >= max_attempts => {
                warn!(attempts = attempt, error = %e, "Giving up");
                return Err(if policy.propagate_last_error {
                    RetryError::Cause(e)
                } else {
                    RetryError::Exhausted {
                        attempts: attempt,
                        last: e,
                    }
                });
            }
            Err(e) => {
                debug!(
                    attempt,
                    max_attempts,
                    interval_ms = policy.interval.as_millis() as u64,
                    error = %e,
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(policy.interval).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    async fn fail_times(calls: &AtomicU32, failures: u32) -> Result<u32, String> {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= failures {
            Err(format!("failure {}", n))
        } else {
            Ok(n)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_k_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, Duration::from_millis(1000));

        let result = retry(&policy, |_| fail_times(&calls, 3)).await;

        assert_eq!(result.unwrap(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::from_millis(1000));
        let started = Instant::now();

        let result = retry(&policy, |_| fail_times(&calls, 10)).await;

        match result {
            Err(RetryError::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last, "failure 3");
            }
            other => panic!("Expected Exhausted, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_attempts_equal_to_failures_gives_up() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(2, Duration::from_millis(500));

        let result = retry(&policy, |_| fail_times(&calls, 2)).await;

        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 2, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_propagate_last_error_surfaces_cause() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(2, Duration::from_millis(10)).propagate_last_error(true);

        let counter = &calls;
        let err = retry(&policy, move |_| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(WorkerError::Flash("device misbehaved".to_string()))
        })
        .await
        .unwrap_err();

        let err: WorkerError = err.into();
        assert!(matches!(err, WorkerError::Flash(ref m) if m == "device misbehaved"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_converts_to_retry_exhausted() {
        let policy = RetryPolicy::new(2, Duration::from_millis(10));

        let err: WorkerError = retry(&policy, |_| async {
            Err::<(), _>(WorkerError::Setup("board silent".to_string()))
        })
        .await
        .unwrap_err()
        .into();

        match err {
            WorkerError::RetryExhausted { attempts, last } => {
                assert_eq!(attempts, 2);
                assert!(matches!(*last, WorkerError::Setup(_)));
            }
            other => panic!("Expected RetryExhausted, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_numbers_are_passed_through() {
        let seen = std::sync::Mutex::new(Vec::new());
        let policy = RetryPolicy::new(3, Duration::from_millis(1));

        let _ = retry(&policy, |attempt| {
            seen.lock().unwrap().push(attempt);
            async move { Err::<(), _>("nope") }
        })
        .await;

        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_builtin_policies() {
        let firmware = RetryPolicy::firmware();
        assert_eq!(firmware.max_attempts, 10);
        assert_eq!(firmware.interval, Duration::from_millis(1000));
        assert!(firmware.propagate_last_error);

        let device = RetryPolicy::device_resolution();
        assert_eq!(device.max_attempts, 5);
        assert_eq!(device.interval, Duration::from_millis(5000));
        assert!(device.propagate_last_error);
    }
}
