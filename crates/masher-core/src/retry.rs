//! Bounded retry with exponential backoff and per-attempt timeouts.
//!
//! Every external call the pipeline makes goes through [`retry_with_backoff`]
//! or [`RetryPolicy`]'s delay schedule; there is no unbounded loop.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Retry schedule for one kind of external call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first (values below 1 are treated as 1).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the second attempt; doubled for each later attempt.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound for a single backoff delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Wall-clock limit for a single attempt (0 = no limit).
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_timeout_ms() -> u64 {
    60_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            ..Self::default()
        }
    }

    /// Single attempt, no delay.
    pub fn once() -> Self {
        Self::new(1, 0)
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = max_delay_ms;
        self
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Backoff to wait after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let ms = self
            .base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }
}

/// Errors that know whether another attempt could succeed.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// Value produced by a successful retried call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
}

/// Why a retried call gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryFailure<E> {
    /// The call reported a non-transient error.
    Fatal { error: E, attempts: u32 },
    /// Every attempt failed transiently; carries the last error.
    Exhausted { error: E, attempts: u32 },
    /// The last attempt exceeded the per-attempt timeout.
    TimedOut { attempts: u32, timeout_ms: u64 },
}

impl<E> RetryFailure<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryFailure::Fatal { attempts, .. }
            | RetryFailure::Exhausted { attempts, .. }
            | RetryFailure::TimedOut { attempts, .. } => *attempts,
        }
    }
}

impl<E: Display> Display for RetryFailure<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryFailure::Fatal { error, .. } => write!(f, "{error}"),
            RetryFailure::Exhausted { error, attempts } => {
                write!(f, "{error} (gave up after {attempts} attempt(s))")
            }
            RetryFailure::TimedOut {
                attempts,
                timeout_ms,
            } => write!(
                f,
                "timed out after {timeout_ms}ms (gave up after {attempts} attempt(s))"
            ),
        }
    }
}

/// Run `op` until it succeeds, fails fatally, or the policy is exhausted.
///
/// `op` receives the 1-based attempt number. Timeouts count as transient.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
) -> Result<Retried<T>, RetryFailure<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Transient + Display,
{
    let max_attempts = policy.attempts();
    let mut attempt = 1;
    loop {
        let outcome = match policy.timeout() {
            Some(limit) => tokio::time::timeout(limit, op(attempt)).await.ok(),
            None => Some(op(attempt).await),
        };

        let failure = match outcome {
            Some(Ok(value)) => {
                return Ok(Retried {
                    value,
                    attempts: attempt,
                })
            }
            Some(Err(error)) if !error.is_transient() => {
                return Err(RetryFailure::Fatal {
                    error,
                    attempts: attempt,
                })
            }
            Some(Err(error)) => {
                warn!(call = %label, attempt, error = %error, "transient failure");
                RetryFailure::Exhausted {
                    error,
                    attempts: attempt,
                }
            }
            None => {
                warn!(call = %label, attempt, timeout_ms = policy.timeout_ms, "attempt timed out");
                RetryFailure::TimedOut {
                    attempts: attempt,
                    timeout_ms: policy.timeout_ms,
                }
            }
        };

        if attempt >= max_attempts {
            return Err(failure);
        }
        tokio::time::sleep(policy.delay_after(attempt)).await;
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct TestError {
        transient: bool,
    }

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "test error (transient={})", self.transient)
        }
    }

    impl Transient for TestError {
        fn is_transient(&self) -> bool {
            self.transient
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy::new(5, 100).with_max_delay_ms(350);
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(350));
        assert_eq!(policy.delay_after(40), Duration::from_millis(350));
    }

    #[test]
    fn test_zero_attempts_means_one() {
        let policy = RetryPolicy::new(0, 10);
        assert_eq!(policy.attempts(), 1);
        assert!(RetryPolicy::once().with_timeout_ms(0).timeout().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, 10);
        let result = retry_with_backoff(&policy, "test", |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err(TestError { transient: true })
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result.value, 3);
        assert_eq!(result.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_stops_immediately() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, 10);
        let err = retry_with_backoff(&policy, "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(TestError { transient: false }) }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, RetryFailure::Fatal { attempts: 1, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_is_bounded() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(4, 10);
        let err = retry_with_backoff(&policy, "test", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(TestError { transient: true }) }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, RetryFailure::Exhausted { attempts: 4, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_attempt() {
        let policy = RetryPolicy::new(2, 10).with_timeout_ms(50);
        let err = retry_with_backoff(&policy, "slow", |_| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<(), TestError>(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, RetryFailure::TimedOut { attempts: 2, .. }));
    }
}
