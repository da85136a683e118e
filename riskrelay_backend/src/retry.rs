use std::future::Future;
use std::time::Duration;

use crate::error::AgentApiError;
use crate::shutdown::ShutdownSignal;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(800);

/// Attempt budget with linear backoff: the wait after attempt `n` is `n * delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Saturates instead of overflowing on absurd delays.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.delay.checked_mul(attempt).unwrap_or(Duration::MAX)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// budget is spent. The shutdown signal is checked before every attempt and
    /// interrupts the backoff wait.
    pub async fn run<T, F, Fut>(
        &self,
        label: &str,
        shutdown: &ShutdownSignal,
        mut op: F,
    ) -> Result<T, AgentApiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AgentApiError>>,
    {
        let mut attempt = 1;
        loop {
            if shutdown.is_cancelled() {
                return Err(AgentApiError::Cancelled);
            }

            match op().await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_retryable() && attempt < self.max_attempts => {
                    let wait = self.backoff_for(attempt);
                    tracing::warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        label,
                        attempt,
                        self.max_attempts,
                        error,
                        wait
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = shutdown.cancelled() => return Err(AgentApiError::Cancelled),
                    }
                    attempt += 1;
                }
                Err(error) => {
                    if error.is_retryable() {
                        tracing::error!(
                            "{} failed after {} attempt(s): {}",
                            label,
                            attempt,
                            error
                        );
                    }
                    return Err(error);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::shutdown_pair;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn rate_limited() -> AgentApiError {
        AgentApiError::Http {
            status: 429,
            body: String::new(),
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1))
    }

    #[test]
    fn backoff_is_linear() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        assert_eq!(policy.backoff_for(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(200));
    }

    #[test]
    fn backoff_saturates_on_huge_delay() {
        let policy = RetryPolicy::new(3, Duration::from_millis(u64::MAX));
        assert_eq!(policy.backoff_for(2), Duration::MAX);
    }

    #[tokio::test]
    async fn three_rate_limits_exhaust_the_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = fast_policy()
            .run("execute", &ShutdownSignal::never(), || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(rate_limited())
                }
            })
            .await;

        assert!(matches!(result, Err(AgentApiError::Http { status: 429, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = fast_policy()
            .run("execute", &ShutdownSignal::never(), || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(rate_limited())
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.expect("second attempt succeeds"), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_retryable_error_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = fast_policy()
            .run("execute", &ShutdownSignal::never(), || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(AgentApiError::Http {
                        status: 403,
                        body: "forbidden".to_string(),
                    })
                }
            })
            .await;

        assert!(matches!(result, Err(AgentApiError::Http { status: 403, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn teardown_stops_between_attempts() {
        let (handle, signal) = shutdown_pair();
        let policy = RetryPolicy::new(3, Duration::from_secs(30));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let run = policy.run("execute", &signal, || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(rate_limited())
            }
        });
        let trigger = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            handle.trigger();
        };
        let (result, _) = tokio::join!(run, trigger);

        assert!(matches!(result, Err(AgentApiError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_before_first_attempt() {
        let (handle, signal) = shutdown_pair();
        handle.trigger();
        let result: Result<(), _> = fast_policy()
            .run("create", &signal, || async { Ok(()) })
            .await;
        assert!(matches!(result, Err(AgentApiError::Cancelled)));
    }
}
