use crate::error::{RagError, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(250);
const MAX_RETRIES: u32 = 1;

/// Deadline and retry budget for one external call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallPolicy {
    timeout: Duration,
    retry_backoff: Duration,
    max_retries: u32,
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_CALL_TIMEOUT,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            max_retries: MAX_RETRIES,
        }
    }
}

impl CallPolicy {
    /// `max_retries` is clamped to one.
    pub fn new(timeout: Duration, retry_backoff: Duration, max_retries: u32) -> Self {
        Self {
            timeout,
            retry_backoff,
            max_retries: max_retries.min(MAX_RETRIES),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Runs `call` under the per-attempt timeout. A transient failure is
    /// retried after the backoff while the retry budget lasts; anything else
    /// surfaces as is.
    pub async fn run<T, F, Fut>(&self, operation: &'static str, call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run_until(operation, None, call).await
    }

    /// Like [`CallPolicy::run`], but no attempt outlives `deadline`, and a
    /// retry whose backoff would end past it is not started.
    pub async fn run_until<T, F, Fut>(
        &self,
        operation: &'static str,
        deadline: Option<Instant>,
        mut call: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            let attempt_deadline = match deadline {
                Some(deadline) => deadline.min(Instant::now() + self.timeout),
                None => Instant::now() + self.timeout,
            };
            let outcome = match tokio::time::timeout_at(attempt_deadline, call()).await {
                Ok(result) => result,
                Err(_) => Err(RagError::Timeout {
                    operation,
                    after: started.elapsed(),
                }),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(error) if error.is_transient() && attempt < self.max_retries => {
                    let backoff = self.retry_backoff * (attempt + 1);
                    if deadline.is_some_and(|deadline| Instant::now() + backoff >= deadline) {
                        return Err(error);
                    }
                    attempt += 1;
                    warn!(operation, attempt, error = %error, "retrying external call");
                    tokio::time::sleep(backoff).await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn transient_failure_is_retried_once() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = CallPolicy::default();

        let value = policy
            .run("embed", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(RagError::EmbeddingUnavailable("flaky".to_string()))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn second_failure_surfaces() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = CallPolicy::new(Duration::from_secs(1), Duration::from_millis(10), 5);
        assert_eq!(policy.max_retries(), 1);

        let error = policy
            .run("generate", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(RagError::GenerationFailed("503".to_string()))
            })
            .await
            .unwrap_err();

        assert!(matches!(error, RagError::GenerationFailed(_)));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_call_times_out() {
        let policy = CallPolicy::new(Duration::from_millis(100), Duration::from_millis(10), 1);

        let error = policy
            .run("embed", || async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            })
            .await
            .unwrap_err();

        match error {
            RagError::Timeout { operation, after } => {
                assert_eq!(operation, "embed");
                // two 100ms attempts around a 10ms backoff
                assert_eq!(after, Duration::from_millis(210));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let error = CallPolicy::default()
            .run("embed", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(RagError::DimensionMismatch {
                    expected: 3,
                    actual: 4,
                })
            })
            .await
            .unwrap_err();

        assert!(matches!(error, RagError::DimensionMismatch { .. }));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_caps_every_attempt_and_skips_late_retries() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = CallPolicy::new(Duration::from_secs(30), Duration::from_millis(10), 1);
        let start = Instant::now();

        let error = policy
            .run_until("generate", Some(start + Duration::from_millis(50)), move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            })
            .await
            .unwrap_err();

        assert_eq!(start.elapsed(), Duration::from_millis(50));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        match error {
            RagError::Timeout { after, .. } => assert_eq!(after, Duration::from_millis(50)),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_fits_inside_a_generous_deadline() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = CallPolicy::new(Duration::from_secs(1), Duration::from_millis(10), 1);

        let value = policy
            .run_until(
                "embed",
                Some(Instant::now() + Duration::from_secs(5)),
                move || async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(RagError::EmbeddingUnavailable("flaky".to_string()))
                    } else {
                        Ok(3)
                    }
                },
            )
            .await
            .unwrap();

        assert_eq!(value, 3);
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
