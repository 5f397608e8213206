//! FIFO throttle for upstream calls.
//!
//! Every call to the stats provider goes through one process-wide limiter so
//! concurrent sessions cannot exceed the provider's per-second allowance.
//! Admissions drain in arrival order; a fair async mutex is the queue.

use std::{future::Future, time::Duration};

use tokio::{
    sync::Mutex,
    time::{Instant, sleep, sleep_until},
};
use tracing::debug;

use crate::config::LimiterConfig;

/// Classification hook letting the limiter recognize rate-limit failures
/// without knowing the caller's error type.
pub trait Throttled {
    /// Whether this error means the upstream rejected the call for pacing.
    fn is_rate_limited(&self) -> bool;
    /// Server-requested wait before trying again, when one was given.
    fn retry_after(&self) -> Option<Duration>;
}

/// Process-wide FIFO call throttle.
pub struct RateLimiter {
    last_admission: Mutex<Option<Instant>>,
    spacing: Duration,
    default_retry_after: Duration,
}

impl RateLimiter {
    /// Limiter admitting at most `config.max_calls_per_second` calls per
    /// second, evenly spaced.
    pub fn new(config: &LimiterConfig) -> Self {
        let per_second = config.max_calls_per_second.max(1);
        Self {
            last_admission: Mutex::new(None),
            spacing: Duration::from_millis(1_000 / u64::from(per_second)),
            default_retry_after: Duration::from_secs(1),
        }
    }

    /// Run `work` once the next admission slot is free.
    ///
    /// If `work` fails with a rate-limited error the limiter waits out the
    /// server's `retry-after` (or one second when absent) and retries exactly
    /// once; the second outcome is returned as-is, success or failure.
    /// Queued callers behind this one wait until the retry resolves, so the
    /// queue keeps draining one call at a time.
    pub async fn execute<T, E, F, Fut>(&self, mut work: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Throttled,
    {
        let mut last = self.last_admission.lock().await;
        if let Some(previous) = *last {
            sleep_until(previous + self.spacing).await;
        }
        *last = Some(Instant::now());

        match work().await {
            Err(error) if error.is_rate_limited() => {
                let wait = error.retry_after().unwrap_or(self.default_retry_after);
                debug!(wait_ms = wait.as_millis() as u64, "upstream throttled the call; retrying once");
                sleep(wait).await;
                *last = Some(Instant::now());
                work().await
            }
            outcome => outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    #[derive(Debug)]
    struct TestError {
        rate_limited: bool,
        retry_after: Option<Duration>,
    }

    impl Throttled for TestError {
        fn is_rate_limited(&self) -> bool {
            self.rate_limited
        }
        fn retry_after(&self) -> Option<Duration> {
            self.retry_after
        }
    }

    fn limiter(cps: u32) -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(&LimiterConfig {
            max_calls_per_second: cps,
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn admissions_are_spaced_and_ordered() {
        let limiter = limiter(2);
        let admissions: Arc<Mutex<Vec<(usize, Instant)>>> = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for index in 0..3usize {
            let limiter = limiter.clone();
            let admissions = admissions.clone();
            handles.push(tokio::spawn(async move {
                limiter
                    .execute(|| {
                        let admissions = admissions.clone();
                        async move {
                            admissions.lock().await.push((index, Instant::now()));
                            Ok::<_, TestError>(())
                        }
                    })
                    .await
                    .unwrap();
            }));
            // Let the task reach the queue before spawning the next one.
            tokio::task::yield_now().await;
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let admissions = admissions.lock().await;
        let start = admissions[0].1;
        let order: Vec<usize> = admissions.iter().map(|(index, _)| *index).collect();
        assert_eq!(order, vec![0, 1, 2]);
        assert_eq!(admissions[0].1 - start, Duration::ZERO);
        assert_eq!(admissions[1].1 - start, Duration::from_millis(500));
        assert_eq!(admissions[2].1 - start, Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_call_is_retried_exactly_once() {
        let limiter = limiter(10);
        let calls = Arc::new(AtomicUsize::new(0));

        let result = limiter
            .execute(|| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(TestError {
                            rate_limited: true,
                            retry_after: Some(Duration::from_millis(250)),
                        })
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn second_rate_limit_failure_is_surfaced() {
        let limiter = limiter(10);
        let calls = Arc::new(AtomicUsize::new(0));

        let result: Result<(), TestError> = limiter
            .execute(|| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(TestError {
                        rate_limited: true,
                        retry_after: None,
                    })
                }
            })
            .await;

        let error = result.unwrap_err();
        assert!(error.is_rate_limited());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn non_rate_limit_errors_pass_through_untouched() {
        let limiter = limiter(10);
        let calls = Arc::new(AtomicUsize::new(0));

        let result: Result<(), TestError> = limiter
            .execute(|| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(TestError {
                        rate_limited: false,
                        retry_after: None,
                    })
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
