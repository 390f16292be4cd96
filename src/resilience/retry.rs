//! Retry with exponential backoff and jitter.
//!
//! Delays grow as `initial_delay * backoff_factor^(attempt - 1)`, capped at
//! `max_delay`, with optional uniform jitter of `delay * jitter_factor` in
//! either direction. A `retry_on` predicate can stop retries for errors
//! that will never succeed (bad input, auth failures).

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first call.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Ceiling for any single delay.
    pub max_delay: Duration,
    /// Multiplier applied per attempt.
    pub backoff_factor: f64,
    /// Whether to randomize delays.
    pub jitter: bool,
    /// Jitter spread as a fraction of the delay.
    pub jitter_factor: f64,
    /// Optional timeout around each single attempt.
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter: true,
            jitter_factor: 0.25,
            attempt_timeout: None,
        }
    }
}

impl RetryConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor.max(1.0);
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }
}

/// Result of a retried operation plus how the retries went.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T>,
    /// Attempts actually made, starting at 1.
    pub attempts: u32,
    /// Wall time across all attempts and delays.
    pub elapsed: Duration,
}

impl<T> RetryOutcome<T> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

type RetryPredicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;
type RetryObserver = Arc<dyn Fn(u32, &Error, Duration) + Send + Sync>;

/// Reusable retry policy for async operations.
pub struct RetryPolicy {
    config: RetryConfig,
    retry_on: Option<RetryPredicate>,
    on_retry: Option<RetryObserver>,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            retry_on: None,
            on_retry: None,
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Only retry errors the predicate accepts. Without a predicate every
    /// error is retryable.
    pub fn with_retry_on<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Error) -> bool + Send + Sync + 'static,
    {
        self.retry_on = Some(Arc::new(predicate));
        self
    }

    /// Observe each retry before its delay. Receives the failed attempt
    /// number, the error, and the upcoming delay. Panics are swallowed.
    pub fn with_on_retry<F>(mut self, observer: F) -> Self
    where
        F: Fn(u32, &Error, Duration) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(observer));
        self
    }

    /// Run `op` until it succeeds or the policy gives up.
    ///
    /// Exhausting all attempts yields [`Error::MaxAttemptsExceeded`]
    /// wrapping the final error. A non-retryable error is returned as-is
    /// after its attempt.
    pub async fn execute<T, Op, Fut>(&self, op: Op) -> Result<T>
    where
        Op: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        self.execute_with_result(op).await.result
    }

    /// Like [`RetryPolicy::execute`], but also reports attempt count and
    /// elapsed time.
    pub async fn execute_with_result<T, Op, Fut>(&self, mut op: Op) -> RetryOutcome<T>
    where
        Op: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let res = match self.config.attempt_timeout {
                Some(limit) => match tokio::time::timeout(limit, op()).await {
                    Ok(res) => res,
                    Err(_) => Err(Error::OperationTimeout(limit)),
                },
                None => op().await,
            };
            let err = match res {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                        elapsed: started.elapsed(),
                    }
                }
                Err(err) => err,
            };

            let retryable = self.retry_on.as_ref().map(|p| p(&err)).unwrap_or(true);
            if !retryable {
                return RetryOutcome {
                    result: Err(err),
                    attempts: attempt,
                    elapsed: started.elapsed(),
                };
            }
            if attempt >= self.config.max_attempts {
                return RetryOutcome {
                    result: Err(Error::MaxAttemptsExceeded {
                        attempts: attempt,
                        source: Box::new(err),
                    }),
                    attempts: attempt,
                    elapsed: started.elapsed(),
                };
            }

            let delay = self.jittered(self.backoff_delay(attempt));
            if let Some(cb) = &self.on_retry {
                let _ = catch_unwind(AssertUnwindSafe(|| cb(attempt, &err, delay)));
            }
            tracing::debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying after failure"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Deterministic (pre-jitter) delay after the given 1-based attempt.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63);
        let base = self.config.initial_delay.as_secs_f64() * self.config.backoff_factor.powi(exp as i32);
        let capped = base.min(self.config.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.config.jitter || self.config.jitter_factor <= 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = delay.as_secs_f64() * self.config.jitter_factor;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        let jittered = (delay.as_secs_f64() + offset)
            .clamp(0.0, self.config.max_delay.as_secs_f64());
        Duration::from_secs_f64(jittered)
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("config", &self.config)
            .field("has_retry_on", &self.retry_on.is_some())
            .field("has_on_retry", &self.on_retry.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config() -> RetryConfig {
        RetryConfig::new()
            .with_max_attempts(3)
            .with_initial_delay(Duration::from_millis(5))
            .with_jitter(false)
    }

    #[tokio::test]
    async fn test_succeeds_first_try() {
        let policy = RetryPolicy::new(fast_config());
        let outcome = policy
            .execute_with_result(|| async { Ok::<_, Error>(42) })
            .await;
        assert!(outcome.is_success());
        assert_eq!(outcome.attempts, 1);
        assert_eq!(outcome.result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let policy = RetryPolicy::new(fast_config());
        let calls = AtomicU32::new(0);
        let value = policy
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(Error::msg("flaky"))
                    } else {
                        Ok("ready")
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(value, "ready");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_wraps_final_error() {
        let policy = RetryPolicy::new(fast_config());
        let err = policy
            .execute(|| async { Err::<(), _>(Error::msg("down")) })
            .await
            .unwrap_err();
        match err {
            Error::MaxAttemptsExceeded { attempts, source } => {
                assert_eq!(attempts, 3);
                assert!(source.to_string().contains("down"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_elapsed_covers_backoff_sleeps() {
        // 3 attempts with jitter off sleep 5ms then 10ms between them; the
        // outcome's elapsed time must account for both delays.
        let policy = RetryPolicy::new(fast_config());
        let outcome = policy
            .execute_with_result(|| async { Err::<(), _>(Error::msg("down")) })
            .await;
        assert_eq!(outcome.attempts, 3);
        assert!(
            outcome.elapsed >= Duration::from_millis(15),
            "elapsed {:?} shorter than the backoff sleeps",
            outcome.elapsed
        );
    }

    #[tokio::test]
    async fn test_non_retryable_error_returns_immediately() {
        let policy = RetryPolicy::new(fast_config())
            .with_retry_on(|err| err.is_timeout());
        let calls = AtomicU32::new(0);
        let err = policy
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::msg("bad request")) }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Operation(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempt_timeout_is_retryable() {
        let policy = RetryPolicy::new(
            fast_config().with_attempt_timeout(Duration::from_millis(10)),
        );
        let calls = AtomicU32::new(0);
        let err = policy
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok::<(), Error>(())
                }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MaxAttemptsExceeded { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_on_retry_observer_fires_per_retry() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let policy = RetryPolicy::new(fast_config()).with_on_retry(move |attempt, _, delay| {
            log.lock().unwrap().push((attempt, delay));
        });
        let _ = policy
            .execute(|| async { Err::<(), _>(Error::msg("down")) })
            .await;
        let seen = seen.lock().unwrap();
        // 3 attempts means 2 retries.
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, 1);
        assert_eq!(seen[1].0, 2);
        assert_eq!(seen[1].1, seen[0].1 * 2);
    }

    #[tokio::test]
    async fn test_panicking_observer_does_not_stop_retries() {
        let policy = RetryPolicy::new(fast_config()).with_on_retry(|_, _, _| panic!("bug"));
        let calls = AtomicU32::new(0);
        let _ = policy
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::msg("down")) }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_backoff_delay_progression() {
        let policy = RetryPolicy::new(
            RetryConfig::new()
                .with_initial_delay(Duration::from_millis(100))
                .with_backoff_factor(2.0)
                .with_max_delay(Duration::from_millis(350))
                .with_jitter(false),
        );
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(200));
        // Capped at max_delay.
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(350));
        assert_eq!(policy.backoff_delay(10), Duration::from_millis(350));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = RetryPolicy::new(
            RetryConfig::new()
                .with_initial_delay(Duration::from_millis(100))
                .with_jitter(true)
                .with_jitter_factor(0.5),
        );
        for _ in 0..100 {
            let d = policy.jittered(Duration::from_millis(100));
            assert!(d >= Duration::from_millis(50));
            assert!(d <= Duration::from_millis(150));
        }
    }
}
