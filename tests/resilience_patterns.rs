//! Resilience patterns working against a simulated flaky dependency,
//! including the breaker and retry composed together.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flowgate::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, Error, RetryConfig, RetryPolicy,
};

/// A dependency that fails its first `failures` calls, then recovers.
struct FlakyService {
    calls: AtomicU32,
    failures: u32,
}

impl FlakyService {
    fn new(failures: u32) -> Self {
        Self {
            calls: AtomicU32::new(0),
            failures,
        }
    }

    async fn call(&self) -> Result<u32, Error> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            Err(Error::msg("service unavailable"))
        } else {
            Ok(n)
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[tokio::test]
async fn test_breaker_blocks_after_threshold_without_calling() {
    let service = FlakyService::new(u32::MAX);
    let breaker = CircuitBreaker::new(
        CircuitBreakerConfig::new()
            .with_failure_threshold(3)
            .with_reset_timeout(Duration::from_secs(60)),
    );

    for _ in 0..3 {
        let _ = breaker.execute(service.call()).await;
    }
    assert_eq!(breaker.state(), CircuitState::Open);
    assert_eq!(service.calls(), 3);

    // Short-circuited: the service never sees the 4th call.
    let res = breaker.execute(service.call()).await;
    assert!(matches!(res, Err(Error::CircuitOpen)));
    assert_eq!(service.calls(), 3);
}

#[tokio::test]
async fn test_breaker_recovers_through_half_open() {
    let service = FlakyService::new(3);
    let breaker = CircuitBreaker::new(
        CircuitBreakerConfig::new()
            .with_failure_threshold(3)
            .with_reset_timeout(Duration::from_millis(30))
            .with_success_threshold(1),
    );

    for _ in 0..3 {
        let _ = breaker.execute(service.call()).await;
    }
    assert_eq!(breaker.state(), CircuitState::Open);

    tokio::time::sleep(Duration::from_millis(40)).await;
    let value = breaker.execute(service.call()).await.unwrap();
    assert_eq!(value, 3);
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_retry_rides_out_transient_failures() {
    let service = FlakyService::new(2);
    let policy = RetryPolicy::new(
        RetryConfig::new()
            .with_max_attempts(5)
            .with_initial_delay(Duration::from_millis(5))
            .with_jitter(false),
    );

    let outcome = policy.execute_with_result(|| service.call()).await;
    assert!(outcome.is_success());
    assert_eq!(outcome.attempts, 3);
}

#[tokio::test]
async fn test_retry_around_breaker_stops_on_open_circuit() {
    let service = Arc::new(FlakyService::new(u32::MAX));
    let breaker = Arc::new(CircuitBreaker::new(
        CircuitBreakerConfig::new()
            .with_failure_threshold(2)
            .with_reset_timeout(Duration::from_secs(60)),
    ));

    // Do not keep retrying a circuit that has already opened.
    let policy = RetryPolicy::new(
        RetryConfig::new()
            .with_max_attempts(10)
            .with_initial_delay(Duration::from_millis(2))
            .with_jitter(false),
    )
    .with_retry_on(|err| !matches!(err, Error::CircuitOpen));

    let err = policy
        .execute(|| {
            let breaker = Arc::clone(&breaker);
            let service = Arc::clone(&service);
            async move { breaker.execute(service.call()).await }
        })
        .await
        .unwrap_err();

    assert!(matches!(err, Error::CircuitOpen));
    // Two real attempts opened the circuit; the third short-circuited.
    assert_eq!(service.calls(), 2);
    assert_eq!(breaker.state(), CircuitState::Open);
}
