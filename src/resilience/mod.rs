//! Resilience patterns for calls to unreliable dependencies.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`circuit_breaker`] | Circuit breaker with a trailing failure window |
//! | [`retry`] | Retry with exponential backoff and jitter |
//!
//! ## Circuit Breaker
//!
//! The breaker isolates a failing dependency instead of hammering it:
//! - **Closed**: normal operation, calls pass through
//! - **Open**: failures reached the threshold, calls fail fast
//! - **Half-Open**: probing whether the dependency has recovered
//!
//! ```rust
//! use flowgate::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! let config = CircuitBreakerConfig::new()
//!     .with_failure_threshold(5)
//!     .with_reset_timeout(Duration::from_secs(30));
//! let breaker = CircuitBreaker::new(config);
//! ```
//!
//! ## Retry
//!
//! ```rust
//! use flowgate::resilience::retry::{RetryConfig, RetryPolicy};
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::new(
//!     RetryConfig::new()
//!         .with_max_attempts(5)
//!         .with_initial_delay(Duration::from_millis(50)),
//! )
//! .with_retry_on(|err| err.is_timeout());
//! ```
//!
//! Both patterns compose: wrap a breaker-guarded call inside a retry
//! policy whose predicate refuses to retry an open circuit.

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{BreakerStats, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use retry::{RetryConfig, RetryOutcome, RetryPolicy};
