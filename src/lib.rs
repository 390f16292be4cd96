//! # flowgate
//!
//! Asynchronous concurrency-control primitives: deferred completion
//! handles, a bounded-concurrency task queue, async locks, a resource
//! pool, and resilience patterns, all on top of Tokio.
//!
//! ## Core Philosophy
//!
//! - **Deadline-Aware**: every blocking acquire takes an optional timeout
//! - **Fair**: waiters are served strictly first-in first-out
//! - **Cancel-Safe**: dropping a pending acquire never leaks a permit,
//!   a lock, or a pooled resource
//! - **Observable**: queues, pools, and breakers expose serializable
//!   stats snapshots and emit `tracing` events
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use flowgate::{TaskQueue, QueueConfig};
//!
//! #[tokio::main]
//! async fn main() -> flowgate::Result<()> {
//!     let queue = TaskQueue::with_config(QueueConfig::new().with_concurrency(2));
//!
//!     let handle = queue.add(async {
//!         // some expensive work
//!         Ok(42)
//!     });
//!
//!     let value = handle.await?;
//!     assert_eq!(value, 42);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`queue`] | Bounded-concurrency task queue with priorities and events |
//! | [`sync`] | Async mutex, reader-writer lock, and counting semaphore |
//! | [`pool`] | Generic resource pool with leases and idle eviction |
//! | [`resilience`] | Circuit breaker and retry with backoff |
//! | [`error`] | Unified error type for every primitive |

pub mod error;
pub mod pool;
pub mod queue;
pub mod resilience;
pub mod sync;

pub(crate) mod waiter;

// Re-export main types for convenience
pub use error::{Error, Result};
pub use pool::{Pool, PoolConfig, PoolGuard, PoolStats, ResourceFactory};
pub use queue::{
    ListenerId, QueueConfig, QueueEvent, QueueNotice, QueueStats, TaskHandle, TaskOptions,
    TaskQueue,
};
pub use resilience::{
    BreakerStats, CircuitBreaker, CircuitBreakerConfig, CircuitState, RetryConfig, RetryOutcome,
    RetryPolicy,
};
pub use sync::{
    Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Semaphore, SemaphorePermit,
};
