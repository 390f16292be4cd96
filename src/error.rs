use std::time::Duration;
use thiserror::Error;

/// Unified error type for the toolkit.
///
/// Every primitive reports failures through this enum so callers always
/// receive either a result or a typed error on the same channel they used
/// to request the operation.
#[derive(Debug, Error)]
pub enum Error {
    /// The queue was cleared while the task was still pending.
    #[error("queue cleared before task could run")]
    QueueCleared,

    /// A queued task exceeded its per-task timeout. The underlying work is
    /// not aborted; its eventual result is discarded.
    #[error("task timed out after {0:?}")]
    TaskTimeout(Duration),

    /// A queued task panicked. The queue itself keeps running.
    #[error("task panicked")]
    TaskPanicked,

    /// A blocking acquire (lock, semaphore, pool) hit its deadline while
    /// still queued.
    #[error("timed out acquiring {resource} after {waited:?}")]
    AcquireTimeout {
        resource: &'static str,
        waited: Duration,
    },

    /// The pool was closed before or during the acquire.
    #[error("pool is closed")]
    PoolClosed,

    /// The pool's resource factory failed to create a resource.
    #[error("resource creation failed: {0}")]
    ResourceCreation(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The circuit breaker is open; the wrapped call was not invoked.
    #[error("circuit breaker is open")]
    CircuitOpen,

    /// A wrapped call exceeded its per-attempt timeout.
    #[error("operation timed out after {0:?}")]
    OperationTimeout(Duration),

    /// All retry attempts were exhausted. Carries the last underlying error.
    #[error("gave up after {attempts} attempts: {source}")]
    MaxAttemptsExceeded {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    /// Failure produced by a caller-supplied operation.
    #[error("operation failed: {0}")]
    Operation(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wrap a foreign error produced by a caller-supplied operation.
    pub fn operation(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Error::Operation(Box::new(err))
    }

    /// Wrap a plain message as an operation failure.
    pub fn msg(message: impl Into<String>) -> Self {
        Error::Operation(message.into().into())
    }

    /// Wrap a factory error as a resource-creation failure.
    pub fn resource_creation(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Error::ResourceCreation(Box::new(err))
    }

    /// True for every timeout-kind error, regardless of which primitive
    /// produced it.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::TaskTimeout(_) | Error::AcquireTimeout { .. } | Error::OperationTimeout(_)
        )
    }
}

/// Result type alias for the toolkit.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_timeout_classification() {
        assert!(Error::TaskTimeout(Duration::from_secs(1)).is_timeout());
        assert!(Error::AcquireTimeout {
            resource: "mutex",
            waited: Duration::from_millis(5),
        }
        .is_timeout());
        assert!(Error::OperationTimeout(Duration::from_secs(2)).is_timeout());
        assert!(!Error::QueueCleared.is_timeout());
        assert!(!Error::CircuitOpen.is_timeout());
    }

    #[test]
    fn test_max_attempts_carries_last_error() {
        let err = Error::MaxAttemptsExceeded {
            attempts: 3,
            source: Box::new(Error::msg("connection refused")),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("3 attempts"));
        assert!(rendered.contains("connection refused"));
    }

    #[test]
    fn test_operation_wraps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err = Error::operation(io);
        assert!(std::error::Error::source(&err).is_some());
    }
}
