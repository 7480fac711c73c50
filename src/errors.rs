//! Error types for the resource pool

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Boxed error returned by handle factories, probes and caller operations.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Shared form of [`BoxError`] so that [`PoolError`] stays `Clone`.
pub type SharedError = Arc<dyn StdError + Send + Sync>;

#[derive(Error, Debug, Clone)]
pub enum PoolError {
    #[error("Timed out after {0:?} waiting for a handle")]
    AcquireTimeout(Duration),

    #[error("Pool is at capacity and the wait queue is full ({queued} waiters)")]
    CapacityExhausted { queued: usize },

    #[error("Handle factory failed: {0}")]
    HandleCreationFailed(#[source] SharedError),

    /// Only ever reported through pool events, never returned to callers.
    #[error("Health probe failed: {0}")]
    ProbeFailed(String),

    #[error("Operation failed after {attempts} attempt(s): {source}")]
    OperationFailed {
        attempts: u32,
        #[source]
        source: SharedError,
    },

    #[error("Pool is shut down")]
    ShutDown,

    #[error("Circuit breaker is open - too many failures")]
    CircuitBreakerOpen,

    #[error("Invalid pool configuration: {0}")]
    InvalidConfiguration(String),
}

impl PoolError {
    pub(crate) fn creation_failed(err: BoxError) -> Self {
        Self::HandleCreationFailed(Arc::from(err))
    }

    /// Whether `execute` may retry after this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::ShutDown | Self::CircuitBreakerOpen | Self::InvalidConfiguration(_)
        )
    }
}

pub type PoolResult<T> = Result<T, PoolError>;
