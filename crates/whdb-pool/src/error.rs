//! Pool error types.

use thiserror::Error;

/// Errors returned by the session pool.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PoolError {
    /// The pool has been closed.
    #[error("pool is closed")]
    PoolClosed,

    /// Invalid pool configuration.
    #[error("invalid pool configuration: {0}")]
    Configuration(String),
}
