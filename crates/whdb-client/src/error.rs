//! Client error types.

use std::fmt;

use thiserror::Error;

use crate::state::ConnectionState;

/// Convenience alias used throughout the client.
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error type used to carry foreign causes.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Fixed classification codes attached to errors raised by the driver itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorCode {
    /// A fresh session could not be established.
    ConnectionFailure,
}

impl ErrorCode {
    /// Numeric vendor code reported to callers.
    #[must_use]
    pub fn code(self) -> i32 {
        match self {
            Self::ConnectionFailure => 270_001,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Errors produced by the connection lifecycle engine and its collaborators.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Establishing a fresh session failed for a reason the session layer did
    /// not classify. The original error is preserved as the source.
    #[error("connection failure ({code}): {message}")]
    ConnectionFailed {
        /// Classification code.
        code: ErrorCode,
        /// Message of the original failure.
        message: String,
        /// The original failure.
        #[source]
        source: BoxError,
    },

    /// Error reported by the remote service, already classified by the
    /// session layer.
    #[error("server error {code}: {message}")]
    Server {
        /// Vendor error code.
        code: i32,
        /// SQLSTATE, when the server supplied one.
        sql_state: Option<String>,
        /// Server message.
        message: String,
    },

    /// Authentication was rejected by the remote service.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The operation was cancelled through its cancellation token.
    #[error("operation cancelled")]
    Cancelled,

    /// Invalid configuration or connection string.
    #[error("configuration error: {0}")]
    Config(String),

    /// The connection is not in the state an operation requires.
    #[error("invalid connection state: expected {expected}, found {actual}")]
    InvalidState {
        /// Required state.
        expected: ConnectionState,
        /// Actual state.
        actual: ConnectionState,
    },

    /// A blocking operation was invoked from inside an async runtime.
    #[error("blocking connection call made from within an async runtime; use the async variant")]
    BlockingInAsyncContext,

    /// IO error below the session layer.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other failure raised by a collaborator.
    #[error(transparent)]
    Other(BoxError),
}

impl Error {
    /// Wrap an arbitrary error as a connection failure, keeping its message.
    pub fn connection_failed(source: impl Into<BoxError>) -> Self {
        let source = source.into();
        Self::ConnectionFailed {
            code: ErrorCode::ConnectionFailure,
            message: source.to_string(),
            source,
        }
    }

    /// Create a server error.
    pub fn server(code: i32, message: impl Into<String>) -> Self {
        Self::Server {
            code,
            sql_state: None,
            message: message.into(),
        }
    }

    /// Whether the error was already classified by the driver or the session
    /// layer and must be propagated unchanged.
    #[must_use]
    pub fn is_driver_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed { .. }
                | Self::Server { .. }
                | Self::Authentication(_)
                | Self::Cancelled
                | Self::Config(_)
                | Self::InvalidState { .. }
                | Self::BlockingInAsyncContext
        )
    }

    /// Whether this error represents a cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Vendor code of the error, when it has one.
    #[must_use]
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::ConnectionFailed { code, .. } => Some(code.code()),
            Self::Server { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Classify an error raised while establishing a fresh session.
    ///
    /// Driver errors pass through untouched; everything else becomes a
    /// [`Error::ConnectionFailed`].
    #[must_use]
    pub fn classify_connect(self) -> Self {
        if self.is_driver_error() {
            self
        } else {
            match self {
                Self::Other(source) => Self::connection_failed(source),
                other => Self::connection_failed(other),
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn test_driver_errors_pass_through() {
        let err = Error::server(390_100, "incorrect username or password").classify_connect();
        assert!(matches!(err, Error::Server { code: 390_100, .. }));
        assert_eq!(err.code(), Some(390_100));

        let err = Error::Cancelled.classify_connect();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_io_error_wrapped_as_connection_failure() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = Error::from(io).classify_connect();

        match &err {
            Error::ConnectionFailed { code, message, .. } => {
                assert_eq!(*code, ErrorCode::ConnectionFailure);
                assert!(message.contains("refused"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(err.code(), Some(270_001));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_other_error_keeps_original_source() {
        let err = Error::Other("dns lookup failed".into()).classify_connect();
        let source = err.source().unwrap();
        assert_eq!(source.to_string(), "dns lookup failed");
        assert_eq!(
            err.to_string(),
            "connection failure (270001): dns lookup failed"
        );
    }
}
