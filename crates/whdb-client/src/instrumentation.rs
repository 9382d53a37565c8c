//! Tracing spans and timing for connection lifecycle operations.
//!
//! Every lifecycle operation runs inside a span named after it so that
//! events from the session layer nest under the connection that caused them.
//!
//! ## Span fields
//!
//! - `db.system`: "whdb"
//! - `db.account`: account identifier
//! - `db.name`: configured database

use crate::config::Config;

/// Database system identifier.
pub const DB_SYSTEM: &str = "whdb";

/// Span names for lifecycle operations.
pub mod span_names {
    /// Span name for opening a connection.
    pub const OPEN: &str = "whdb.open";
    /// Span name for closing a connection.
    pub const CLOSE: &str = "whdb.close";
    /// Span name for disposing a connection.
    pub const DISPOSE: &str = "whdb.dispose";
}

/// Create the span for a lifecycle operation.
///
/// The descriptor itself is never recorded since it may carry credentials.
#[must_use]
pub fn lifecycle_span(name: &'static str, config: &Config) -> tracing::Span {
    match name {
        span_names::OPEN => tracing::info_span!(
            "whdb.open",
            db.system = DB_SYSTEM,
            db.account = %config.account,
            db.name = ?config.database,
        ),
        span_names::CLOSE => tracing::info_span!(
            "whdb.close",
            db.system = DB_SYSTEM,
            db.account = %config.account,
        ),
        _ => tracing::info_span!(
            "whdb.dispose",
            db.system = DB_SYSTEM,
            db.account = %config.account,
        ),
    }
}

/// Helper for timing operations.
#[derive(Debug, Clone)]
pub struct OperationTimer {
    start: std::time::Instant,
    operation: &'static str,
}

impl OperationTimer {
    /// Start timing an operation.
    #[must_use]
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: std::time::Instant::now(),
            operation,
        }
    }

    /// Get the elapsed time in seconds.
    #[must_use]
    pub fn elapsed_seconds(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    /// Get the operation name.
    #[must_use]
    pub fn operation(&self) -> &'static str {
        self.operation
    }

    /// Finish timing and log the duration.
    pub fn finish(self, success: bool) {
        tracing::debug!(
            operation = self.operation,
            elapsed_seconds = self.elapsed_seconds(),
            success,
            "operation finished"
        );
    }
}
