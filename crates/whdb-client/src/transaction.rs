//! Transaction cleanup before a session is pooled.
//!
//! Transactions can be started and ended by arbitrary SQL, so the engine
//! never tracks them itself. It asks the server instead, right before handing
//! a session back to the pool.

use tokio_util::sync::CancellationToken;

use crate::session::Session;

/// Statement returning the id of the session's open transaction, or NULL.
pub const CURRENT_TRANSACTION_SQL: &str = "SELECT CURRENT_TRANSACTION()";

/// Statement rolling back the session's open transaction.
pub const ROLLBACK_SQL: &str = "ROLLBACK";

/// Whether a session may be handed to the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolEligibility {
    /// No transaction is open; the session may be pooled.
    Eligible,
    /// The session state is unknown or dirty; it must be closed.
    HardClose,
}

/// Make sure no transaction is left open on `session`.
///
/// Runs the introspection statement and, when a transaction is open, a single
/// rollback. Neither statement observes the caller's cancellation token.
pub async fn ensure_no_open_transaction(session: &mut dyn Session) -> PoolEligibility {
    let inert = CancellationToken::new();

    let txn = match session.execute_simple(CURRENT_TRANSACTION_SQL, &inert).await {
        Ok(txn) => txn.filter(|id| !id.trim().is_empty()),
        Err(e) => {
            tracing::error!(
                session_id = ?session.id(),
                error = %e,
                "failed to query current transaction; session will not be pooled"
            );
            return PoolEligibility::HardClose;
        }
    };

    let Some(txn) = txn else {
        return PoolEligibility::Eligible;
    };

    match session.execute_simple(ROLLBACK_SQL, &inert).await {
        Ok(_) => {
            tracing::warn!(
                session_id = ?session.id(),
                transaction = %txn,
                "rolled back transaction left open at close"
            );
            PoolEligibility::Eligible
        }
        Err(e) => {
            tracing::error!(
                session_id = ?session.id(),
                transaction = %txn,
                error = %e,
                "failed to roll back open transaction; session will be closed"
            );
            PoolEligibility::HardClose
        }
    }
}
