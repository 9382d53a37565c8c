//! Cross-connection coordination for array binding.
//!
//! Bulk binding stages data in a server-side area that must be created only
//! once. Connections share a [`BindingCoordination`] so callers can serialize
//! that setup: hold [`BindingCoordination::mutex`] while checking and
//! setting the stage-created flag.
//!
//! The flag is process-wide by default while the staging area it describes
//! belongs to a single session. Pass a dedicated instance to
//! [`ConnectionBuilder::coordination`](crate::connection::ConnectionBuilder::coordination)
//! to scope it more narrowly.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use once_cell::sync::Lazy;
use tokio::sync::Mutex;

static GLOBAL: Lazy<Arc<BindingCoordination>> = Lazy::new(|| Arc::new(BindingCoordination::new()));

/// Mutex and stage-created flag shared by connections.
#[derive(Debug, Default)]
pub struct BindingCoordination {
    mutex: Arc<Mutex<()>>,
    stage_created: AtomicBool,
}

impl BindingCoordination {
    /// Create an isolated coordination state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide coordination state used when none is injected.
    #[must_use]
    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL)
    }

    /// Handle to the binding mutex.
    ///
    /// The engine never locks it. Async callers use `lock().await`, blocking
    /// callers `blocking_lock()`.
    #[must_use]
    pub fn mutex(&self) -> Arc<Mutex<()>> {
        Arc::clone(&self.mutex)
    }

    /// Whether the staging area has been created.
    #[must_use]
    pub fn stage_created(&self) -> bool {
        self.stage_created.load(Ordering::Acquire)
    }

    /// Record whether the staging area exists.
    pub fn set_stage_created(&self, created: bool) {
        self.stage_created.store(created, Ordering::Release);
    }

    /// Clear the stage-created flag. Called for every new connection.
    pub(crate) fn reset(&self) {
        self.set_stage_created(false);
    }
}
