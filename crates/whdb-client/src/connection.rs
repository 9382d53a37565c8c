//! Connection lifecycle engine.
//!
//! A [`Connection`] owns at most one [`Session`]. Opening first asks the
//! [`SessionPool`] for an idle session under the connection's descriptor and
//! falls back to creating and opening a fresh one. Closing rolls back any
//! transaction left open, offers the session back to the pool and closes it
//! when the pool declines.
//!
//! Blocking and async entry points share one implementation. The blocking
//! variants drive the async one to completion on a private runtime with a
//! token that never fires.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::binding::BindingCoordination;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::instrumentation::{OperationTimer, lifecycle_span, span_names};
use crate::operation::{Outcome, block_on, run_cancellable};
use crate::session::{NoPool, Session, SessionFactory, SessionPool};
use crate::state::ConnectionState;
use crate::transaction::{PoolEligibility, ensure_no_open_transaction};

/// A logical connection to the warehouse service.
///
/// # Example
///
/// ```rust,ignore
/// use whdb_client::Connection;
///
/// let conn = Connection::builder("account=xy12345;user=loader;password=secret")
///     .factory(HttpSessionFactory::default())
///     .pool(pool.clone())
///     .build()?;
///
/// conn.open_async(&CancellationToken::new()).await?;
/// // ...
/// conn.close_async(&CancellationToken::new()).await?;
/// ```
pub struct Connection {
    shared: Arc<Shared>,
}

struct Shared {
    config: RwLock<Config>,
    factory: Arc<dyn SessionFactory>,
    pool: Arc<dyn SessionPool>,
    coordination: Arc<BindingCoordination>,
    core: Mutex<Core>,
    disposed: AtomicBool,
}

/// State guarded together so that `Open` always coincides with a held
/// session.
#[derive(Default)]
struct Core {
    state: ConnectionState,
    session: Option<Box<dyn Session>>,
    /// Incremented for every fresh-session attempt. Completions and
    /// cancellation callbacks only act on the attempt they belong to.
    attempt: u64,
}

impl Connection {
    /// Start building a connection for `descriptor`.
    #[must_use]
    pub fn builder(descriptor: impl Into<String>) -> ConnectionBuilder {
        ConnectionBuilder::new(descriptor)
    }

    /// Create a connection without pooling, using the process-wide binding
    /// coordination.
    pub fn new(descriptor: &str, factory: impl SessionFactory + 'static) -> Result<Self> {
        Self::builder(descriptor).factory(factory).build()
    }

    /// Open the connection, blocking the calling thread.
    ///
    /// Does nothing unless the connection is closed.
    pub fn open(&self) -> Result<()> {
        block_on(self.shared.open(&CancellationToken::new()))?
    }

    /// Open the connection.
    ///
    /// Cancelling `cancel` before the call issues no I/O. Cancelling it while
    /// a fresh session is being opened moves the connection back to
    /// [`ConnectionState::Closed`] at once; the call then resolves to
    /// [`Error::Cancelled`].
    pub async fn open_async(&self, cancel: &CancellationToken) -> Result<()> {
        self.shared.open(cancel).await
    }

    /// Open the connection, giving up after `timeout`.
    pub async fn open_with_timeout(&self, timeout: Duration) -> Result<()> {
        let cancel = CancellationToken::new();
        let timer = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                cancel.cancel();
            })
        };

        let result = self.shared.open(&cancel).await;
        timer.abort();
        result
    }

    /// Close the connection, blocking the calling thread.
    ///
    /// Errors from closing the session on the server are returned; the
    /// connection is closed either way.
    pub fn close(&self) -> Result<()> {
        block_on(self.shared.close(&CancellationToken::new()))?
    }

    /// Close the connection.
    ///
    /// A close cancelled through `cancel` completes without error.
    pub async fn close_async(&self, cancel: &CancellationToken) -> Result<()> {
        self.shared.close(cancel).await
    }

    /// Close the connection once, logging instead of returning errors.
    ///
    /// The connection is closed when this returns. Inside a Tokio runtime
    /// handing the session to the pool or closing it on the server is
    /// spawned onto that runtime and may finish later; use
    /// [`dispose_async`](Self::dispose_async) to wait for it.
    pub fn dispose(&self) {
        Shared::dispose_detached(Arc::clone(&self.shared));
    }

    /// Close the connection once, logging instead of returning errors.
    pub async fn dispose_async(&self) {
        self.shared.dispose().await;
    }

    /// Whether [`dispose`](Self::dispose) has run.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::Acquire)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.core.lock().state
    }

    /// Connection string of this connection.
    #[must_use]
    pub fn descriptor(&self) -> String {
        self.shared.config.read().descriptor.clone()
    }

    /// Replace the connection string. Only allowed while closed.
    pub fn set_descriptor(&self, descriptor: &str) -> Result<()> {
        let config = Config::from_connection_string(descriptor)?;
        let core = self.shared.core.lock();
        if !core.state.is_closed() {
            return Err(Error::InvalidState {
                expected: ConnectionState::Closed,
                actual: core.state,
            });
        }
        *self.shared.config.write() = config;
        Ok(())
    }

    /// Current database: the session's once open, the configured one before.
    #[must_use]
    pub fn database(&self) -> Option<String> {
        let core = self.shared.core.lock();
        match &core.session {
            Some(session) => session.database().map(str::to_string),
            None => self.shared.config.read().database.clone(),
        }
    }

    /// Server version reported by the open session.
    #[must_use]
    pub fn server_version(&self) -> Option<String> {
        let core = self.shared.core.lock();
        core.session
            .as_ref()
            .and_then(|session| session.server_version().map(str::to_string))
    }

    /// Identifier of the open session.
    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        let core = self.shared.core.lock();
        core.session
            .as_ref()
            .and_then(|session| session.id().map(str::to_string))
    }

    /// Login timeout: the session's once open, the configured one before.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        let core = self.shared.core.lock();
        match &core.session {
            Some(session) => session.connect_timeout(),
            None => self.shared.config.read().connection_timeout,
        }
    }

    /// Binding coordination state this connection shares with others.
    #[must_use]
    pub fn coordination(&self) -> Arc<BindingCoordination> {
        Arc::clone(&self.shared.coordination)
    }

    /// Handle to the shared binding mutex.
    #[must_use]
    pub fn binding_mutex(&self) -> Arc<tokio::sync::Mutex<()>> {
        self.shared.coordination.mutex()
    }

    /// Whether the shared staging area has been created.
    #[must_use]
    pub fn stage_created(&self) -> bool {
        self.shared.coordination.stage_created()
    }

    /// Record whether the shared staging area exists.
    pub fn set_stage_created(&self, created: bool) {
        self.shared.coordination.set_stage_created(created);
    }
}

impl Shared {
    async fn open(&self, cancel: &CancellationToken) -> Result<()> {
        let config = self.config.read().clone();
        let span = lifecycle_span(span_names::OPEN, &config);
        self.open_inner(config, cancel).instrument(span).await
    }

    async fn open_inner(&self, config: Config, cancel: &CancellationToken) -> Result<()> {
        let attempt = {
            let mut core = self.core.lock();
            if !core.state.is_closed() {
                tracing::debug!(state = %core.state, "open ignored: connection is not closed");
                return Ok(());
            }
            if cancel.is_cancelled() {
                tracing::debug!("open cancelled before start");
                return Err(Error::Cancelled);
            }

            if config.pooling {
                if let Some(session) = self.pool.acquire(&config.descriptor) {
                    tracing::debug!(session_id = ?session.id(), "adopted pooled session");
                    core.session = Some(session);
                    core.state = ConnectionState::Open;
                    return Ok(());
                }
            }

            core.state = ConnectionState::Connecting;
            core.attempt += 1;
            core.attempt
        };

        let timer = OperationTimer::start(span_names::OPEN);

        let mut session = match self.factory.create(&config) {
            Ok(session) => session,
            Err(e) => {
                self.abandon(attempt);
                tracing::error!(error = %e, "failed to create session");
                timer.finish(false);
                return Err(e.classify_connect());
            }
        };

        let outcome = run_cancellable(session.open(cancel), cancel, || {
            tracing::debug!("cancellation requested while opening session");
            self.abandon(attempt);
        })
        .await;

        match outcome {
            Outcome::Succeeded(()) => {
                let installed = {
                    let mut core = self.core.lock();
                    if core.attempt == attempt && core.state == ConnectionState::Connecting {
                        core.state = ConnectionState::Open;
                        core.session = Some(session);
                        None
                    } else {
                        Some(session)
                    }
                };

                match installed {
                    None => {
                        tracing::info!("session established");
                        timer.finish(true);
                        Ok(())
                    }
                    Some(mut orphan) => {
                        // Cancelled while the open was in flight; the
                        // connection already reported itself closed.
                        tracing::debug!(
                            session_id = ?orphan.id(),
                            "session opened after cancellation; closing it"
                        );
                        if let Err(e) = orphan.close(&CancellationToken::new()).await {
                            tracing::warn!(error = %e, "failed to close orphaned session");
                        }
                        timer.finish(false);
                        Err(Error::Cancelled)
                    }
                }
            }
            Outcome::Faulted(e) => {
                self.abandon(attempt);
                tracing::error!(error = %e, "failed to open session");
                timer.finish(false);
                Err(e.classify_connect())
            }
            Outcome::Canceled => {
                self.abandon(attempt);
                tracing::debug!("session open cancelled");
                timer.finish(false);
                Err(Error::Cancelled)
            }
        }
    }

    /// Move a pending attempt back to `Closed`.
    fn abandon(&self, attempt: u64) {
        let mut core = self.core.lock();
        if core.attempt == attempt && core.state == ConnectionState::Connecting {
            core.state = ConnectionState::Closed;
        }
    }

    async fn close(&self, cancel: &CancellationToken) -> Result<()> {
        let config = self.config.read().clone();
        let span = lifecycle_span(span_names::CLOSE, &config);
        self.close_inner(config, cancel).instrument(span).await
    }

    async fn close_inner(&self, config: Config, cancel: &CancellationToken) -> Result<()> {
        let Some(session) = self.detach_session() else {
            tracing::debug!(state = %self.core.lock().state, "close ignored: connection is not open");
            return Ok(());
        };

        if cancel.is_cancelled() {
            tracing::warn!(
                session_id = ?session.id(),
                "close cancelled before start; discarding session without contacting the server"
            );
            return Ok(());
        }

        self.release_or_close(session, &config, cancel).await
    }

    /// Take the session out and move to `Closed`.
    ///
    /// Returns `None` unless the connection is open.
    fn detach_session(&self) -> Option<Box<dyn Session>> {
        let mut core = self.core.lock();
        if !core.state.is_open() {
            return None;
        }
        core.state = ConnectionState::Closed;
        core.session.take()
    }

    /// Hand a detached session to the pool, or close it on the server.
    async fn release_or_close(
        &self,
        mut session: Box<dyn Session>,
        config: &Config,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let timer = OperationTimer::start(span_names::CLOSE);

        let eligibility = ensure_no_open_transaction(session.as_mut()).await;
        if eligibility == PoolEligibility::Eligible && config.pooling {
            let session_id = session.id().map(str::to_string);
            match self.pool.release(&config.descriptor, session) {
                Ok(()) => {
                    tracing::debug!(session_id = ?session_id, "session returned to pool");
                    timer.finish(true);
                    return Ok(());
                }
                Err(declined) => {
                    tracing::debug!(session_id = ?session_id, "pool declined session");
                    session = declined;
                }
            }
        }

        let outcome = run_cancellable(session.close(cancel), cancel, || {
            tracing::debug!("cancellation requested while closing session");
        })
        .await;

        match outcome {
            Outcome::Succeeded(()) => {
                tracing::info!(session_id = ?session.id(), "session closed");
                timer.finish(true);
                Ok(())
            }
            Outcome::Canceled => {
                tracing::debug!(session_id = ?session.id(), "session close cancelled");
                timer.finish(false);
                Ok(())
            }
            Outcome::Faulted(e) => {
                tracing::warn!(session_id = ?session.id(), error = %e, "failed to close session");
                timer.finish(false);
                Err(e)
            }
        }
    }

    async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let config = self.config.read().clone();
        if let Some(session) = self.detach_session() {
            self.teardown(session, config).await;
        }
    }

    /// Release or close a session detached by dispose, logging failures.
    async fn teardown(&self, session: Box<dyn Session>, config: Config) {
        let span = lifecycle_span(span_names::DISPOSE, &config);
        async {
            if let Err(e) = self
                .release_or_close(session, &config, &CancellationToken::new())
                .await
            {
                tracing::error!(error = %e, "error while disposing connection");
            }
        }
        .instrument(span)
        .await;
    }

    /// Dispose from a synchronous context.
    ///
    /// The connection is marked disposed and moved to `Closed` before this
    /// returns. Releasing or closing the session is spawned onto the current
    /// runtime when there is one and run to completion otherwise. A spawned
    /// teardown that never runs because its runtime shuts down first drops
    /// the session without contacting the server.
    fn dispose_detached(shared: Arc<Self>) {
        if shared.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let config = shared.config.read().clone();
        let Some(session) = shared.detach_session() else {
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { shared.teardown(session, config).await });
            }
            Err(_) => {
                if let Err(e) = block_on(shared.teardown(session, config)) {
                    tracing::error!(error = %e, "error while disposing connection");
                }
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        Shared::dispose_detached(Arc::clone(&self.shared));
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        let config = self.shared.config.read();
        f.debug_struct("Connection")
            .field("account", &config.account)
            .field("database", &config.database)
            .field("state", &state)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Builder for [`Connection`].
pub struct ConnectionBuilder {
    descriptor: String,
    factory: Option<Arc<dyn SessionFactory>>,
    pool: Arc<dyn SessionPool>,
    coordination: Arc<BindingCoordination>,
}

impl ConnectionBuilder {
    /// Create a builder for `descriptor` with pooling disabled and the
    /// process-wide binding coordination.
    pub fn new(descriptor: impl Into<String>) -> Self {
        Self {
            descriptor: descriptor.into(),
            factory: None,
            pool: Arc::new(NoPool),
            coordination: BindingCoordination::global(),
        }
    }

    /// Set the factory creating fresh sessions.
    #[must_use]
    pub fn factory(mut self, factory: impl SessionFactory + 'static) -> Self {
        self.factory = Some(Arc::new(factory));
        self
    }

    /// Set a shared factory creating fresh sessions.
    #[must_use]
    pub fn shared_factory(mut self, factory: Arc<dyn SessionFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Set the session pool.
    #[must_use]
    pub fn pool(mut self, pool: Arc<dyn SessionPool>) -> Self {
        self.pool = pool;
        self
    }

    /// Set the binding coordination state.
    #[must_use]
    pub fn coordination(mut self, coordination: Arc<BindingCoordination>) -> Self {
        self.coordination = coordination;
        self
    }

    /// Build the connection.
    ///
    /// Clears the stage-created flag of the binding coordination state.
    pub fn build(self) -> Result<Connection> {
        let config = Config::from_connection_string(&self.descriptor)?;
        let factory = self
            .factory
            .ok_or_else(|| Error::Config("no session factory configured".into()))?;

        self.coordination.reset();

        Ok(Connection {
            shared: Arc::new(Shared {
                config: RwLock::new(config),
                factory,
                pool: self.pool,
                coordination: self.coordination,
                core: Mutex::new(Core::default()),
                disposed: AtomicBool::new(false),
            }),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;

    use super::*;

    #[derive(Debug, Default)]
    struct Counters {
        created: AtomicUsize,
        opened: AtomicUsize,
        closed: AtomicUsize,
    }

    #[derive(Debug)]
    struct TestSession {
        counters: Arc<Counters>,
        fail_open: bool,
    }

    #[async_trait]
    impl Session for TestSession {
        async fn open(&mut self, cancel: &CancellationToken) -> Result<()> {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            self.counters.opened.fetch_add(1, Ordering::SeqCst);
            if self.fail_open {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "connection refused",
                )));
            }
            Ok(())
        }

        async fn close(&mut self, _cancel: &CancellationToken) -> Result<()> {
            self.counters.closed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn execute_simple(
            &mut self,
            _sql: &str,
            _cancel: &CancellationToken,
        ) -> Result<Option<String>> {
            Ok(None)
        }

        fn id(&self) -> Option<&str> {
            Some("test-session")
        }

        fn server_version(&self) -> Option<&str> {
            Some("8.1.0")
        }

        fn database(&self) -> Option<&str> {
            Some("SESSION_DB")
        }

        fn connect_timeout(&self) -> Duration {
            Duration::from_secs(60)
        }
    }

    fn connection(counters: &Arc<Counters>, fail_open: bool) -> Connection {
        let counters = Arc::clone(counters);
        Connection::builder("account=a1;db=CONFIG_DB;connection_timeout=30")
            .factory(move |_: &Config| -> Result<Box<dyn Session>> {
                counters.created.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(TestSession {
                    counters: Arc::clone(&counters),
                    fail_open,
                }))
            })
            .coordination(Arc::new(BindingCoordination::new()))
            .build()
            .unwrap()
    }

    #[test]
    fn test_blocking_open_close_without_pool() {
        let counters = Arc::new(Counters::default());
        let conn = connection(&counters, false);
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(conn.database().as_deref(), Some("CONFIG_DB"));
        assert_eq!(conn.timeout(), Duration::from_secs(30));

        conn.open().unwrap();
        assert_eq!(conn.state(), ConnectionState::Open);
        assert_eq!(conn.database().as_deref(), Some("SESSION_DB"));
        assert_eq!(conn.server_version().as_deref(), Some("8.1.0"));
        assert_eq!(conn.session_id().as_deref(), Some("test-session"));
        assert_eq!(conn.timeout(), Duration::from_secs(60));

        conn.close().unwrap();
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
        assert!(conn.session_id().is_none());
    }

    #[test]
    fn test_second_open_is_ignored() {
        let counters = Arc::new(Counters::default());
        let conn = connection(&counters, false);

        conn.open().unwrap();
        conn.open().unwrap();
        assert_eq!(counters.created.load(Ordering::SeqCst), 1);
        assert_eq!(counters.opened.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_open_leaves_connection_closed() {
        let counters = Arc::new(Counters::default());
        let conn = connection(&counters, true);

        let err = conn.open().unwrap_err();
        assert!(matches!(err, Error::ConnectionFailed { .. }));
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(conn.session_id().is_none());
    }

    #[test]
    fn test_missing_factory_is_a_config_error() {
        let err = Connection::builder("account=a1").build().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_set_descriptor_requires_closed() {
        let counters = Arc::new(Counters::default());
        let conn = connection(&counters, false);

        conn.set_descriptor("account=a2;db=OTHER").unwrap();
        assert_eq!(conn.descriptor(), "account=a2;db=OTHER");

        conn.open().unwrap();
        let err = conn.set_descriptor("account=a3").unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidState {
                expected: ConnectionState::Closed,
                actual: ConnectionState::Open
            }
        ));
    }

    #[test]
    fn test_drop_closes_open_connection_once() {
        let counters = Arc::new(Counters::default());
        let conn = connection(&counters, false);
        conn.open().unwrap();
        conn.dispose();
        conn.dispose();
        drop(conn);

        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_without_dispose_tears_down() {
        let counters = Arc::new(Counters::default());
        let conn = connection(&counters, false);
        conn.open().unwrap();
        drop(conn);

        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sync_dispose_inside_runtime_closes_at_once() {
        let counters = Arc::new(Counters::default());
        let conn = connection(&counters, false);
        conn.open_async(&CancellationToken::new()).await.unwrap();

        conn.dispose();
        assert!(conn.is_disposed());
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(conn.session_id().is_none());

        for _ in 0..100 {
            if counters.closed.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(counters.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dispose_stays_closed_when_runtime_stops_first() {
        let counters = Arc::new(Counters::default());
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let conn = runtime.block_on(async {
            let conn = connection(&counters, false);
            conn.open_async(&CancellationToken::new()).await.unwrap();
            conn.dispose();
            conn
        });
        drop(runtime);

        assert!(conn.is_disposed());
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(conn.session_id().is_none());

        // Dropping afterwards does not start a second teardown.
        drop(conn);
        assert!(counters.closed.load(Ordering::SeqCst) <= 1);
    }

    #[tokio::test]
    async fn test_blocking_open_inside_runtime_is_rejected() {
        let counters = Arc::new(Counters::default());
        let conn = connection(&counters, false);

        let err = conn.open().unwrap_err();
        assert!(matches!(err, Error::BlockingInAsyncContext));
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(counters.created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_pre_cancelled_open_issues_no_io() {
        let counters = Arc::new(Counters::default());
        let conn = connection(&counters, false);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = conn.open_async(&cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(counters.created.load(Ordering::SeqCst), 0);
    }
}
