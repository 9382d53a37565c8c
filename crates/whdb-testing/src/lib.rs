//! # whdb-testing
//!
//! Test infrastructure for the whdb driver.
//!
//! - [`MockSessionFactory`] creates [`MockSession`]s whose behavior is
//!   scripted through a shared [`MockBehavior`] and whose every call is
//!   recorded in a [`SessionLog`].
//! - [`MockPool`] is a session pool that can be told to decline releases.
//!
//! ## Example
//!
//! ```rust,ignore
//! let factory = MockSessionFactory::new();
//! let conn = Connection::builder("account=test")
//!     .shared_factory(factory.clone())
//!     .build()?;
//!
//! conn.open()?;
//! assert_eq!(factory.log().opened(), 1);
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use whdb_client::transaction::{CURRENT_TRANSACTION_SQL, ROLLBACK_SQL};
use whdb_client::{Config, Error, Result, Session, SessionFactory, SessionPool};

/// Install a test-writer tracing subscriber once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// How a mock session responds to `open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenBehavior {
    /// Open normally.
    #[default]
    Succeed,
    /// Fail with an IO error (not classified by the session layer).
    FailIo,
    /// Fail with a server error (classified by the session layer).
    FailServer,
}

/// How a mock session responds to `close`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CloseBehavior {
    /// Close normally.
    #[default]
    Succeed,
    /// Fail with a server error.
    Fail,
    /// Report cancellation without waiting for the token.
    Cancelled,
}

/// Behavior shared by every session of a factory, read at call time.
#[derive(Debug, Clone, Default)]
pub struct MockBehavior {
    /// Result of `open`.
    pub open: OpenBehavior,
    /// Result of `close`.
    pub close: CloseBehavior,
    /// Simulated latency of `open`.
    pub open_delay: Option<Duration>,
    /// Whether a delayed `open` stops early when its token fires.
    pub open_honors_cancel: bool,
    /// Simulated latency of `close`.
    pub close_delay: Option<Duration>,
    /// Whether a delayed `close` stops early when its token fires.
    pub close_honors_cancel: bool,
    /// Transaction id reported by the introspection statement.
    pub transaction: Option<String>,
    /// Whether the rollback statement fails.
    pub rollback_fails: bool,
}

/// Something a mock session did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The factory created session `n`.
    Created(u64),
    /// Session `n` finished an open attempt.
    Opened(u64),
    /// Session `n` started closing.
    Closed(u64),
    /// Session `n` executed a statement.
    Executed(u64, String),
}

/// Ordered record of mock session activity.
#[derive(Debug, Default)]
pub struct SessionLog {
    events: Mutex<Vec<SessionEvent>>,
}

impl SessionLog {
    fn push(&self, event: SessionEvent) {
        self.events.lock().push(event);
    }

    /// Snapshot of every event so far, in order.
    #[must_use]
    pub fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().clone()
    }

    fn count(&self, pred: impl Fn(&SessionEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }

    /// Number of sessions created.
    #[must_use]
    pub fn created(&self) -> usize {
        self.count(|e| matches!(e, SessionEvent::Created(_)))
    }

    /// Number of finished open attempts.
    #[must_use]
    pub fn opened(&self) -> usize {
        self.count(|e| matches!(e, SessionEvent::Opened(_)))
    }

    /// Number of close calls.
    #[must_use]
    pub fn closed(&self) -> usize {
        self.count(|e| matches!(e, SessionEvent::Closed(_)))
    }

    /// Number of times `sql` was executed on any session.
    #[must_use]
    pub fn executed(&self, sql: &str) -> usize {
        self.count(|e| matches!(e, SessionEvent::Executed(_, s) if s == sql))
    }

    /// Number of rollback statements executed.
    #[must_use]
    pub fn rollbacks(&self) -> usize {
        self.executed(ROLLBACK_SQL)
    }

    /// Number of transaction introspection statements executed.
    #[must_use]
    pub fn introspections(&self) -> usize {
        self.executed(CURRENT_TRANSACTION_SQL)
    }
}

/// Scripted session.
#[derive(Debug)]
pub struct MockSession {
    seq: u64,
    id: String,
    opened: bool,
    behavior: Arc<Mutex<MockBehavior>>,
    log: Arc<SessionLog>,
}

impl MockSession {
    /// Creation sequence number, starting at 1.
    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }
}

#[async_trait]
impl Session for MockSession {
    async fn open(&mut self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let behavior = self.behavior.lock().clone();
        if let Some(delay) = behavior.open_delay {
            if behavior.open_honors_cancel {
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = cancel.cancelled() => return Err(Error::Cancelled),
                }
            } else {
                tokio::time::sleep(delay).await;
            }
        }

        self.log.push(SessionEvent::Opened(self.seq));
        match behavior.open {
            OpenBehavior::Succeed => {
                self.opened = true;
                Ok(())
            }
            OpenBehavior::FailIo => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "connection refused",
            ))),
            OpenBehavior::FailServer => Err(Error::server(390_100, "incorrect username or password")),
        }
    }

    async fn close(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.log.push(SessionEvent::Closed(self.seq));
        self.opened = false;

        let behavior = self.behavior.lock().clone();
        if let Some(delay) = behavior.close_delay {
            if behavior.close_honors_cancel {
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = cancel.cancelled() => return Err(Error::Cancelled),
                }
            } else {
                tokio::time::sleep(delay).await;
            }
        }

        match behavior.close {
            CloseBehavior::Succeed => Ok(()),
            CloseBehavior::Fail => Err(Error::server(390_111, "session no longer exists")),
            CloseBehavior::Cancelled => Err(Error::Cancelled),
        }
    }

    async fn execute_simple(
        &mut self,
        sql: &str,
        _cancel: &CancellationToken,
    ) -> Result<Option<String>> {
        self.log.push(SessionEvent::Executed(self.seq, sql.to_string()));
        let mut behavior = self.behavior.lock();
        match sql {
            CURRENT_TRANSACTION_SQL => Ok(behavior.transaction.clone()),
            ROLLBACK_SQL if behavior.rollback_fails => {
                Err(Error::server(2003, "rollback failed"))
            }
            ROLLBACK_SQL => {
                behavior.transaction = None;
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    fn id(&self) -> Option<&str> {
        self.opened.then_some(self.id.as_str())
    }

    fn server_version(&self) -> Option<&str> {
        self.opened.then_some("9.2.1")
    }

    fn database(&self) -> Option<&str> {
        self.opened.then_some("MOCK_DB")
    }

    fn connect_timeout(&self) -> Duration {
        Duration::from_secs(45)
    }
}

/// Factory handing out [`MockSession`]s.
#[derive(Debug, Default)]
pub struct MockSessionFactory {
    next_seq: AtomicU64,
    behavior: Arc<Mutex<MockBehavior>>,
    log: Arc<SessionLog>,
}

impl MockSessionFactory {
    /// Factory whose sessions succeed at everything.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Factory with scripted behavior.
    #[must_use]
    pub fn with_behavior(behavior: MockBehavior) -> Arc<Self> {
        let factory = Self::default();
        *factory.behavior.lock() = behavior;
        Arc::new(factory)
    }

    /// Change the behavior of existing and future sessions.
    pub fn update(&self, f: impl FnOnce(&mut MockBehavior)) {
        f(&mut self.behavior.lock());
    }

    /// Activity of every session this factory created.
    #[must_use]
    pub fn log(&self) -> &SessionLog {
        &self.log
    }
}

impl SessionFactory for MockSessionFactory {
    fn create(&self, _config: &Config) -> Result<Box<dyn Session>> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.log.push(SessionEvent::Created(seq));
        Ok(Box::new(MockSession {
            seq,
            id: format!("mock-{seq}"),
            opened: false,
            behavior: Arc::clone(&self.behavior),
            log: Arc::clone(&self.log),
        }))
    }
}

/// Session pool for tests: stores released sessions, can decline them.
#[derive(Debug)]
pub struct MockPool {
    accepting: AtomicBool,
    idle: Mutex<HashMap<String, Vec<Box<dyn Session>>>>,
    acquires: AtomicUsize,
    releases: AtomicUsize,
}

impl Default for MockPool {
    fn default() -> Self {
        Self {
            accepting: AtomicBool::new(true),
            idle: Mutex::new(HashMap::new()),
            acquires: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
        }
    }
}

impl MockPool {
    /// Empty pool that accepts releases.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make later releases succeed or be declined.
    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }

    /// Number of idle sessions stored for `descriptor`.
    #[must_use]
    pub fn idle(&self, descriptor: &str) -> usize {
        self.idle.lock().get(descriptor).map_or(0, Vec::len)
    }

    /// Number of `acquire` calls.
    #[must_use]
    pub fn acquires(&self) -> usize {
        self.acquires.load(Ordering::SeqCst)
    }

    /// Number of `release` calls, accepted or not.
    #[must_use]
    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    /// Seed the pool with a session, bypassing the accepting switch.
    pub fn put(&self, descriptor: &str, session: Box<dyn Session>) {
        self.idle
            .lock()
            .entry(descriptor.to_string())
            .or_default()
            .push(session);
    }
}

impl SessionPool for MockPool {
    fn acquire(&self, descriptor: &str) -> Option<Box<dyn Session>> {
        self.acquires.fetch_add(1, Ordering::SeqCst);
        self.idle.lock().get_mut(descriptor).and_then(Vec::pop)
    }

    fn release(
        &self,
        descriptor: &str,
        session: Box<dyn Session>,
    ) -> std::result::Result<(), Box<dyn Session>> {
        self.releases.fetch_add(1, Ordering::SeqCst);
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(session);
        }
        self.put(descriptor, session);
        Ok(())
    }
}
