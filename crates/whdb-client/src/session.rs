//! Collaborator contracts consumed by the connection engine.
//!
//! A [`Session`] is one authenticated handle to the remote service. Sessions
//! are created by a [`SessionFactory`] and cached between uses by a
//! [`SessionPool`]. The engine owns a session exclusively while a connection
//! is open and hands ownership to the pool, or closes it, on close.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::Result;

/// An authenticated session against the remote service.
///
/// Every I/O operation takes a cancellation token. Implementations report
/// cancellation as [`Error::Cancelled`](crate::Error::Cancelled); any other
/// error is a fault.
#[async_trait]
pub trait Session: Send + fmt::Debug {
    /// Establish and authenticate the session.
    async fn open(&mut self, cancel: &CancellationToken) -> Result<()>;

    /// Close the session on the server.
    async fn close(&mut self, cancel: &CancellationToken) -> Result<()>;

    /// Execute a statement and return the first column of the first row,
    /// if any.
    async fn execute_simple(
        &mut self,
        sql: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>>;

    /// Server-assigned session identifier, once opened.
    fn id(&self) -> Option<&str>;

    /// Version of the server, once opened.
    fn server_version(&self) -> Option<&str>;

    /// Current database of the session.
    fn database(&self) -> Option<&str>;

    /// Login timeout the session was configured with.
    fn connect_timeout(&self) -> Duration;
}

/// Creates unopened sessions for a configuration.
pub trait SessionFactory: Send + Sync {
    /// Construct a new session. The engine opens it.
    fn create(&self, config: &Config) -> Result<Box<dyn Session>>;
}

impl<F> SessionFactory for F
where
    F: Fn(&Config) -> Result<Box<dyn Session>> + Send + Sync,
{
    fn create(&self, config: &Config) -> Result<Box<dyn Session>> {
        (self)(config)
    }
}

/// Idle-session cache keyed by connection descriptor.
pub trait SessionPool: Send + Sync {
    /// Take an idle session for `descriptor`, if one is cached.
    fn acquire(&self, descriptor: &str) -> Option<Box<dyn Session>>;

    /// Offer a session back to the pool.
    ///
    /// On decline the session is handed back and the caller must close it.
    fn release(
        &self,
        descriptor: &str,
        session: Box<dyn Session>,
    ) -> std::result::Result<(), Box<dyn Session>>;
}

/// Pool used when pooling is disabled: never has a session, never takes one.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPool;

impl SessionPool for NoPool {
    fn acquire(&self, _descriptor: &str) -> Option<Box<dyn Session>> {
        None
    }

    fn release(
        &self,
        _descriptor: &str,
        session: Box<dyn Session>,
    ) -> std::result::Result<(), Box<dyn Session>> {
        Err(session)
    }
}
