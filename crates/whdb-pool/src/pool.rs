//! Session pool implementation.
//!
//! Idle sessions are cached per connection descriptor. The pool only stores
//! sessions; opening them and making sure they carry no open transaction is
//! the connection's job.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use whdb_client::{Session, SessionPool};

use crate::config::PoolConfig;
use crate::error::PoolError;

static SHARED: Lazy<Arc<Pool>> = Lazy::new(|| Arc::new(Pool::with_defaults()));

/// A descriptor-keyed cache of idle sessions.
///
/// # Example
///
/// ```rust,ignore
/// use std::sync::Arc;
/// use whdb_pool::Pool;
///
/// let pool = Arc::new(Pool::builder().max_idle_per_descriptor(4).build()?);
///
/// let conn = Connection::builder(descriptor)
///     .factory(factory)
///     .pool(pool.clone())
///     .build()?;
/// ```
pub struct Pool {
    config: PoolConfig,

    /// Whether the pool is closed.
    closed: AtomicBool,

    /// When the pool was created.
    created_at: Instant,

    /// Idle sessions, most recently returned last.
    idle: Mutex<HashMap<String, VecDeque<IdleSession>>>,

    /// Pool metrics.
    metrics: Mutex<PoolMetricsInner>,
}

struct IdleSession {
    session: Box<dyn Session>,
    returned_at: Instant,
}

/// Internal metrics tracking.
#[derive(Debug, Default)]
struct PoolMetricsInner {
    /// Acquisitions served from the cache.
    hits: u64,
    /// Acquisitions that found nothing usable.
    misses: u64,
    /// Sessions taken back.
    releases_accepted: u64,
    /// Sessions refused on release.
    releases_declined: u64,
    /// Sessions closed after sitting idle too long.
    expired: u64,
}

impl Pool {
    /// Create a new pool builder.
    #[must_use]
    pub fn builder() -> PoolBuilder {
        PoolBuilder::new()
    }

    /// Create a new pool with the given configuration.
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;

        tracing::info!(
            max_idle_per_descriptor = config.max_idle_per_descriptor,
            idle_timeout = ?config.idle_timeout,
            enabled = config.enabled,
            "session pool created"
        );

        Ok(Self::from_config(config))
    }

    fn with_defaults() -> Self {
        Self::from_config(PoolConfig::default())
    }

    fn from_config(config: PoolConfig) -> Self {
        Self {
            config,
            closed: AtomicBool::new(false),
            created_at: Instant::now(),
            idle: Mutex::new(HashMap::new()),
            metrics: Mutex::new(PoolMetricsInner::default()),
        }
    }

    /// The process-wide pool, created with default settings on first use.
    #[must_use]
    pub fn shared() -> Arc<Pool> {
        Arc::clone(&SHARED)
    }

    /// Take an idle session for `descriptor`.
    ///
    /// Sessions idle for longer than the configured timeout are never handed
    /// out. They stay queued until [`reap_expired`](Self::reap_expired) or
    /// [`close`](Self::close) closes them on the server.
    pub fn try_acquire(&self, descriptor: &str) -> Result<Option<Box<dyn Session>>, PoolError> {
        if self.is_closed() {
            return Err(PoolError::PoolClosed);
        }

        let (found, stale) = {
            let mut idle = self.idle.lock();
            match idle.get_mut(descriptor) {
                // Newest entry last: if it has expired, every entry has.
                Some(queue) => match queue.back() {
                    Some(entry) if entry.returned_at.elapsed() < self.config.idle_timeout => {
                        let found = queue.pop_back().map(|entry| entry.session);
                        if queue.is_empty() {
                            idle.remove(descriptor);
                        }
                        (found, 0)
                    }
                    _ => (None, queue.len()),
                },
                None => (None, 0),
            }
        };

        {
            let mut metrics = self.metrics.lock();
            if found.is_some() {
                metrics.hits += 1;
            } else {
                metrics.misses += 1;
            }
        }

        if stale > 0 {
            tracing::debug!(count = stale, "idle sessions expired; left for reaping");
        }
        tracing::trace!(hit = found.is_some(), "session pool lookup");

        Ok(found)
    }

    /// Offer a session to the pool, handing it back when declined.
    pub fn try_release(
        &self,
        descriptor: &str,
        session: Box<dyn Session>,
    ) -> Result<(), Box<dyn Session>> {
        if self.is_closed() || !self.config.enabled {
            self.record_release(false);
            return Err(session);
        }

        {
            let mut idle = self.idle.lock();
            let queue = idle.entry(descriptor.to_string()).or_default();
            if queue.len() < self.config.max_idle_per_descriptor as usize {
                queue.push_back(IdleSession {
                    session,
                    returned_at: Instant::now(),
                });
                drop(idle);
                self.record_release(true);
                return Ok(());
            }
        }

        tracing::debug!(
            max_idle_per_descriptor = self.config.max_idle_per_descriptor,
            "idle queue full; declining session"
        );
        self.record_release(false);
        Err(session)
    }

    fn record_release(&self, accepted: bool) {
        let mut metrics = self.metrics.lock();
        if accepted {
            metrics.releases_accepted += 1;
        } else {
            metrics.releases_declined += 1;
        }
    }

    /// Close every idle session whose idle timeout has passed.
    ///
    /// Returns the number of sessions closed.
    pub async fn reap_expired(&self) -> usize {
        let expired: Vec<Box<dyn Session>> = {
            let mut idle = self.idle.lock();
            let timeout = self.config.idle_timeout;
            let mut expired = Vec::new();
            for queue in idle.values_mut() {
                let (stale, fresh): (VecDeque<_>, VecDeque<_>) = queue
                    .drain(..)
                    .partition(|entry| entry.returned_at.elapsed() >= timeout);
                *queue = fresh;
                expired.extend(stale.into_iter().map(|entry| entry.session));
            }
            idle.retain(|_, queue| !queue.is_empty());
            expired
        };

        self.metrics.lock().expired += expired.len() as u64;
        let count = expired.len();
        close_all(expired).await;
        count
    }

    /// Spawn a task that calls [`reap_expired`](Self::reap_expired) every
    /// `interval` until `cancel` fires or the pool is closed.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn_reaper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tokio::time::sleep(interval) => {}
                    () = cancel.cancelled() => break,
                }
                if pool.is_closed() {
                    break;
                }
                let reaped = pool.reap_expired().await;
                if reaped > 0 {
                    tracing::debug!(reaped, "reaper closed expired idle sessions");
                }
            }
            tracing::debug!("session pool reaper stopped");
        })
    }

    /// Get the current pool status.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let idle = self.idle.lock();
        PoolStatus {
            idle: idle.values().map(|queue| queue.len() as u32).sum(),
            descriptors: idle.len() as u32,
            max_idle_per_descriptor: self.config.max_idle_per_descriptor,
        }
    }

    /// Get pool metrics.
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        let inner = self.metrics.lock();
        PoolMetrics {
            hits: inner.hits,
            misses: inner.misses,
            releases_accepted: inner.releases_accepted,
            releases_declined: inner.releases_declined,
            expired: inner.expired,
            uptime: self.created_at.elapsed(),
        }
    }

    /// Close the pool and every idle session in it.
    ///
    /// Later releases are declined and later acquisitions find nothing.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);

        let sessions: Vec<Box<dyn Session>> = {
            let mut idle = self.idle.lock();
            idle.drain()
                .flat_map(|(_, queue)| queue.into_iter().map(|entry| entry.session))
                .collect()
        };

        let count = sessions.len();
        close_all(sessions).await;
        tracing::info!(closed_sessions = count, "session pool closed");
    }

    /// Check if the pool is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Get the pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }
}

async fn close_all(sessions: Vec<Box<dyn Session>>) {
    let cancel = CancellationToken::new();
    for mut session in sessions {
        if let Err(e) = session.close(&cancel).await {
            tracing::warn!(session_id = ?session.id(), error = %e, "failed to close idle session");
        }
    }
}

impl SessionPool for Pool {
    fn acquire(&self, descriptor: &str) -> Option<Box<dyn Session>> {
        match self.try_acquire(descriptor) {
            Ok(found) => found,
            Err(e) => {
                tracing::debug!(error = %e, "session pool unavailable");
                None
            }
        }
    }

    fn release(
        &self,
        descriptor: &str,
        session: Box<dyn Session>,
    ) -> Result<(), Box<dyn Session>> {
        self.try_release(descriptor, session)
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.config)
            .field("closed", &self.is_closed())
            .field("status", &self.status())
            .finish()
    }
}

/// Builder for creating a session pool.
///
/// # Example
///
/// ```rust,ignore
/// let pool = Pool::builder()
///     .max_idle_per_descriptor(4)
///     .idle_timeout(Duration::from_secs(60))
///     .build()?;
/// ```
pub struct PoolBuilder {
    pool_config: PoolConfig,
}

impl PoolBuilder {
    /// Create a new pool builder with default settings.
    pub fn new() -> Self {
        Self {
            pool_config: PoolConfig::default(),
        }
    }

    /// Set the pool configuration.
    #[must_use]
    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    /// Set the maximum number of idle sessions per descriptor.
    #[must_use]
    pub fn max_idle_per_descriptor(mut self, count: u32) -> Self {
        self.pool_config.max_idle_per_descriptor = count;
        self
    }

    /// Set the idle session timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.pool_config.idle_timeout = timeout;
        self
    }

    /// Enable or disable caching.
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.pool_config.enabled = enabled;
        self
    }

    /// Build the pool.
    pub fn build(self) -> Result<Pool, PoolError> {
        Pool::new(self.pool_config)
    }
}

impl Default for PoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Status information about the pool.
#[derive(Debug, Clone, Copy)]
pub struct PoolStatus {
    /// Number of idle sessions across all descriptors.
    pub idle: u32,
    /// Number of descriptors with at least one idle session.
    pub descriptors: u32,
    /// Maximum idle sessions kept per descriptor.
    pub max_idle_per_descriptor: u32,
}

/// Metrics collected from the pool.
#[derive(Debug, Clone)]
pub struct PoolMetrics {
    /// Acquisitions served from the cache.
    pub hits: u64,
    /// Acquisitions that found nothing usable.
    pub misses: u64,
    /// Sessions taken back on release.
    pub releases_accepted: u64,
    /// Sessions refused on release.
    pub releases_declined: u64,
    /// Sessions discarded after their idle timeout.
    pub expired: u64,
    /// Time since pool creation.
    pub uptime: std::time::Duration,
}

impl PoolMetrics {
    /// Fraction of acquisitions served from the cache (0.0 to 1.0).
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use whdb_client::Result;

    use super::*;

    #[derive(Debug)]
    struct StubSession {
        id: String,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Session for StubSession {
        async fn open(&mut self, _cancel: &CancellationToken) -> Result<()> {
            Ok(())
        }

        async fn close(&mut self, _cancel: &CancellationToken) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
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
            Some(&self.id)
        }

        fn server_version(&self) -> Option<&str> {
            None
        }

        fn database(&self) -> Option<&str> {
            None
        }

        fn connect_timeout(&self) -> Duration {
            Duration::from_secs(1)
        }
    }

    fn stub(id: &str, closes: &Arc<AtomicUsize>) -> Box<dyn Session> {
        Box::new(StubSession {
            id: id.to_string(),
            closes: Arc::clone(closes),
        })
    }

    #[test]
    fn test_release_then_acquire_same_descriptor() {
        let closes = Arc::new(AtomicUsize::new(0));
        let pool = Pool::builder().build().unwrap();

        assert!(pool.acquire("account=a1").is_none());
        assert!(pool.release("account=a1", stub("s1", &closes)).is_ok());
        assert!(pool.acquire("account=a2").is_none());

        let session = pool.acquire("account=a1").unwrap();
        assert_eq!(session.id(), Some("s1"));

        let metrics = pool.metrics();
        assert_eq!(metrics.hits, 1);
        assert_eq!(metrics.misses, 2);
        assert_eq!(metrics.releases_accepted, 1);
        assert!((metrics.hit_rate() - 1.0 / 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_most_recent_session_is_reused_first() {
        let closes = Arc::new(AtomicUsize::new(0));
        let pool = Pool::builder().build().unwrap();

        pool.release("d", stub("old", &closes)).unwrap();
        pool.release("d", stub("new", &closes)).unwrap();

        assert_eq!(pool.acquire("d").unwrap().id(), Some("new"));
        assert_eq!(pool.acquire("d").unwrap().id(), Some("old"));
        assert_eq!(pool.status().idle, 0);
        assert_eq!(pool.status().descriptors, 0);
    }

    #[test]
    fn test_release_declined_when_full() {
        let closes = Arc::new(AtomicUsize::new(0));
        let pool = Pool::builder().max_idle_per_descriptor(1).build().unwrap();

        assert!(pool.release("d", stub("s1", &closes)).is_ok());
        let declined = pool.release("d", stub("s2", &closes)).unwrap_err();
        assert_eq!(declined.id(), Some("s2"));
        assert_eq!(pool.metrics().releases_declined, 1);
    }

    #[test]
    fn test_disabled_pool_declines() {
        let closes = Arc::new(AtomicUsize::new(0));
        let pool = Pool::builder().enabled(false).build().unwrap();

        assert!(pool.release("d", stub("s1", &closes)).is_err());
        assert!(pool.acquire("d").is_none());
    }

    #[test]
    fn test_expired_sessions_are_skipped() {
        let closes = Arc::new(AtomicUsize::new(0));
        let pool = Pool::builder()
            .idle_timeout(Duration::from_millis(1))
            .build()
            .unwrap();

        pool.release("d", stub("s1", &closes)).unwrap();
        std::thread::sleep(Duration::from_millis(5));

        assert!(pool.acquire("d").is_none());
        assert_eq!(pool.metrics().misses, 1);

        // Still queued, not dropped: reaping closes it on the server.
        assert_eq!(pool.status().idle, 1);
        assert_eq!(closes.load(Ordering::SeqCst), 0);

        assert_eq!(tokio_test::block_on(pool.reap_expired()), 1);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(pool.metrics().expired, 1);
        assert_eq!(pool.status().idle, 0);
    }

    #[test]
    fn test_fresh_session_served_while_older_ones_expire() {
        let closes = Arc::new(AtomicUsize::new(0));
        let pool = Pool::builder()
            .idle_timeout(Duration::from_millis(50))
            .build()
            .unwrap();

        pool.release("d", stub("old", &closes)).unwrap();
        std::thread::sleep(Duration::from_millis(60));
        pool.release("d", stub("new", &closes)).unwrap();

        assert_eq!(pool.acquire("d").unwrap().id(), Some("new"));
        assert!(pool.acquire("d").is_none());

        assert_eq!(tokio_test::block_on(pool.reap_expired()), 1);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reaper_closes_expired_sessions_until_cancelled() {
        let closes = Arc::new(AtomicUsize::new(0));
        let pool = Arc::new(
            Pool::builder()
                .idle_timeout(Duration::from_millis(1))
                .build()
                .unwrap(),
        );
        let cancel = CancellationToken::new();
        let reaper = pool.spawn_reaper(Duration::from_millis(5), cancel.clone());

        pool.release("d", stub("s1", &closes)).unwrap();
        for _ in 0..200 {
            if closes.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(pool.status().idle, 0);

        cancel.cancel();
        reaper.await.unwrap();
    }

    #[test]
    fn test_reap_expired_closes_sessions() {
        let closes = Arc::new(AtomicUsize::new(0));
        let pool = Pool::builder()
            .idle_timeout(Duration::from_millis(1))
            .build()
            .unwrap();

        pool.release("d1", stub("s1", &closes)).unwrap();
        pool.release("d2", stub("s2", &closes)).unwrap();
        std::thread::sleep(Duration::from_millis(5));

        let reaped = tokio_test::block_on(pool.reap_expired());
        assert_eq!(reaped, 2);
        assert_eq!(closes.load(Ordering::SeqCst), 2);
        assert_eq!(pool.status().idle, 0);
    }

    #[test]
    fn test_close_closes_idle_sessions_and_declines_later_releases() {
        let closes = Arc::new(AtomicUsize::new(0));
        let pool = Pool::builder().build().unwrap();

        pool.release("d", stub("s1", &closes)).unwrap();
        pool.release("d", stub("s2", &closes)).unwrap();

        tokio_test::block_on(pool.close());
        assert!(pool.is_closed());
        assert_eq!(closes.load(Ordering::SeqCst), 2);

        assert!(pool.release("d", stub("s3", &closes)).is_err());
        assert!(matches!(pool.try_acquire("d"), Err(PoolError::PoolClosed)));
    }

    #[test]
    fn test_builder_fluent() {
        let builder = Pool::builder()
            .max_idle_per_descriptor(3)
            .idle_timeout(Duration::from_secs(30))
            .enabled(false);

        assert_eq!(builder.pool_config.max_idle_per_descriptor, 3);
        assert_eq!(builder.pool_config.idle_timeout, Duration::from_secs(30));
        assert!(!builder.pool_config.enabled);
    }

    #[test]
    fn test_shared_pool_is_singleton() {
        assert!(Arc::ptr_eq(&Pool::shared(), &Pool::shared()));
    }
}
