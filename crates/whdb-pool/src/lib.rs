//! # whdb-pool
//!
//! Idle session pool for the whdb driver.
//!
//! Sessions are cached under the connection descriptor they were opened
//! with. A [`Connection`](whdb_client::Connection) takes a cached session on
//! open instead of authenticating again, and hands its session back on close
//! once it has made sure no transaction is left open.
//!
//! ## Features
//!
//! - Per-descriptor idle queues, most recently returned session first
//! - Idle timeout: expired sessions are never handed out and are closed by
//!   [`Pool::reap_expired`] or a background [`Pool::spawn_reaper`] task
//! - Per-descriptor cap; releases beyond it are declined
//! - Metrics for hits, misses, releases and expirations
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use whdb_pool::{Pool, PoolConfig};
//!
//! // Using the builder pattern
//! let pool = Pool::builder()
//!     .max_idle_per_descriptor(4)
//!     .idle_timeout(Duration::from_secs(300))
//!     .build()?;
//!
//! // Or the process-wide pool
//! let shared = Pool::shared();
//!
//! // Get metrics
//! let metrics = pool.metrics();
//! println!("Hit rate: {:.2}", metrics.hit_rate());
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod pool;

// Configuration
pub use config::PoolConfig;

// Error types
pub use error::PoolError;

// Pool types
pub use pool::{Pool, PoolBuilder, PoolMetrics, PoolStatus};
