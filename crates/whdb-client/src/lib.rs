//! # whdb-client
//!
//! Connection lifecycle engine for the whdb data-warehouse driver.
//!
//! A [`Connection`] acquires an authenticated [`Session`] from a
//! [`SessionPool`] or opens a fresh one, and on close hands it back to the
//! pool, rolling back any transaction left open first.
//!
//! ## Features
//!
//! - **Blocking and async**: one implementation behind both entry points
//! - **Cancellation**: `CancellationToken` support for open and close
//! - **Transaction-safe pooling**: dirty sessions are rolled back or closed
//! - **Binding coordination**: a shared mutex and stage-created flag for bulk binding
//!
//! ## Example
//!
//! ```rust,ignore
//! use tokio_util::sync::CancellationToken;
//! use whdb_client::Connection;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let conn = Connection::builder("account=xy12345;user=loader;password=secret;")
//!         .factory(MySessionFactory::default())
//!         .pool(whdb_pool::Pool::shared())
//!         .build()?;
//!
//!     let cancel = CancellationToken::new();
//!     conn.open_async(&cancel).await?;
//!     println!("server version: {:?}", conn.server_version());
//!     conn.close_async(&cancel).await?;
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod binding;
pub mod config;
pub mod connection;
pub mod error;
pub mod instrumentation;
mod operation;
pub mod session;
pub mod state;
pub mod transaction;

// Re-export commonly used types
pub use binding::BindingCoordination;
pub use config::Config;
pub use connection::{Connection, ConnectionBuilder};
pub use error::{Error, ErrorCode, Result};
pub use session::{NoPool, Session, SessionFactory, SessionPool};
pub use state::ConnectionState;
pub use tokio_util::sync::CancellationToken;
pub use transaction::PoolEligibility;
