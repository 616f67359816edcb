//! dblock Core Library
//!
//! Named cross-process locks on top of database advisory locks. Processes
//! that share a database coordinate on logical resource names without any
//! lock state outside the database connection.
//!
//! This crate provides:
//! - Single-name locks and atomic multi-name locks with ordered acquisition
//! - `wait` and `synchronize` behaviors shared by every lock
//! - Backend drivers for MySQL/MariaDB (`GET_LOCK()`), PostgreSQL
//!   (`pg_advisory_lock()`) and an in-process lock table
//! - Configuration from environment variables or TOML
//!
//! ```no_run
//! use dblock_core::prelude::*;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let connected = dblock_core::config::connect(&DriverConfig::from_env()?).await?;
//! let factory = LockFactory::new(connected.driver);
//!
//! let lock = factory.create_multi_lock(["invoice:7", "customer:3"])?;
//! let total = lock
//!     .synchronize(|| async { Ok::<_, std::io::Error>(42) })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod driver;
pub mod error;
pub mod executor;
pub mod keys;
pub mod lock;
pub mod result;

#[cfg(test)]
mod testing;

pub use error::{LockError, LockErrorKind, Result, SynchronizeError};
pub use lock::{AdvisoryLock, AdvisoryLockExt, Lock, LockFactory, MultiLock};
pub use result::SynchronizeResult;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{DriverConfig, DriverKind};
    pub use crate::driver::LockDriver;
    pub use crate::error::{LockError, LockErrorKind, Result, SynchronizeError};
    pub use crate::lock::{AdvisoryLock, AdvisoryLockExt, Lock, LockFactory, MultiLock};
    pub use crate::result::SynchronizeResult;
}
