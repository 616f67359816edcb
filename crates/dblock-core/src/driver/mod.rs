//! Backend lock drivers
//!
//! A [`LockDriver`] exposes four primitives over a single lock name. Two
//! backend profiles sit behind the same contract:
//!
//! - **MySQL / MariaDB** (`GET_LOCK()`): one primitive with a native timeout
//!   and a tri-state result.
//! - **PostgreSQL** (`pg_advisory_lock()` family): blocking and non-blocking
//!   boolean primitives only; bounded waits are emulated by polling.
//!
//! In both backends locks belong to the connection and are reentrant with a
//! hold count: a connection that acquired a lock twice must release it twice
//! before another connection can take it. Closing the connection releases
//! every lock it holds. Drivers rely on these backend properties and keep no
//! lock state of their own.

pub mod memory;
pub mod mysql;
pub mod postgres;

use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

pub use memory::{MemoryLockDriver, MemoryLockServer};
pub use mysql::{MysqlFlavor, MysqlLockDriver};
pub use postgres::{DEFAULT_POLL_INTERVAL, PostgresLockDriver};

/// Backend adapter for one connection's advisory locks
#[async_trait]
pub trait LockDriver: Send + Sync {
    /// Acquire the lock, waiting as long as needed
    ///
    /// Never reports "not acquired": a backend answering so to an infinite
    /// wait is a contract violation and is reported as an acquire error.
    async fn acquire(&self, lock_name: &str) -> Result<()>;

    /// Try to acquire the lock without waiting
    async fn try_acquire(&self, lock_name: &str) -> Result<bool>;

    /// Try to acquire the lock, waiting up to `timeout_seconds` (at least 1)
    async fn try_acquire_with_timeout(&self, lock_name: &str, timeout_seconds: u64) -> Result<bool>;

    /// Release the lock once
    ///
    /// Fails if the lock is not held by this connection.
    async fn release(&self, lock_name: &str) -> Result<()>;
}

#[async_trait]
impl<D: LockDriver + ?Sized> LockDriver for Arc<D> {
    async fn acquire(&self, lock_name: &str) -> Result<()> {
        (**self).acquire(lock_name).await
    }

    async fn try_acquire(&self, lock_name: &str) -> Result<bool> {
        (**self).try_acquire(lock_name).await
    }

    async fn try_acquire_with_timeout(&self, lock_name: &str, timeout_seconds: u64) -> Result<bool> {
        (**self).try_acquire_with_timeout(lock_name, timeout_seconds).await
    }

    async fn release(&self, lock_name: &str) -> Result<()> {
        (**self).release(lock_name).await
    }
}
