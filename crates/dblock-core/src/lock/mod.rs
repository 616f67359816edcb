//! User-facing locks
//!
//! Every lock implements the four [`AdvisoryLock`] primitives. The derived
//! behaviors (`wait`, `synchronize` and their variants) come for free through
//! [`AdvisoryLockExt`], so [`Lock`], [`MultiLock`] and any user lock share
//! the same implementation.
//!
//! A lock object is a handle over a name (or a set of names) and a driver.
//! It keeps no "held" flag of its own: whether a lock is held is the
//! backend's business.

mod factory;
mod multi;
mod single;

pub use factory::LockFactory;
pub use multi::MultiLock;
pub use single::Lock;

use crate::error::{LockError, Result, SynchronizeError};
use crate::result::SynchronizeResult;
use async_trait::async_trait;
use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tracing::warn;

/// The four lock primitives
///
/// `timeout_seconds` is a whole number of seconds and must be positive.
/// Implementations report a zero timeout as [`LockError::InvalidArgument`]
/// without touching the backend.
#[async_trait]
pub trait AdvisoryLock: Send + Sync {
    /// Acquire the lock, waiting as long as needed
    async fn acquire(&self) -> Result<()>;

    /// Try to acquire the lock without waiting
    ///
    /// Returns `Ok(false)` when the lock is held elsewhere.
    async fn try_acquire(&self) -> Result<bool>;

    /// Try to acquire the lock, waiting at most `timeout_seconds`
    async fn try_acquire_with_timeout(&self, timeout_seconds: u64) -> Result<bool>;

    /// Release the lock
    async fn release(&self) -> Result<()>;
}

#[async_trait]
impl<L: AdvisoryLock + ?Sized> AdvisoryLock for Box<L> {
    async fn acquire(&self) -> Result<()> {
        (**self).acquire().await
    }

    async fn try_acquire(&self) -> Result<bool> {
        (**self).try_acquire().await
    }

    async fn try_acquire_with_timeout(&self, timeout_seconds: u64) -> Result<bool> {
        (**self).try_acquire_with_timeout(timeout_seconds).await
    }

    async fn release(&self) -> Result<()> {
        (**self).release().await
    }
}

/// Behaviors derived from the [`AdvisoryLock`] primitives
///
/// In the `synchronize` family the lock is released on every exit path of
/// the task: success, error and panic. A future dropped while the task is
/// running cannot release; the lock then stays held until the connection
/// closes.
pub trait AdvisoryLockExt: AdvisoryLock {
    /// Wait until nobody holds the lock, without keeping it
    ///
    /// Acquires and immediately releases. Acquire and release errors are
    /// reported as [`LockError::Wait`].
    fn wait(&self) -> impl Future<Output = Result<()>> + Send;

    /// Like [`wait`](Self::wait), giving up after `timeout_seconds`
    ///
    /// Returns whether the lock became free in time.
    fn try_wait_with_timeout(&self, timeout_seconds: u64) -> impl Future<Output = Result<bool>> + Send;

    /// Run `task` while holding the lock, waiting as long as needed for it
    fn synchronize<T, E, F, Fut>(
        &self,
        task: F,
    ) -> impl Future<Output = std::result::Result<T, SynchronizeError<E>>> + Send
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = std::result::Result<T, E>> + Send,
        T: Send,
        E: Send;

    /// Run `task` while holding the lock, if the lock is free right now
    fn try_synchronize<T, E, F, Fut>(
        &self,
        task: F,
    ) -> impl Future<Output = std::result::Result<SynchronizeResult<T>, SynchronizeError<E>>> + Send
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = std::result::Result<T, E>> + Send,
        T: Send,
        E: Send;

    /// Run `task` while holding the lock, if it can be acquired within
    /// `timeout_seconds`
    fn try_synchronize_with_timeout<T, E, F, Fut>(
        &self,
        timeout_seconds: u64,
        task: F,
    ) -> impl Future<Output = std::result::Result<SynchronizeResult<T>, SynchronizeError<E>>> + Send
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = std::result::Result<T, E>> + Send,
        T: Send,
        E: Send;
}

impl<L: AdvisoryLock + ?Sized> AdvisoryLockExt for L {
    fn wait(&self) -> impl Future<Output = Result<()>> + Send {
        async move {
            self.acquire().await.map_err(waiting)?;
            self.release().await.map_err(waiting)
        }
    }

    fn try_wait_with_timeout(&self, timeout_seconds: u64) -> impl Future<Output = Result<bool>> + Send {
        async move {
            if !self
                .try_acquire_with_timeout(timeout_seconds)
                .await
                .map_err(waiting)?
            {
                return Ok(false);
            }
            self.release().await.map_err(waiting)?;
            Ok(true)
        }
    }

    fn synchronize<T, E, F, Fut>(
        &self,
        task: F,
    ) -> impl Future<Output = std::result::Result<T, SynchronizeError<E>>> + Send
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = std::result::Result<T, E>> + Send,
        T: Send,
        E: Send,
    {
        async move {
            self.acquire().await?;
            run_locked(self, task).await
        }
    }

    fn try_synchronize<T, E, F, Fut>(
        &self,
        task: F,
    ) -> impl Future<Output = std::result::Result<SynchronizeResult<T>, SynchronizeError<E>>> + Send
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = std::result::Result<T, E>> + Send,
        T: Send,
        E: Send,
    {
        async move {
            if !self.try_acquire().await? {
                return Ok(SynchronizeResult::Failure);
            }
            run_locked(self, task).await.map(SynchronizeResult::Success)
        }
    }

    fn try_synchronize_with_timeout<T, E, F, Fut>(
        &self,
        timeout_seconds: u64,
        task: F,
    ) -> impl Future<Output = std::result::Result<SynchronizeResult<T>, SynchronizeError<E>>> + Send
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = std::result::Result<T, E>> + Send,
        T: Send,
        E: Send,
    {
        async move {
            if !self.try_acquire_with_timeout(timeout_seconds).await? {
                return Ok(SynchronizeResult::Failure);
            }
            run_locked(self, task).await.map(SynchronizeResult::Success)
        }
    }
}

/// Invalid arguments are the caller's fault and pass through unwrapped.
fn waiting(err: LockError) -> LockError {
    match err {
        LockError::InvalidArgument(_) => err,
        other => LockError::wait(other),
    }
}

/// Run `task` on an acquired lock, then release it
async fn run_locked<L, T, E, F, Fut>(lock: &L, task: F) -> std::result::Result<T, SynchronizeError<E>>
where
    L: AdvisoryLock + ?Sized,
    F: FnOnce() -> Fut + Send,
    Fut: Future<Output = std::result::Result<T, E>> + Send,
{
    let outcome = AssertUnwindSafe(async move { task().await })
        .catch_unwind()
        .await;

    let released = lock.release().await;

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(panic) => {
            if let Err(e) = released {
                warn!(error = %e, "Failed to release lock after the task panicked");
            }
            std::panic::resume_unwind(panic);
        }
    };

    match (outcome, released) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(release)) => Err(SynchronizeError::Lock(release)),
        (Err(task), Ok(())) => Err(SynchronizeError::Task(task)),
        (Err(task), Err(release)) => {
            warn!(error = %release, "Failed to release lock after the task failed");
            Err(SynchronizeError::ReleaseAfterTask { release, task })
        }
    }
}
