//! Atomic lock over several names
//!
//! Names are always taken in ascending byte order. Two multi locks with
//! overlapping names therefore request the shared names in the same order,
//! which rules out lock-order deadlocks between them.

use super::AdvisoryLock;
use super::single::check_timeout;
use crate::driver::LockDriver;
use crate::error::{LockError, Result};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A lock over two or more names, acquired all together or not at all
#[derive(Clone)]
pub struct MultiLock {
    driver: Arc<dyn LockDriver>,
    names: Vec<String>,
}

impl MultiLock {
    /// Create a lock over `names`
    ///
    /// Duplicates are dropped. At least two distinct names are required.
    pub fn new<I, S>(driver: Arc<dyn LockDriver>, names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut names: Vec<String> = names.into_iter().map(Into::into).collect();
        names.sort();
        names.dedup();

        if names.len() < 2 {
            return Err(LockError::InvalidArgument(format!(
                "A multi lock needs at least two distinct lock names, got {}.",
                names.len()
            )));
        }

        Ok(Self { driver, names })
    }

    /// The names, in acquisition order
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Release the names taken so far by a failed `try_acquire`, newest first
    ///
    /// Every name gets its release attempt. The first failure is reported as
    /// an acquire error of the multi lock.
    async fn roll_back(&self, acquired: &[&str]) -> Result<()> {
        let mut first_error = None;

        for name in acquired.iter().rev() {
            if let Err(e) = self.driver.release(name).await {
                warn!(lock_name = %name, error = %e, "Failed to roll back partially acquired multi lock");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(LockError::multi_acquire("Error while rolling back", e)),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for MultiLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiLock").field("names", &self.names).finish_non_exhaustive()
    }
}

#[async_trait]
impl AdvisoryLock for MultiLock {
    async fn acquire(&self) -> Result<()> {
        // An error midway leaves earlier names held; the state is undefined.
        for name in &self.names {
            self.driver.acquire(name).await?;
        }
        debug!(lock_names = ?self.names, "Multi lock acquired");
        Ok(())
    }

    async fn try_acquire(&self) -> Result<bool> {
        let mut acquired: Vec<&str> = Vec::with_capacity(self.names.len());

        for name in &self.names {
            if !self.driver.try_acquire(name).await? {
                info!(lock_names = ?self.names, blocked_on = %name, "Multi lock busy, rolling back");
                self.roll_back(&acquired).await?;
                return Ok(false);
            }
            acquired.push(name);
        }

        debug!(lock_names = ?self.names, "Multi lock acquired");
        Ok(true)
    }

    async fn try_acquire_with_timeout(&self, timeout_seconds: u64) -> Result<bool> {
        check_timeout(timeout_seconds)?;

        let start = Instant::now();
        let mut acquired: Vec<&str> = Vec::with_capacity(self.names.len());

        for name in &self.names {
            // Whole seconds only: the elapsed time is rounded down, so the
            // total wait can exceed the timeout by less than a second.
            let remaining = timeout_seconds.saturating_sub(start.elapsed().as_secs());

            let got = if remaining == 0 {
                self.driver.try_acquire(name).await?
            } else {
                self.driver.try_acquire_with_timeout(name, remaining).await?
            };

            if !got {
                info!(
                    lock_names = ?self.names,
                    blocked_on = %name,
                    timeout_seconds,
                    "Multi lock timed out, rolling back"
                );
                self.roll_back(&acquired).await?;
                return Ok(false);
            }
            acquired.push(name);
        }

        debug!(lock_names = ?self.names, "Multi lock acquired");
        Ok(true)
    }

    async fn release(&self) -> Result<()> {
        // Stops at the first failure; names after it stay held.
        for name in &self.names {
            self.driver.release(name).await?;
        }
        debug!(lock_names = ?self.names, "Multi lock released");
        Ok(())
    }
}
