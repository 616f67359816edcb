use super::AdvisoryLock;
use crate::driver::LockDriver;
use crate::error::{LockError, Result};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// A lock over one name
///
/// Cloning is cheap; clones share the driver, and so the connection.
#[derive(Clone)]
pub struct Lock {
    driver: Arc<dyn LockDriver>,
    name: String,
}

impl Lock {
    pub fn new(driver: Arc<dyn LockDriver>, name: impl Into<String>) -> Self {
        Self {
            driver,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lock").field("name", &self.name).finish_non_exhaustive()
    }
}

pub(crate) fn check_timeout(timeout_seconds: u64) -> Result<()> {
    if timeout_seconds == 0 {
        return Err(LockError::InvalidArgument(
            "Timeout must be a positive number of seconds.".to_string(),
        ));
    }
    Ok(())
}

#[async_trait]
impl AdvisoryLock for Lock {
    async fn acquire(&self) -> Result<()> {
        self.driver.acquire(&self.name).await?;
        debug!(lock_name = %self.name, "Lock acquired");
        Ok(())
    }

    async fn try_acquire(&self) -> Result<bool> {
        self.driver.try_acquire(&self.name).await
    }

    async fn try_acquire_with_timeout(&self, timeout_seconds: u64) -> Result<bool> {
        check_timeout(timeout_seconds)?;
        self.driver
            .try_acquire_with_timeout(&self.name, timeout_seconds)
            .await
    }

    async fn release(&self) -> Result<()> {
        self.driver.release(&self.name).await?;
        debug!(lock_name = %self.name, "Lock released");
        Ok(())
    }
}
