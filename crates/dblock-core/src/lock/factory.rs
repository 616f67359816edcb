use super::{AdvisoryLock, Lock, MultiLock};
use crate::driver::LockDriver;
use crate::error::{LockError, Result};
use std::fmt;
use std::sync::Arc;

/// Creates locks sharing one driver
///
/// Every lock made by a factory uses the same connection. Locks are
/// reentrant per connection, so two locks from one factory never exclude
/// each other; exclusion needs separate factories over separate connections.
#[derive(Clone)]
pub struct LockFactory {
    driver: Arc<dyn LockDriver>,
}

impl LockFactory {
    pub fn new(driver: Arc<dyn LockDriver>) -> Self {
        Self { driver }
    }

    pub fn from_driver(driver: impl LockDriver + 'static) -> Self {
        Self::new(Arc::new(driver))
    }

    pub fn driver(&self) -> &Arc<dyn LockDriver> {
        &self.driver
    }

    pub fn create_lock(&self, name: impl Into<String>) -> Lock {
        Lock::new(self.driver.clone(), name)
    }

    pub fn create_multi_lock<I, S>(&self, names: I) -> Result<MultiLock>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        MultiLock::new(self.driver.clone(), names)
    }

    /// A [`Lock`] for one distinct name, a [`MultiLock`] for several
    pub fn create<I, S>(&self, names: I) -> Result<Box<dyn AdvisoryLock>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut names: Vec<String> = names.into_iter().map(Into::into).collect();
        names.sort();
        names.dedup();

        match names.len() {
            0 => Err(LockError::InvalidArgument(
                "At least one lock name is required.".to_string(),
            )),
            1 => Ok(Box::new(self.create_lock(names.remove(0)))),
            _ => Ok(Box::new(self.create_multi_lock(names)?)),
        }
    }
}

impl fmt::Debug for LockFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockFactory").finish_non_exhaustive()
    }
}
