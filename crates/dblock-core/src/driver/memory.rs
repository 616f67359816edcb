//! In-process lock backend
//!
//! [`MemoryLockServer`] plays the role of the database: it owns the lock
//! table, and every [`MemoryLockDriver`] obtained from [`MemoryLockServer::connect`]
//! acts as one connection to it. Locks behave like the database ones: they
//! are owned by a connection, reentrant with a hold count, and all released
//! when the connection (the driver) is dropped.

use super::LockDriver;
use crate::error::{LockError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
struct Holder {
    session: Uuid,
    count: u32,
}

#[derive(Debug, Default)]
struct ServerState {
    locks: Mutex<HashMap<String, Holder>>,
    released: Notify,
}

impl ServerState {
    fn locks(&self) -> MutexGuard<'_, HashMap<String, Holder>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared lock table for in-process connections
#[derive(Debug, Clone, Default)]
pub struct MemoryLockServer {
    state: Arc<ServerState>,
}

impl MemoryLockServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new connection to this server
    pub fn connect(&self) -> MemoryLockDriver {
        MemoryLockDriver {
            state: self.state.clone(),
            session: Uuid::new_v4(),
        }
    }

    /// Number of distinct lock names currently held by any connection
    pub fn held_count(&self) -> usize {
        self.state.locks().len()
    }

    /// Whether `lock_name` is currently held by any connection
    pub fn is_held(&self, lock_name: &str) -> bool {
        self.state.locks().contains_key(lock_name)
    }
}

/// One connection to a [`MemoryLockServer`]
#[derive(Debug)]
pub struct MemoryLockDriver {
    state: Arc<ServerState>,
    session: Uuid,
}

impl MemoryLockDriver {
    /// Identifier of this connection
    pub fn session_id(&self) -> Uuid {
        self.session
    }

    fn try_take(&self, lock_name: &str) -> bool {
        let mut locks = self.state.locks();

        match locks.get_mut(lock_name) {
            Some(holder) if holder.session == self.session => {
                holder.count += 1;
                true
            }
            Some(_) => false,
            None => {
                locks.insert(
                    lock_name.to_string(),
                    Holder {
                        session: self.session,
                        count: 1,
                    },
                );
                true
            }
        }
    }

    async fn take(&self, lock_name: &str) {
        loop {
            // Register for wake-ups before checking, so a release between the
            // check and the await is not missed.
            let notified = self.state.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.try_take(lock_name) {
                return;
            }

            notified.await;
        }
    }
}

#[async_trait]
impl LockDriver for MemoryLockDriver {
    async fn acquire(&self, lock_name: &str) -> Result<()> {
        debug!(lock_name = %lock_name, session = %self.session, "Acquiring in-memory lock");
        self.take(lock_name).await;
        Ok(())
    }

    async fn try_acquire(&self, lock_name: &str) -> Result<bool> {
        let acquired = self.try_take(lock_name);
        debug!(lock_name = %lock_name, session = %self.session, acquired, "Tried in-memory lock");
        Ok(acquired)
    }

    async fn try_acquire_with_timeout(&self, lock_name: &str, timeout_seconds: u64) -> Result<bool> {
        let timeout = Duration::from_secs(timeout_seconds);
        let acquired = tokio::time::timeout(timeout, self.take(lock_name)).await.is_ok();
        debug!(
            lock_name = %lock_name,
            session = %self.session,
            acquired,
            timeout_seconds,
            "Waited for in-memory lock"
        );
        Ok(acquired)
    }

    async fn release(&self, lock_name: &str) -> Result<()> {
        let released = {
            let mut locks = self.state.locks();

            let holder = match locks.get_mut(lock_name) {
                Some(holder) => holder,
                None => return Err(LockError::release(lock_name, "The lock does not exist.")),
            };

            if holder.session != self.session {
                return Err(LockError::release(
                    lock_name,
                    "The lock exists, but was not established by this connection.",
                ));
            }

            holder.count -= 1;
            if holder.count == 0 {
                locks.remove(lock_name);
                true
            } else {
                false
            }
        };

        debug!(lock_name = %lock_name, session = %self.session, released, "Released in-memory lock");

        if released {
            self.state.released.notify_waiters();
        }
        Ok(())
    }
}

impl Drop for MemoryLockDriver {
    fn drop(&mut self) {
        let released = {
            let mut locks = self.state.locks();
            let before = locks.len();
            locks.retain(|_, holder| holder.session != self.session);
            before - locks.len()
        };

        if released > 0 {
            debug!(session = %self.session, released, "Connection closed, released its locks");
            self.state.released.notify_waiters();
        }
    }
}
