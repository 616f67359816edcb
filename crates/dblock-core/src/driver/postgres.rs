//! PostgreSQL driver using session-level advisory locks
//!
//! Postgres has no lock timeout primitive, so bounded waits are emulated by
//! polling `pg_try_advisory_lock()`.
//!
//! <https://www.postgresql.org/docs/17/functions-admin.html#FUNCTIONS-ADVISORY-LOCKS>

use super::LockDriver;
use crate::error::{LockError, Result};
use crate::executor::{PostgresExecutor, QueryExecutor, SqlParam, SqlValue};
use crate::keys::postgres_key;
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

/// Default interval between two polls of a bounded wait
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Driver over `pg_advisory_lock()` and friends
#[derive(Debug)]
pub struct PostgresLockDriver<E = PostgresExecutor> {
    executor: E,
    poll_interval: Duration,
}

impl<E: QueryExecutor> PostgresLockDriver<E> {
    pub fn new(executor: E) -> Self {
        Self {
            executor,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Set the interval between polls in `try_acquire_with_timeout()`
    ///
    /// The interval must be positive.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Result<Self> {
        if poll_interval.is_zero() {
            return Err(LockError::InvalidArgument(
                "Poll interval must be positive.".to_string(),
            ));
        }
        self.poll_interval = poll_interval;
        Ok(self)
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    async fn try_advisory_lock(&self, lock_name: &str, key: (i32, i32)) -> Result<bool> {
        debug!(lock_name = %lock_name, key = ?key, "Calling pg_try_advisory_lock()");

        let result = self
            .executor
            .query_scalar("SELECT pg_try_advisory_lock($1, $2)", &key_params(key))
            .await
            .map_err(|e| {
                LockError::acquire_caused(lock_name, "Error while calling pg_try_advisory_lock()", e)
            })?;

        match result {
            SqlValue::Bool(acquired) => Ok(acquired),
            other => {
                warn!(lock_name = %lock_name, result = %other, "Unexpected result from pg_try_advisory_lock()");
                Err(LockError::acquire(
                    lock_name,
                    format!("Unexpected result from pg_try_advisory_lock(): {}", other),
                ))
            }
        }
    }
}

fn key_params((high, low): (i32, i32)) -> [SqlParam; 2] {
    [SqlParam::I32(high), SqlParam::I32(low)]
}

#[async_trait]
impl<E: QueryExecutor> LockDriver for PostgresLockDriver<E> {
    async fn acquire(&self, lock_name: &str) -> Result<()> {
        let key = postgres_key(lock_name);
        debug!(lock_name = %lock_name, key = ?key, "Calling pg_advisory_lock()");

        let result = self
            .executor
            .query_scalar("SELECT pg_advisory_lock($1, $2)", &key_params(key))
            .await
            .map_err(|e| {
                LockError::acquire_caused(lock_name, "Error while calling pg_advisory_lock()", e)
            })?;

        match result {
            // void
            SqlValue::Null => Ok(()),
            SqlValue::Text(ref s) if s.is_empty() => Ok(()),
            other => {
                warn!(lock_name = %lock_name, result = %other, "Unexpected result from pg_advisory_lock()");
                Err(LockError::acquire(
                    lock_name,
                    format!("Unexpected result from pg_advisory_lock(): {}", other),
                ))
            }
        }
    }

    async fn try_acquire(&self, lock_name: &str) -> Result<bool> {
        self.try_advisory_lock(lock_name, postgres_key(lock_name)).await
    }

    async fn try_acquire_with_timeout(&self, lock_name: &str, timeout_seconds: u64) -> Result<bool> {
        let start = Instant::now();
        let timeout = Duration::from_secs(timeout_seconds);
        let key = postgres_key(lock_name);
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            if self.try_advisory_lock(lock_name, key).await? {
                return Ok(true);
            }

            // stop on the deadline, never on an attempt count
            if start.elapsed() >= timeout {
                debug!(
                    lock_name = %lock_name,
                    attempts = attempts,
                    elapsed_ms = start.elapsed().as_millis(),
                    "Timed out polling for advisory lock"
                );
                return Ok(false);
            }

            sleep(self.poll_interval).await;
        }
    }

    async fn release(&self, lock_name: &str) -> Result<()> {
        let key = postgres_key(lock_name);
        debug!(lock_name = %lock_name, key = ?key, "Calling pg_advisory_unlock()");

        let result = self
            .executor
            .query_scalar("SELECT pg_advisory_unlock($1, $2)", &key_params(key))
            .await
            .map_err(|e| {
                LockError::release_caused(lock_name, "Error while calling pg_advisory_unlock()", e)
            })?;

        match result {
            SqlValue::Bool(true) => Ok(()),
            // Postgres does not tell "never held" apart from "held by another session"
            SqlValue::Bool(false) => Err(LockError::release(lock_name, "The lock was not acquired.")),
            other => {
                warn!(lock_name = %lock_name, result = %other, "Unexpected result from pg_advisory_unlock()");
                Err(LockError::release(
                    lock_name,
                    format!("Unexpected result from pg_advisory_unlock(): {}", other),
                ))
            }
        }
    }
}
