//! Test doubles shared by the unit tests

use crate::driver::{LockDriver, MemoryLockDriver};
use crate::error::{LockError, Result};
use crate::executor::{QueryError, QueryExecutor, SqlParam, SqlValue};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// Query executor answering from a script, recording every query it sees
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    responses: Mutex<VecDeque<std::result::Result<SqlValue, QueryError>>>,
    fallback: Option<SqlValue>,
    calls: Mutex<Vec<(String, Vec<SqlParam>)>>,
}

impl ScriptedExecutor {
    /// Answer with `responses` in order, then fail every further query
    pub fn new(
        responses: impl IntoIterator<Item = std::result::Result<SqlValue, QueryError>>,
    ) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            ..Default::default()
        }
    }

    /// Answer every query with `value`
    pub fn repeating(value: SqlValue) -> Self {
        Self {
            fallback: Some(value),
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<(String, Vec<SqlParam>)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl QueryExecutor for ScriptedExecutor {
    async fn query_scalar(
        &self,
        sql: &str,
        params: &[SqlParam],
    ) -> std::result::Result<SqlValue, QueryError> {
        self.calls
            .lock()
            .unwrap()
            .push((sql.to_string(), params.to_vec()));

        if let Some(response) = self.responses.lock().unwrap().pop_front() {
            return response;
        }

        match &self.fallback {
            Some(value) => Ok(value.clone()),
            None => Err(QueryError::RowCount {
                sql: sql.to_string(),
                count: 0,
            }),
        }
    }
}

/// Driver wrapping a [`MemoryLockDriver`] that records every call and can be
/// told to misbehave
#[derive(Debug)]
pub struct RecordingDriver {
    inner: MemoryLockDriver,
    calls: Mutex<Vec<String>>,
    fail_release: bool,
    slow_timeouts: bool,
    timeout_delay: Option<Duration>,
}

impl RecordingDriver {
    pub fn new(inner: MemoryLockDriver) -> Self {
        Self {
            inner,
            calls: Mutex::new(Vec::new()),
            fail_release: false,
            slow_timeouts: false,
            timeout_delay: None,
        }
    }

    /// Every release fails with a release error
    pub fn failing_release(mut self) -> Self {
        self.fail_release = true;
        self
    }

    /// Bounded waits consume their whole timeout before succeeding
    pub fn slow_timeouts(mut self) -> Self {
        self.slow_timeouts = true;
        self
    }

    /// Bounded waits take `delay` before succeeding, whatever their timeout
    pub fn delayed_timeouts(mut self, delay: Duration) -> Self {
        self.timeout_delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl LockDriver for RecordingDriver {
    async fn acquire(&self, lock_name: &str) -> Result<()> {
        self.record(format!("acquire {}", lock_name));
        self.inner.acquire(lock_name).await
    }

    async fn try_acquire(&self, lock_name: &str) -> Result<bool> {
        self.record(format!("try_acquire {}", lock_name));
        self.inner.try_acquire(lock_name).await
    }

    async fn try_acquire_with_timeout(&self, lock_name: &str, timeout_seconds: u64) -> Result<bool> {
        self.record(format!("try_acquire_with_timeout {} {}", lock_name, timeout_seconds));
        let delay = match self.timeout_delay {
            Some(delay) => Some(delay),
            None if self.slow_timeouts => Some(Duration::from_secs(timeout_seconds)),
            None => None,
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
            return self.inner.try_acquire(lock_name).await;
        }
        self.inner.try_acquire_with_timeout(lock_name, timeout_seconds).await
    }

    async fn release(&self, lock_name: &str) -> Result<()> {
        self.record(format!("release {}", lock_name));
        if self.fail_release {
            return Err(LockError::release(lock_name, "Connection lost."));
        }
        self.inner.release(lock_name).await
    }
}
