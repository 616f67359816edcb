//! MySQL and MariaDB driver using `GET_LOCK()` / `RELEASE_LOCK()`
//!
//! <https://dev.mysql.com/doc/refman/8.4/en/locking-functions.html#function_get-lock>

use super::LockDriver;
use crate::error::{LockError, Result};
use crate::executor::{MySqlExecutor, QueryExecutor, SqlParam, SqlValue};
use crate::keys::mysql_key;
use async_trait::async_trait;
use tracing::{debug, warn};

/// Server family behind a MySQL-protocol connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MysqlFlavor {
    #[default]
    Mysql,
    Mariadb,
}

impl MysqlFlavor {
    /// Timeout passed to `GET_LOCK()` for an unbounded wait
    pub fn infinite_timeout(&self) -> i64 {
        match self {
            Self::Mysql => -1,
            // MariaDB has no infinite timeout; 2 billion seconds is about 63
            // years and still a valid 32-bit signed integer.
            Self::Mariadb => 2_000_000_000,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mysql => "MySQL",
            Self::Mariadb => "MariaDB",
        }
    }
}

/// Driver over `GET_LOCK()`, which supports timeouts natively
#[derive(Debug)]
pub struct MysqlLockDriver<E = MySqlExecutor> {
    executor: E,
    flavor: MysqlFlavor,
}

impl<E: QueryExecutor> MysqlLockDriver<E> {
    pub fn new(executor: E, flavor: MysqlFlavor) -> Self {
        Self { executor, flavor }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn flavor(&self) -> MysqlFlavor {
        self.flavor
    }

    /// Returns whether the lock was acquired within `timeout_seconds`
    ///
    /// Zero means "do not wait".
    async fn get_lock(&self, lock_name: &str, timeout_seconds: i64) -> Result<bool> {
        debug!(
            lock_name = %lock_name,
            timeout_seconds = timeout_seconds,
            "Calling GET_LOCK()"
        );

        let result = self
            .executor
            .query_scalar(
                "SELECT GET_LOCK(?, ?)",
                &[
                    SqlParam::Text(mysql_key(lock_name)),
                    SqlParam::I64(timeout_seconds),
                ],
            )
            .await
            .map_err(|e| LockError::acquire_caused(lock_name, "Error while calling GET_LOCK()", e))?;

        match result {
            SqlValue::Int(1) => Ok(true),
            SqlValue::Int(0) => Ok(false),
            SqlValue::Text(ref s) if s == "1" => Ok(true),
            SqlValue::Text(ref s) if s == "0" => Ok(false),
            SqlValue::Null => Err(LockError::acquire(
                lock_name,
                format!(
                    "{}'s GET_LOCK() returned NULL, which indicates an error such as running out of memory, \
                     or the thread was killed with mysqladmin kill.",
                    self.flavor.as_str()
                ),
            )),
            other => {
                warn!(lock_name = %lock_name, result = %other, "Unexpected result from GET_LOCK()");
                Err(LockError::acquire(
                    lock_name,
                    format!("Unexpected result from GET_LOCK(): {}", other),
                ))
            }
        }
    }
}

#[async_trait]
impl<E: QueryExecutor> LockDriver for MysqlLockDriver<E> {
    async fn acquire(&self, lock_name: &str) -> Result<()> {
        if self.get_lock(lock_name, self.flavor.infinite_timeout()).await? {
            return Ok(());
        }

        Err(LockError::acquire(
            lock_name,
            "Got false from GET_LOCK() with infinite timeout, which should not happen.",
        ))
    }

    async fn try_acquire(&self, lock_name: &str) -> Result<bool> {
        self.get_lock(lock_name, 0).await
    }

    async fn try_acquire_with_timeout(&self, lock_name: &str, timeout_seconds: u64) -> Result<bool> {
        let timeout = i64::try_from(timeout_seconds).unwrap_or(i64::MAX);
        self.get_lock(lock_name, timeout).await
    }

    async fn release(&self, lock_name: &str) -> Result<()> {
        debug!(lock_name = %lock_name, "Calling RELEASE_LOCK()");

        let result = self
            .executor
            .query_scalar("SELECT RELEASE_LOCK(?)", &[SqlParam::Text(mysql_key(lock_name))])
            .await
            .map_err(|e| {
                LockError::release_caused(lock_name, "Error while calling RELEASE_LOCK()", e)
            })?;

        match result {
            SqlValue::Int(1) => Ok(()),
            SqlValue::Text(ref s) if s == "1" => Ok(()),
            SqlValue::Int(0) => Err(LockError::release(
                lock_name,
                "The lock exists, but was not established by this thread.",
            )),
            SqlValue::Text(ref s) if s == "0" => Err(LockError::release(
                lock_name,
                "The lock exists, but was not established by this thread.",
            )),
            SqlValue::Null => Err(LockError::release(lock_name, "The lock does not exist.")),
            other => {
                warn!(lock_name = %lock_name, result = %other, "Unexpected result from RELEASE_LOCK()");
                Err(LockError::release(
                    lock_name,
                    format!("Unexpected result from RELEASE_LOCK(): {}", other),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LockErrorKind;
    use crate::executor::QueryError;
    use crate::testing::ScriptedExecutor;
    use std::sync::Arc;

    fn driver(
        responses: Vec<std::result::Result<SqlValue, QueryError>>,
        flavor: MysqlFlavor,
    ) -> (MysqlLockDriver<Arc<ScriptedExecutor>>, Arc<ScriptedExecutor>) {
        let executor = Arc::new(ScriptedExecutor::new(responses));
        (MysqlLockDriver::new(executor.clone(), flavor), executor)
    }

    #[tokio::test]
    async fn test_acquire_uses_infinite_timeout() {
        let (mysql, mysql_exec) = driver(vec![Ok(SqlValue::Int(1))], MysqlFlavor::Mysql);
        mysql.acquire("foo").await.expect("acquire should succeed");

        let (mariadb, mariadb_exec) = driver(vec![Ok(SqlValue::Int(1))], MysqlFlavor::Mariadb);
        mariadb.acquire("foo").await.expect("acquire should succeed");

        let calls = mysql_exec.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "SELECT GET_LOCK(?, ?)");
        assert_eq!(
            calls[0].1,
            vec![SqlParam::Text(mysql_key("foo")), SqlParam::I64(-1)]
        );

        assert_eq!(mariadb_exec.calls()[0].1[1], SqlParam::I64(2_000_000_000));
    }

    #[tokio::test]
    async fn test_acquire_rejects_false_from_infinite_wait() {
        let (driver, _) = driver(vec![Ok(SqlValue::Int(0))], MysqlFlavor::Mysql);

        let err = driver.acquire("foo").await.unwrap_err();
        assert_eq!(err.kind(), LockErrorKind::Acquire);
        assert!(err.to_string().contains("infinite timeout"));
    }

    #[tokio::test]
    async fn test_try_acquire_decodes_integer_and_string_results() {
        let (driver, executor) = driver(
            vec![
                Ok(SqlValue::Int(1)),
                Ok(SqlValue::Int(0)),
                Ok(SqlValue::Text("1".to_string())),
                Ok(SqlValue::Text("0".to_string())),
            ],
            MysqlFlavor::Mysql,
        );

        assert!(driver.try_acquire("foo").await.unwrap());
        assert!(!driver.try_acquire("foo").await.unwrap());
        assert!(driver.try_acquire("foo").await.unwrap());
        assert!(!driver.try_acquire("foo").await.unwrap());

        assert!(executor.calls().iter().all(|(_, params)| params[1] == SqlParam::I64(0)));
    }

    #[tokio::test]
    async fn test_try_acquire_with_timeout_passes_timeout() {
        let (driver, executor) = driver(vec![Ok(SqlValue::Int(0))], MysqlFlavor::Mysql);

        assert!(!driver.try_acquire_with_timeout("foo", 5).await.unwrap());
        assert_eq!(executor.calls()[0].1[1], SqlParam::I64(5));
    }

    #[tokio::test]
    async fn test_get_lock_null_is_an_error() {
        let (driver, _) = driver(vec![Ok(SqlValue::Null)], MysqlFlavor::Mariadb);

        let err = driver.try_acquire("foo").await.unwrap_err();
        assert_eq!(err.kind(), LockErrorKind::Acquire);
        assert!(err.to_string().contains("MariaDB's GET_LOCK() returned NULL"));
    }

    #[tokio::test]
    async fn test_unexpected_get_lock_result_is_reported_verbatim() {
        let (driver, _) = driver(vec![Ok(SqlValue::Int(2))], MysqlFlavor::Mysql);

        let err = driver.try_acquire("foo").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cannot acquire lock with name \"foo\": Unexpected result from GET_LOCK(): 2"
        );
    }

    #[tokio::test]
    async fn test_query_failure_becomes_acquire_error() {
        let (driver, _) = driver(
            vec![Err(QueryError::Execution {
                sql: "SELECT GET_LOCK(?, ?)".to_string(),
                source: sqlx::Error::PoolTimedOut,
            })],
            MysqlFlavor::Mysql,
        );

        let err = driver.try_acquire("foo").await.unwrap_err();
        assert_eq!(err.kind(), LockErrorKind::Acquire);
        assert!(err.to_string().contains("Error while calling GET_LOCK()"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[tokio::test]
    async fn test_release_distinguishes_failure_reasons() {
        let (driver, executor) = driver(
            vec![
                Ok(SqlValue::Int(1)),
                Ok(SqlValue::Int(0)),
                Ok(SqlValue::Null),
                Ok(SqlValue::Text("maybe".to_string())),
            ],
            MysqlFlavor::Mysql,
        );

        driver.release("foo").await.expect("release should succeed");

        let not_owner = driver.release("foo").await.unwrap_err();
        assert!(not_owner.to_string().contains("was not established by this thread"));

        let missing = driver.release("foo").await.unwrap_err();
        assert!(missing.to_string().contains("The lock does not exist."));

        let unexpected = driver.release("foo").await.unwrap_err();
        assert!(
            unexpected
                .to_string()
                .contains("Unexpected result from RELEASE_LOCK(): 'maybe'")
        );

        for err in [not_owner, missing, unexpected] {
            assert_eq!(err.kind(), LockErrorKind::Release);
        }
        assert_eq!(executor.calls()[0].0, "SELECT RELEASE_LOCK(?)");
    }
}
