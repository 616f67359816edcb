//! Single-scalar query execution
//!
//! Lock drivers talk to the database through [`QueryExecutor`], which runs a
//! parameterized query and returns exactly one scalar value. The sqlx-backed
//! executors wrap one dedicated connection each, never a pool: advisory locks
//! belong to the connection that took them, so every call for a given lock
//! holder must go through the same connection.

use async_trait::async_trait;
use sqlx::mysql::{MySql, MySqlConnectOptions, MySqlConnection, MySqlRow};
use sqlx::postgres::{PgConnectOptions, PgConnection, PgRow, Postgres};
use sqlx::{Connection, Row, TypeInfo, ValueRef};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::trace;

/// A bound query parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlParam {
    I32(i32),
    I64(i64),
    Text(String),
}

/// A scalar value returned by a query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Text(s) => write!(f, "'{}'", s.replace('\'', "\\'")),
        }
    }
}

/// Query errors
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("An error occurred while executing the query \"{sql}\": {source}")]
    Execution {
        sql: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("Query \"{sql}\" returned {count} rows, expected 1.")]
    RowCount { sql: String, count: usize },

    #[error("Query \"{sql}\" returned {count} columns, expected 1.")]
    ColumnCount { sql: String, count: usize },

    #[error("Query \"{sql}\" returned a value of unsupported type {type_name}.")]
    UnsupportedType { sql: String, type_name: String },
}

impl QueryError {
    fn execution(sql: &str) -> impl FnOnce(sqlx::Error) -> Self + '_ {
        move |source| Self::Execution {
            sql: sql.to_string(),
            source,
        }
    }
}

/// Executes a parameterized query returning exactly one row of one column
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Run `sql` with `params` and return the single scalar it produced
    ///
    /// Fails if the query fails, or if the result set is not exactly one row
    /// and one column.
    async fn query_scalar(&self, sql: &str, params: &[SqlParam]) -> Result<SqlValue, QueryError>;
}

#[async_trait]
impl<E: QueryExecutor + ?Sized> QueryExecutor for Arc<E> {
    async fn query_scalar(&self, sql: &str, params: &[SqlParam]) -> Result<SqlValue, QueryError> {
        (**self).query_scalar(sql, params).await
    }
}

/// Take the only row of a result set
fn single_row<R: Row>(sql: &str, rows: Vec<R>) -> Result<R, QueryError> {
    let count = rows.len();
    let mut rows = rows.into_iter();

    let row = match (rows.next(), rows.next()) {
        (Some(row), None) => row,
        _ => {
            return Err(QueryError::RowCount {
                sql: sql.to_string(),
                count,
            });
        }
    };

    if row.len() != 1 {
        return Err(QueryError::ColumnCount {
            sql: sql.to_string(),
            count: row.len(),
        });
    }

    Ok(row)
}

/// Executor over a single PostgreSQL connection
#[derive(Debug)]
pub struct PostgresExecutor {
    connection: Mutex<PgConnection>,
}

impl PostgresExecutor {
    /// Wrap an already-open connection
    pub fn new(connection: PgConnection) -> Self {
        Self {
            connection: Mutex::new(connection),
        }
    }

    /// Open a dedicated connection to `url`
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        Ok(Self::new(PgConnection::connect(url).await?))
    }

    /// Open a dedicated connection with explicit options
    pub async fn connect_with(options: &PgConnectOptions) -> Result<Self, sqlx::Error> {
        Ok(Self::new(PgConnection::connect_with(options).await?))
    }

    /// Server version string, as reported by `version()`
    pub async fn server_version(&self) -> Result<String, QueryError> {
        Ok(match self.query_scalar("SELECT version()", &[]).await? {
            SqlValue::Text(version) => version,
            other => other.to_string(),
        })
    }

    /// Close the connection, releasing every advisory lock it still holds
    pub async fn close(self) -> Result<(), sqlx::Error> {
        self.connection.into_inner().close().await
    }
}

#[async_trait]
impl QueryExecutor for PostgresExecutor {
    async fn query_scalar(&self, sql: &str, params: &[SqlParam]) -> Result<SqlValue, QueryError> {
        let mut query = sqlx::query::<Postgres>(sql);
        for param in params {
            query = match param {
                SqlParam::I32(v) => query.bind(*v),
                SqlParam::I64(v) => query.bind(*v),
                SqlParam::Text(v) => query.bind(v.clone()),
            };
        }

        trace!(sql = %sql, params = ?params, "Executing query");

        let mut conn = self.connection.lock().await;
        let rows = query
            .fetch_all(&mut *conn)
            .await
            .map_err(QueryError::execution(sql))?;

        let row = single_row(sql, rows)?;
        decode_postgres(sql, &row)
    }
}

fn decode_postgres(sql: &str, row: &PgRow) -> Result<SqlValue, QueryError> {
    let raw = row.try_get_raw(0).map_err(QueryError::execution(sql))?;
    if raw.is_null() {
        return Ok(SqlValue::Null);
    }
    let type_name = raw.type_info().name().to_string();

    let value = match type_name.as_str() {
        "BOOL" => SqlValue::Bool(row.try_get::<bool, _>(0).map_err(QueryError::execution(sql))?),
        "INT2" => SqlValue::Int(i64::from(
            row.try_get::<i16, _>(0).map_err(QueryError::execution(sql))?,
        )),
        "INT4" => SqlValue::Int(i64::from(
            row.try_get::<i32, _>(0).map_err(QueryError::execution(sql))?,
        )),
        "INT8" => SqlValue::Int(row.try_get::<i64, _>(0).map_err(QueryError::execution(sql))?),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" => {
            SqlValue::Text(row.try_get::<String, _>(0).map_err(QueryError::execution(sql))?)
        }
        // pg_advisory_lock() returns void
        "VOID" => SqlValue::Null,
        _ => {
            return Err(QueryError::UnsupportedType {
                sql: sql.to_string(),
                type_name: type_name.clone(),
            });
        }
    };

    Ok(value)
}

/// Executor over a single MySQL or MariaDB connection
#[derive(Debug)]
pub struct MySqlExecutor {
    connection: Mutex<MySqlConnection>,
}

impl MySqlExecutor {
    /// Wrap an already-open connection
    pub fn new(connection: MySqlConnection) -> Self {
        Self {
            connection: Mutex::new(connection),
        }
    }

    /// Open a dedicated connection to `url`
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        Ok(Self::new(MySqlConnection::connect(url).await?))
    }

    /// Open a dedicated connection with explicit options
    pub async fn connect_with(options: &MySqlConnectOptions) -> Result<Self, sqlx::Error> {
        Ok(Self::new(MySqlConnection::connect_with(options).await?))
    }

    /// Server version string, as reported by `VERSION()`
    pub async fn server_version(&self) -> Result<String, QueryError> {
        Ok(match self.query_scalar("SELECT VERSION()", &[]).await? {
            SqlValue::Text(version) => version,
            other => other.to_string(),
        })
    }

    /// Close the connection, releasing every named lock it still holds
    pub async fn close(self) -> Result<(), sqlx::Error> {
        self.connection.into_inner().close().await
    }
}

#[async_trait]
impl QueryExecutor for MySqlExecutor {
    async fn query_scalar(&self, sql: &str, params: &[SqlParam]) -> Result<SqlValue, QueryError> {
        let mut query = sqlx::query::<MySql>(sql);
        for param in params {
            query = match param {
                SqlParam::I32(v) => query.bind(*v),
                SqlParam::I64(v) => query.bind(*v),
                SqlParam::Text(v) => query.bind(v.clone()),
            };
        }

        trace!(sql = %sql, params = ?params, "Executing query");

        let mut conn = self.connection.lock().await;
        let rows = query
            .fetch_all(&mut *conn)
            .await
            .map_err(QueryError::execution(sql))?;

        let row = single_row(sql, rows)?;
        decode_mysql(sql, &row)
    }
}

fn decode_mysql(sql: &str, row: &MySqlRow) -> Result<SqlValue, QueryError> {
    let raw = row.try_get_raw(0).map_err(QueryError::execution(sql))?;
    if raw.is_null() {
        return Ok(SqlValue::Null);
    }
    let type_name = raw.type_info().name().to_string();

    if type_name == "BOOLEAN" {
        return Ok(SqlValue::Bool(
            row.try_get::<bool, _>(0).map_err(QueryError::execution(sql))?,
        ));
    }

    if type_name.contains("INT") {
        if type_name.ends_with("UNSIGNED") {
            let value = row.try_get::<u64, _>(0).map_err(QueryError::execution(sql))?;
            return Ok(match i64::try_from(value) {
                Ok(v) => SqlValue::Int(v),
                Err(_) => SqlValue::Text(value.to_string()),
            });
        }
        return Ok(SqlValue::Int(
            row.try_get::<i64, _>(0).map_err(QueryError::execution(sql))?,
        ));
    }

    // Strings, and anything else the server is willing to hand over as text
    row.try_get::<String, _>(0)
        .map(SqlValue::Text)
        .map_err(|_| QueryError::UnsupportedType {
            sql: sql.to_string(),
            type_name,
        })
}
