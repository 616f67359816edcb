//! Driver configuration
//!
//! A [`DriverConfig`] names a backend and how to reach it. It is read from
//! environment variables or from a TOML file, and [`connect`] turns it into a
//! live [`LockDriver`] on a dedicated connection.
//!
//! Environment variables:
//!
//! - `DBLOCK_DRIVER`: `mysql`, `mariadb`, `postgres` or `memory`
//! - `<BACKEND>_HOST`, `<BACKEND>_PORT`, `<BACKEND>_USER`,
//!   `<BACKEND>_PASSWORD`, `<BACKEND>_DATABASE`, where `<BACKEND>` is
//!   `MYSQL`, `MARIADB` or `POSTGRES`
//! - `DBLOCK_DATABASE_URL`: full connection URL, used instead of the parts
//! - `DBLOCK_POLL_INTERVAL_MS`: Postgres polling interval for bounded waits

use crate::driver::{LockDriver, MemoryLockServer, MysqlFlavor, MysqlLockDriver, PostgresLockDriver};
use crate::executor::{MySqlExecutor, PostgresExecutor};
use anyhow::{Context, anyhow, bail};
use serde::{Deserialize, Serialize};
use sqlx::mysql::MySqlConnectOptions;
use sqlx::postgres::PgConnectOptions;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

/// Lock backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    Mysql,
    Mariadb,
    Postgres,
    /// In-process lock table; locks are not shared with other processes
    Memory,
}

impl DriverKind {
    pub const ALL: [DriverKind; 4] = [Self::Mysql, Self::Mariadb, Self::Postgres, Self::Memory];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mysql => "mysql",
            Self::Mariadb => "mariadb",
            Self::Postgres => "postgres",
            Self::Memory => "memory",
        }
    }

    /// Prefix of the connection environment variables
    fn env_prefix(&self) -> Option<&'static str> {
        match self {
            Self::Mysql => Some("MYSQL"),
            Self::Mariadb => Some("MARIADB"),
            Self::Postgres => Some("POSTGRES"),
            Self::Memory => None,
        }
    }

    /// Server family for the MySQL-protocol backends
    pub fn mysql_flavor(&self) -> Option<MysqlFlavor> {
        match self {
            Self::Mysql => Some(MysqlFlavor::Mysql),
            Self::Mariadb => Some(MysqlFlavor::Mariadb),
            Self::Postgres | Self::Memory => None,
        }
    }

    pub fn default_port(&self) -> Option<u16> {
        match self {
            Self::Mysql | Self::Mariadb => Some(3306),
            Self::Postgres => Some(5432),
            Self::Memory => None,
        }
    }

    fn available() -> String {
        Self::ALL
            .iter()
            .map(|kind| kind.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DriverKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                anyhow!(
                    "Unknown driver \"{}\", available drivers: {}",
                    s,
                    Self::available()
                )
            })
    }
}

/// How to reach the lock backend
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverConfig {
    pub driver: DriverKind,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    /// Full connection URL; takes precedence over the individual parts
    pub url: Option<String>,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl DriverConfig {
    pub fn new(driver: DriverKind) -> Self {
        Self {
            driver,
            host: None,
            port: None,
            user: None,
            password: None,
            database: None,
            url: None,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }

    pub fn memory() -> Self {
        Self::new(DriverKind::Memory)
    }

    /// Read the configuration from the process environment
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Read the configuration from `lookup`, which maps an environment
    /// variable name to its value
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let driver: DriverKind = lookup("DBLOCK_DRIVER")
            .ok_or_else(|| {
                anyhow!(
                    "DBLOCK_DRIVER is not set, available drivers: {}",
                    DriverKind::available()
                )
            })?
            .parse()?;

        let mut config = Self::new(driver);
        config.url = lookup("DBLOCK_DATABASE_URL");

        if let Some(prefix) = driver.env_prefix() {
            let var = |name: &str| lookup(&format!("{}_{}", prefix, name));

            config.host = var("HOST");
            config.port = var("PORT")
                .map(|port| {
                    port.parse::<u16>()
                        .with_context(|| format!("Invalid {}_PORT: {}", prefix, port))
                })
                .transpose()?;
            config.user = var("USER");
            config.password = var("PASSWORD");
            config.database = var("DATABASE");
        }

        if let Some(ms) = lookup("DBLOCK_POLL_INTERVAL_MS") {
            config.poll_interval_ms = ms
                .parse()
                .with_context(|| format!("Invalid DBLOCK_POLL_INTERVAL_MS: {}", ms))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load the configuration from a TOML file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: DriverConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every setting the driver needs is present
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.poll_interval_ms == 0 {
            bail!("poll_interval_ms must be positive");
        }

        let Some(prefix) = self.driver.env_prefix() else {
            return Ok(());
        };
        if self.url.is_some() {
            return Ok(());
        }

        let missing: Vec<String> = [
            ("host", &self.host),
            ("user", &self.user),
            ("password", &self.password),
        ]
        .into_iter()
        .filter(|(_, value)| value.is_none())
        .map(|(name, _)| format!("{} ({}_{})", name, prefix, name.to_uppercase()))
        .collect();

        if !missing.is_empty() {
            bail!(
                "Missing settings for the {} driver: {}",
                self.driver,
                missing.join(", ")
            );
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Where the driver connects to, without credentials
    pub fn target(&self) -> String {
        if self.driver == DriverKind::Memory {
            return "in-process lock table".to_string();
        }
        if self.url.is_some() {
            return format!("{} database URL", self.driver);
        }

        let host = self.host.as_deref().unwrap_or("localhost");
        let port = self.port.or(self.driver.default_port()).unwrap_or_default();
        let user = self.user.as_deref().unwrap_or_default();
        let database = self.database.as_deref().unwrap_or_default();
        format!("{}://{}@{}:{}/{}", self.driver, user, host, port, database)
    }

    fn mysql_options(&self) -> MySqlConnectOptions {
        let mut options = MySqlConnectOptions::new()
            .host(self.host.as_deref().unwrap_or("localhost"))
            .port(self.port.unwrap_or(3306));
        if let Some(user) = &self.user {
            options = options.username(user);
        }
        if let Some(password) = &self.password {
            options = options.password(password);
        }
        if let Some(database) = &self.database {
            options = options.database(database);
        }
        options
    }

    fn postgres_options(&self) -> PgConnectOptions {
        let mut options = PgConnectOptions::new()
            .host(self.host.as_deref().unwrap_or("localhost"))
            .port(self.port.unwrap_or(5432));
        if let Some(user) = &self.user {
            options = options.username(user);
        }
        if let Some(password) = &self.password {
            options = options.password(password);
        }
        if let Some(database) = &self.database {
            options = options.database(database);
        }
        options
    }
}

impl fmt::Debug for DriverConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverConfig")
            .field("driver", &self.driver)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("database", &self.database)
            .field("url", &self.url.as_ref().map(|_| "***"))
            .field("poll_interval_ms", &self.poll_interval_ms)
            .finish()
    }
}

/// A connected driver and what is worth telling the user about it
pub struct DriverWithInfo {
    pub driver: Arc<dyn LockDriver>,
    pub info: Vec<String>,
}

impl fmt::Debug for DriverWithInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverWithInfo").field("info", &self.info).finish_non_exhaustive()
    }
}

/// Open a dedicated connection and build the driver for it
pub async fn connect(config: &DriverConfig) -> anyhow::Result<DriverWithInfo> {
    config.validate()?;

    let mut messages = vec![format!("Using {} driver ({})", config.driver, config.target())];

    let driver: Arc<dyn LockDriver> = match config.driver {
        DriverKind::Memory => {
            messages.push("Locks are only shared within this process".to_string());
            Arc::new(MemoryLockServer::new().connect())
        }
        DriverKind::Mysql | DriverKind::Mariadb => {
            let executor = match &config.url {
                Some(url) => MySqlExecutor::connect(url).await,
                None => MySqlExecutor::connect_with(&config.mysql_options()).await,
            }
            .with_context(|| format!("Failed to connect to {}", config.target()))?;

            let version = executor
                .server_version()
                .await
                .context("Failed to query server version")?;
            messages.push(format!("Server version: {}", version));

            let flavor = config.driver.mysql_flavor().unwrap_or_default();
            Arc::new(MysqlLockDriver::new(executor, flavor))
        }
        DriverKind::Postgres => {
            let executor = match &config.url {
                Some(url) => PostgresExecutor::connect(url).await,
                None => PostgresExecutor::connect_with(&config.postgres_options()).await,
            }
            .with_context(|| format!("Failed to connect to {}", config.target()))?;

            let version = executor
                .server_version()
                .await
                .context("Failed to query server version")?;
            messages.push(format!("Server version: {}", version));
            messages.push(format!("Poll interval: {} ms", config.poll_interval_ms));

            Arc::new(PostgresLockDriver::new(executor).with_poll_interval(config.poll_interval())?)
        }
    };

    info!(driver = %config.driver, target = %config.target(), "Connected lock driver");

    Ok(DriverWithInfo {
        driver,
        info: messages,
    })
}
