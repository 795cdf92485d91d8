//! Store and change feed configuration
//!
//! Both structs follow the same shape: `Default` from [`crate::constants`],
//! `from_env()` reading `RAINBOT_*` variables, and `with_*` builders for
//! tests and embedders.

use crate::constants::{
    DEFAULT_DB_CONNECT_TIMEOUT_SECS, DEFAULT_DB_HOST, DEFAULT_DB_NAME, DEFAULT_DB_POOL_SIZE,
    DEFAULT_DB_PORT, DEFAULT_DB_USER, DEFAULT_FEED_BACKOFF_MULTIPLIER,
    DEFAULT_FEED_INITIAL_BACKOFF_MS, DEFAULT_FEED_MAX_BACKOFF_MS, DEFAULT_GUILDS_TABLE,
    DEFAULT_OPERATION_TIMEOUT_MS, DEFAULT_USERS_TABLE,
};
use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime};
use rainbot_core::{RainbotResult, StorageError};
use std::str::FromStr;
use std::time::Duration;
use tokio_postgres::NoTls;

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn invalid(field: &str, reason: impl Into<String>) -> StorageError {
    StorageError::InvalidConfig {
        field: field.to_string(),
        reason: reason.into(),
    }
}

/// Check that `name` can be spliced into SQL as a bare identifier.
pub(crate) fn validate_identifier(field: &str, name: &str) -> Result<(), StorageError> {
    let mut chars = name.chars();
    let starts_well = chars
        .next()
        .map(|c| c.is_ascii_lowercase() || c == '_')
        .unwrap_or(false);
    if !starts_well || !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_') {
        return Err(invalid(
            field,
            format!("{name:?} is not a lowercase SQL identifier"),
        ));
    }
    if name.len() > 48 {
        return Err(invalid(field, format!("{name:?} is longer than 48 bytes")));
    }
    Ok(())
}

// ============================================================================
// STORE CONFIGURATION
// ============================================================================

/// Remote store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// PostgreSQL host
    pub host: String,
    /// PostgreSQL port
    pub port: u16,
    /// Database name
    pub dbname: String,
    /// Database user
    pub user: String,
    /// Database password
    pub password: String,
    /// Maximum pool size
    pub max_size: usize,
    /// Time allowed to obtain or open a connection
    pub connect_timeout: Duration,
    /// Deadline for a single store operation issued by the tenant/user stores
    pub operation_timeout: Duration,
    /// Table holding guild config documents
    pub guilds_table: String,
    /// Table holding user documents
    pub users_table: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_DB_HOST.to_string(),
            port: DEFAULT_DB_PORT,
            dbname: DEFAULT_DB_NAME.to_string(),
            user: DEFAULT_DB_USER.to_string(),
            password: String::new(),
            max_size: DEFAULT_DB_POOL_SIZE,
            connect_timeout: Duration::from_secs(DEFAULT_DB_CONNECT_TIMEOUT_SECS),
            operation_timeout: Duration::from_millis(DEFAULT_OPERATION_TIMEOUT_MS),
            guilds_table: DEFAULT_GUILDS_TABLE.to_string(),
            users_table: DEFAULT_USERS_TABLE.to_string(),
        }
    }
}

impl StoreConfig {
    /// Create a store configuration from environment variables.
    ///
    /// # Environment Variables
    /// - `RAINBOT_DB_HOST`, `RAINBOT_DB_PORT`, `RAINBOT_DB_NAME`,
    ///   `RAINBOT_DB_USER`, `RAINBOT_DB_PASSWORD`
    /// - `RAINBOT_DB_POOL_SIZE`: maximum pooled connections (default: 16)
    /// - `RAINBOT_DB_CONNECT_TIMEOUT_SECS`: connection timeout (default: 10)
    /// - `RAINBOT_STORE_TIMEOUT_MS`: per-operation deadline (default: 5000)
    /// - `RAINBOT_GUILDS_TABLE` / `RAINBOT_USERS_TABLE`: table names
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("RAINBOT_DB_HOST").unwrap_or_else(|_| DEFAULT_DB_HOST.to_string()),
            port: env_or("RAINBOT_DB_PORT", DEFAULT_DB_PORT),
            dbname: std::env::var("RAINBOT_DB_NAME")
                .unwrap_or_else(|_| DEFAULT_DB_NAME.to_string()),
            user: std::env::var("RAINBOT_DB_USER")
                .unwrap_or_else(|_| DEFAULT_DB_USER.to_string()),
            password: std::env::var("RAINBOT_DB_PASSWORD").unwrap_or_default(),
            max_size: env_or("RAINBOT_DB_POOL_SIZE", DEFAULT_DB_POOL_SIZE),
            connect_timeout: Duration::from_secs(env_or(
                "RAINBOT_DB_CONNECT_TIMEOUT_SECS",
                DEFAULT_DB_CONNECT_TIMEOUT_SECS,
            )),
            operation_timeout: Duration::from_millis(env_or(
                "RAINBOT_STORE_TIMEOUT_MS",
                DEFAULT_OPERATION_TIMEOUT_MS,
            )),
            guilds_table: std::env::var("RAINBOT_GUILDS_TABLE")
                .unwrap_or_else(|_| DEFAULT_GUILDS_TABLE.to_string()),
            users_table: std::env::var("RAINBOT_USERS_TABLE")
                .unwrap_or_else(|_| DEFAULT_USERS_TABLE.to_string()),
        }
    }

    /// Set the per-operation deadline.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Set the guild and user table names.
    pub fn with_tables(mut self, guilds: impl Into<String>, users: impl Into<String>) -> Self {
        self.guilds_table = guilds.into();
        self.users_table = users.into();
        self
    }

    /// Reject configurations that could never work.
    pub fn validate(&self) -> RainbotResult<()> {
        validate_identifier("guilds_table", &self.guilds_table)?;
        validate_identifier("users_table", &self.users_table)?;
        if self.guilds_table == self.users_table {
            return Err(invalid("users_table", "must differ from guilds_table").into());
        }
        if self.max_size == 0 {
            return Err(invalid("max_size", "pool needs at least one connection").into());
        }
        if self.operation_timeout.is_zero() {
            return Err(invalid("operation_timeout", "must be greater than zero").into());
        }
        Ok(())
    }

    fn deadpool_config(&self) -> Config {
        let mut cfg = Config::new();
        cfg.host = Some(self.host.clone());
        cfg.port = Some(self.port);
        cfg.dbname = Some(self.dbname.clone());
        cfg.user = Some(self.user.clone());
        cfg.password = Some(self.password.clone());
        cfg.connect_timeout = Some(self.connect_timeout);
        cfg.application_name = Some("rainbot".to_string());

        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });

        let mut pool = PoolConfig::new(self.max_size);
        pool.timeouts.wait = Some(self.connect_timeout);
        pool.timeouts.create = Some(self.connect_timeout);
        cfg.pool = Some(pool);
        cfg
    }

    /// Create a connection pool from this configuration.
    pub fn create_pool(&self) -> RainbotResult<Pool> {
        self.validate()?;
        let pool = self
            .deadpool_config()
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| StorageError::unavailable(format!("Failed to create pool: {}", e)))?;
        Ok(pool)
    }

    /// Connection settings for dedicated (non-pooled) sessions such as LISTEN.
    pub fn session_config(&self) -> RainbotResult<tokio_postgres::Config> {
        self.deadpool_config()
            .get_pg_config()
            .map_err(|e| invalid("database", e.to_string()).into())
    }
}

// ============================================================================
// CHANGE FEED CONFIGURATION
// ============================================================================

/// Reconnect policy for the change feed listener.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedConfig {
    /// Delay before the first reconnect attempt
    pub initial_backoff: Duration,
    /// Ceiling for the reconnect delay
    pub max_backoff: Duration,
    /// Factor the delay grows by after each consecutive failure
    pub backoff_multiplier: f64,
    /// Give up after this many consecutive failures; `None` retries forever
    pub max_consecutive_failures: Option<u32>,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(DEFAULT_FEED_INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(DEFAULT_FEED_MAX_BACKOFF_MS),
            backoff_multiplier: DEFAULT_FEED_BACKOFF_MULTIPLIER,
            max_consecutive_failures: None,
        }
    }
}

impl FeedConfig {
    /// Create a feed configuration from environment variables.
    ///
    /// # Environment Variables
    /// - `RAINBOT_FEED_INITIAL_BACKOFF_MS` (default: 500)
    /// - `RAINBOT_FEED_MAX_BACKOFF_MS` (default: 30000)
    /// - `RAINBOT_FEED_BACKOFF_MULTIPLIER` (default: 2.0)
    /// - `RAINBOT_FEED_MAX_FAILURES`: 0 or unset retries forever
    pub fn from_env() -> Self {
        let max_failures: u32 = env_or("RAINBOT_FEED_MAX_FAILURES", 0);
        Self {
            initial_backoff: Duration::from_millis(env_or(
                "RAINBOT_FEED_INITIAL_BACKOFF_MS",
                DEFAULT_FEED_INITIAL_BACKOFF_MS,
            )),
            max_backoff: Duration::from_millis(env_or(
                "RAINBOT_FEED_MAX_BACKOFF_MS",
                DEFAULT_FEED_MAX_BACKOFF_MS,
            )),
            backoff_multiplier: env_or(
                "RAINBOT_FEED_BACKOFF_MULTIPLIER",
                DEFAULT_FEED_BACKOFF_MULTIPLIER,
            ),
            max_consecutive_failures: (max_failures > 0).then_some(max_failures),
        }
    }

    /// Short delays for tests and local development.
    pub fn development() -> Self {
        Self {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_consecutive_failures: None,
        }
    }

    /// Set the initial and maximum reconnect delays.
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Set the backoff growth factor.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Bound the number of consecutive failures before the feed gives up.
    /// Zero removes the bound.
    pub fn with_max_failures(mut self, failures: u32) -> Self {
        self.max_consecutive_failures = (failures > 0).then_some(failures);
        self
    }

    /// Delay to use after `current`, capped at `max_backoff`.
    pub fn next_backoff(&self, current: Duration) -> Duration {
        let multiplier = if self.backoff_multiplier.is_finite() && self.backoff_multiplier >= 1.0 {
            self.backoff_multiplier
        } else {
            1.0
        };
        let grown = current.as_nanos() as f64 * multiplier;
        if grown >= self.max_backoff.as_nanos() as f64 {
            self.max_backoff
        } else {
            Duration::from_nanos(grown as u64)
        }
    }
}
