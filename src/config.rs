//! Configuration for the resource clients and the `resource-kit` binary.
//!
//! Every resource takes a plain struct: connection fields are required, tunables are
//! optional and fall back to the documented defaults through their `*_or_default()`
//! accessors. Pool sizes scale with the available parallelism of the host.

use crate::db::IsolationLevel;
use crate::error::{KitError, KitResult};
use crate::util::RetryConfig;
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

// Database defaults
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 1;
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 30 * 60;
pub const DEFAULT_DATABASE_MAX_LIFETIME_SECS: u64 = 60 * 60;
pub const DEFAULT_DATABASE_DIAL_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_DATABASE_STATEMENT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_APP_NAME: &str = "resource-kit";

// Cache defaults, shared by the worker broker connection
pub const DEFAULT_CACHE_MIN_CONNECTIONS: u32 = 1;
pub const DEFAULT_CACHE_IDLE_TIMEOUT_SECS: u64 = 30 * 60;
pub const DEFAULT_CACHE_MAX_LIFETIME_SECS: u64 = 60 * 60;
pub const DEFAULT_CACHE_READ_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CACHE_WRITE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CACHE_DIAL_TIMEOUT_SECS: u64 = 30;

// Worker defaults
pub const DEFAULT_WORKER_STOP_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_WORKER_SCHEDULE_RETRY: u32 = 0;
pub const DEFAULT_WORKER_QUEUE: &str = "default";
pub const DEFAULT_WORKER_NAMESPACE: &str = "kit";

// Migrator defaults
pub const DEFAULT_MIGRATIONS_PATH: &str = "./migrations";
pub const DEFAULT_MIGRATIONS_TABLE: &str = "schema_migrations";
pub const DEFAULT_MIGRATOR_LOCK_TIMEOUT_SECS: u64 = 15;

// Binary defaults
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_DATABASE_PORT: u16 = 5432;
pub const DEFAULT_CACHE_PORT: u16 = 6379;

/// Number of threads the host can run in parallel (at least 1).
pub fn parallelism() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

fn validate_pool(min: Option<u32>, max: Option<u32>, max_default: u32) -> Result<(), String> {
    if max == Some(0) {
        return Err("max_connections must be greater than 0".to_string());
    }
    let max = max.unwrap_or(max_default);
    if let Some(min) = min {
        if min > max {
            return Err(format!(
                "min_connections ({}) cannot exceed max_connections ({})",
                min, max
            ));
        }
    }
    Ok(())
}

/// Relational database connection settings.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    /// libpq style sslmode (disable, prefer, require, verify-ca, verify-full)
    pub ssl_mode: String,
    pub user: String,
    #[serde(skip_serializing, default)]
    pub password: String,
    pub name: String,
    /// Reported to the server as `application_name` (default: resource-kit)
    pub app_name: Option<String>,
    /// Minimum connections kept open (default: 1)
    pub min_connections: Option<u32>,
    /// Maximum connections (default: max(4, 2 x parallelism))
    pub max_connections: Option<u32>,
    /// Idle connections are closed after this many seconds (default: 1800)
    pub idle_timeout_secs: Option<u64>,
    /// Connections are recycled after this many seconds (default: 3600)
    pub max_lifetime_secs: Option<u64>,
    /// Budget for establishing one connection (default: 30)
    pub dial_timeout_secs: Option<u64>,
    /// Server side statement and lock timeout (default: 30)
    pub statement_timeout_secs: Option<u64>,
    /// Isolation level of transactions that do not ask for one (default: Read Committed)
    pub default_isolation_level: Option<IsolationLevel>,
}

impl DatabaseConfig {
    pub fn app_name_or_default(&self) -> &str {
        self.app_name.as_deref().unwrap_or(DEFAULT_APP_NAME)
    }

    pub fn min_connections_or_default(&self) -> u32 {
        self.min_connections
            .unwrap_or(DEFAULT_DATABASE_MIN_CONNECTIONS)
    }

    pub fn max_connections_or_default(&self) -> u32 {
        self.max_connections
            .unwrap_or_else(|| (2 * parallelism()).max(4))
    }

    pub fn idle_timeout_or_default(&self) -> Duration {
        Duration::from_secs(
            self.idle_timeout_secs
                .unwrap_or(DEFAULT_DATABASE_IDLE_TIMEOUT_SECS),
        )
    }

    pub fn max_lifetime_or_default(&self) -> Duration {
        Duration::from_secs(
            self.max_lifetime_secs
                .unwrap_or(DEFAULT_DATABASE_MAX_LIFETIME_SECS),
        )
    }

    pub fn dial_timeout_or_default(&self) -> Duration {
        Duration::from_secs(
            self.dial_timeout_secs
                .unwrap_or(DEFAULT_DATABASE_DIAL_TIMEOUT_SECS),
        )
    }

    pub fn statement_timeout_or_default(&self) -> Duration {
        Duration::from_secs(
            self.statement_timeout_secs
                .unwrap_or(DEFAULT_DATABASE_STATEMENT_TIMEOUT_SECS),
        )
    }

    pub fn default_isolation_level_or_default(&self) -> IsolationLevel {
        self.default_isolation_level.unwrap_or_default()
    }

    /// `host:port/name`, used to label log lines and errors without leaking credentials.
    pub fn target(&self) -> String {
        format!("{}:{}/{}", self.host, self.port, self.name)
    }

    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.host.is_empty() {
            return Err("database host must not be empty".to_string());
        }
        if self.name.is_empty() {
            return Err("database name must not be empty".to_string());
        }
        validate_pool(
            self.min_connections,
            self.max_connections,
            self.max_connections_or_default(),
        )
    }
}

/// Redis connection settings, used by the cache and by the worker broker.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct CacheConfig {
    pub host: String,
    pub port: u16,
    /// Connect over TLS (`rediss://`)
    #[serde(default)]
    pub ssl_mode: bool,
    #[serde(skip_serializing, default)]
    pub password: Option<String>,
    /// Minimum connections kept open (default: 1)
    pub min_connections: Option<u32>,
    /// Maximum connections (default: max(8, 4 x parallelism))
    pub max_connections: Option<u32>,
    /// Idle connections are closed after this many seconds (default: 1800)
    pub idle_timeout_secs: Option<u64>,
    /// Connections are recycled after this many seconds (default: 3600)
    pub max_lifetime_secs: Option<u64>,
    /// Budget for reading a reply (default: 30)
    pub read_timeout_secs: Option<u64>,
    /// Budget for sending a command (default: 30)
    pub write_timeout_secs: Option<u64>,
    /// Budget for establishing one connection (default: 30)
    pub dial_timeout_secs: Option<u64>,
}

impl CacheConfig {
    pub fn min_connections_or_default(&self) -> u32 {
        self.min_connections.unwrap_or(DEFAULT_CACHE_MIN_CONNECTIONS)
    }

    pub fn max_connections_or_default(&self) -> u32 {
        self.max_connections
            .unwrap_or_else(|| (4 * parallelism()).max(8))
    }

    pub fn idle_timeout_or_default(&self) -> Duration {
        Duration::from_secs(
            self.idle_timeout_secs
                .unwrap_or(DEFAULT_CACHE_IDLE_TIMEOUT_SECS),
        )
    }

    pub fn max_lifetime_or_default(&self) -> Duration {
        Duration::from_secs(
            self.max_lifetime_secs
                .unwrap_or(DEFAULT_CACHE_MAX_LIFETIME_SECS),
        )
    }

    pub fn read_timeout_or_default(&self) -> Duration {
        Duration::from_secs(
            self.read_timeout_secs
                .unwrap_or(DEFAULT_CACHE_READ_TIMEOUT_SECS),
        )
    }

    pub fn write_timeout_or_default(&self) -> Duration {
        Duration::from_secs(
            self.write_timeout_secs
                .unwrap_or(DEFAULT_CACHE_WRITE_TIMEOUT_SECS),
        )
    }

    pub fn dial_timeout_or_default(&self) -> Duration {
        Duration::from_secs(
            self.dial_timeout_secs
                .unwrap_or(DEFAULT_CACHE_DIAL_TIMEOUT_SECS),
        )
    }

    /// Budget for one command round trip: write it, then read the reply.
    pub fn command_timeout(&self) -> Duration {
        self.write_timeout_or_default() + self.read_timeout_or_default()
    }

    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Connection URL, `rediss://` when TLS is requested.
    pub fn url(&self) -> KitResult<Url> {
        let scheme = if self.ssl_mode { "rediss" } else { "redis" };
        let mut url = Url::parse(&format!("{}://{}:{}", scheme, self.host, self.port)).map_err(
            |e| {
                KitError::generic()
                    .with_message("invalid cache address")
                    .with_field("target", self.target())
                    .caused_by(e)
            },
        )?;
        if let Some(password) = self.password.as_deref().filter(|p| !p.is_empty()) {
            url.set_password(Some(password)).map_err(|()| {
                KitError::generic()
                    .with_message("cache address cannot carry a password")
                    .with_field("target", self.target())
            })?;
        }
        Ok(url)
    }

    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.host.is_empty() {
            return Err("cache host must not be empty".to_string());
        }
        validate_pool(
            self.min_connections,
            self.max_connections,
            self.max_connections_or_default(),
        )
    }
}

/// Background task worker settings.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct WorkerConfig {
    /// Redis instance acting as the broker
    pub broker: CacheConfig,
    /// Queue name to priority (default: {"default": 1})
    #[serde(default)]
    pub queues: BTreeMap<String, u32>,
    /// Tasks processed at the same time (default: 4 x parallelism)
    pub concurrency: Option<u32>,
    /// Always drain higher priority queues first (default: false)
    pub strict_priority: Option<bool>,
    /// Grace period for in-flight tasks on close (default: 30)
    pub stop_timeout_secs: Option<u64>,
    /// Retries granted to scheduled tasks (default: 0)
    pub schedule_default_retry: Option<u32>,
    /// Prefix of every broker key (default: kit)
    pub namespace: Option<String>,
}

impl WorkerConfig {
    pub fn queues_or_default(&self) -> BTreeMap<String, u32> {
        if self.queues.is_empty() {
            BTreeMap::from([(DEFAULT_WORKER_QUEUE.to_string(), 1)])
        } else {
            self.queues.clone()
        }
    }

    pub fn concurrency_or_default(&self) -> u32 {
        self.concurrency.unwrap_or_else(|| 4 * parallelism())
    }

    pub fn strict_priority_or_default(&self) -> bool {
        self.strict_priority.unwrap_or(false)
    }

    pub fn stop_timeout_or_default(&self) -> Duration {
        Duration::from_secs(
            self.stop_timeout_secs
                .unwrap_or(DEFAULT_WORKER_STOP_TIMEOUT_SECS),
        )
    }

    pub fn schedule_default_retry_or_default(&self) -> u32 {
        self.schedule_default_retry
            .unwrap_or(DEFAULT_WORKER_SCHEDULE_RETRY)
    }

    pub fn namespace_or_default(&self) -> &str {
        self.namespace.as_deref().unwrap_or(DEFAULT_WORKER_NAMESPACE)
    }

    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        self.broker.validate()?;
        if self.concurrency == Some(0) {
            return Err("concurrency must be greater than 0".to_string());
        }
        if let Some((name, _)) = self.queues.iter().find(|(_, priority)| **priority == 0) {
            return Err(format!("queue '{}' must have a priority above 0", name));
        }
        Ok(())
    }
}

/// Schema migrator settings.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct MigratorConfig {
    pub database: DatabaseConfig,
    /// Directory holding `{version}_{name}.up.sql` / `.down.sql` files (default: ./migrations)
    pub migrations_path: Option<PathBuf>,
    /// Bookkeeping table (default: schema_migrations)
    pub table: Option<String>,
    /// Wait for the migration lock when the context has no deadline (default: 15)
    pub lock_timeout_secs: Option<u64>,
}

impl MigratorConfig {
    pub fn migrations_path_or_default(&self) -> PathBuf {
        self.migrations_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_MIGRATIONS_PATH))
    }

    pub fn table_or_default(&self) -> &str {
        self.table.as_deref().unwrap_or(DEFAULT_MIGRATIONS_TABLE)
    }

    pub fn lock_timeout_or_default(&self) -> Duration {
        Duration::from_secs(
            self.lock_timeout_secs
                .unwrap_or(DEFAULT_MIGRATOR_LOCK_TIMEOUT_SECS),
        )
    }

    /// Validate the configuration and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        self.database.validate()?;
        let table = self.table_or_default();
        if table.is_empty() || !table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(format!("invalid migrations table name '{}'", table));
        }
        Ok(())
    }
}

/// Command run by the binary.
#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Print the current schema version
    Version,
    /// Fail unless the schema is exactly at VERSION
    Assert { version: i64 },
    /// Apply migrations up to VERSION
    Apply { version: i64 },
    /// Roll migrations back down to VERSION
    Rollback { version: i64 },
    /// Connect to the configured resources and report their health
    Health,
}

/// Configuration for the `resource-kit` binary.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "resource-kit",
    about = "Schema migrations and health checks for Postgres and Redis",
    version,
    author
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Database host
    #[arg(long, default_value = "localhost", env = "KIT_DATABASE_HOST")]
    pub database_host: String,

    /// Database port
    #[arg(long, default_value_t = DEFAULT_DATABASE_PORT, env = "KIT_DATABASE_PORT")]
    pub database_port: u16,

    /// Database sslmode
    #[arg(long, default_value = "prefer", env = "KIT_DATABASE_SSLMODE")]
    pub database_sslmode: String,

    /// Database user
    #[arg(long, default_value = "postgres", env = "KIT_DATABASE_USER")]
    pub database_user: String,

    /// Database password
    #[arg(long, default_value = "", env = "KIT_DATABASE_PASSWORD", hide_env_values = true)]
    pub database_password: String,

    /// Database name
    #[arg(long, default_value = "postgres", env = "KIT_DATABASE_NAME")]
    pub database_name: String,

    /// Directory holding the migration files
    #[arg(long, default_value = DEFAULT_MIGRATIONS_PATH, env = "KIT_MIGRATIONS_PATH")]
    pub migrations_path: PathBuf,

    /// Cache host; the cache is only checked when set
    #[arg(long, env = "KIT_CACHE_HOST")]
    pub cache_host: Option<String>,

    /// Cache port
    #[arg(long, default_value_t = DEFAULT_CACHE_PORT, env = "KIT_CACHE_PORT")]
    pub cache_port: u16,

    /// Cache password
    #[arg(long, env = "KIT_CACHE_PASSWORD", hide_env_values = true)]
    pub cache_password: Option<String>,

    /// Connect to the cache over TLS
    #[arg(long, env = "KIT_CACHE_SSL")]
    pub cache_ssl: bool,

    /// Deadline for the whole command in seconds
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_SECS, env = "KIT_TIMEOUT")]
    pub timeout: u64,

    /// Connection attempts
    #[arg(long, default_value_t = 1, env = "KIT_RETRY_ATTEMPTS")]
    pub attempts: u32,

    /// Delay before the second connection attempt in milliseconds
    #[arg(long, default_value_t = 0, env = "KIT_RETRY_INITIAL_DELAY_MS")]
    pub initial_delay_ms: u64,

    /// Upper bound of a single retry delay in milliseconds (0 = none)
    #[arg(long, default_value_t = 0, env = "KIT_RETRY_LIMIT_DELAY_MS")]
    pub limit_delay_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "KIT_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "KIT_JSON_LOGS")]
    pub json_logs: bool,
}

impl Cli {
    pub fn database_config(&self) -> DatabaseConfig {
        DatabaseConfig {
            host: self.database_host.clone(),
            port: self.database_port,
            ssl_mode: self.database_sslmode.clone(),
            user: self.database_user.clone(),
            password: self.database_password.clone(),
            name: self.database_name.clone(),
            ..DatabaseConfig::default()
        }
    }

    /// Cache settings, if a cache host was given.
    pub fn cache_config(&self) -> Option<CacheConfig> {
        self.cache_host.as_ref().map(|host| CacheConfig {
            host: host.clone(),
            port: self.cache_port,
            ssl_mode: self.cache_ssl,
            password: self.cache_password.clone(),
            ..CacheConfig::default()
        })
    }

    pub fn migrator_config(&self) -> MigratorConfig {
        MigratorConfig {
            database: self.database_config(),
            migrations_path: Some(self.migrations_path.clone()),
            ..MigratorConfig::default()
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(
            self.attempts,
            Duration::from_millis(self.initial_delay_ms),
            Duration::from_millis(self.limit_delay_ms),
        )
    }

    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}
