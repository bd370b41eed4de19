//! Configuration management.
//!
//! Configuration is layered from built-in defaults, an optional
//! `config/connection-health.{toml,yaml,json}` file, an explicit file passed
//! on the command line, and `CONNECTION_HEALTH__*` environment variables, in
//! that order.
//!
//! ```rust,ignore
//! use connection_health::config::{AppConfig, ConfigValidator};
//!
//! let config = AppConfig::load(None)?;
//! ```

pub mod error;
pub mod validator;

pub use error::{ConfigResult, ConfigurationError};
pub use validator::ConfigValidator;

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::scheduler::ExecutionSettings;
use crate::store::sqlite::BUSY_TIMEOUT;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "CONNECTION_HEALTH";

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Applications whose connections can be scheduled.
    #[serde(default)]
    pub applications: Vec<ApplicationConfig>,
    /// Connections tested by scheduled runs.
    #[serde(default)]
    pub connections: Vec<ConnectionConfig>,
}

impl AppConfig {
    /// Load and validate configuration.
    ///
    /// `path` adds an explicit file on top of the default search location.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let config = Self::load_unchecked(path)?;

        ConfigValidator::validate(&config)
            .map_err(|e| anyhow::anyhow!("Configuration validation failed:\n\n{e}"))?;

        Ok(config)
    }

    /// Load configuration without validation.
    pub fn load_unchecked(path: Option<&Path>) -> anyhow::Result<Self> {
        // Load .env file if present
        let _ = dotenvy::dotenv();

        let mut builder = config::Config::builder()
            .set_default("server.host", default_host())?
            .set_default("server.port", default_port())?
            .set_default("database.path", default_database_path())?
            .set_default("logging.level", default_log_level())?
            .set_default("logging.format", default_log_format())?
            .add_source(config::File::with_name("config/connection-health").required(false));

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,
    /// API port.
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Schedule database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// `SQLite` file path; `:memory:` keeps schedules in process memory.
    #[serde(default = "default_database_path")]
    pub path: String,
}

fn default_database_path() -> String {
    "connection-health.db".to_string()
}

impl DatabaseConfig {
    /// Whether schedules are kept in memory only.
    pub fn is_in_memory(&self) -> bool {
        self.path == ":memory:"
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

/// Trigger loop and run execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Start the trigger loop. Manual runs work either way.
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_per_connection_timeout")]
    pub per_connection_timeout_ms: u64,
    #[serde(default = "default_max_concurrent_tests")]
    pub max_concurrent_tests: usize,
    /// Parent deadline of one run.
    #[serde(default = "default_run_timeout")]
    pub run_timeout_secs: u64,
    /// Must exceed the run timeout plus the persistence budget.
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: u64,
    #[serde(default = "default_persist_max_attempts")]
    pub persist_max_attempts: u32,
    #[serde(default = "default_persist_retry_delay")]
    pub persist_retry_delay_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_tick_interval() -> u64 {
    60
}

fn default_per_connection_timeout() -> u64 {
    10_000
}

fn default_max_concurrent_tests() -> usize {
    8
}

fn default_run_timeout() -> u64 {
    300
}

fn default_lease_ttl() -> u64 {
    360
}

fn default_persist_max_attempts() -> u32 {
    3
}

fn default_persist_retry_delay() -> u64 {
    500
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval_secs: default_tick_interval(),
            per_connection_timeout_ms: default_per_connection_timeout(),
            max_concurrent_tests: default_max_concurrent_tests(),
            run_timeout_secs: default_run_timeout(),
            lease_ttl_secs: default_lease_ttl(),
            persist_max_attempts: default_persist_max_attempts(),
            persist_retry_delay_ms: default_persist_retry_delay(),
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    /// Longest time writing a run result back can take: every attempt may
    /// wait out the database busy timeout, plus the linear backoff between
    /// attempts.
    pub fn persist_budget(&self) -> Duration {
        let attempts = self.persist_max_attempts;
        let backoff_steps = attempts.saturating_mul(attempts.saturating_sub(1)) / 2;
        BUSY_TIMEOUT.saturating_mul(attempts)
            + Duration::from_millis(self.persist_retry_delay_ms).saturating_mul(backoff_steps)
    }

    /// Settings handed to the executor.
    pub fn execution_settings(&self) -> ExecutionSettings {
        ExecutionSettings {
            per_connection_timeout: Duration::from_millis(self.per_connection_timeout_ms),
            max_concurrent_tests: self.max_concurrent_tests,
            run_timeout: self.run_timeout(),
            lease_ttl: Duration::from_secs(self.lease_ttl_secs),
            persist_max_attempts: self.persist_max_attempts,
            persist_retry_delay: Duration::from_millis(self.persist_retry_delay_ms),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error). `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format: "pretty" or "json".
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl LoggingConfig {
    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// An application that may own a schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// A connection belonging to an application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub id: String,
    pub application_id: String,
    #[serde(default)]
    pub name: String,
    /// Inactive connections are never tested.
    #[serde(default = "default_true")]
    pub active: bool,
    pub probe: ProbeConfig,
}

/// How a connection is exercised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProbeConfig {
    /// Open a TCP socket to `host:port`.
    Tcp { address: String },
    /// Issue a GET and check the status code.
    Http {
        url: String,
        /// Expected status; any 2xx when unset.
        #[serde(default)]
        expect_status: Option<u16>,
    },
}
