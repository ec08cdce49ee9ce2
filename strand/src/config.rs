//! Configuration for connection pools, query execution and the coroutine scheduler

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::defaults;
use crate::error::{Error, Result};

/// Replication role of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Master,
    Slave,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Master => f.write_str("master"),
            Role::Slave => f.write_str("slave"),
        }
    }
}

/// One server behind a connection name.
///
/// `num_connection` core connections are created for the entry; when
/// `max_num_connection` is larger, the difference is created as bench
/// connections that are only opened under load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub role: Role,

    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    pub username: String,

    #[serde(default)]
    pub password: String,

    pub dbname: String,

    #[serde(default = "default_num_connection")]
    pub num_connection: usize,

    #[serde(default = "default_max_num_connection")]
    pub max_num_connection: usize,
}

impl ServerConfig {
    /// Number of elastic connections on top of the core ones.
    pub fn bench_size(&self) -> usize {
        self.max_num_connection.saturating_sub(self.num_connection)
    }

    /// Upper bound of concurrently open connections for this entry.
    pub fn max_open(&self) -> usize {
        self.num_connection + self.bench_size()
    }
}

/// Idle connection maintenance settings (seconds).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReaperConfig {
    #[serde(default = "default_reaper_interval")]
    pub interval: u64,

    #[serde(default = "default_core_max_age")]
    pub core_max_age: u64,

    #[serde(default = "default_core_ping_after")]
    pub core_ping_after: u64,

    #[serde(default = "default_bench_max_idle")]
    pub bench_max_idle: u64,
}

/// Coroutine scheduler settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoroutineConfig {
    /// Recycled coroutines kept without trimming
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: usize,

    /// Seconds a pooled coroutine may stay unused before it is trimmed
    #[serde(default = "default_max_time_idle")]
    pub max_time_idle: u64,

    /// Seconds a coroutine may run before it is cancelled
    #[serde(default = "default_coroutine_timeout")]
    pub timeout: u64,
}

impl CoroutineConfig {
    pub fn max_time_idle(&self) -> Duration {
        Duration::from_secs(self.max_time_idle)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

/// Main configuration struct
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Role entries per connection name
    #[serde(default)]
    pub connections: BTreeMap<String, Vec<ServerConfig>>,

    /// Waiters allowed before the backpressure gate closes
    #[serde(default = "default_connection_waiting_list_size")]
    pub connection_waiting_list_size: usize,

    /// Seconds a caller may wait for a connection
    #[serde(default = "default_connection_waiting_time")]
    pub connection_waiting_time: u64,

    /// Seconds a query may run
    #[serde(default = "default_max_execution_time")]
    pub max_execution_time: u64,

    #[serde(default)]
    pub reaper: ReaperConfig,

    #[serde(default)]
    pub coroutine: CoroutineConfig,

    /// Log level (trace, debug, info, warn, error)
    /// Can be overridden by RUST_LOG env var
    #[serde(default)]
    pub log_level: Option<String>,
}

// Default value functions for serde
fn default_port() -> u16 {
    defaults::PORT
}
fn default_num_connection() -> usize {
    defaults::NUM_CONNECTION
}
fn default_max_num_connection() -> usize {
    defaults::MAX_NUM_CONNECTION
}
fn default_connection_waiting_list_size() -> usize {
    defaults::CONNECTION_WAITING_LIST_SIZE
}
fn default_connection_waiting_time() -> u64 {
    defaults::CONNECTION_WAITING_TIME
}
fn default_max_execution_time() -> u64 {
    defaults::MAX_EXECUTION_TIME
}
fn default_reaper_interval() -> u64 {
    defaults::REAPER_INTERVAL
}
fn default_core_max_age() -> u64 {
    defaults::CORE_MAX_AGE
}
fn default_core_ping_after() -> u64 {
    defaults::CORE_PING_AFTER
}
fn default_bench_max_idle() -> u64 {
    defaults::BENCH_MAX_IDLE
}
fn default_max_pool_size() -> usize {
    defaults::COROUTINE_MAX_POOL_SIZE
}
fn default_max_time_idle() -> u64 {
    defaults::COROUTINE_MAX_TIME_IDLE
}
fn default_coroutine_timeout() -> u64 {
    defaults::COROUTINE_TIMEOUT
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            interval: default_reaper_interval(),
            core_max_age: default_core_max_age(),
            core_ping_after: default_core_ping_after(),
            bench_max_idle: default_bench_max_idle(),
        }
    }
}

impl Default for CoroutineConfig {
    fn default() -> Self {
        Self {
            max_pool_size: default_max_pool_size(),
            max_time_idle: default_max_time_idle(),
            timeout: default_coroutine_timeout(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            connections: BTreeMap::new(),
            connection_waiting_list_size: default_connection_waiting_list_size(),
            connection_waiting_time: default_connection_waiting_time(),
            max_execution_time: default_max_execution_time(),
            reaper: ReaperConfig::default(),
            coroutine: CoroutineConfig::default(),
            log_level: None,
        }
    }
}

impl DatabaseConfig {
    /// Add a role entry under a connection name
    pub fn with_server(mut self, name: impl Into<String>, server: ServerConfig) -> Self {
        self.connections.entry(name.into()).or_default().push(server);
        self
    }

    /// Parse configuration from a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Load configuration using config-rs (file + environment variables)
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path));
        } else {
            builder = builder.add_source(File::with_name(defaults::CONFIG_FILE).required(false));
        }

        // Override with environment variables (STRAND_*, nested keys joined by "__")
        builder = builder.add_source(
            Environment::with_prefix(defaults::ENV_PREFIX)
                .prefix_separator("_")
                .separator("__"),
        );

        let config: DatabaseConfig = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    pub fn connection_waiting_time(&self) -> Duration {
        Duration::from_secs(self.connection_waiting_time)
    }

    pub fn max_execution_time(&self) -> Duration {
        Duration::from_secs(self.max_execution_time)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        for (name, servers) in &self.connections {
            if name.is_empty() {
                return Err(Error::Configuration(
                    "connection name must not be empty".into(),
                ));
            }
            if !servers.iter().any(|s| s.role == Role::Master) {
                return Err(Error::Configuration(format!(
                    "connection '{}' has no master entry",
                    name
                )));
            }
            for server in servers {
                if server.num_connection == 0 {
                    return Err(Error::Configuration(format!(
                        "connection '{}' ({}) needs at least one core connection",
                        name, server.role
                    )));
                }
                if server.max_num_connection != 0
                    && server.max_num_connection < server.num_connection
                {
                    return Err(Error::Configuration(format!(
                        "connection '{}' ({}): max_num_connection {} is below num_connection {}",
                        name, server.role, server.max_num_connection, server.num_connection
                    )));
                }
            }
        }

        if self.connection_waiting_list_size == 0 {
            return Err(Error::Configuration(
                "connection_waiting_list_size must be positive".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        connection_waiting_time = 5
        log_level = "debug"

        [[connections.main]]
        role = "master"
        host = "10.0.0.1"
        username = "app"
        password = "secret"
        dbname = "shop"
        num_connection = 2
        max_num_connection = 5

        [[connections.main]]
        role = "slave"
        host = "10.0.0.2"
        username = "app"
        dbname = "shop"

        [coroutine]
        max_pool_size = 4
    "#;

    #[test]
    fn test_default_config() {
        let config = DatabaseConfig::default();
        assert_eq!(config.connection_waiting_list_size, 200);
        assert_eq!(config.connection_waiting_time(), Duration::from_secs(15));
        assert_eq!(config.max_execution_time(), Duration::from_secs(30));
        assert_eq!(config.coroutine.max_pool_size, 16);
        assert_eq!(config.coroutine.max_time_idle, 30);
        assert_eq!(config.reaper.interval, 30);
        assert!(config.log_level.is_none());
    }

    #[test]
    fn test_parse_role_entries() {
        let config = DatabaseConfig::from_toml_str(SAMPLE).unwrap();
        let main = &config.connections["main"];
        assert_eq!(main.len(), 2);
        assert_eq!(main[0].role, Role::Master);
        assert_eq!(main[0].bench_size(), 3);
        assert_eq!(main[1].port, 3306);
        assert_eq!(main[1].num_connection, 1);
        assert_eq!(main[1].bench_size(), 0);
        assert_eq!(config.connection_waiting_time, 5);
        assert_eq!(config.coroutine.max_pool_size, 4);
        assert_eq!(config.coroutine.timeout, 30);
        assert_eq!(config.log_level, Some("debug".to_string()));
        config.validate().unwrap();
    }

    #[test]
    fn test_validation_requires_master() {
        let config = DatabaseConfig::from_toml_str(
            r#"
            [[connections.reports]]
            role = "slave"
            host = "localhost"
            username = "root"
            dbname = "reports"
            "#,
        )
        .unwrap();
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_validation_rejects_inverted_bounds() {
        let mut config = DatabaseConfig::from_toml_str(SAMPLE).unwrap();
        if let Some(servers) = config.connections.get_mut("main") {
            servers[0].max_num_connection = 1;
        }
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("strand-config-{}.toml", std::process::id()));
        std::fs::write(&path, SAMPLE).unwrap();
        let config = DatabaseConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.connections["main"][0].host, "10.0.0.1");
    }
}
