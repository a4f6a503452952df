//! meteogrid.toml configuration parser.
//!
//! The file names every logical database the service talks to and the
//! pool sizing shared by all of them. Environment variables override the
//! file after it is parsed, so container deployments can keep one config
//! file and inject credentials at start-up.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default MySQL port used when a database entry omits `port`.
pub const DEFAULT_DB_PORT: u16 = 3306;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv { var: String, value: String },

    #[error("database {name}: min_connections ({min}) exceeds max_connections ({max})")]
    PoolBounds { name: String, min: usize, max: usize },

    #[error("database {0}: max_connections must be at least 1")]
    ZeroCapacity(String),
}

/// Root of `meteogrid.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MeteoConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub pooling: PoolingConfig,
    #[serde(default)]
    pub databases: BTreeMap<String, DatabaseConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8085".to_string()
}

/// Pool sizing and timeouts shared by every logical database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolingConfig {
    /// Pooled mode when true; one unbounded connection per database otherwise.
    pub enabled: bool,
    pub min_connections: usize,
    pub max_connections: usize,
    /// Idle connections older than this are retired instead of reused.
    pub max_idle_seconds: u64,
    pub connect_timeout_seconds: u64,
    /// How long `with_connection` waits for a free connection.
    pub acquire_timeout_seconds: u64,
    /// Period of the idle-reaping task; 0 disables it.
    pub maintenance_interval_seconds: u64,
}

impl Default for PoolingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_connections: 3,
            max_connections: 15,
            max_idle_seconds: 3600,
            connect_timeout_seconds: 30,
            acquire_timeout_seconds: 30,
            maintenance_interval_seconds: 60,
        }
    }
}

/// Endpoint of one logical database plus optional pool-size overrides.
#[derive(Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    pub database: String,
    pub min_connections: Option<usize>,
    pub max_connections: Option<usize>,
}

fn default_port() -> u16 {
    DEFAULT_DB_PORT
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("min_connections", &self.min_connections)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

impl DatabaseConfig {
    /// Effective `(min, max)` pool bounds after applying per-database overrides.
    pub fn pool_bounds(&self, pooling: &PoolingConfig) -> (usize, usize) {
        (
            self.min_connections.unwrap_or(pooling.min_connections),
            self.max_connections.unwrap_or(pooling.max_connections),
        )
    }
}

impl MeteoConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Apply overrides from the process environment.
    pub fn apply_process_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env(std::env::vars())
    }

    /// Apply `USE_CONNECTION_POOLING`, `DB_POOL_*` and `<NAME>_DB_*` overrides.
    ///
    /// Endpoint variables only touch databases declared in the file;
    /// unrelated `*_DB_HOST` variables in the environment are ignored.
    pub fn apply_env<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: HashMap<String, String> = vars.into_iter().collect();

        if let Some(value) = vars.get("USE_CONNECTION_POOLING") {
            self.pooling.enabled = value.eq_ignore_ascii_case("true");
        }
        if let Some(value) = vars.get("DB_POOL_MIN_CONNECTIONS") {
            self.pooling.min_connections = parse_env("DB_POOL_MIN_CONNECTIONS", value)?;
        }
        if let Some(value) = vars.get("DB_POOL_MAX_CONNECTIONS") {
            self.pooling.max_connections = parse_env("DB_POOL_MAX_CONNECTIONS", value)?;
        }
        if let Some(value) = vars.get("DB_POOL_MAX_IDLE_TIME") {
            self.pooling.max_idle_seconds = parse_env("DB_POOL_MAX_IDLE_TIME", value)?;
        }
        if let Some(value) = vars.get("DB_CONNECTION_TIMEOUT") {
            self.pooling.connect_timeout_seconds = parse_env("DB_CONNECTION_TIMEOUT", value)?;
        }

        for (name, db) in self.databases.iter_mut() {
            let prefix = name.to_ascii_uppercase();
            if let Some(value) = vars.get(&format!("{prefix}_DB_HOST")) {
                db.host = value.clone();
            }
            let port_var = format!("{prefix}_DB_PORT");
            if let Some(value) = vars.get(&port_var) {
                db.port = parse_env(&port_var, value)?;
            }
            if let Some(value) = vars.get(&format!("{prefix}_DB_USER")) {
                db.user = value.clone();
            }
            if let Some(value) = vars.get(&format!("{prefix}_DB_PASSWORD")) {
                db.password = value.clone();
            }
            if let Some(value) = vars.get(&format!("{prefix}_DB_NAME")) {
                db.database = value.clone();
            }
        }

        Ok(())
    }

    /// Check `0 <= min <= max` and `max >= 1` for every database.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, db) in &self.databases {
            let (min, max) = db.pool_bounds(&self.pooling);
            if max == 0 {
                return Err(ConfigError::ZeroCapacity(name.clone()));
            }
            if min > max {
                return Err(ConfigError::PoolBounds {
                    name: name.clone(),
                    min,
                    max,
                });
            }
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(var: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var: var.to_string(),
        value: value.to_string(),
    })
}
