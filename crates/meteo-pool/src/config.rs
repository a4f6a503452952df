//! Runtime pool configuration.
//!
//! Built from the user-facing [`meteo_core::MeteoConfig`] and frozen for
//! the lifetime of a pool.

use std::fmt;
use std::time::Duration;

use meteo_core::{DatabaseConfig, PoolingConfig};

use crate::error::{PoolError, PoolResult};

/// Network endpoint and credentials of one logical database.
#[derive(Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl Endpoint {
    pub fn new(host: &str, port: u16, user: &str, password: &str, database: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            user: user.to_string(),
            password: password.to_string(),
            database: database.to_string(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}/{}", self.user, self.host, self.port, self.database)
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("database", &self.database)
            .finish_non_exhaustive()
    }
}

/// Configuration for a single connection pool.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub endpoint: Endpoint,
    /// Connections opened at construction (default: 3).
    pub min_connections: usize,
    /// Hard cap on live connections, leased plus idle (default: 15).
    pub max_connections: usize,
    /// Connections unused for longer than this are retired (default: 1h).
    pub max_idle: Duration,
    /// Upper bound on opening one connection (default: 30s).
    pub connect_timeout: Duration,
    /// Wait used by `with_connection` when the pool is saturated (default: 30s).
    pub acquire_timeout: Duration,
}

impl PoolConfig {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            min_connections: 3,
            max_connections: 15,
            max_idle: Duration::from_secs(3600),
            connect_timeout: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(30),
        }
    }

    /// Combine a database entry with the shared pooling section.
    pub fn from_settings(db: &DatabaseConfig, pooling: &PoolingConfig) -> Self {
        let (min_connections, max_connections) = db.pool_bounds(pooling);
        Self {
            endpoint: Endpoint::new(&db.host, db.port, &db.user, &db.password, &db.database),
            min_connections,
            max_connections,
            max_idle: Duration::from_secs(pooling.max_idle_seconds),
            connect_timeout: Duration::from_secs(pooling.connect_timeout_seconds),
            acquire_timeout: Duration::from_secs(pooling.acquire_timeout_seconds),
        }
    }

    /// Builder method: set `(min, max)` connection bounds.
    pub fn with_bounds(self, min_connections: usize, max_connections: usize) -> Self {
        Self {
            min_connections,
            max_connections,
            ..self
        }
    }

    /// Builder method: set the idle retirement threshold.
    pub fn with_max_idle(self, max_idle: Duration) -> Self {
        Self { max_idle, ..self }
    }

    /// Builder method: set the `with_connection` acquire timeout.
    pub fn with_acquire_timeout(self, acquire_timeout: Duration) -> Self {
        Self {
            acquire_timeout,
            ..self
        }
    }

    /// Enforce `0 <= min <= max` and `max >= 1`.
    pub fn validate(&self) -> PoolResult<()> {
        if self.max_connections == 0 {
            return Err(PoolError::InvalidConfig(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(PoolError::InvalidConfig(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        Ok(())
    }
}
