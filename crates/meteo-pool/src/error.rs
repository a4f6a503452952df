//! Pool error taxonomy.
//!
//! Only [`PoolError::AcquireTimeout`] and [`PoolError::PoolClosed`] ever
//! escape `acquire`. Creation failures are retried inside the acquire loop
//! and validation failures are not errors at all.

use std::time::Duration;

use thiserror::Error;

/// Boxed error carried from the database driver.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result alias for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to connect to {endpoint}: {source}")]
    ConnectionCreation {
        endpoint: String,
        #[source]
        source: BoxError,
    },

    #[error("no database connection available within {0:?}")]
    AcquireTimeout(Duration),

    #[error("connection pool is closed")]
    PoolClosed,

    #[error("unknown database: {0}")]
    UnknownDatabase(String),

    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),

    #[error("database error: {0}")]
    Database(#[source] BoxError),
}

impl PoolError {
    /// True for the "server busy" kinds: saturation timeout or shutdown.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, PoolError::AcquireTimeout(_) | PoolError::PoolClosed)
    }
}

impl From<BoxError> for PoolError {
    fn from(err: BoxError) -> Self {
        PoolError::Database(err)
    }
}

impl From<sqlx::Error> for PoolError {
    fn from(err: sqlx::Error) -> Self {
        PoolError::Database(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_kinds() {
        assert!(PoolError::AcquireTimeout(Duration::from_secs(1)).is_unavailable());
        assert!(PoolError::PoolClosed.is_unavailable());
        assert!(!PoolError::UnknownDatabase("x".into()).is_unavailable());
        assert!(!PoolError::InvalidConfig("x".into()).is_unavailable());
    }

    #[test]
    fn creation_error_names_endpoint() {
        let err = PoolError::ConnectionCreation {
            endpoint: "db.local:3306/meteo".into(),
            source: "connection refused".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("db.local:3306/meteo"));
        assert!(msg.contains("connection refused"));
    }
}
