//! meteo-core — shared configuration types for meteogrid.

pub mod config;

pub use config::{ConfigError, DatabaseConfig, MeteoConfig, PoolingConfig, ServerConfig};
