//! meteo-pool — database connection pooling for meteogrid.
//!
//! Keeps a bounded set of reusable MySQL connections per logical database
//! (`local`, `global`, ...), hands them out to request handlers and takes
//! them back, validating liveness and idle age along the way.
//!
//! # Architecture
//!
//! ```text
//! PoolRegistry ── name ──▶ ConnectionPool ──▶ factory::create / is_valid / destroy
//!      │                        │                     │
//!      │ (pooling off)          │ idle FIFO           ▼
//!      └──▶ DirectConnection    │ active count   ConnectionFactory<B> ─▶ B: ConnectionBackend
//!                               ▼                     (MySqlFactory / MySqlBackend)
//!                        PooledConnection<B>
//! ```
//!
//! Everything is generic over the backend so the pool can be driven by
//! in-memory mocks in tests.

pub mod config;
pub mod direct;
pub mod error;
pub mod factory;
pub mod mysql;
pub mod pool;
pub mod registry;

#[cfg(test)]
mod testing;

pub use config::{Endpoint, PoolConfig};
pub use direct::{Database, DirectConnection, SingleConnectionStats};
pub use error::{BoxError, PoolError, PoolResult};
pub use factory::{ConnectionBackend, ConnectionFactory};
pub use mysql::{MySqlBackend, MySqlFactory, QueryOutcome, execute_query};
pub use pool::{ConnectionPool, PoolStats, PooledConnection};
pub use registry::{ConnectionStats, DatabaseStats, PoolRegistry};
