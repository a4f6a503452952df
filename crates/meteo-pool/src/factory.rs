//! Connection factory: creating, validating and destroying single connections.
//!
//! Holds no state of its own. The pool decides *when* a connection is
//! created or retired; this module only knows *how*.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{Endpoint, PoolConfig};
use crate::error::{BoxError, PoolError, PoolResult};
use crate::pool::PooledConnection;

/// Longest a liveness ping may take before the connection counts as dead.
pub const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// A live database session driven by the pool.
///
/// Implemented by [`crate::mysql::MySqlBackend`] in production and by
/// in-memory mocks in tests.
#[async_trait]
pub trait ConnectionBackend: Send + fmt::Debug + 'static {
    /// Whether the driver still considers the session open.
    fn is_open(&self) -> bool;
    /// Lightweight liveness probe. Returns `true` if the server answered.
    async fn ping(&mut self) -> bool;
    /// Commit the current transaction.
    async fn commit(&mut self) -> Result<(), BoxError>;
    /// Roll back any uncommitted work.
    async fn rollback(&mut self) -> Result<(), BoxError>;
    /// Close the underlying transport.
    async fn close(&mut self) -> Result<(), BoxError>;
}

/// Opens new backends. Injected into the pool so tests can substitute mocks.
#[async_trait]
pub trait ConnectionFactory<B: ConnectionBackend>: Send + Sync {
    /// Establish a new session with `endpoint`.
    async fn connect(&self, endpoint: &Endpoint, connect_timeout: Duration) -> Result<B, BoxError>;
}

/// Open a new connection, bounded by `config.connect_timeout`.
pub async fn create<B: ConnectionBackend>(
    factory: &dyn ConnectionFactory<B>,
    config: &PoolConfig,
    id: u64,
) -> PoolResult<PooledConnection<B>> {
    let connect = factory.connect(&config.endpoint, config.connect_timeout);
    let result = match tokio::time::timeout(config.connect_timeout, connect).await {
        Ok(result) => result,
        Err(_) => Err(format!("connect timed out after {:?}", config.connect_timeout).into()),
    };

    match result {
        Ok(backend) => {
            tracing::debug!(
                conn_id = id,
                endpoint = %config.endpoint,
                "created new database connection"
            );
            Ok(PooledConnection::new(id, backend))
        }
        Err(source) => Err(PoolError::ConnectionCreation {
            endpoint: config.endpoint.to_string(),
            source,
        }),
    }
}

/// Check that `conn` is open, fresh, and answers a ping within [`PING_TIMEOUT`].
///
/// Never fails: any problem simply makes the connection invalid.
pub async fn is_valid<B: ConnectionBackend>(conn: &mut PooledConnection<B>, max_idle: Duration) -> bool {
    if !conn.is_open() {
        return false;
    }
    let idle_for = conn.last_used().elapsed();
    if idle_for > max_idle {
        tracing::debug!(
            conn_id = conn.id(),
            idle_secs = idle_for.as_secs(),
            "connection idle too long, marking invalid"
        );
        return false;
    }
    match tokio::time::timeout(PING_TIMEOUT, conn.ping()).await {
        Ok(true) => {}
        Ok(false) => {
            tracing::debug!(conn_id = conn.id(), "connection ping failed");
            return false;
        }
        Err(_) => {
            tracing::debug!(conn_id = conn.id(), "connection ping timed out");
            return false;
        }
    }
    true
}

/// Close `conn`, logging rather than propagating any failure.
pub async fn destroy<B: ConnectionBackend>(mut conn: PooledConnection<B>) {
    conn.detach();
    tracing::debug!(
        conn_id = conn.id(),
        age_secs = conn.created_at().elapsed().as_secs(),
        "destroying connection"
    );
    if !conn.is_open() {
        return;
    }
    if let Err(err) = conn.close().await {
        tracing::debug!(conn_id = conn.id(), error = %err, "error closing connection");
    }
}
