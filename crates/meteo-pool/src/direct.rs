//! Unpooled mode: one shared, lazily (re)opened connection per database.
//!
//! Used when `pooling.enabled = false`. There is no capacity bound and no
//! idle tracking; callers queue on the single session.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::factory::{self, ConnectionBackend, ConnectionFactory};
use crate::pool::{ConnectionPool, PoolStats, PooledConnection};

pub struct DirectConnection<B: ConnectionBackend> {
    name: String,
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory<B>>,
    conn: Mutex<Option<PooledConnection<B>>>,
    connected: AtomicBool,
    closed: AtomicBool,
}

/// Statistics entry for a database served in unpooled mode.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SingleConnectionStats {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub connected: bool,
    pub closed: bool,
}

impl<B: ConnectionBackend> DirectConnection<B> {
    pub fn new(name: &str, config: PoolConfig, factory: Arc<dyn ConnectionFactory<B>>) -> Self {
        Self {
            name: name.to_string(),
            config,
            factory,
            conn: Mutex::new(None),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `f` on the shared connection, reconnecting first if it was lost.
    ///
    /// The session is revalidated (open, idle age, ping) before every use,
    /// so a server-side disconnect is repaired on the next call.
    ///
    /// Commits on `Ok`, rolls back on `Err`. A panic drops the session so
    /// the next caller starts from a fresh connection.
    pub async fn with_connection<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: for<'c> FnOnce(&'c mut B) -> BoxFuture<'c, Result<T, E>>,
        E: From<PoolError>,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::PoolClosed.into());
        }

        let mut slot = self.conn.lock().await;
        let healthy = match slot.as_mut() {
            Some(conn) => factory::is_valid(conn, self.config.max_idle).await,
            None => false,
        };
        if !healthy {
            if let Some(stale) = slot.take() {
                tracing::debug!(database = %self.name, conn_id = stale.id(), "single connection lost, reconnecting");
                factory::destroy(stale).await;
            }
            self.connected.store(false, Ordering::Release);
            let conn = factory::create(self.factory.as_ref(), &self.config, 1).await?;
            tracing::debug!(database = %self.name, "opened single connection");
            *slot = Some(conn);
            self.connected.store(true, Ordering::Release);
        }
        let Some(conn) = slot.as_mut() else {
            return Err(PoolError::PoolClosed.into());
        };
        conn.touch();

        match AssertUnwindSafe(f(&mut **conn)).catch_unwind().await {
            Ok(Ok(value)) => match conn.commit().await {
                Ok(()) => Ok(value),
                Err(err) => {
                    tracing::debug!(database = %self.name, error = %err, "commit failed");
                    if let Err(rollback_err) = conn.rollback().await {
                        tracing::debug!(database = %self.name, error = %rollback_err, "rollback failed");
                    }
                    Err(PoolError::Database(err).into())
                }
            },
            Ok(Err(err)) => {
                if let Err(rollback_err) = conn.rollback().await {
                    tracing::debug!(database = %self.name, error = %rollback_err, "rollback failed");
                }
                Err(err)
            }
            Err(panic) => {
                if let Some(conn) = slot.take() {
                    factory::destroy(conn).await;
                }
                self.connected.store(false, Ordering::Release);
                std::panic::resume_unwind(panic)
            }
        }
    }

    /// Close the shared connection; later calls fail with `PoolClosed`.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if let Some(conn) = self.conn.lock().await.take() {
            factory::destroy(conn).await;
        }
        self.connected.store(false, Ordering::Release);
        tracing::info!(database = %self.name, "closed single connection");
    }

    pub fn stats(&self) -> SingleConnectionStats {
        SingleConnectionStats {
            kind: "single_connection",
            connected: self.connected.load(Ordering::Acquire),
            closed: self.closed.load(Ordering::Acquire),
        }
    }
}

/// Handle to a logical database in either pooling mode.
pub enum Database<B: ConnectionBackend> {
    Pooled(Arc<ConnectionPool<B>>),
    Direct(Arc<DirectConnection<B>>),
}

impl<B: ConnectionBackend> Clone for Database<B> {
    fn clone(&self) -> Self {
        match self {
            Database::Pooled(pool) => Database::Pooled(Arc::clone(pool)),
            Database::Direct(direct) => Database::Direct(Arc::clone(direct)),
        }
    }
}

impl<B: ConnectionBackend> Database<B> {
    pub fn name(&self) -> &str {
        match self {
            Database::Pooled(pool) => pool.name(),
            Database::Direct(direct) => direct.name(),
        }
    }

    /// Run `f` in a transaction on a connection of this database.
    pub async fn with_connection<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: for<'c> FnOnce(&'c mut B) -> BoxFuture<'c, Result<T, E>>,
        E: From<PoolError>,
    {
        match self {
            Database::Pooled(pool) => pool.with_connection(f).await,
            Database::Direct(direct) => direct.with_connection(f).await,
        }
    }

    /// Pool statistics, `None` in unpooled mode.
    pub fn pool_stats(&self) -> Option<PoolStats> {
        match self {
            Database::Pooled(pool) => Some(pool.stats()),
            Database::Direct(_) => None,
        }
    }
}
