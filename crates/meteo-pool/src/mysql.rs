//! MySQL backend and factory built on `sqlx`.
//!
//! Each pooled connection is a single `sqlx::MySqlConnection`. Sessions are
//! opened with autocommit disabled so `with_connection` owns the
//! transaction boundary: commit on success, rollback on failure.

use std::time::Duration;

use async_trait::async_trait;
use futures::{FutureExt, TryStreamExt};
use sqlx::mysql::{MySqlConnectOptions, MySqlRow};
use sqlx::{ConnectOptions, Connection, Either, Executor, MySqlConnection};

use crate::config::Endpoint;
use crate::error::{BoxError, PoolError, PoolResult};
use crate::factory::{ConnectionBackend, ConnectionFactory};
use crate::pool::ConnectionPool;

/// A pooled MySQL session.
///
/// Query code reaches the driver through [`MySqlBackend::session`], e.g.
/// `sqlx::query(..).fetch_all(conn.session()?)`.
#[derive(Debug)]
pub struct MySqlBackend {
    /// `None` once closed.
    conn: Option<MySqlConnection>,
}

impl MySqlBackend {
    pub fn new(conn: MySqlConnection) -> Self {
        Self { conn: Some(conn) }
    }

    /// The underlying driver connection, unless already closed.
    pub fn session(&mut self) -> Result<&mut MySqlConnection, BoxError> {
        self.conn.as_mut().ok_or_else(|| "mysql connection already closed".into())
    }

    /// Drop the session when `result` shows the transport is gone, so
    /// `is_open` turns false and the owner reconnects.
    fn observe<T>(&mut self, result: Result<T, sqlx::Error>) -> Result<T, BoxError> {
        if let Err(err) = &result {
            if is_disconnect(err) {
                tracing::debug!(error = %err, "mysql session lost");
                self.conn = None;
            }
        }
        Ok(result?)
    }
}

/// Errors after which the session cannot be used again.
fn is_disconnect(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Io(_) | sqlx::Error::Protocol(_) | sqlx::Error::WorkerCrashed)
}

#[async_trait]
impl ConnectionBackend for MySqlBackend {
    fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    async fn ping(&mut self) -> bool {
        let result = match self.conn.as_mut() {
            Some(conn) => conn.ping().await,
            None => return false,
        };
        self.observe(result).is_ok()
    }

    async fn commit(&mut self) -> Result<(), BoxError> {
        let result = self.session()?.execute("COMMIT").await;
        self.observe(result).map(|_| ())
    }

    async fn rollback(&mut self) -> Result<(), BoxError> {
        let result = self.session()?.execute("ROLLBACK").await;
        self.observe(result).map(|_| ())
    }

    async fn close(&mut self) -> Result<(), BoxError> {
        match self.conn.take() {
            Some(conn) => Ok(conn.close().await?),
            None => Ok(()),
        }
    }
}

/// Opens [`MySqlBackend`] sessions (utf8mb4, autocommit off).
#[derive(Debug, Default, Clone)]
pub struct MySqlFactory;

impl MySqlFactory {
    pub fn new() -> Self {
        Self
    }

    fn options(endpoint: &Endpoint) -> MySqlConnectOptions {
        let mut options = MySqlConnectOptions::new()
            .host(&endpoint.host)
            .port(endpoint.port)
            .username(&endpoint.user)
            .charset("utf8mb4");
        if !endpoint.password.is_empty() {
            options = options.password(&endpoint.password);
        }
        if !endpoint.database.is_empty() {
            options = options.database(&endpoint.database);
        }
        options.disable_statement_logging()
    }
}

#[async_trait]
impl ConnectionFactory<MySqlBackend> for MySqlFactory {
    async fn connect(&self, endpoint: &Endpoint, connect_timeout: Duration) -> Result<MySqlBackend, BoxError> {
        let options = Self::options(endpoint);
        let mut conn = tokio::time::timeout(connect_timeout, options.connect())
            .await
            .map_err(|_| format!("connect to {endpoint} timed out after {connect_timeout:?}"))??;
        conn.execute("SET autocommit = 0").await?;
        tracing::debug!(endpoint = %endpoint, "opened mysql session");
        Ok(MySqlBackend::new(conn))
    }
}

/// Result of [`execute_query`].
#[derive(Debug)]
pub enum QueryOutcome {
    /// The statement produced a result set.
    Rows(Vec<MySqlRow>),
    /// The statement changed rows and returned none.
    Affected(u64),
}

/// Run one SQL statement in its own transaction on a pooled connection.
pub async fn execute_query(pool: &ConnectionPool<MySqlBackend>, sql: &str) -> PoolResult<QueryOutcome> {
    let sql = sql.to_string();
    pool.with_connection(move |conn| {
        async move {
            let mut rows = Vec::new();
            let mut affected = 0;
            {
                let mut results = conn.session()?.fetch_many(sql.as_str());
                while let Some(item) = results.try_next().await? {
                    match item {
                        Either::Left(done) => affected += done.rows_affected(),
                        Either::Right(row) => rows.push(row),
                    }
                }
            }
            if rows.is_empty() {
                Ok::<_, PoolError>(QueryOutcome::Affected(affected))
            } else {
                Ok::<_, PoolError>(QueryOutcome::Rows(rows))
            }
        }
        .boxed()
    })
    .await
}
