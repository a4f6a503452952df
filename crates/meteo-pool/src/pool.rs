//! Bounded connection pool for one logical database.
//!
//! # Architecture
//!
//! ```text
//! acquire(timeout)
//!   → pop idle connection → valid?   → hand out
//!                         → invalid? → destroy, free slot, retry
//!   → idle empty, active < max → reserve slot under lock, create outside it
//!   → saturated → back off (woken early by release) until the deadline
//! ```
//!
//! All bookkeeping (`idle`, `active`, `closed`) lives behind one
//! `std::sync::Mutex` per pool. The lock is never held across an `.await`:
//! network work (ping, rollback, connect, close) happens on connections that
//! have already been taken out of the shared state, and those connections
//! keep counting towards `active` while they are out, so
//! `idle.len() <= active <= max_connections` holds at every instant.
//!
//! Every slot held outside the lock is owned by a guard (`SlotGuard`
//! while the pool works on it, the lease inside `PooledConnection` while a
//! caller holds it), so a cancelled `acquire`, `release` or
//! `with_connection` never leaks capacity. Connect and validation are
//! bounded by the acquire deadline.

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::config::PoolConfig;
use crate::error::{PoolError, PoolResult};
use crate::factory::{self, ConnectionBackend, ConnectionFactory};

/// Longest single back-off while waiting for capacity.
const BACKOFF: Duration = Duration::from_millis(100);

/// A connection owned by the pool or leased to a caller.
///
/// Dereferences to the driver backend. A leased connection must go back
/// through [`ConnectionPool::release`]; one that is dropped instead is
/// discarded and its slot returned to the pool.
pub struct PooledConnection<B: ConnectionBackend> {
    id: u64,
    created_at: Instant,
    last_used: Instant,
    backend: B,
    /// Set while leased.
    lease: Option<Arc<Shared<B>>>,
}

impl<B: ConnectionBackend> PooledConnection<B> {
    pub(crate) fn new(id: u64, backend: B) -> Self {
        let now = Instant::now();
        Self {
            id,
            created_at: now,
            last_used: now,
            backend,
            lease: None,
        }
    }

    /// Pool-unique connection id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Last time the connection was handed out or returned.
    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub(crate) fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    fn attach(&mut self, shared: Arc<Shared<B>>) {
        self.lease = Some(shared);
    }

    pub(crate) fn detach(&mut self) {
        self.lease = None;
    }
}

impl<B: ConnectionBackend> Deref for PooledConnection<B> {
    type Target = B;

    fn deref(&self) -> &B {
        &self.backend
    }
}

impl<B: ConnectionBackend> DerefMut for PooledConnection<B> {
    fn deref_mut(&mut self) -> &mut B {
        &mut self.backend
    }
}

impl<B: ConnectionBackend> fmt::Debug for PooledConnection<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("leased", &self.lease.is_some())
            .field("backend", &self.backend)
            .finish()
    }
}

impl<B: ConnectionBackend> Drop for PooledConnection<B> {
    fn drop(&mut self) {
        if let Some(shared) = self.lease.take() {
            tracing::warn!(
                pool = %shared.name,
                conn_id = self.id,
                "leased connection dropped without release, discarding"
            );
            shared.free_slot();
        }
    }
}

/// Point-in-time pool statistics.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Live connections: leased, idle, or being opened.
    pub active_count: usize,
    pub idle_count: usize,
    pub max_connections: usize,
    pub min_connections: usize,
    pub closed: bool,
    /// Acquisitions that gave up with `AcquireTimeout`.
    pub wait_count: u64,
}

struct PoolState<B: ConnectionBackend> {
    /// Returned connections are pushed to the back and handed out from the front.
    idle: VecDeque<PooledConnection<B>>,
    active: usize,
    closed: bool,
    wait_count: u64,
}

pub(crate) struct Shared<B: ConnectionBackend> {
    name: String,
    state: Mutex<PoolState<B>>,
    /// Signalled whenever an idle connection or a free slot appears.
    returned: Notify,
}

impl<B: ConnectionBackend> Shared<B> {
    fn lock(&self) -> MutexGuard<'_, PoolState<B>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop a creation reservation that never produced a connection.
    fn unreserve(&self) {
        let mut state = self.lock();
        state.active = state.active.saturating_sub(1);
    }

    /// Forget one live connection and wake a waiter.
    fn free_slot(&self) {
        self.unreserve();
        self.returned.notify_one();
    }
}

/// One unit of `active` held by work in flight outside the pool lock.
///
/// Dropping the guard (including when the owning future is cancelled)
/// gives the slot back and wakes a waiter. [`SlotGuard::disarm`] keeps it
/// counted once the connection is handed out or parked as idle.
struct SlotGuard<B: ConnectionBackend> {
    shared: Option<Arc<Shared<B>>>,
}

impl<B: ConnectionBackend> SlotGuard<B> {
    fn new(shared: &Arc<Shared<B>>) -> Self {
        Self {
            shared: Some(Arc::clone(shared)),
        }
    }

    fn disarm(mut self) {
        self.shared = None;
    }

    /// Give the slot back without waking anyone.
    fn unreserve(mut self) {
        if let Some(shared) = self.shared.take() {
            shared.unreserve();
        }
    }
}

impl<B: ConnectionBackend> Drop for SlotGuard<B> {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.free_slot();
        }
    }
}

enum Step<B: ConnectionBackend> {
    Reuse(PooledConnection<B>),
    Create,
    Wait,
}

/// A bounded pool of connections to one logical database.
pub struct ConnectionPool<B: ConnectionBackend> {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory<B>>,
    shared: Arc<Shared<B>>,
    next_id: AtomicU64,
}

impl<B: ConnectionBackend> ConnectionPool<B> {
    /// Build a pool and open `min_connections` connections.
    ///
    /// Warm-up failures are logged and skipped; the pool grows on demand.
    pub async fn new(
        name: &str,
        config: PoolConfig,
        factory: Arc<dyn ConnectionFactory<B>>,
    ) -> PoolResult<Self> {
        config.validate()?;

        let pool = Self {
            shared: Arc::new(Shared {
                name: name.to_string(),
                state: Mutex::new(PoolState {
                    idle: VecDeque::with_capacity(config.max_connections),
                    active: 0,
                    closed: false,
                    wait_count: 0,
                }),
                returned: Notify::new(),
            }),
            config,
            factory,
            next_id: AtomicU64::new(1),
        };

        for _ in 0..pool.config.min_connections {
            match factory::create(pool.factory.as_ref(), &pool.config, pool.allocate_id()).await {
                Ok(conn) => {
                    let mut state = pool.shared.lock();
                    state.idle.push_back(conn);
                    state.active += 1;
                }
                Err(err) => {
                    tracing::warn!(pool = name, error = %err, "failed to open warm-up connection");
                }
            }
        }

        let stats = pool.stats();
        tracing::info!(
            pool = name,
            endpoint = %pool.config.endpoint,
            idle = stats.idle_count,
            min = pool.config.min_connections,
            max = pool.config.max_connections,
            "connection pool initialized"
        );
        Ok(pool)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Lease a connection, waiting up to `timeout` for one to become available.
    ///
    /// Stale idle connections and transient connect failures are absorbed;
    /// only [`PoolError::PoolClosed`] and [`PoolError::AcquireTimeout`] are
    /// returned.
    pub async fn acquire(&self, timeout: Duration) -> PoolResult<PooledConnection<B>> {
        let deadline = Instant::now() + timeout;

        loop {
            let step = {
                let mut state = self.shared.lock();
                if state.closed {
                    return Err(PoolError::PoolClosed);
                }
                match state.idle.pop_front() {
                    Some(conn) => Step::Reuse(conn),
                    None if state.active < self.config.max_connections => {
                        // Reserve the slot in the same critical section as the check.
                        state.active += 1;
                        Step::Create
                    }
                    None => Step::Wait,
                }
            };

            match step {
                Step::Reuse(mut conn) => {
                    let slot = SlotGuard::new(&self.shared);
                    let checked = tokio::time::timeout_at(deadline, factory::is_valid(&mut conn, self.config.max_idle)).await;
                    match checked {
                        Ok(true) => {
                            conn.touch();
                            slot.disarm();
                            conn.attach(Arc::clone(&self.shared));
                            tracing::debug!(pool = %self.shared.name, conn_id = conn.id(), "reused idle connection");
                            return Ok(conn);
                        }
                        Ok(false) => {
                            tracing::debug!(pool = %self.shared.name, conn_id = conn.id(), "discarded invalid idle connection");
                            self.retire(conn, slot).await;
                            continue;
                        }
                        Err(_) => {
                            // Unresponsive session: dropped without a close handshake.
                            drop(conn);
                            drop(slot);
                            return Err(self.timed_out(timeout));
                        }
                    }
                }
                Step::Create => {
                    let slot = SlotGuard::new(&self.shared);
                    let created = tokio::time::timeout_at(
                        deadline,
                        factory::create(self.factory.as_ref(), &self.config, self.allocate_id()),
                    )
                    .await;
                    match created {
                        Ok(Ok(mut conn)) => {
                            if self.shared.lock().closed {
                                self.retire(conn, slot).await;
                                return Err(PoolError::PoolClosed);
                            }
                            slot.disarm();
                            conn.attach(Arc::clone(&self.shared));
                            return Ok(conn);
                        }
                        Ok(Err(err)) => {
                            slot.unreserve();
                            tracing::warn!(pool = %self.shared.name, error = %err, "failed to create connection, retrying");
                            if !self.pause_until(deadline, false).await {
                                return Err(self.timed_out(timeout));
                            }
                            continue;
                        }
                        Err(_) => {
                            drop(slot);
                            return Err(self.timed_out(timeout));
                        }
                    }
                }
                Step::Wait => {}
            }

            if !self.pause_until(deadline, true).await {
                return Err(self.timed_out(timeout));
            }
        }
    }

    /// Sleep for one back-off step, or less if the deadline is nearer.
    ///
    /// With `wake_on_return` the sleep ends early when a connection is
    /// returned. Returns `false` once the deadline has passed.
    async fn pause_until(&self, deadline: Instant, wake_on_return: bool) -> bool {
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        let pause = BACKOFF.min(deadline - now);
        if wake_on_return {
            let _ = tokio::time::timeout(pause, self.shared.returned.notified()).await;
        } else {
            tokio::time::sleep(pause).await;
        }
        true
    }

    fn timed_out(&self, timeout: Duration) -> PoolError {
        self.shared.lock().wait_count += 1;
        tracing::debug!(pool = %self.shared.name, ?timeout, "acquire timed out");
        PoolError::AcquireTimeout(timeout)
    }

    /// Return a leased connection.
    ///
    /// Uncommitted work is rolled back, then the connection is revalidated
    /// and either parked as idle or destroyed. After `close_all` every
    /// returned connection is destroyed.
    pub async fn release(&self, mut conn: PooledConnection<B>) {
        conn.detach();
        let slot = SlotGuard::new(&self.shared);

        if self.shared.lock().closed {
            tracing::debug!(pool = %self.shared.name, conn_id = conn.id(), "pool closed, destroying returned connection");
            self.retire(conn, slot).await;
            return;
        }

        if conn.is_open() {
            if let Err(err) = conn.rollback().await {
                tracing::debug!(pool = %self.shared.name, conn_id = conn.id(), error = %err, "rollback failed on release");
                self.retire(conn, slot).await;
                return;
            }
        }

        if !factory::is_valid(&mut conn, self.config.max_idle).await {
            tracing::debug!(pool = %self.shared.name, conn_id = conn.id(), "invalid connection closed instead of returned");
            self.retire(conn, slot).await;
            return;
        }

        conn.touch();
        let rejected = {
            let mut state = self.shared.lock();
            if state.closed || state.idle.len() >= self.config.max_connections {
                Some(conn)
            } else {
                tracing::debug!(
                    pool = %self.shared.name,
                    conn_id = conn.id(),
                    idle_count = state.idle.len() + 1,
                    "returned connection to pool"
                );
                state.idle.push_back(conn);
                None
            }
        };

        match rejected {
            Some(conn) => self.retire(conn, slot).await,
            None => {
                slot.disarm();
                self.shared.returned.notify_one();
            }
        }
    }

    /// Destroy a leased connection without trying to recycle it.
    pub async fn discard(&self, mut conn: PooledConnection<B>) {
        conn.detach();
        let slot = SlotGuard::new(&self.shared);
        self.retire(conn, slot).await;
    }

    /// Close `conn`; its slot is freed when `slot` drops, even if this is cancelled.
    async fn retire(&self, conn: PooledConnection<B>, slot: SlotGuard<B>) {
        factory::destroy(conn).await;
        drop(slot);
    }

    /// Run `f` on a leased connection, committing on success.
    ///
    /// On `Err` the transaction is rolled back before the connection is
    /// returned. On panic the connection is discarded and the panic resumed.
    /// If the returned future is dropped mid-lease the connection is
    /// discarded and its slot freed.
    pub async fn with_connection<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: for<'c> FnOnce(&'c mut B) -> BoxFuture<'c, Result<T, E>>,
        E: From<PoolError>,
    {
        let mut conn = self.acquire(self.config.acquire_timeout).await?;

        let outcome = AssertUnwindSafe(f(&mut conn.backend)).catch_unwind().await;

        match outcome {
            Ok(Ok(value)) => match conn.commit().await {
                Ok(()) => {
                    self.release(conn).await;
                    Ok(value)
                }
                Err(err) => {
                    tracing::debug!(pool = %self.shared.name, conn_id = conn.id(), error = %err, "commit failed");
                    self.release(conn).await;
                    Err(PoolError::Database(err).into())
                }
            },
            Ok(Err(err)) => {
                self.release(conn).await;
                Err(err)
            }
            Err(panic) => {
                tracing::warn!(pool = %self.shared.name, conn_id = conn.id(), "work function panicked, discarding connection");
                self.discard(conn).await;
                std::panic::resume_unwind(panic)
            }
        }
    }

    /// Close the pool: destroy idle connections and refuse new acquisitions.
    ///
    /// Safe to call more than once. Leased connections stay usable until
    /// released, at which point they are destroyed.
    pub async fn close_all(&self) {
        let drained: Vec<PooledConnection<B>> = {
            let mut state = self.shared.lock();
            if state.closed && state.idle.is_empty() {
                return;
            }
            state.closed = true;
            let drained: Vec<_> = state.idle.drain(..).collect();
            state.active = state.active.saturating_sub(drained.len());
            drained
        };

        tracing::info!(pool = %self.shared.name, closed = drained.len(), "closing connection pool");
        for conn in drained {
            factory::destroy(conn).await;
        }
        self.shared.returned.notify_waiters();
    }

    /// Destroy idle connections unused for longer than `max_idle`.
    ///
    /// Returns the number of connections reaped.
    pub async fn reap_idle(&self) -> usize {
        let stale: Vec<PooledConnection<B>> = {
            let mut state = self.shared.lock();
            let max_idle = self.config.max_idle;
            let (stale, fresh): (Vec<_>, Vec<_>) = state
                .idle
                .drain(..)
                .partition(|conn| conn.last_used().elapsed() > max_idle);
            state.idle.extend(fresh);
            state.active = state.active.saturating_sub(stale.len());
            stale
        };

        let reaped = stale.len();
        for conn in stale {
            factory::destroy(conn).await;
        }
        if reaped > 0 {
            self.shared.returned.notify_one();
            tracing::info!(pool = %self.shared.name, reaped, "reaped idle connections");
        }
        reaped
    }

    /// Snapshot of the pool counters, taken under the pool lock.
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();
        PoolStats {
            active_count: state.active,
            idle_count: state.idle.len(),
            max_connections: self.config.max_connections,
            min_connections: self.config.min_connections,
            closed: state.closed,
            wait_count: state.wait_count,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }
}

impl<B: ConnectionBackend> fmt::Debug for ConnectionPool<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("name", &self.shared.name)
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
