//! In-memory backend and factory shared by the unit tests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{Endpoint, PoolConfig};
use crate::error::BoxError;
use crate::factory::{ConnectionBackend, ConnectionFactory};

/// Switches and counters of one mock session, shared with the test body.
#[derive(Debug)]
pub struct MockState {
    open: AtomicBool,
    ping_ok: AtomicBool,
    ping_hangs: AtomicBool,
    rollback_hangs: AtomicBool,
    close_fails: AtomicBool,
    commit_fails: AtomicBool,
    pub commits: AtomicU64,
    pub rollbacks: AtomicU64,
}

impl MockState {
    fn new() -> Self {
        Self {
            open: AtomicBool::new(true),
            ping_ok: AtomicBool::new(true),
            ping_hangs: AtomicBool::new(false),
            rollback_hangs: AtomicBool::new(false),
            close_fails: AtomicBool::new(false),
            commit_fails: AtomicBool::new(false),
            commits: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    pub fn set_ping_ok(&self, ok: bool) {
        self.ping_ok.store(ok, Ordering::SeqCst);
    }

    pub fn set_ping_hangs(&self, hangs: bool) {
        self.ping_hangs.store(hangs, Ordering::SeqCst);
    }

    pub fn set_rollback_hangs(&self, hangs: bool) {
        self.rollback_hangs.store(hangs, Ordering::SeqCst);
    }

    pub fn set_close_fails(&self, fails: bool) {
        self.close_fails.store(fails, Ordering::SeqCst);
    }

    pub fn set_commit_fails(&self, fails: bool) {
        self.commit_fails.store(fails, Ordering::SeqCst);
    }

    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> u64 {
        self.rollbacks.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct MockBackend {
    state: Arc<MockState>,
    closes: Arc<AtomicU64>,
}

impl MockBackend {
    pub fn state(&self) -> &Arc<MockState> {
        &self.state
    }
}

#[async_trait]
impl ConnectionBackend for MockBackend {
    fn is_open(&self) -> bool {
        self.state.is_open()
    }

    async fn ping(&mut self) -> bool {
        if self.state.ping_hangs.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.state.ping_ok.load(Ordering::SeqCst)
    }

    async fn commit(&mut self) -> Result<(), BoxError> {
        if self.state.commit_fails.load(Ordering::SeqCst) {
            return Err("commit failed: deadlock".into());
        }
        self.state.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), BoxError> {
        if self.state.rollback_hangs.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.state.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BoxError> {
        self.state.set_open(false);
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.state.close_fails.load(Ordering::SeqCst) {
            return Err("close failed: broken pipe".into());
        }
        Ok(())
    }
}

pub struct MockFactory {
    connect_count: AtomicU64,
    close_count: Arc<AtomicU64>,
    should_fail: AtomicBool,
    should_hang: AtomicBool,
    created: Mutex<Vec<Arc<MockState>>>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self {
            connect_count: AtomicU64::new(0),
            close_count: Arc::new(AtomicU64::new(0)),
            should_fail: AtomicBool::new(false),
            should_hang: AtomicBool::new(false),
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn connects(&self) -> u64 {
        self.connect_count.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u64 {
        self.close_count.load(Ordering::SeqCst)
    }

    pub fn fail_connects(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::SeqCst);
    }

    pub fn hang_connects(&self, hang: bool) {
        self.should_hang.store(hang, Ordering::SeqCst);
    }

    /// State handle of the `n`th backend this factory created.
    pub fn created(&self, n: usize) -> Arc<MockState> {
        self.created.lock().unwrap()[n].clone()
    }
}

#[async_trait]
impl ConnectionFactory<MockBackend> for MockFactory {
    async fn connect(&self, _endpoint: &Endpoint, _timeout: Duration) -> Result<MockBackend, BoxError> {
        if self.should_hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.should_fail.load(Ordering::SeqCst) {
            return Err("connection refused".into());
        }
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        let state = Arc::new(MockState::new());
        self.created.lock().unwrap().push(state.clone());
        Ok(MockBackend {
            state,
            closes: self.close_count.clone(),
        })
    }
}

pub fn test_endpoint() -> Endpoint {
    Endpoint::new("db.meteo.local", 3306, "app", "secret", "meteo_local")
}

pub fn test_config() -> PoolConfig {
    PoolConfig {
        endpoint: test_endpoint(),
        min_connections: 0,
        max_connections: 3,
        max_idle: Duration::from_secs(300),
        connect_timeout: Duration::from_secs(1),
        acquire_timeout: Duration::from_millis(200),
    }
}
