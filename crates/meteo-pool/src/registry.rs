//! Pool registry: one lazily built pool per logical database name.
//!
//! The registry owns the configured endpoints and the shared connection
//! factory. Pools are created on first use (or eagerly via
//! [`PoolRegistry::warm_up`]) and live until [`PoolRegistry::close_all`].
//! With pooling disabled, each name is served by a single
//! [`DirectConnection`] instead.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use meteo_core::MeteoConfig;
use serde::Serialize;
use tokio::sync::{OnceCell, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::direct::{Database, DirectConnection, SingleConnectionStats};
use crate::error::{PoolError, PoolResult};
use crate::factory::{ConnectionBackend, ConnectionFactory};
use crate::pool::{ConnectionPool, PoolStats};

type PoolCell<B> = Arc<OnceCell<Arc<ConnectionPool<B>>>>;

/// Statistics across every database the registry has opened.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    pub pooling_enabled: bool,
    pub pools: BTreeMap<String, DatabaseStats>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum DatabaseStats {
    Pool(PoolStats),
    Single(SingleConnectionStats),
}

pub struct PoolRegistry<B: ConnectionBackend> {
    configs: BTreeMap<String, PoolConfig>,
    pooling_enabled: bool,
    factory: Arc<dyn ConnectionFactory<B>>,
    pools: Mutex<HashMap<String, PoolCell<B>>>,
    direct: Mutex<HashMap<String, Arc<DirectConnection<B>>>>,
    closed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<B: ConnectionBackend> PoolRegistry<B> {
    pub fn new(
        configs: BTreeMap<String, PoolConfig>,
        pooling_enabled: bool,
        factory: Arc<dyn ConnectionFactory<B>>,
    ) -> Self {
        Self {
            configs,
            pooling_enabled,
            factory,
            pools: Mutex::new(HashMap::new()),
            direct: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Build a registry from the `[pooling]` and `[databases.*]` sections.
    ///
    /// Every pool config is validated up front so a bad entry fails at
    /// start-up rather than on first use.
    pub fn from_config(config: &MeteoConfig, factory: Arc<dyn ConnectionFactory<B>>) -> PoolResult<Self> {
        let mut configs = BTreeMap::new();
        for (name, db) in &config.databases {
            let pool_config = PoolConfig::from_settings(db, &config.pooling);
            pool_config
                .validate()
                .map_err(|err| PoolError::InvalidConfig(format!("database {name}: {err}")))?;
            configs.insert(name.clone(), pool_config);
        }
        Ok(Self::new(configs, config.pooling.enabled, factory))
    }

    pub fn pooling_enabled(&self) -> bool {
        self.pooling_enabled
    }

    /// Configured logical database names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.configs.keys().map(String::as_str)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn config_for(&self, name: &str) -> PoolResult<&PoolConfig> {
        if self.is_closed() {
            return Err(PoolError::PoolClosed);
        }
        self.configs
            .get(name)
            .ok_or_else(|| PoolError::UnknownDatabase(name.to_string()))
    }

    /// The pool for `name`, building it on first use.
    ///
    /// Racing first callers share one construction.
    pub async fn get(&self, name: &str) -> PoolResult<Arc<ConnectionPool<B>>> {
        let config = self.config_for(name)?;
        let cell = {
            let mut pools = lock(&self.pools);
            // close_all sets the flag before draining under this lock.
            if self.is_closed() {
                return Err(PoolError::PoolClosed);
            }
            Arc::clone(pools.entry(name.to_string()).or_default())
        };

        let pool = cell
            .get_or_try_init(|| async {
                debug!(database = name, "creating connection pool");
                ConnectionPool::new(name, config.clone(), Arc::clone(&self.factory))
                    .await
                    .map(Arc::new)
            })
            .await?;

        // close_all may have drained the cell while the pool was being built.
        if self.is_closed() {
            pool.close_all().await;
            return Err(PoolError::PoolClosed);
        }
        Ok(Arc::clone(pool))
    }

    /// A handle for `name` in whichever mode the registry runs.
    pub async fn database(&self, name: &str) -> PoolResult<Database<B>> {
        if self.pooling_enabled {
            return self.get(name).await.map(Database::Pooled);
        }
        let config = self.config_for(name)?;
        let direct = {
            let mut direct = lock(&self.direct);
            if self.is_closed() {
                return Err(PoolError::PoolClosed);
            }
            Arc::clone(direct.entry(name.to_string()).or_insert_with(|| {
                Arc::new(DirectConnection::new(name, config.clone(), Arc::clone(&self.factory)))
            }))
        };
        Ok(Database::Direct(direct))
    }

    /// Eagerly build every configured pool. No-op in unpooled mode.
    pub async fn warm_up(&self) -> PoolResult<()> {
        if !self.pooling_enabled {
            return Ok(());
        }
        for name in self.configs.keys() {
            self.get(name).await?;
        }
        Ok(())
    }

    fn initialized_pools(&self) -> Vec<Arc<ConnectionPool<B>>> {
        lock(&self.pools)
            .values()
            .filter_map(|cell| cell.get().cloned())
            .collect()
    }

    /// Counters of every database opened so far.
    pub fn connection_stats(&self) -> ConnectionStats {
        let mut pools: BTreeMap<String, DatabaseStats> = self
            .initialized_pools()
            .into_iter()
            .map(|pool| (pool.name().to_string(), DatabaseStats::Pool(pool.stats())))
            .collect();
        for (name, direct) in lock(&self.direct).iter() {
            pools.insert(name.clone(), DatabaseStats::Single(direct.stats()));
        }
        ConnectionStats {
            pooling_enabled: self.pooling_enabled,
            pools,
        }
    }

    /// One maintenance pass: reap stale idle connections and log counters.
    pub async fn run_maintenance(&self) -> usize {
        let mut reaped = 0;
        for pool in self.initialized_pools() {
            reaped += pool.reap_idle().await;
            let stats = pool.stats();
            debug!(
                database = pool.name(),
                active = stats.active_count,
                idle = stats.idle_count,
                waits = stats.wait_count,
                "pool stats"
            );
        }
        reaped
    }

    /// Run [`run_maintenance`](Self::run_maintenance) every `interval`
    /// until `shutdown` changes.
    pub fn spawn_maintenance(self: &Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            info!(interval_secs = interval.as_secs(), "pool maintenance started");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        if registry.is_closed() {
                            break;
                        }
                        registry.run_maintenance().await;
                    }
                    _ = shutdown.changed() => {
                        info!("pool maintenance shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Close every pool and single connection. Later lookups fail with
    /// [`PoolError::PoolClosed`]. Safe to call more than once.
    pub async fn close_all(&self) {
        let first = !self.closed.swap(true, Ordering::AcqRel);

        let pools: Vec<PoolCell<B>> = lock(&self.pools).drain().map(|(_, cell)| cell).collect();
        let direct: Vec<Arc<DirectConnection<B>>> = lock(&self.direct).drain().map(|(_, conn)| conn).collect();

        if first {
            info!(pools = pools.len(), single = direct.len(), "closing all database connections");
        }
        for cell in pools {
            if let Some(pool) = cell.get() {
                pool.close_all().await;
            }
        }
        for conn in direct {
            conn.close().await;
        }
    }
}

impl<B: ConnectionBackend> Drop for PoolRegistry<B> {
    fn drop(&mut self) {
        if !self.is_closed() && !self.initialized_pools().is_empty() {
            warn!("pool registry dropped without close_all");
        }
    }
}
