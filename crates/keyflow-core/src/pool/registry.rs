//! Session-scoped registry mapping each driver thread to its worker pool.
//!
//! One registry exists per application session. The session start-up path
//! creates it, threads it through the application configuration (see
//! [`crate::config::POOL_REGISTRY_CONFIG`]), and registers a pool when each
//! driver thread starts; processors look their pool up from `init`. Pools
//! are torn down when their driver's session ends. No process-wide
//! singleton exists; tests instantiate their own registry.

use std::sync::Arc;

use fxhash::FxHashMap;
use parking_lot::Mutex;

use super::{PoolError, WorkerPool};

/// Registry of worker pools keyed by driver-thread name.
pub struct PoolRegistry {
    pool_size: usize,
    pools: Mutex<FxHashMap<String, Arc<WorkerPool>>>,
}

impl PoolRegistry {
    /// Creates a registry whose pools will have `pool_size` workers each.
    #[must_use]
    pub fn new(pool_size: usize) -> Self {
        Self {
            pool_size,
            pools: Mutex::new(FxHashMap::default()),
        }
    }

    /// Creates a registry sized to the host machine: one worker per
    /// available core.
    #[must_use]
    pub fn sized_for_host() -> Self {
        Self::new(num_cpus::get())
    }

    /// Worker count configured for each pool.
    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Registers and starts a pool for the named driver thread.
    ///
    /// If a pool is already registered under that name it is considered
    /// orphaned (its driver never shut it down): a warning is logged and
    /// the old pool's shutdown is initiated.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::SpawnFailed`] if worker threads cannot be
    /// created.
    pub fn register_pool(&self, driver_name: &str) -> Result<Arc<WorkerPool>, PoolError> {
        let pool = WorkerPool::spawn(driver_name, self.pool_size)?;
        let old = self
            .pools
            .lock()
            .insert(driver_name.to_string(), Arc::clone(&pool));
        if let Some(old) = old {
            tracing::warn!(
                driver = driver_name,
                "shutting down orphaned worker pool for re-registered driver"
            );
            old.shutdown();
        }
        Ok(pool)
    }

    /// The pool registered for the named driver thread, if any.
    #[must_use]
    pub fn pool_for_driver(&self, driver_name: &str) -> Option<Arc<WorkerPool>> {
        self.pools.lock().get(driver_name).cloned()
    }

    /// Unregisters the named driver's pool and initiates its shutdown
    /// without waiting. Idempotent: a second call (for example when the
    /// session tears a driver down twice) is a no-op.
    pub fn shutdown_pool(&self, driver_name: &str) {
        if let Some(pool) = self.pools.lock().remove(driver_name) {
            pool.shutdown();
        }
    }
}

impl std::fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("pool_size", &self.pool_size)
            .field("pools", &self.pools.lock().keys().cloned().collect::<Vec<_>>())
            .finish()
    }
}
