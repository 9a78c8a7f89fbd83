//! Process-wide tracking of purgeable buffers.
//!
//! The manager keeps an LRU cache of buffer handles. Buffers pushed out of
//! the cache are pinned, so the least recently used buffers beyond the
//! capacity are the ones that stay put while the rest can be reclaimed
//! cheaply. Cache insertions and removals run on a small worker pool so
//! buffer creation and teardown never wait on the cache lock; bulk access
//! passes fan out one task per tracked buffer on the same pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::common::{BufferId, ManagerConfig, Result};

use super::lru_cache::LruCache;
use super::resource::{PurgeableResource, ResourceHandle};
use super::stats::{ResourceStats, StatsSnapshot};
use super::worker_pool::WorkerPool;

type BulkOp = fn(&dyn PurgeableResource) -> bool;

pub struct ResourceManager {
    cache: Arc<Mutex<LruCache>>,
    pool: Mutex<Option<Arc<WorkerPool>>>,
    pool_size: usize,
    stopped: AtomicBool,
    stats: Arc<ResourceStats>,
}

impl ResourceManager {
    /// Build a manager from explicit settings. Workers start on first use.
    ///
    /// Out-of-range settings fall back to their defaults.
    pub fn new(config: ManagerConfig) -> Self {
        let config = config.sanitized();
        let cache = LruCache::new(config.lru_capacity).unwrap_or_else(|e| {
            warn!(error = %e, "invalid LRU capacity, using default");
            LruCache::default()
        });
        debug!(
            lru_capacity = cache.capacity(),
            pool_size = config.pool_size,
            "resource manager created"
        );
        Self {
            cache: Arc::new(Mutex::new(cache)),
            pool: Mutex::new(None),
            pool_size: config.pool_size,
            stopped: AtomicBool::new(false),
            stats: Arc::new(ResourceStats::new()),
        }
    }

    /// Shared manager configured from the environment on first call.
    pub fn global() -> &'static ResourceManager {
        static GLOBAL: OnceLock<ResourceManager> = OnceLock::new();
        GLOBAL.get_or_init(|| ResourceManager::new(ManagerConfig::from_env()))
    }

    // ========================================================================
    // Cache mutations
    // ========================================================================

    /// Start tracking `handle` (asynchronously).
    pub fn add_resource(&self, handle: ResourceHandle) {
        let cache = Arc::clone(&self.cache);
        let stats = Arc::clone(&self.stats);
        self.spawn(move || {
            let id = handle.id();
            let evicted = {
                let mut cache = cache.lock();
                let evicted = cache.insert(handle);
                debug!(%id, len = cache.len(), "resource added");
                evicted
            };
            stats.inserts.fetch_add(1, Ordering::Relaxed);
            if let Some(evicted) = evicted {
                stats.evictions.fetch_add(1, Ordering::Relaxed);
                pin_if_idle(evicted.as_ref());
            }
        });
    }

    /// Stop tracking `handle`.
    ///
    /// The buffer is marked invalid (and pinned if idle) before this
    /// returns, so a concurrent bulk pass can no longer open it; the cache
    /// entry is dropped asynchronously.
    pub fn remove_resource(&self, handle: ResourceHandle) {
        change_data_valid(handle.as_ref(), false);
        let cache = Arc::clone(&self.cache);
        let stats = Arc::clone(&self.stats);
        self.spawn(move || {
            let id = handle.id();
            let removed = {
                let mut cache = cache.lock();
                let removed = cache.erase(id);
                debug!(%id, len = cache.len(), "resource removed");
                removed
            };
            if let Some(removed) = removed {
                stats.removals.fetch_add(1, Ordering::Relaxed);
                pin_if_idle(removed.as_ref());
            }
        });
    }

    /// Mark `resource` as most recently used. Runs on the caller's thread.
    pub fn set_recent_used_resource(&self, resource: &dyn PurgeableResource) {
        self.cache.lock().visited(resource.id());
    }

    /// Resize the cache, pinning whatever no longer fits.
    pub fn set_lru_cache_capacity(&self, capacity: usize) -> Result<()> {
        let evicted = self.cache.lock().set_capacity(capacity).map_err(|e| {
            warn!(error = %e, "LRU capacity rejected");
            e
        })?;
        self.stats
            .evictions
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        for handle in &evicted {
            pin_if_idle(handle.as_ref());
        }
        debug!(capacity, evicted = evicted.len(), "LRU capacity changed");
        Ok(())
    }

    /// Evict the least recently used buffer. Returns its id.
    pub fn remove_last_resource(&self) -> Option<BufferId> {
        let handle = {
            let mut cache = self.cache.lock();
            let handle = cache.remove_last()?;
            debug!(id = %handle.id(), len = cache.len(), "last resource removed");
            handle
        };
        self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        pin_if_idle(handle.as_ref());
        Some(handle.id())
    }

    /// Forget every tracked buffer without touching them.
    pub fn clear(&self) {
        self.cache.lock().clear();
    }

    // ========================================================================
    // Bulk access
    // ========================================================================

    /// Open a validity-gated read window on every tracked buffer, so all of
    /// them are resident until [`end_access_purgeable_mem`].
    ///
    /// Returns once every window has been attempted, with the number that
    /// opened.
    ///
    /// [`end_access_purgeable_mem`]: Self::end_access_purgeable_mem
    pub fn begin_access_purgeable_mem(&self) -> usize {
        self.bulk("begin access", |r| r.begin_read_with_data_lock())
    }

    /// Close the windows opened by
    /// [`begin_access_purgeable_mem`](Self::begin_access_purgeable_mem).
    pub fn end_access_purgeable_mem(&self) -> usize {
        self.bulk("end access", |r| {
            r.end_read_with_data_lock();
            true
        })
    }

    fn bulk(&self, what: &'static str, op: BulkOp) -> usize {
        let resources = self.cache.lock().resources();
        if resources.is_empty() {
            return 0;
        }
        let total = resources.len();
        let (tx, rx) = flume::bounded(total);

        for resource in resources {
            let tx = tx.clone();
            let stats = Arc::clone(&self.stats);
            self.spawn(move || {
                let ok = op(resource.as_ref());
                stats.bulk_tasks.fetch_add(1, Ordering::Relaxed);
                if !ok {
                    stats.bulk_failures.fetch_add(1, Ordering::Relaxed);
                }
                let _ = tx.send(ok);
            });
        }
        drop(tx);

        let succeeded = rx.iter().filter(|&ok| ok).count();
        debug!(what, total, succeeded, "bulk access finished");
        succeeded
    }

    // ========================================================================
    // Worker pool
    // ========================================================================

    fn spawn<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match self.pool() {
            Some(pool) => {
                if !pool.execute(task) {
                    warn!("worker pool rejected task");
                }
            }
            None => task(),
        }
    }

    /// The running pool, started on first use. `None` after shutdown or if
    /// the workers could not be spawned; callers then run tasks inline.
    fn pool(&self) -> Option<Arc<WorkerPool>> {
        if self.stopped.load(Ordering::Acquire) {
            return None;
        }
        let mut slot = self.pool.lock();
        if slot.is_none() {
            match WorkerPool::new(self.pool_size) {
                Ok(pool) => {
                    debug!(size = self.pool_size, "worker pool started");
                    *slot = Some(Arc::new(pool));
                }
                Err(e) => {
                    error!(error = %e, "starting worker pool failed, running tasks inline");
                    return None;
                }
            }
        }
        slot.clone()
    }

    /// Block until every queued cache mutation and bulk task has run.
    pub fn wait_idle(&self) {
        let pool = self.pool.lock().clone();
        if let Some(pool) = pool {
            pool.wait_idle();
        }
    }

    /// Drain and stop the workers. Later operations run inline.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
        let pool = self.pool.lock().take();
        if let Some(pool) = pool {
            pool.shutdown();
            debug!("worker pool stopped");
        }
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }

    pub fn contains(&self, id: BufferId) -> bool {
        self.cache.lock().contains(id)
    }

    pub fn lru_capacity(&self) -> usize {
        self.cache.lock().capacity()
    }

    /// Tracked ids, most recently used first.
    pub fn lru_ids(&self) -> Vec<BufferId> {
        self.cache.lock().ids()
    }

    /// Dump the recency list at debug level.
    pub fn log_lru_cache(&self) {
        let cache = self.cache.lock();
        for (index, handle) in cache.resources().iter().enumerate() {
            debug!(
                index,
                id = %handle.id(),
                pin_status = handle.pin_status(),
                valid = handle.is_data_valid(),
                "lru entry"
            );
        }
        debug!(len = cache.len(), capacity = cache.capacity(), "lru cache");
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new(ManagerConfig::default())
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        self.shutdown();
        self.cache.lock().clear();
    }
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager")
            .field("len", &self.len())
            .field("lru_capacity", &self.lru_capacity())
            .field("pool_size", &self.pool_size)
            .field("stats", &self.stats())
            .finish()
    }
}

fn pin_if_idle(resource: &dyn PurgeableResource) {
    if resource.pin_status() == 0 {
        resource.pin();
    }
}

fn change_data_valid(resource: &dyn PurgeableResource, valid: bool) {
    resource.set_data_valid(valid);
    if !valid {
        pin_if_idle(resource);
    }
}
