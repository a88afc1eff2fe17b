//! Registry of resident tiles: lookup, eviction, disk-cache teardown.

use fxhash::FxHashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::Instant;

use crate::core::config::CacheConfig;
use crate::core::quadkey::TileKey;
use crate::tiles::generator::TileGenerator;
use crate::tiles::loader::{LoaderContext, Task, WorkerPool};
use crate::tiles::record::TileRecord;
use crate::tiles::store::{DiskTileStore, StoreError};

/// Owns every resident [`TileRecord`] for one generator's layer.
///
/// `get` is the renderer's entry point: it returns the existing record for a
/// key or atomically creates one and starts its load on the worker pool. A
/// housekeeping thread periodically dispatches due fallback refreshes; tiles
/// unpainted past the eviction threshold are removed by [`sweep`](Self::sweep).
pub struct TileRegistry {
    config: CacheConfig,
    epoch: Instant,
    ctx: Arc<LoaderContext>,
    records: Arc<Mutex<FxHashMap<TileKey, Arc<TileRecord>>>>,
    pool: Arc<WorkerPool>,
    shutdown: Arc<AtomicBool>,
    housekeeper: Option<JoinHandle<()>>,
}

impl TileRegistry {
    /// Create a registry with its own private disk-cache lock.
    pub fn new(generator: Arc<dyn TileGenerator>, config: CacheConfig) -> Self {
        Self::with_shared_lock(generator, config, Arc::new(RwLock::new(())))
    }

    /// Create a registry whose disk store shares `lock` with other registries
    /// over the same cache root, so a clear in one excludes I/O in all.
    pub fn with_shared_lock(
        generator: Arc<dyn TileGenerator>,
        config: CacheConfig,
        lock: Arc<RwLock<()>>,
    ) -> Self {
        let store =
            DiskTileStore::with_shared_lock(&config.cache_root, generator.name(), lock);
        let ctx = Arc::new(LoaderContext {
            store,
            generator,
            max_ancestor_depth: config.max_ancestor_depth,
        });
        let pool = Arc::new(WorkerPool::new(config.workers, Arc::clone(&ctx)));
        let records: Arc<Mutex<FxHashMap<TileKey, Arc<TileRecord>>>> =
            Arc::new(Mutex::new(FxHashMap::default()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let housekeeper = {
            let records = Arc::clone(&records);
            let pool = Arc::clone(&pool);
            let shutdown = Arc::clone(&shutdown);
            let tick = config.housekeeping_tick;
            std::thread::Builder::new()
                .name("quadtile-housekeeper".into())
                .spawn(move || {
                    while !shutdown.load(Ordering::Acquire) {
                        std::thread::sleep(tick);
                        dispatch_due_fallbacks(&records, &pool);
                    }
                })
                .expect("failed to spawn housekeeping thread")
        };

        Self {
            config,
            epoch: Instant::now(),
            ctx,
            records,
            pool,
            shutdown,
            housekeeper: Some(housekeeper),
        }
    }

    /// Return the resident record for `key`, creating it and enqueuing its
    /// load if absent. Creation under contention yields exactly one record;
    /// callers racing on the same key all observe the same instance.
    pub fn get(&self, key: TileKey) -> Arc<TileRecord> {
        let record = {
            let mut records = self.records.lock().expect("registry lock poisoned");
            if let Some(existing) = records.get(&key) {
                return Arc::clone(existing);
            }
            let record = Arc::new(TileRecord::new(key, self.epoch, &self.config));
            records.insert(key, Arc::clone(&record));
            record
        };
        if record.try_begin_load() {
            self.pool.submit(Task::Load(Arc::clone(&record)));
        }
        record
    }

    /// Returns the resident record for `key` without creating one.
    pub fn lookup(&self, key: &TileKey) -> Option<Arc<TileRecord>> {
        self.records
            .lock()
            .expect("registry lock poisoned")
            .get(key)
            .cloned()
    }

    /// Re-enqueue a load for a tile in `Error`. Idempotent; a no-op for
    /// missing tiles, other states, and tiles with a load already in flight.
    pub fn retry_load(&self, key: &TileKey) -> bool {
        let Some(record) = self.lookup(key) else {
            return false;
        };
        if record.try_begin_retry() {
            self.pool.submit(Task::Load(record));
            true
        } else {
            false
        }
    }

    /// Evict every record unpainted for longer than the eviction threshold,
    /// disposing each. An in-flight load for an evicted tile runs to
    /// completion but its result is discarded.
    pub fn sweep(&self, now: Instant) -> usize {
        let evicted: Vec<Arc<TileRecord>> = {
            let mut records = self.records.lock().expect("registry lock poisoned");
            let stale: Vec<TileKey> = records
                .iter()
                .filter(|(_, r)| r.last_painted_age(now) > self.config.eviction_threshold)
                .map(|(k, _)| *k)
                .collect();
            stale
                .into_iter()
                .filter_map(|key| records.remove(&key))
                .collect()
        };
        for record in &evicted {
            log::debug!("evicting tile {}", record.key());
            record.dispose();
        }
        evicted.len()
    }

    /// Tear down the whole layer: dispose every in-memory record first, then
    /// delete the generator's disk subtree under the exclusive lock.
    pub fn clear_disk_cache(&self) -> Result<(), StoreError> {
        let drained: Vec<Arc<TileRecord>> = {
            let mut records = self.records.lock().expect("registry lock poisoned");
            records.drain().map(|(_, r)| r).collect()
        };
        for record in &drained {
            record.dispose();
        }
        self.ctx.store.clear_all()
    }

    /// Warm the registry from the disk cache: every decodable cached tile
    /// becomes a resident record born `Loaded`. Keys already resident are
    /// left untouched. Returns how many records were seeded.
    pub fn preload_from_disk(&self) -> Result<usize, StoreError> {
        let cached = self.ctx.store.scan()?;
        let mut records = self.records.lock().expect("registry lock poisoned");
        let mut seeded = 0;
        for (key, image) in cached {
            if records.contains_key(&key) {
                continue;
            }
            let has_alpha_quirk = image.color().has_alpha();
            let record = TileRecord::preloaded(
                key,
                self.epoch,
                &self.config,
                Arc::new(image),
                has_alpha_quirk,
            );
            records.insert(key, Arc::new(record));
            seeded += 1;
        }
        Ok(seeded)
    }

    /// Number of resident records.
    pub fn len(&self) -> usize {
        self.records.lock().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }
}

impl Drop for TileRegistry {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.housekeeper.take() {
            let _ = handle.join();
        }
        // Dropping the last pool reference joins the workers.
    }
}

/// One housekeeping tick: enqueue a fallback refresh for every record whose
/// schedule is due, claiming its fallback slot so no record ever has two
/// refreshes in flight.
fn dispatch_due_fallbacks(
    records: &Mutex<FxHashMap<TileKey, Arc<TileRecord>>>,
    pool: &WorkerPool,
) {
    let now = Instant::now();
    let snapshot: Vec<Arc<TileRecord>> = records
        .lock()
        .expect("registry lock poisoned")
        .values()
        .cloned()
        .collect();
    for record in snapshot {
        if record.fallback_due(now) && record.try_begin_fallback() {
            pool.submit(Task::FallbackRefresh(record));
        }
    }
}
