//! Worker pool that executes tile loads and fallback refreshes.
//!
//! One bounded pool serves every resident tile instead of a thread per tile;
//! per-key single-flight is enforced by the record's load slot, so tasks for
//! the same key are never in flight twice while different keys proceed
//! independently.

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crate::tiles::fallback;
use crate::tiles::generator::TileGenerator;
use crate::tiles::record::{TileRecord, TileState};
use crate::tiles::store::{DiskTileStore, StoreError};

pub(crate) enum Task {
    Load(Arc<TileRecord>),
    FallbackRefresh(Arc<TileRecord>),
}

/// Shared collaborators every worker needs.
pub(crate) struct LoaderContext {
    pub store: DiskTileStore,
    pub generator: Arc<dyn TileGenerator>,
    pub max_ancestor_depth: u8,
}

pub(crate) struct WorkerPool {
    tx: Option<Sender<Task>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn new(workers: usize, ctx: Arc<LoaderContext>) -> Self {
        let (tx, rx) = unbounded::<Task>();
        let workers = workers.max(1);
        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers {
            let rx = rx.clone();
            let ctx = Arc::clone(&ctx);
            let handle = std::thread::Builder::new()
                .name(format!("quadtile-worker-{}", i))
                .spawn(move || worker_loop(rx, ctx))
                .expect("failed to spawn tile worker thread");
            handles.push(handle);
        }
        Self {
            tx: Some(tx),
            handles,
        }
    }

    pub(crate) fn submit(&self, task: Task) {
        if let Some(tx) = &self.tx {
            // A send error means shutdown is underway; the task is moot.
            let _ = tx.send(task);
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Closing the channel lets workers drain and exit.
        self.tx.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(rx: Receiver<Task>, ctx: Arc<LoaderContext>) {
    for task in rx.iter() {
        match task {
            Task::Load(record) => run_load(&ctx, &record),
            Task::FallbackRefresh(record) => run_fallback(&ctx, &record),
        }
    }
}

/// One load attempt: disk first, generator on miss, persist back on success.
///
/// Disk-level faults never escape this function as errors; every outcome is
/// a state transition on the record. The caller must have claimed the
/// record's load slot; it is released here.
pub(crate) fn run_load(ctx: &LoaderContext, record: &Arc<TileRecord>) {
    let key = record.key();
    if record.state() == TileState::Disposing {
        record.finish_load();
        return;
    }
    record.mark_loading();

    match ctx.store.load(&key) {
        Ok(image) => {
            log::debug!("tile {} served from disk cache", key);
            record.complete_load(Arc::new(image), true);
        }
        Err(miss) => {
            if let StoreError::Io(e) = &miss {
                log::warn!("disk read for tile {} failed: {}", key, e);
            }
            generate_tile(ctx, record);
        }
    }
    record.finish_load();
}

fn generate_tile(ctx: &LoaderContext, record: &Arc<TileRecord>) {
    let key = record.key();
    match ctx.generator.generate(&key) {
        Ok(image) => {
            let image = Arc::new(image);
            // Persist only when the record actually kept the image; a tile
            // disposed mid-generation leaves no trace on disk.
            if record.complete_load(Arc::clone(&image), false) {
                if let Err(e) = ctx.store.save(&key, &image) {
                    // The in-memory image stays authoritative this session.
                    log::warn!("failed to persist tile {}: {}", key, e);
                }
            }
        }
        Err(e) => {
            log::warn!(
                "generation failed for tile {} ({}): {}",
                key,
                if e.retryable { "retryable" } else { "fatal" },
                e.message
            );
            record.fail_load(e.message, e.retryable);
        }
    }
}

/// One fallback refresh; silent best-effort, then re-arm or cancel the
/// schedule. The caller must have claimed the record's fallback slot.
pub(crate) fn run_fallback(ctx: &LoaderContext, record: &Arc<TileRecord>) {
    if record.state() != TileState::Disposing && record.image().is_none() {
        fallback::refresh(record, &ctx.store, ctx.max_ancestor_depth);
    }
    record.finish_fallback(Instant::now());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::CacheConfig;
    use crate::core::quadkey::TileKey;
    use crate::tiles::generator::GenerateError;
    use image::{DynamicImage, Rgb, RgbImage};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct SolidGenerator {
        calls: AtomicUsize,
    }

    impl TileGenerator for SolidGenerator {
        fn name(&self) -> &str {
            "SolidGenerator"
        }
        fn generate(&self, _key: &TileKey) -> Result<DynamicImage, GenerateError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let img = RgbImage::from_pixel(256, 256, Rgb([255, 0, 0]));
            Ok(DynamicImage::ImageRgb8(img))
        }
    }

    struct FailingGenerator {
        retryable: bool,
    }

    impl TileGenerator for FailingGenerator {
        fn name(&self) -> &str {
            "FailingGenerator"
        }
        fn generate(&self, _key: &TileKey) -> Result<DynamicImage, GenerateError> {
            Err(GenerateError {
                message: "no data".into(),
                retryable: self.retryable,
            })
        }
    }

    fn context(temp: &TempDir, generator: Arc<dyn TileGenerator>) -> LoaderContext {
        LoaderContext {
            store: DiskTileStore::new(temp.path(), generator.name()),
            generator,
            max_ancestor_depth: 5,
        }
    }

    fn record(temp: &TempDir) -> Arc<TileRecord> {
        let config = CacheConfig::for_testing(temp.path().to_path_buf());
        Arc::new(TileRecord::new(
            TileKey::new(3, 2, 1).unwrap(),
            Instant::now(),
            &config,
        ))
    }

    #[test]
    fn cache_miss_generates_and_persists() {
        let temp = TempDir::new().unwrap();
        let generator = Arc::new(SolidGenerator {
            calls: AtomicUsize::new(0),
        });
        let ctx = context(&temp, generator.clone());
        let record = record(&temp);

        assert!(record.try_begin_load());
        run_load(&ctx, &record);

        assert_eq!(record.state(), TileState::Loaded);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
        assert!(ctx.store.tile_path(&record.key()).exists());
    }

    #[test]
    fn disk_hit_skips_the_generator() {
        let temp = TempDir::new().unwrap();
        let generator = Arc::new(SolidGenerator {
            calls: AtomicUsize::new(0),
        });
        let ctx = context(&temp, generator.clone());
        let record = record(&temp);

        let cached = DynamicImage::ImageRgb8(RgbImage::from_pixel(256, 256, Rgb([0, 255, 0])));
        ctx.store.save(&record.key(), &cached).unwrap();

        assert!(record.try_begin_load());
        run_load(&ctx, &record);

        assert_eq!(record.state(), TileState::Loaded);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
        let image = record.image().unwrap();
        assert_eq!(image.to_rgb8().get_pixel(0, 0), &Rgb([0, 255, 0]));
    }

    #[test]
    fn retryable_failure_lands_in_error() {
        let temp = TempDir::new().unwrap();
        let ctx = context(&temp, Arc::new(FailingGenerator { retryable: true }));
        let record = record(&temp);

        assert!(record.try_begin_load());
        run_load(&ctx, &record);

        assert_eq!(record.state(), TileState::Error);
        assert_eq!(record.last_error_message(), "no data");
    }

    #[test]
    fn fatal_failure_lands_in_fatal_error() {
        let temp = TempDir::new().unwrap();
        let ctx = context(&temp, Arc::new(FailingGenerator { retryable: false }));
        let record = record(&temp);

        assert!(record.try_begin_load());
        run_load(&ctx, &record);

        assert_eq!(record.state(), TileState::FatalError);
        assert!(!record.try_begin_retry());
    }

    #[test]
    fn disposed_record_is_skipped_without_generation() {
        let temp = TempDir::new().unwrap();
        let generator = Arc::new(SolidGenerator {
            calls: AtomicUsize::new(0),
        });
        let ctx = context(&temp, generator.clone());
        let record = record(&temp);

        record.dispose();
        assert!(record.try_begin_load());
        run_load(&ctx, &record);

        assert_eq!(record.state(), TileState::Disposing);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
        assert!(!ctx.store.tile_path(&record.key()).exists());
    }

    #[test]
    fn corrupt_cache_entry_falls_through_to_generator() {
        let temp = TempDir::new().unwrap();
        let generator = Arc::new(SolidGenerator {
            calls: AtomicUsize::new(0),
        });
        let ctx = context(&temp, generator.clone());
        let record = record(&temp);

        let path = ctx.store.tile_path(&record.key());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"truncated write").unwrap();

        assert!(record.try_begin_load());
        run_load(&ctx, &record);

        assert_eq!(record.state(), TileState::Loaded);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
    }
}
