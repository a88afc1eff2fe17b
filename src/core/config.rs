//! Configuration for the tile cache subsystem.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Tuning knobs for the registry, worker pool, and fallback engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Root directory of the on-disk tile cache. Each generator gets its own
    /// subtree underneath, keyed by [`TileGenerator::name`].
    ///
    /// [`TileGenerator::name`]: crate::TileGenerator::name
    pub cache_root: PathBuf,
    /// Number of worker threads shared by tile loads and fallback refreshes.
    pub workers: usize,
    /// A record unpainted for longer than this is evicted by `sweep`.
    pub eviction_threshold: Duration,
    /// Delay before the first ancestor-fallback attempt for an imageless tile.
    pub fallback_initial_delay: Duration,
    /// Period between ancestor-fallback attempts after the first.
    pub fallback_interval: Duration,
    /// A tile unpainted for longer than this stops refreshing its fallback;
    /// off-screen tiles are not worth the disk reads.
    pub fallback_inactivity_window: Duration,
    /// How many levels up the pyramid the ancestor search may walk.
    pub max_ancestor_depth: u8,
    /// Tick interval of the housekeeping thread that dispatches due
    /// fallback refreshes.
    pub housekeeping_tick: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_root: PathBuf::from(".cache/tiles"),
            workers: 4,
            eviction_threshold: Duration::from_secs(20),
            fallback_initial_delay: Duration::from_secs(1),
            fallback_interval: Duration::from_secs(30),
            fallback_inactivity_window: Duration::from_secs(30),
            max_ancestor_depth: 5,
            housekeeping_tick: Duration::from_millis(250),
        }
    }
}

/// Configuration presets
impl CacheConfig {
    pub fn low_resource() -> Self {
        Self {
            workers: 1,
            eviction_threshold: Duration::from_secs(10),
            max_ancestor_depth: 3,
            ..Self::default()
        }
    }

    /// Short timings so tests observe schedules without multi-second waits.
    pub fn for_testing(cache_root: PathBuf) -> Self {
        Self {
            cache_root,
            workers: 2,
            eviction_threshold: Duration::from_millis(200),
            fallback_initial_delay: Duration::from_millis(20),
            fallback_interval: Duration::from_millis(50),
            fallback_inactivity_window: Duration::from_secs(5),
            max_ancestor_depth: 5,
            housekeeping_tick: Duration::from_millis(10),
        }
    }
}
