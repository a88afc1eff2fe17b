//! Per-tile state machine and the renderer-facing paint snapshot.

use image::DynamicImage;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::core::config::CacheConfig;
use crate::core::quadkey::TileKey;

/// Sentinel for "no fallback refresh scheduled".
const NEVER: u64 = u64::MAX;

/// Lifecycle states of a resident tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileState {
    /// Initial state; a load task is or will be in flight.
    Loading,
    /// A retry was requested from `Error`; transitions to `Loading` when the
    /// re-enqueued task starts.
    Retrying,
    /// The tile owns its image.
    Loaded,
    /// Load failed retryably; a retry affordance may be shown.
    Error,
    /// The generator classified the failure as permanent; retries are no-ops.
    FatalError,
    /// Terminal. Evicted or shut down; late load completions are discarded.
    Disposing,
}

struct RecordInner {
    state: TileState,
    image: Option<Arc<DynamicImage>>,
    /// Cropped/scaled ancestor bitmap and the level it came from.
    fallback: Option<(Arc<DynamicImage>, u8)>,
    last_error: String,
    has_alpha_quirk: bool,
}

impl RecordInner {
    /// Once `Disposing` or `FatalError`, the only permitted transition is
    /// (re)entering `Disposing`. A slow in-flight load completing after
    /// disposal must not resurrect the record.
    fn set_state(&mut self, state: TileState) {
        if state != TileState::Disposing
            && matches!(self.state, TileState::Disposing | TileState::FatalError)
        {
            return;
        }
        self.state = state;
    }
}

struct FallbackTiming {
    initial_delay_ms: u64,
    interval_ms: u64,
    inactivity_ms: u64,
}

/// The mutable entity owned by the registry, one per resident quad-key.
///
/// Mutated by at most one load task and one fallback task at a time; the
/// renderer only reads snapshots and bumps the paint timestamp.
pub struct TileRecord {
    key: TileKey,
    world_origin: (u32, u32),
    epoch: Instant,
    timing: FallbackTiming,
    inner: Mutex<RecordInner>,
    /// Milliseconds since `epoch` of the last paint; drives eviction.
    last_painted_ms: AtomicU64,
    /// Milliseconds since `epoch` of the next fallback attempt, or [`NEVER`].
    next_fallback_ms: AtomicU64,
    load_inflight: AtomicBool,
    fallback_inflight: AtomicBool,
}

/// Read-only snapshot handed to the renderer by [`TileRecord::paint`].
#[derive(Clone)]
pub struct PaintView {
    pub state: TileState,
    /// Pixel-space top-left of the tile, derived once from the key.
    pub world_origin: (u32, u32),
    /// The tile's own bitmap; present exactly when `state == Loaded`.
    pub image: Option<Arc<DynamicImage>>,
    /// Degraded stand-in from a coarser level, with its source level.
    pub fallback: Option<(Arc<DynamicImage>, u8)>,
    /// The disk-decoded image unexpectedly carried an alpha channel;
    /// transparency-blend shortcuts must be skipped for this tile.
    pub has_alpha_quirk: bool,
    /// Whether a retry affordance applies (`Error`, but not `FatalError`).
    pub can_retry: bool,
}

impl TileRecord {
    pub(crate) fn new(key: TileKey, epoch: Instant, config: &CacheConfig) -> Self {
        let now_ms = Instant::now().saturating_duration_since(epoch).as_millis() as u64;
        Self {
            key,
            world_origin: key.pixel_origin(),
            epoch,
            timing: FallbackTiming {
                initial_delay_ms: config.fallback_initial_delay.as_millis() as u64,
                interval_ms: config.fallback_interval.as_millis() as u64,
                inactivity_ms: config.fallback_inactivity_window.as_millis() as u64,
            },
            inner: Mutex::new(RecordInner {
                state: TileState::Loading,
                image: None,
                fallback: None,
                last_error: String::new(),
                has_alpha_quirk: false,
            }),
            last_painted_ms: AtomicU64::new(now_ms),
            next_fallback_ms: AtomicU64::new(NEVER),
            load_inflight: AtomicBool::new(false),
            fallback_inflight: AtomicBool::new(false),
        }
    }

    /// A record born `Loaded` from an already-decoded cached image; used when
    /// warm-scanning the disk cache.
    pub(crate) fn preloaded(
        key: TileKey,
        epoch: Instant,
        config: &CacheConfig,
        image: Arc<DynamicImage>,
        has_alpha_quirk: bool,
    ) -> Self {
        let record = Self::new(key, epoch, config);
        {
            let mut inner = record.inner.lock().expect("record lock poisoned");
            inner.image = Some(image);
            inner.has_alpha_quirk = has_alpha_quirk;
            inner.state = TileState::Loaded;
        }
        record
    }

    pub fn key(&self) -> TileKey {
        self.key
    }

    pub fn world_origin(&self) -> (u32, u32) {
        self.world_origin
    }

    pub fn state(&self) -> TileState {
        self.inner.lock().expect("record lock poisoned").state
    }

    pub fn image(&self) -> Option<Arc<DynamicImage>> {
        self.inner.lock().expect("record lock poisoned").image.clone()
    }

    pub fn fallback_image(&self) -> Option<(Arc<DynamicImage>, u8)> {
        self.inner
            .lock()
            .expect("record lock poisoned")
            .fallback
            .clone()
    }

    pub fn last_error_message(&self) -> String {
        self.inner
            .lock()
            .expect("record lock poisoned")
            .last_error
            .clone()
    }

    pub fn has_alpha_quirk(&self) -> bool {
        self.inner.lock().expect("record lock poisoned").has_alpha_quirk
    }

    /// Time since the renderer last painted this tile.
    pub fn last_painted_age(&self, now: Instant) -> Duration {
        let painted = self.last_painted_ms.load(Ordering::Relaxed);
        Duration::from_millis(self.ms(now).saturating_sub(painted))
    }

    /// The renderer-facing entry point: non-blocking, never does I/O.
    ///
    /// Returns a snapshot of the current image (or ancestor stand-in) and, as
    /// a side effect, bumps the paint timestamp and arms the fallback-refresh
    /// schedule while the tile still has no image of its own.
    pub fn paint(&self, now: Instant) -> PaintView {
        self.last_painted_ms.store(self.ms(now), Ordering::Relaxed);

        let inner = self.inner.lock().expect("record lock poisoned");
        if inner.image.is_none() && inner.state != TileState::Disposing {
            self.arm_fallback(now, &inner);
        }
        PaintView {
            state: inner.state,
            world_origin: self.world_origin,
            image: inner.image.clone(),
            fallback: inner.fallback.clone(),
            has_alpha_quirk: inner.has_alpha_quirk,
            can_retry: inner.state == TileState::Error,
        }
    }

    fn arm_fallback(&self, now: Instant, inner: &RecordInner) {
        // Nothing better exists once the direct parent is the source.
        if let Some((_, source_level)) = &inner.fallback {
            if self.key.level() - source_level == 1 {
                return;
            }
        }
        let first = self.ms(now) + self.timing.initial_delay_ms;
        let _ = self.next_fallback_ms.compare_exchange(
            NEVER,
            first,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }

    // ---- load orchestration (worker pool side) ----

    /// Claims the single load slot; at most one load task per key.
    pub(crate) fn try_begin_load(&self) -> bool {
        self.load_inflight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn finish_load(&self) {
        self.load_inflight.store(false, Ordering::Release);
    }

    /// Retry is only legal from `Error`; claims the load slot and moves to
    /// `Retrying`. Idempotent: a second call while one is outstanding is a
    /// no-op.
    pub(crate) fn try_begin_retry(&self) -> bool {
        let mut inner = self.inner.lock().expect("record lock poisoned");
        if inner.state != TileState::Error {
            return false;
        }
        if !self.try_begin_load() {
            return false;
        }
        inner.set_state(TileState::Retrying);
        true
    }

    pub(crate) fn mark_loading(&self) {
        self.inner
            .lock()
            .expect("record lock poisoned")
            .set_state(TileState::Loading);
    }

    /// Install the loaded image. Returns `false` (and discards the image)
    /// when the record was disposed or fatally errored in the meantime.
    pub(crate) fn complete_load(&self, image: Arc<DynamicImage>, from_disk: bool) -> bool {
        let mut inner = self.inner.lock().expect("record lock poisoned");
        if matches!(inner.state, TileState::Disposing | TileState::FatalError) {
            return false;
        }
        inner.has_alpha_quirk = from_disk && image.color().has_alpha();
        inner.image = Some(image);
        inner.fallback = None;
        inner.set_state(TileState::Loaded);
        self.next_fallback_ms.store(NEVER, Ordering::Relaxed);
        true
    }

    pub(crate) fn fail_load(&self, message: impl Into<String>, retryable: bool) {
        let mut inner = self.inner.lock().expect("record lock poisoned");
        if matches!(inner.state, TileState::Disposing | TileState::FatalError) {
            return;
        }
        inner.last_error = message.into();
        inner.set_state(if retryable {
            TileState::Error
        } else {
            TileState::FatalError
        });
    }

    // ---- fallback orchestration ----

    /// Install an ancestor stand-in. Refused once the tile owns an image or
    /// is disposing.
    pub(crate) fn set_fallback(&self, image: Arc<DynamicImage>, source_level: u8) -> bool {
        let mut inner = self.inner.lock().expect("record lock poisoned");
        if inner.image.is_some() || inner.state == TileState::Disposing {
            return false;
        }
        inner.fallback = Some((image, source_level));
        true
    }

    pub(crate) fn fallback_level(&self) -> Option<u8> {
        self.inner
            .lock()
            .expect("record lock poisoned")
            .fallback
            .as_ref()
            .map(|(_, level)| *level)
    }

    /// Whether the housekeeping tick should dispatch a refresh now.
    pub(crate) fn fallback_due(&self, now: Instant) -> bool {
        let next = self.next_fallback_ms.load(Ordering::Relaxed);
        next != NEVER
            && self.ms(now) >= next
            && !self.fallback_inflight.load(Ordering::Acquire)
    }

    pub(crate) fn try_begin_fallback(&self) -> bool {
        self.fallback_inflight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Re-arms or cancels the refresh schedule after an attempt.
    ///
    /// Self-cancels when the tile got its image, is disposing, already holds
    /// the closest possible ancestor, or has not been painted within the
    /// inactivity window.
    pub(crate) fn finish_fallback(&self, now: Instant) {
        let cancel = {
            let inner = self.inner.lock().expect("record lock poisoned");
            let best_found = inner
                .fallback
                .as_ref()
                .map(|(_, level)| self.key.level() - level == 1)
                .unwrap_or(false);
            inner.image.is_some()
                || inner.state == TileState::Disposing
                || best_found
                || self.last_painted_age(now).as_millis() as u64 > self.timing.inactivity_ms
        };
        let next = if cancel {
            NEVER
        } else {
            self.ms(now) + self.timing.interval_ms
        };
        self.next_fallback_ms.store(next, Ordering::Relaxed);
        self.fallback_inflight.store(false, Ordering::Release);
    }

    // ---- disposal ----

    /// Invalidates the record: cancels the fallback schedule and makes any
    /// in-flight load's completion a no-op. Idempotent.
    pub(crate) fn dispose(&self) {
        {
            let mut inner = self.inner.lock().expect("record lock poisoned");
            inner.state = TileState::Disposing;
            inner.image = None;
            inner.fallback = None;
        }
        self.next_fallback_ms.store(NEVER, Ordering::Relaxed);
    }

    fn ms(&self, t: Instant) -> u64 {
        t.saturating_duration_since(self.epoch).as_millis() as u64
    }
}
