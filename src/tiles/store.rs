//! Hierarchical on-disk tile store.
//!
//! One PNG per cached tile at `<root>/<generator>/z<level>/x<x>/y<y>.png`.
//! The directory shape is the only wire format and must stay stable across
//! versions. All state lives on the file system; the store itself is a
//! stateless function over it, guarded by a shared reader/writer lock:
//! `load`/`save` take the read side so they may overlap freely, `clear_all`
//! takes the write side so no reader ever observes a half-deleted tree.

use image::{DynamicImage, ImageFormat};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::core::quadkey::TileKey;

const TILE_EXTENSION: &str = "png";

/// Faults at the disk-store boundary. `NotFound` and `Corrupt` are expected
/// and drive fallback to generation; they are never shown to a user.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("tile not cached on disk")]
    NotFound,

    /// The cached file failed to decode, typically a write truncated by a
    /// crash. The file has already been deleted so the next load will not
    /// trip over the same bytes.
    #[error("cached tile was corrupt and has been deleted")]
    Corrupt,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image codec error: {0}")]
    Codec(#[from] image::ImageError),
}

/// Disk cache for one generator's tile subtree.
pub struct DiskTileStore {
    root: PathBuf,
    /// Shared with every store participating in the same cache tree; the
    /// write side is taken only by [`clear_all`](Self::clear_all).
    lock: Arc<RwLock<()>>,
}

impl DiskTileStore {
    /// Create a store rooted at `<cache_root>/<generator_name>` with its own
    /// private reader/writer lock.
    pub fn new(cache_root: &Path, generator_name: &str) -> Self {
        Self::with_shared_lock(cache_root, generator_name, Arc::new(RwLock::new(())))
    }

    /// Create a store sharing `lock` with other stores over the same cache
    /// tree, so one `clear_all` excludes every participant's loads and saves.
    pub fn with_shared_lock(
        cache_root: &Path,
        generator_name: &str,
        lock: Arc<RwLock<()>>,
    ) -> Self {
        Self {
            root: cache_root.join(generator_name),
            lock,
        }
    }

    /// Deterministic path for `key` under this store's root.
    pub fn tile_path(&self, key: &TileKey) -> PathBuf {
        self.root
            .join(format!("z{}", key.level()))
            .join(format!("x{}", key.x()))
            .join(format!("y{}.{}", key.y(), TILE_EXTENSION))
    }

    /// Read and decode the cached tile for `key`.
    ///
    /// A file that exists but fails to decode is treated as a truncated
    /// concurrent write: it is deleted and reported as [`StoreError::Corrupt`].
    pub fn load(&self, key: &TileKey) -> Result<DynamicImage, StoreError> {
        let _shared = self.lock.read().expect("cache lock poisoned");
        let path = self.tile_path(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound)
            }
            Err(e) => return Err(StoreError::Io(e)),
        };
        match image::load_from_memory(&bytes) {
            Ok(image) => Ok(image),
            Err(e) => {
                log::warn!("deleting undecodable cached tile {}: {}", path.display(), e);
                let _ = fs::remove_file(&path);
                Err(StoreError::Corrupt)
            }
        }
    }

    /// Encode and persist `image` at the deterministic path for `key`,
    /// creating parent directories as needed.
    pub fn save(&self, key: &TileKey, image: &DynamicImage) -> Result<(), StoreError> {
        let _shared = self.lock.read().expect("cache lock poisoned");
        let path = self.tile_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        image.save_with_format(&path, ImageFormat::Png)?;
        Ok(())
    }

    /// Delete this generator's entire subtree under the exclusive side of the
    /// shared lock; no load or save overlaps a clear.
    ///
    /// Only files matching the `z*/x*/y*.png` shape are touched, so foreign
    /// files that found their way into the cache root survive, as do the
    /// directories holding them.
    pub fn clear_all(&self) -> Result<(), StoreError> {
        let _exclusive = self.lock.write().expect("cache lock poisoned");
        if !self.root.exists() {
            return Ok(());
        }
        for z_dir in Self::prefixed_dirs(&self.root, 'z')? {
            for x_dir in Self::prefixed_dirs(&z_dir, 'x')? {
                for (y_file, _) in Self::tile_files(&x_dir)? {
                    if let Err(e) = fs::remove_file(&y_file) {
                        log::warn!("failed to delete {}: {}", y_file.display(), e);
                    }
                }
                let _ = fs::remove_dir(&x_dir);
            }
            let _ = fs::remove_dir(&z_dir);
        }
        let _ = fs::remove_dir(&self.root);
        Ok(())
    }

    /// Enumerate every decodable cached tile, yielding `(key, image)` pairs.
    ///
    /// Undecodable files are deleted and skipped; entries whose path parses
    /// to an out-of-range address are ignored.
    pub fn scan(&self) -> Result<Vec<(TileKey, DynamicImage)>, StoreError> {
        let _shared = self.lock.read().expect("cache lock poisoned");
        let mut tiles = Vec::new();
        if !self.root.exists() {
            return Ok(tiles);
        }
        for z_dir in Self::prefixed_dirs(&self.root, 'z')? {
            let Some(level) = Self::parse_component(&z_dir, 'z')
                .and_then(|l| u8::try_from(l).ok())
            else {
                continue;
            };
            for x_dir in Self::prefixed_dirs(&z_dir, 'x')? {
                let Some(x) = Self::parse_component(&x_dir, 'x') else {
                    continue;
                };
                for (y_file, y) in Self::tile_files(&x_dir)? {
                    let Ok(key) = TileKey::new(level, x, y) else {
                        continue;
                    };
                    match self.decode_for_scan(&y_file) {
                        Some(image) => tiles.push((key, image)),
                        None => continue,
                    }
                }
            }
        }
        Ok(tiles)
    }

    fn decode_for_scan(&self, path: &Path) -> Option<DynamicImage> {
        match fs::read(path).ok().and_then(|b| image::load_from_memory(&b).ok()) {
            Some(image) => Some(image),
            None => {
                log::warn!("deleting undecodable cached tile {}", path.display());
                let _ = fs::remove_file(path);
                None
            }
        }
    }

    /// Subdirectories of `dir` named `<prefix><digits>`.
    fn prefixed_dirs(dir: &Path, prefix: char) -> Result<Vec<PathBuf>, StoreError> {
        let mut dirs = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() && Self::parse_component(&path, prefix).is_some() {
                dirs.push(path);
            }
        }
        Ok(dirs)
    }

    /// Files of `dir` named `y<digits>.png`, with the parsed y coordinate.
    fn tile_files(dir: &Path) -> Result<Vec<(PathBuf, u32)>, StoreError> {
        let mut files = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(stem) = name.strip_suffix(&format!(".{}", TILE_EXTENSION)) else {
                continue;
            };
            if let Some(y) = stem.strip_prefix('y').and_then(|s| s.parse::<u32>().ok()) {
                files.push((path, y));
            }
        }
        Ok(files)
    }

    /// Parses `<prefix><digits>` out of a path's final component.
    fn parse_component(path: &Path, prefix: char) -> Option<u32> {
        path.file_name()?
            .to_str()?
            .strip_prefix(prefix)?
            .parse()
            .ok()
    }
}
