use image::DynamicImage;

use crate::core::quadkey::TileKey;

/// Failure reported by a [`TileGenerator`], classified for retry purposes.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct GenerateError {
    pub message: String,
    /// Whether a later [`retry_load`](crate::TileRegistry::retry_load) may
    /// succeed. Non-retryable failures park the tile in a fatal state.
    pub retryable: bool,
}

impl GenerateError {
    /// A transient failure; the tile becomes retryable.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A permanent failure (e.g. malformed source data); retries are futile.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

/// Trait representing anything that can produce a tile bitmap for a given
/// key: a remote map provider, a procedural renderer, a compositor.
///
/// One generator backs one map layer; the registry is parameterized over it.
/// Transport concerns such as HTTP retry or backoff belong inside the
/// implementation, not in the cache.
pub trait TileGenerator: Send + Sync + 'static {
    /// Stable identifier; doubles as the disk-cache subdirectory name, so it
    /// must stay the same across versions for cache compatibility.
    fn name(&self) -> &str;

    /// Produce the bitmap for `key`. Runs on a worker thread, never on the
    /// paint path, and may be called concurrently for different keys.
    fn generate(&self, key: &TileKey) -> Result<DynamicImage, GenerateError>;
}
