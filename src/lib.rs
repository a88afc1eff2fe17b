//! # Quadtile
//!
//! A quad-tree tile pyramid cache with asynchronous loading.
//!
//! Square raster tiles are addressed by `(level, x, y)` and resolved through
//! a per-tile state machine: a registry lookup either returns a resident
//! record or creates one and hands it to a worker pool, which consults a
//! hierarchical on-disk PNG cache and falls back to a pluggable
//! [`TileGenerator`]. While a tile has no image of its own, a coarser
//! ancestor is cropped and rescaled as a stand-in so a renderer can keep
//! painting without ever blocking on I/O.

pub mod core;
pub mod tiles;

// Re-export public API
pub use crate::core::{
    config::CacheConfig,
    quadkey::{TileKey, LEVEL_MAX, LEVEL_MIN, TILE_SIZE},
};

pub use crate::tiles::{
    generator::{GenerateError, TileGenerator},
    record::{PaintView, TileRecord, TileState},
    registry::TileRegistry,
    store::{DiskTileStore, StoreError},
};

/// Result type used throughout the library
pub type Result<T> = std::result::Result<T, TileError>;

/// Common error types
#[derive(Debug, thiserror::Error)]
pub enum TileError {
    /// Malformed tile address. This is a programmer error and fails fast;
    /// every other fault in the subsystem surfaces as a state transition.
    #[error("invalid tile address: {0}")]
    InvalidAddress(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image codec error: {0}")]
    Image(#[from] image::ImageError),
}

/// Error type alias for convenience
pub type Error = TileError;
