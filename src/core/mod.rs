pub mod config;
pub mod quadkey;

// Re-exports for convenience
pub use config::CacheConfig;
pub use quadkey::{TileKey, LEVEL_MAX, LEVEL_MIN, TILE_SIZE};
