pub mod generator;
pub mod record;
pub mod registry;
pub mod store;

mod fallback;
mod loader;

// Re-exports for convenience
pub use generator::{GenerateError, TileGenerator};
pub use record::{PaintView, TileRecord, TileState};
pub use registry::TileRegistry;
pub use store::{DiskTileStore, StoreError};
