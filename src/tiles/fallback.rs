//! Ancestor fallback: best-effort degraded imagery for tiles still loading.
//!
//! While a tile has no image of its own, the nearest disk-cached ancestor is
//! cropped to the matching quadrant and rescaled to native resolution. This
//! is pure rendering continuity: failures here are silent and never touch
//! the tile's state.

use image::imageops::FilterType;
use std::sync::Arc;

use crate::core::quadkey::TILE_SIZE;
use crate::tiles::record::TileRecord;
use crate::tiles::store::DiskTileStore;

/// One refresh attempt. Walks up to `max_depth` ancestors, closest first,
/// and installs the first decodable one as the record's stand-in image.
///
/// Returns whether a (new) fallback was installed. Stops early when the
/// record already holds the level it would load next: every closer ancestor
/// just missed, so this round cannot improve on it.
pub(crate) fn refresh(record: &TileRecord, store: &DiskTileStore, max_depth: u8) -> bool {
    let key = record.key();
    let quad = key.quad_key();
    let current_level = record.fallback_level();

    for cuts in 1..=max_depth {
        let Some(ancestor) = key.ancestor(cuts) else {
            break;
        };
        if current_level == Some(ancestor.level()) {
            return false;
        }
        // Misses and corrupt entries just move the search one level up.
        let Ok(image) = store.load(&ancestor) else {
            continue;
        };
        let suffix = &quad[quad.len() - cuts as usize..];
        let (px, py, size) = quadrant_rect(suffix, image.width());
        let scaled = image
            .crop_imm(px, py, size, size)
            .resize_exact(TILE_SIZE, TILE_SIZE, FilterType::Triangle);
        return record.set_fallback(Arc::new(scaled), ancestor.level());
    }
    false
}

/// Offset and edge length, in ancestor-image pixels, of the sub-rectangle
/// covering the descendant whose quad-key ends in `suffix`.
///
/// Each digit halves the region: bit 0 of the digit selects the x half,
/// bit 1 the y half.
fn quadrant_rect(suffix: &str, base: u32) -> (u32, u32, u32) {
    let mut px = 0u32;
    let mut py = 0u32;
    let mut half = base / 2;
    for digit in suffix.bytes() {
        let d = digit - b'0';
        if d & 1 != 0 {
            px += half;
        }
        if d & 2 != 0 {
            py += half;
        }
        half /= 2;
    }
    let size = (base >> suffix.len()).max(1);
    (px, py, size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::CacheConfig;
    use crate::core::quadkey::TileKey;
    use image::{DynamicImage, Rgb, RgbImage};
    use std::time::Instant;
    use tempfile::TempDir;

    #[test]
    fn quadrant_rect_single_digit() {
        assert_eq!(quadrant_rect("0", 256), (0, 0, 128));
        assert_eq!(quadrant_rect("1", 256), (128, 0, 128));
        assert_eq!(quadrant_rect("2", 256), (0, 128, 128));
        assert_eq!(quadrant_rect("3", 256), (128, 128, 128));
    }

    #[test]
    fn quadrant_rect_nested_digits() {
        // "21": y half of the parent, then x half of that quadrant.
        assert_eq!(quadrant_rect("21", 256), (64, 128, 64));
        assert_eq!(quadrant_rect("321", 256), (160, 192, 32));
    }

    fn record_for(quad: &str, temp: &TempDir) -> TileRecord {
        let config = CacheConfig::for_testing(temp.path().to_path_buf());
        TileRecord::new(
            TileKey::from_quad_key(quad).unwrap(),
            Instant::now(),
            &config,
        )
    }

    /// Ancestor image with the quadrant of interest painted a distinct color.
    fn marked_ancestor(px: u32, py: u32, size: u32) -> DynamicImage {
        let mut img = RgbImage::from_pixel(256, 256, Rgb([200, 0, 0]));
        for y in py..py + size {
            for x in px..px + size {
                img.put_pixel(x, y, Rgb([0, 0, 200]));
            }
        }
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn resolves_nearest_available_ancestor() {
        let temp = TempDir::new().unwrap();
        let store = DiskTileStore::new(temp.path(), "TestLayer");

        // Grandparent "0" cached, parent "02" absent.
        let grandparent = TileKey::from_quad_key("0").unwrap();
        store
            .save(&grandparent, &marked_ancestor(64, 128, 64))
            .unwrap();

        let record = record_for("021", &temp);
        assert!(refresh(&record, &store, 5));

        let (image, source_level) = record.fallback_image().unwrap();
        assert_eq!(source_level, 1);
        assert_eq!(image.width(), TILE_SIZE);
        // The crop landed on the marked quadrant, so the scaled stand-in is
        // uniformly the marker color.
        let rgb = image.to_rgb8();
        assert_eq!(rgb.get_pixel(0, 0), &Rgb([0, 0, 200]));
        assert_eq!(rgb.get_pixel(255, 255), &Rgb([0, 0, 200]));
    }

    #[test]
    fn prefers_parent_over_grandparent() {
        let temp = TempDir::new().unwrap();
        let store = DiskTileStore::new(temp.path(), "TestLayer");

        let parent = TileKey::from_quad_key("02").unwrap();
        let grandparent = TileKey::from_quad_key("0").unwrap();
        store.save(&parent, &marked_ancestor(128, 0, 128)).unwrap();
        store
            .save(&grandparent, &marked_ancestor(64, 128, 64))
            .unwrap();

        let record = record_for("021", &temp);
        assert!(refresh(&record, &store, 5));
        assert_eq!(record.fallback_image().unwrap().1, 2);
    }

    #[test]
    fn stops_once_holding_the_level_it_would_load() {
        let temp = TempDir::new().unwrap();
        let store = DiskTileStore::new(temp.path(), "TestLayer");

        let grandparent = TileKey::from_quad_key("0").unwrap();
        store
            .save(&grandparent, &marked_ancestor(64, 128, 64))
            .unwrap();

        let record = record_for("021", &temp);
        assert!(refresh(&record, &store, 5));
        // Parent still missing; a second round cannot improve.
        assert!(!refresh(&record, &store, 5));
        assert_eq!(record.fallback_image().unwrap().1, 1);
    }

    #[test]
    fn respects_search_depth_bound() {
        let temp = TempDir::new().unwrap();
        let store = DiskTileStore::new(temp.path(), "TestLayer");

        let root = TileKey::from_quad_key("0").unwrap();
        store.save(&root, &marked_ancestor(0, 0, 128)).unwrap();

        // Level 4 tile, ancestor at level 1 is 3 cuts away.
        let record = record_for("0000", &temp);
        assert!(!refresh(&record, &store, 2));
        assert!(refresh(&record, &store, 3));
    }

    #[test]
    fn empty_cache_finds_nothing() {
        let temp = TempDir::new().unwrap();
        let store = DiskTileStore::new(temp.path(), "TestLayer");
        let record = record_for("021", &temp);
        assert!(!refresh(&record, &store, 5));
        assert!(record.fallback_image().is_none());
    }
}
