//! Quad-key addressing for the tile pyramid.
//!
//! A tile at `(level, x, y)` is equivalently addressed by a base-4 string
//! with one digit per level, root to leaf. The digit at position `i` selects
//! a quadrant: bit 0 is the x half, bit 1 is the y half. The string doubles
//! as the cache-map key and the on-disk path component.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Result, TileError};

/// Edge length of a tile bitmap in pixels.
pub const TILE_SIZE: u32 = 256;

/// Coarsest valid level of detail.
pub const LEVEL_MIN: u8 = 1;

/// Finest valid level of detail.
pub const LEVEL_MAX: u8 = 22;

/// Immutable address of a tile in the quad-tree pyramid.
///
/// Invariants: `LEVEL_MIN <= level <= LEVEL_MAX` and `x, y < 2^level`;
/// both constructors enforce them, so a `TileKey` in hand is always valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileKey {
    level: u8,
    x: u32,
    y: u32,
}

impl TileKey {
    /// Creates a key from level-of-detail and tile coordinates.
    pub fn new(level: u8, x: u32, y: u32) -> Result<Self> {
        if !(LEVEL_MIN..=LEVEL_MAX).contains(&level) {
            return Err(TileError::InvalidAddress(format!(
                "level {} outside {}..={}",
                level, LEVEL_MIN, LEVEL_MAX
            )));
        }
        let extent = 1u32 << level;
        if x >= extent || y >= extent {
            return Err(TileError::InvalidAddress(format!(
                "tile ({}, {}) outside level {} extent {}",
                x, y, level, extent
            )));
        }
        Ok(Self { level, x, y })
    }

    /// Parses a base-4 quad-key string; the level is the string length.
    pub fn from_quad_key(quad_key: &str) -> Result<Self> {
        let level = quad_key.len();
        if !(LEVEL_MIN as usize..=LEVEL_MAX as usize).contains(&level) {
            return Err(TileError::InvalidAddress(format!(
                "quad-key {:?} has invalid length {}",
                quad_key, level
            )));
        }
        let mut x = 0u32;
        let mut y = 0u32;
        for (i, digit) in quad_key.chars().enumerate() {
            let mask = 1u32 << (level - 1 - i);
            match digit {
                '0' => {}
                '1' => x |= mask,
                '2' => y |= mask,
                '3' => {
                    x |= mask;
                    y |= mask;
                }
                other => {
                    return Err(TileError::InvalidAddress(format!(
                        "quad-key {:?} has invalid digit {:?}",
                        quad_key, other
                    )))
                }
            }
        }
        Ok(Self {
            level: level as u8,
            x,
            y,
        })
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn x(&self) -> u32 {
        self.x
    }

    pub fn y(&self) -> u32 {
        self.y
    }

    /// The base-4 string address, one digit per level from root to leaf.
    pub fn quad_key(&self) -> String {
        let mut key = String::with_capacity(self.level as usize);
        for i in (1..=self.level).rev() {
            let mask = 1u32 << (i - 1);
            let mut digit = 0u8;
            if self.x & mask != 0 {
                digit += 1;
            }
            if self.y & mask != 0 {
                digit += 2;
            }
            key.push((b'0' + digit) as char);
        }
        key
    }

    /// Pixel-space top-left corner of this tile at its own level.
    pub fn pixel_origin(&self) -> (u32, u32) {
        (self.x * TILE_SIZE, self.y * TILE_SIZE)
    }

    /// The containing tile `cuts` levels coarser, or `None` when that would
    /// fall below [`LEVEL_MIN`].
    pub fn ancestor(&self, cuts: u8) -> Option<TileKey> {
        if cuts == 0 || self.level < LEVEL_MIN + cuts {
            return None;
        }
        Some(TileKey {
            level: self.level - cuts,
            x: self.x >> cuts,
            y: self.y >> cuts,
        })
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "z{}/x{}/y{}", self.level, self.x, self.y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quad_key_known_values() {
        // Bing maps worked example: level 3, (3, 5) -> "213"
        let key = TileKey::new(3, 3, 5).unwrap();
        assert_eq!(key.quad_key(), "213");

        let key = TileKey::new(1, 0, 0).unwrap();
        assert_eq!(key.quad_key(), "0");

        let key = TileKey::new(2, 1, 1).unwrap();
        assert_eq!(key.quad_key(), "03");
    }

    #[test]
    fn quad_key_round_trips_exhaustively_at_small_levels() {
        for level in LEVEL_MIN..=6 {
            let extent = 1u32 << level;
            for x in 0..extent {
                for y in 0..extent {
                    let key = TileKey::new(level, x, y).unwrap();
                    let qk = key.quad_key();
                    assert_eq!(qk.len(), level as usize);
                    let back = TileKey::from_quad_key(&qk).unwrap();
                    assert_eq!(back, key);
                }
            }
        }
    }

    #[test]
    fn quad_key_round_trips_at_max_level() {
        let extent = 1u32 << LEVEL_MAX;
        for &(x, y) in &[(0, 0), (extent - 1, extent - 1), (12_345, 987_654)] {
            let key = TileKey::new(LEVEL_MAX, x, y).unwrap();
            assert_eq!(TileKey::from_quad_key(&key.quad_key()).unwrap(), key);
        }
    }

    #[test]
    fn rejects_out_of_range_levels() {
        assert!(matches!(
            TileKey::new(0, 0, 0),
            Err(TileError::InvalidAddress(_))
        ));
        assert!(matches!(
            TileKey::new(LEVEL_MAX + 1, 0, 0),
            Err(TileError::InvalidAddress(_))
        ));
    }

    #[test]
    fn rejects_coordinates_outside_level_extent() {
        assert!(TileKey::new(3, 8, 0).is_err());
        assert!(TileKey::new(3, 0, 8).is_err());
        assert!(TileKey::new(3, 7, 7).is_ok());
    }

    #[test]
    fn rejects_malformed_quad_keys() {
        assert!(TileKey::from_quad_key("").is_err());
        assert!(TileKey::from_quad_key("014x").is_err());
        assert!(TileKey::from_quad_key("4").is_err());
        assert!(TileKey::from_quad_key(&"0".repeat(LEVEL_MAX as usize + 1)).is_err());
    }

    #[test]
    fn pixel_origin_scales_by_tile_size() {
        let key = TileKey::new(3, 2, 1).unwrap();
        assert_eq!(key.pixel_origin(), (512, 256));
    }

    #[test]
    fn ancestor_strips_trailing_digits() {
        let key = TileKey::from_quad_key("0213").unwrap();
        assert_eq!(key.ancestor(1).unwrap().quad_key(), "021");
        assert_eq!(key.ancestor(3).unwrap().quad_key(), "0");
        assert!(key.ancestor(4).is_none());
        assert!(key.ancestor(0).is_none());
    }
}
