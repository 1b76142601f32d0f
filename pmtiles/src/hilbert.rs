//! Mapping of tile coordinates onto the Hilbert curve.
//!
//! Tile ids are unique across all zoom levels: the id of `(z, x, y)` is its
//! position on the Hilbert curve filling the `2^z * 2^z` grid, plus the
//! number of tiles in all zoom levels below `z`.
use parking_lot::Mutex;

/// The largest zoom level whose tile ids fit in `u64`.
pub const MAX_ZOOM: u8 = 31;

/// Convert tile coordinates to an index along the Hilbert curve of zoom `z`.
///
/// The result is in `0..4^z` for `x, y < 2^z`, and meaningless otherwise.
///
/// # Panics
///
/// Panics if `z > MAX_ZOOM`.
#[must_use]
pub fn zxy_to_index(z: u8, mut x: u64, mut y: u64) -> u64 {
    assert!(z <= MAX_ZOOM, "zoom level {z} out of range");
    let n = 1u64 << z;
    let mut d = 0u64;
    let mut s = n / 2;
    while s > 0 {
        let rx = u64::from(x & s > 0);
        let ry = u64::from(y & s > 0);
        d += s * s * ((3 * rx) ^ ry);
        if ry == 0 {
            if rx == 1 {
                x = n.wrapping_sub(1).wrapping_sub(x);
                y = n.wrapping_sub(1).wrapping_sub(y);
            }
            std::mem::swap(&mut x, &mut y);
        }
        s /= 2;
    }
    d
}

/// Lazily grown table of cumulative tile counts per zoom level.
///
/// `get(z)` is the number of tile ids used by all zoom levels strictly
/// below `z`, that is `sum(4^i for i in 0..z)`.
#[derive(Debug)]
pub struct ZoomOffsets {
    table: Mutex<Vec<u64>>,
}

impl Default for ZoomOffsets {
    fn default() -> Self {
        Self::new()
    }
}

impl ZoomOffsets {
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: Mutex::new(vec![0]),
        }
    }

    /// # Panics
    ///
    /// Panics if `z > MAX_ZOOM`.
    #[must_use]
    pub fn get(&self, z: u8) -> u64 {
        assert!(z <= MAX_ZOOM, "zoom level {z} out of range");
        let z = usize::from(z);
        let mut table = self.table.lock();
        while table.len() <= z {
            let i = table.len();
            let prev = table[i - 1];
            table.push(prev + (1u64 << (2 * (i - 1))));
        }
        table[z]
    }

    /// The globally unique tile id of `(z, x, y)`.
    #[must_use]
    pub fn tile_id(&self, z: u8, x: u64, y: u64) -> u64 {
        zxy_to_index(z, x, y) + self.get(z)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn zoom_offsets() {
        let offsets = ZoomOffsets::new();
        // Out of order to exercise lazy growth.
        assert_eq!(offsets.get(3), 21);
        assert_eq!(offsets.get(0), 0);
        assert_eq!(offsets.get(1), 1);
        assert_eq!(offsets.get(2), 5);
        assert_eq!(offsets.get(20), 366_503_875_925);
        assert_eq!(offsets.get(MAX_ZOOM), ((1u64 << 62) - 1) / 3);
    }

    #[test]
    fn known_indices() {
        assert_eq!(zxy_to_index(0, 0, 0), 0);
        assert_eq!(
            [(0, 0), (0, 1), (1, 1), (1, 0)].map(|(x, y)| zxy_to_index(1, x, y)),
            [0, 1, 2, 3],
        );
        assert_eq!(zxy_to_index(3, 4, 7), 37);
        assert_eq!(zxy_to_index(3, 5, 7), 38);

        let offsets = ZoomOffsets::new();
        assert_eq!(offsets.tile_id(0, 0, 0), 0);
        assert_eq!(offsets.tile_id(1, 0, 0), 1);
        assert_eq!(offsets.tile_id(3, 5, 7), 59);
    }

    #[test]
    fn injective_per_zoom() {
        for z in 0..=6u8 {
            let n = 1u64 << z;
            let mut seen = HashSet::new();
            for x in 0..n {
                for y in 0..n {
                    let d = zxy_to_index(z, x, y);
                    assert!(d < n * n, "z={z} x={x} y={y} d={d}");
                    assert!(seen.insert(d), "duplicate index z={z} x={x} y={y}");
                }
            }
            assert_eq!(seen.len() as u64, n * n);
        }
    }

    #[test]
    fn injective_across_zooms() {
        let offsets = ZoomOffsets::new();
        let mut seen = HashSet::new();
        for z in 0..=5u8 {
            let n = 1u64 << z;
            for x in 0..n {
                for y in 0..n {
                    assert!(seen.insert(offsets.tile_id(z, x, y)));
                }
            }
        }
        // Ids of zoom 0..=5 are exactly 0..offsets(6).
        assert_eq!(seen.len() as u64, offsets.get(6));
        assert!(seen.iter().all(|&id| id < offsets.get(6)));
    }

    #[test]
    fn extreme_zoom() {
        let offsets = ZoomOffsets::new();
        let max = (1u64 << 30) - 1;
        for (x, y) in [(0, 0), (max, 0), (0, max), (max, max)] {
            let id = offsets.tile_id(30, x, y);
            assert!(id >= offsets.get(30) && id < offsets.get(31));
        }
        let max = (1u64 << MAX_ZOOM) - 1;
        assert!(zxy_to_index(MAX_ZOOM, max, max) < 1u64 << 62);
    }
}
