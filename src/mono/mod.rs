
//! The monochrome sub-engine.
//!
//! A self-contained codec for a single-channel 2D plane with an external
//! set of consumed positions. It compresses the alpha plane and the two
//! filter-selection maps of the RGBA engine, and recursively compresses the
//! map of its own tile filters when the grid is large enough.
//!
//! Symbols are not written in one block: the parent engine requests values
//! lazily during its own pixel scan, so a plane position that is never
//! requested costs no bits at all. The writer therefore mirrors the
//! reader's consumption order exactly, first in a statistics pass that
//! designs the entropy tables, then in the emission pass.

mod writer;
mod reader;

pub use writer::{MonoWriter, MonoParams};
pub use reader::MonoReader;

use crate::math::{Vec2, ceil_div, ceil_log2};
use crate::filters::{MonoNeighbors, MonoFilterFn};


/// Smallest tile edge exponent the engines may choose.
pub const MIN_TILE_BITS: usize = 3;

/// Largest tile edge exponent the engines may choose.
pub const MAX_TILE_BITS: usize = 5;

/// Tile grids below this size are not worth another recursion level.
pub const RECURSE_THRESH: usize = 64;

/// Most palette filters one engine may activate.
pub const MAX_PALETTE: usize = 15;

/// Sentinel for tiles whose every position is unconsumed.
pub const MASK_TILE: u8 = 255;

/// Row filters for the non-recursive filter-id transmission:
/// no prediction, left, up, up-left, in that order.
pub const ROW_FILTER_COUNT: usize = 4;

const RF_A: u8 = 1;
const RF_B: u8 = 2;
const RF_C: u8 = 3;


/// Width of the transmitted tile-edge field.
#[inline]
pub fn tile_bits_field_width() -> usize {
    ceil_log2(MAX_TILE_BITS - MIN_TILE_BITS + 1)
}

/// A square tile grid over a plane.
#[derive(Debug, Clone, Copy)]
pub struct TileGrid {
    pub bits: usize,
    pub tiles: Vec2<usize>,
}

impl TileGrid {

    pub fn new(plane: Vec2<usize>, bits: usize) -> Self {
        let edge = 1 << bits;
        TileGrid {
            bits,
            tiles: Vec2(ceil_div(plane.x(), edge), ceil_div(plane.y(), edge)),
        }
    }

    #[inline]
    pub fn edge(&self) -> usize { 1 << self.bits }

    #[inline]
    pub fn count(&self) -> usize { self.tiles.area() }

    #[inline]
    pub fn tile_of(&self, x: usize, y: usize) -> Vec2<usize> {
        Vec2(x >> self.bits, y >> self.bits)
    }

    #[inline]
    pub fn index_of(&self, x: usize, y: usize) -> usize {
        self.tile_of(x, y).flat_index_for_size(self.tiles)
    }
}

/// Fetch the plane neighborhood of a position.
/// Values outside the plane read as zero.
#[inline]
pub(crate) fn plane_neighbors(values: &[u8], size: Vec2<usize>, x: usize, y: usize) -> MonoNeighbors {
    let width = size.width();
    let index = y * width + x;

    MonoNeighbors {
        a: if x > 0 { values[index - 1] } else { 0 },
        b: if y > 0 { values[index - width] } else { 0 },
        c: if x > 0 && y > 0 { values[index - width - 1] } else { 0 },
        d: if y > 0 && x + 1 < width { values[index - width + 1] } else { 0 },
    }
}

/// Apply a plane predictor, reduced to the plane's alphabet.
#[inline]
pub(crate) fn predict(
    filter: MonoFilterFn, values: &[u8], size: Vec2<usize>,
    x: usize, y: usize, num_syms: usize,
) -> u8 {
    (filter(&plane_neighbors(values, size, x, y)) as usize % num_syms) as u8
}

/// The row-filter prediction for the tile at `(tx, ty)`,
/// reading previously transmitted ids from the id buffer.
#[inline]
pub(crate) fn row_filter_prediction(
    row_filter: u8, ids: &[u8], tiles: Vec2<usize>, tx: usize, ty: usize,
) -> u8 {
    let index = ty * tiles.width() + tx;

    match row_filter {
        RF_A if tx > 0 => ids[index - 1],
        RF_B if ty > 0 => ids[index - tiles.width()],
        RF_C if tx > 0 && ty > 0 => ids[index - tiles.width() - 1],
        _ => 0,
    }
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn grids_cover_the_plane(){
        let grid = TileGrid::new(Vec2(65, 17), 3);
        assert_eq!(grid.edge(), 8);
        assert_eq!(grid.tiles, Vec2(9, 3));
        assert_eq!(grid.index_of(64, 16), 2 * 9 + 8);
    }

    #[test]
    fn field_width_matches_the_search_range(){
        assert_eq!(tile_bits_field_width(), 2);
    }
}
