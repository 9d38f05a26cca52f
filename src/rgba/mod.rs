
//! The RGBA pixel engine: tile-based spatial and color filter selection,
//! chaos-modeled residual coding, the LZ copy subsystem and the codec
//! driver orchestrating the interleaved sub-engines.

mod writer;
mod reader;

pub use writer::RgbaEncoder;
pub use reader::RgbaDecoder;

use crate::entropy::ZRL_SYMS;
use crate::error::{UnitResult, Error};
use crate::filters::Neighbors;
use crate::lz::ESCAPE_SYMS;
use crate::math::Vec2;
use crate::mono::{MIN_TILE_BITS, MAX_TILE_BITS};


/// A decoded image: 4 bytes per pixel, row-major, top-left origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub width: usize,
    pub height: usize,
    pub rgba: Vec<u8>,
}

pub(crate) const NUM_LITERALS: usize = 256;

/// The Y alphabet: literals, then zero-run symbols, then LZ escapes.
pub(crate) const Y_ALPHABET: usize = NUM_LITERALS + ZRL_SYMS + ESCAPE_SYMS;

/// The U and V alphabets: literals, then zero-run symbols.
pub(crate) const UV_ALPHABET: usize = NUM_LITERALS + ZRL_SYMS;

/// First LZ escape symbol in the Y alphabet.
pub(crate) const LZ_ESCAPE_BASE: u16 = (NUM_LITERALS + ZRL_SYMS) as u16;


/// Enumerated configuration recognised by the encoder.
/// The defaults match the content-generated artwork the codec targets.
#[derive(Debug, Clone, Copy)]
pub struct Knobs {

    /// Fraction of tiles that must be uniform on one value
    /// before a palette filter is added for it.
    pub sympal_thresh: f32,

    /// Cumulative coverage fraction at which the candidate
    /// filter shortlist stops growing.
    pub filter_thresh: f32,

    /// How many ranks of the per-tile shortlist receive award weight.
    pub award_count: usize,

    /// Geometric award schedule per rank.
    pub awards: [u32; 4],

    /// Most tiles revisited across the refinement passes.
    pub mono_revisit_count: usize,

    /// Whether the LZ subsystem participates.
    pub lz_enable: bool,

    /// Smallest tile edge exponent the search may choose.
    pub min_bits: usize,

    /// Largest tile edge exponent the search may choose.
    pub max_bits: usize,
}

impl Default for Knobs {
    fn default() -> Self {
        Knobs {
            sympal_thresh: 0.6,
            filter_thresh: 0.6,
            award_count: 4,
            awards: [5, 3, 1, 1],
            mono_revisit_count: 4096,
            lz_enable: true,
            min_bits: MIN_TILE_BITS,
            max_bits: MAX_TILE_BITS,
        }
    }
}

impl Knobs {
    pub(crate) fn validate(&self) -> UnitResult {
        if !(self.sympal_thresh >= 0.0 && self.sympal_thresh <= 1.0) {
            return Err(Error::invalid("sympal threshold out of range"));
        }

        if !(self.filter_thresh >= 0.0 && self.filter_thresh <= 1.0) {
            return Err(Error::invalid("filter threshold out of range"));
        }

        if self.award_count == 0 || self.award_count > self.awards.len() {
            return Err(Error::invalid("award count out of range"));
        }

        if self.awards[0] == 0 {
            return Err(Error::invalid("top award weight must be positive"));
        }

        if self.min_bits < MIN_TILE_BITS || self.max_bits > MAX_TILE_BITS
            || self.min_bits > self.max_bits
        {
            return Err(Error::invalid("tile edge search range"));
        }

        Ok(())
    }
}


#[inline]
pub(crate) fn pack_pixel(rgba: &[u8]) -> u32 {
    u32::from_le_bytes([rgba[0], rgba[1], rgba[2], rgba[3]])
}

#[inline]
fn rgb_at(rgba: &[u8], position: usize) -> [u8; 3] {
    [rgba[position * 4], rgba[position * 4 + 1], rgba[position * 4 + 2]]
}

/// Fetch the RGB neighborhood of a pixel from the reconstructed image.
/// Interior pixels read their neighbors directly; on the border, missing
/// neighbors substitute (left ↔ up, up-right → up) and the origin
/// predicts from zero.
#[inline]
pub(crate) fn rgb_neighbors(rgba: &[u8], size: Vec2<usize>, x: usize, y: usize) -> Neighbors {
    let width = size.width();
    let position = y * width + x;

    if x > 0 && y > 0 && x + 1 < width {
        return Neighbors {
            a: rgb_at(rgba, position - 1),
            b: rgb_at(rgba, position - width),
            c: rgb_at(rgba, position - width - 1),
            d: rgb_at(rgba, position - width + 1),
        };
    }

    let a = if x > 0 { rgb_at(rgba, position - 1) }
        else if y > 0 { rgb_at(rgba, position - width) }
        else { [0; 3] };

    let b = if y > 0 { rgb_at(rgba, position - width) }
        else if x > 0 { rgb_at(rgba, position - 1) }
        else { [0; 3] };

    let c = if x > 0 && y > 0 { rgb_at(rgba, position - width - 1) } else { b };
    let d = if y > 0 && x + 1 < width { rgb_at(rgba, position - width + 1) } else { b };

    Neighbors { a, b, c, d }
}
