
//! The dominant-color mask consumed by the codec.
//!
//! The mask itself is produced and serialized by the caller; the codec only
//! needs to know which pixels it covers and which color those pixels decode
//! to. Both the encoder and the decoder of one image must be handed the
//! same mask.

use crate::math::Vec2;
use crate::error::{Result, Error};


/// A per-pixel binary map whose set pixels decode to one stored color.
#[derive(Debug, Clone)]
pub struct Mask {
    size: Vec2<usize>,
    covered: Vec<bool>,
    color: [u8; 4],
}

impl Mask {

    /// Wrap a caller-produced coverage map.
    /// The map must contain one entry per pixel, row-major.
    pub fn new(width: usize, height: usize, covered: Vec<bool>, color: [u8; 4]) -> Result<Self> {
        if covered.len() != width * height {
            return Err(Error::invalid("mask size does not match the image"));
        }

        Ok(Mask { size: Vec2(width, height), covered, color })
    }

    /// A mask covering no pixels at all.
    pub fn all_clear(width: usize, height: usize) -> Self {
        Mask {
            size: Vec2(width, height),
            covered: vec![false; width * height],
            color: [0; 4],
        }
    }

    /// The dimensions this mask was built for.
    #[inline]
    pub fn size(&self) -> Vec2<usize> { self.size }

    /// Whether the pixel decodes to the dominant color.
    #[inline]
    pub fn is_masked(&self, x: usize, y: usize) -> bool {
        self.covered[Vec2(x, y).flat_index_for_size(self.size)]
    }

    /// The color that every masked pixel decodes to.
    #[inline]
    pub fn color(&self) -> [u8; 4] { self.color }

    /// Number of pixels covered by this mask.
    pub fn covered_count(&self) -> usize {
        self.covered.iter().filter(|&&covered| covered).count()
    }
}
