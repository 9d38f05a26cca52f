
//! Lossless RGBA image compression for content-generated artwork.
//! This library uses no foreign code or unsafe Rust.
//!
//! The codec combines per-tile spatial and color filtering, a chaos-based
//! context model feeding static Huffman tables, zero-run-length folding and
//! an LZ pixel-copy subsystem. Filter-selection maps and the alpha plane are
//! compressed by a recursive monochrome sub-engine.

#![warn(
    rust_2018_idioms,
    future_incompatible,
    unused_extern_crates,
    unused,

    missing_copy_implementations,
)]

#![deny(
    unused_variables,
    unused_assignments,
    unused_must_use,
    trivial_numeric_casts,
    redundant_semicolons
)]

#![forbid(unsafe_code)]

pub mod error;
pub mod math;
pub mod bits;
pub mod huffman;
pub mod mask;
pub mod filters;
pub mod chaos;
pub mod entropy;
pub mod lz;
pub mod mono;
pub mod rgba;

/// Export the most important items from `spritec`.
/// _Note: This includes a type called `Result`, possibly overwriting the default `std::Result` type usage._
pub mod prelude {
    pub use crate::rgba::{RgbaEncoder, RgbaDecoder, Image, Knobs};
    pub use crate::mask::Mask;
    pub use crate::error::{Result, Error};
}
