
//! Rebuilds one RGBA image from its bit-stream.
//!
//! The read loop is the normative side of the bit-stream contract: the
//! encoder's scan mirrors the order in which this decoder consumes fields.

use smallvec::SmallVec;

use crate::bits::BitReader;
use crate::chaos::RgbChaos;
use crate::entropy::SymbolReader;
use crate::error::{Result, Error};
use crate::filters::{
    SpatialFilterFn, ColorFilterFn, SPATIAL_FILTERS, YUV_TO_RGB,
    SF_COUNT, CF_COUNT, MAX_FILTERS, MAX_CHAOS_LEVELS,
};
use crate::lz;
use crate::mask::Mask;
use crate::math::Vec2;
use crate::mono::{MonoReader, TileGrid, tile_bits_field_width, MIN_TILE_BITS, MAX_TILE_BITS, MAX_PALETTE};
use super::{
    Image, rgb_neighbors,
    NUM_LITERALS, Y_ALPHABET, UV_ALPHABET, LZ_ESCAPE_BASE,
};


/// Decodes one image produced by [`super::RgbaEncoder`].
/// The decoder must be handed the same mask the encoder saw.
#[derive(Debug, Clone, Copy)]
pub struct RgbaDecoder;

impl RgbaDecoder {

    /// Decode one image. Fails on truncated input, malformed tables,
    /// ids outside the active subsets, and impossible LZ copies.
    pub fn read(data: &[u8], mask: &Mask) -> Result<Image> {
        let mut reader = BitReader::new(data);

        let width = reader.read_bits(16)? as usize;
        let height = reader.read_bits(16)? as usize;
        if width == 0 || height == 0 {
            return Err(Error::corrupt("image dimensions"));
        }

        if mask.size() != Vec2(width, height) {
            return Err(Error::invalid("mask size does not match the stream"));
        }

        let size = Vec2(width, height);

        let bits_offset = reader.read_bits(tile_bits_field_width())? as usize;
        if bits_offset > MAX_TILE_BITS - MIN_TILE_BITS {
            return Err(Error::corrupt("tile size"));
        }

        let grid = TileGrid::new(size, MAX_TILE_BITS - bits_offset);

        // active spatial filter subset
        let normal_count = reader.read_bits(5)? as usize + 1;
        let mut spatial: SmallVec<[SpatialFilterFn; MAX_FILTERS]> = SmallVec::new();
        for _ in 0 .. normal_count {
            let index = reader.read_bits(7)? as usize;
            if index >= SF_COUNT {
                return Err(Error::corrupt("spatial filter id"));
            }

            spatial.push(SPATIAL_FILTERS[index]);
        }

        let sympal_count = reader.read_bits(4)? as usize;
        if normal_count + sympal_count > MAX_FILTERS {
            return Err(Error::corrupt("active filter count"));
        }

        let mut sympal: SmallVec<[[u8; 4]; MAX_PALETTE]> = SmallVec::new();
        for _ in 0 .. sympal_count {
            let mut pixel = [0_u8; 4];
            for byte in &mut pixel {
                *byte = reader.read_bits(8)? as u8;
            }

            sympal.push(pixel);
        }

        // active color transform subset
        let cf_count = reader.read_bits(4)? as usize + 1;
        let mut color: SmallVec<[ColorFilterFn; CF_COUNT]> = SmallVec::new();
        for _ in 0 .. cf_count {
            let index = reader.read_bits(8)? as usize;
            if index >= CF_COUNT {
                return Err(Error::corrupt("color filter id"));
            }

            color.push(YUV_TO_RGB[index]);
        }

        let chaos_levels = reader.read_bits(4)? as usize + 1;
        if chaos_levels > MAX_CHAOS_LEVELS {
            return Err(Error::corrupt("chaos levels"));
        }

        let mut y_symbols = SymbolReader::read_tables(
            &mut reader, chaos_levels, Y_ALPHABET, NUM_LITERALS)?;
        let mut u_symbols = SymbolReader::read_tables(
            &mut reader, chaos_levels, UV_ALPHABET, NUM_LITERALS)?;
        let mut v_symbols = SymbolReader::read_tables(
            &mut reader, chaos_levels, UV_ALPHABET, NUM_LITERALS)?;

        let mut sf_map = MonoReader::read_tables(
            &mut reader, grid.tiles, normal_count + sympal_count)?;
        let mut cf_map = MonoReader::read_tables(&mut reader, grid.tiles, cf_count)?;
        let mut a_map = MonoReader::read_tables(&mut reader, size, NUM_LITERALS)?;

        // the pixel scan
        let mut rgba = vec![0_u8; size.area() * 4];
        let mut chaos = RgbChaos::new(width, chaos_levels);
        let mut tile_seen = vec![false; grid.tiles.width()];
        let mut selected_sf = vec![0_u8; grid.tiles.width()];
        let mut selected_cf = vec![0_u8; grid.tiles.width()];

        let mut copy_pending = 0_usize;
        let mut copy_distance = 1_usize;

        for y in 0 .. height {
            a_map.enter_row(y, &mut reader)?;

            if y & (grid.edge() - 1) == 0 {
                let ty = y >> grid.bits;
                sf_map.enter_row(ty, &mut reader)?;
                cf_map.enter_row(ty, &mut reader)?;
                for seen in &mut tile_seen { *seen = false; }
            }

            chaos.start_row();

            for x in 0 .. width {
                let position = y * width + x;

                // the mask always wins, whatever the stream claims
                if mask.is_masked(x, y) {
                    rgba[position * 4 .. position * 4 + 4].copy_from_slice(&mask.color());
                    chaos.skip(x);
                    a_map.skip(x);
                    continue;
                }

                if copy_pending > 0 {
                    copy_pending -= 1;
                    let source = (position - copy_distance) * 4;
                    rgba.copy_within(source .. source + 4, position * 4);
                    chaos.skip(x);
                    a_map.skip(x);
                    continue;
                }

                let tx = x >> grid.bits;
                if !tile_seen[tx] {
                    tile_seen[tx] = true;

                    let sf_id = sf_map.read(tx, &mut reader)?;
                    selected_sf[tx] = sf_id;

                    if (sf_id as usize) < normal_count {
                        selected_cf[tx] = cf_map.read(tx, &mut reader)?;
                    }
                }

                let sf_id = selected_sf[tx] as usize;
                if sf_id >= normal_count {
                    // palette tile: one stored pixel, no symbols at all
                    let pixel = sympal[sf_id - normal_count];
                    rgba[position * 4 .. position * 4 + 4].copy_from_slice(&pixel);
                    chaos.skip(x);
                    a_map.skip(x);
                    continue;
                }

                let y_symbol = y_symbols.read(chaos.y.bin(x), &mut reader)?;

                if y_symbol >= LZ_ESCAPE_BASE {
                    let category = (y_symbol - LZ_ESCAPE_BASE) as usize;
                    let length = lz::read_length(category, &mut reader)?;
                    let distance = lz::read_distance(&mut reader)?;

                    if distance > position {
                        return Err(Error::corrupt("lz copy before the image origin"));
                    }

                    let source = (position - distance) * 4;
                    rgba.copy_within(source .. source + 4, position * 4);

                    copy_pending = length - 1;
                    copy_distance = distance;
                    chaos.skip(x);
                    a_map.skip(x);
                    continue;
                }

                let u_symbol = u_symbols.read(chaos.u.bin(x), &mut reader)?;
                let v_symbol = v_symbols.read(chaos.v.bin(x), &mut reader)?;

                let residual = color[selected_cf[tx] as usize](
                    [y_symbol as u8, u_symbol as u8, v_symbol as u8]);

                let neighbors = rgb_neighbors(&rgba, size, x, y);
                let prediction = spatial[sf_id](&neighbors);

                let alpha = !a_map.read(x, &mut reader)?;

                rgba[position * 4] = residual[0].wrapping_add(prediction[0]);
                rgba[position * 4 + 1] = residual[1].wrapping_add(prediction[1]);
                rgba[position * 4 + 2] = residual[2].wrapping_add(prediction[2]);
                rgba[position * 4 + 3] = alpha;

                chaos.y.store(x, y_symbol as u8);
                chaos.u.store(x, u_symbol as u8);
                chaos.v.store(x, v_symbol as u8);
            }
        }

        Ok(Image { width, height, rgba })
    }
}
