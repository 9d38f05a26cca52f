
//! The LZ pixel-copy subsystem, for RGBA data only.
//!
//! The encoder hashes pairs of pixels into a chain table and greedily
//! accepts matches whose estimated bit saving is positive. A chosen match
//! rides in the Y-channel symbol alphabet as an escape code carrying the
//! length bit-range; the distance bit-range follows raw. Copies avoid
//! masked pixels entirely so the mask, LZ and literal modes stay disjoint.

use std::io::Write;

use crate::bits::{BitWriter, BitReader};
use crate::math::bit_length;
use crate::error::{Result, UnitResult, Error};


/// Shortest accepted match, in pixels.
pub const MIN_MATCH: usize = 2;

/// Longest accepted match, in pixels.
pub const MAX_MATCH: usize = 4096;

/// How far back a match may reach, in pixels.
pub const WINDOW_SIZE: usize = 1 << 20;

/// Escape symbols appended to the Y alphabet,
/// one per length bit-range.
pub const ESCAPE_SYMS: usize = 16;

const HASH_BITS: usize = 18;
const HASH_SIZE: usize = 1 << HASH_BITS;
const HASH_MULT: u64 = 0xc6a4_a793_5bd1_e995;
const CHAIN_LIMIT: usize = 32;

// estimated cost model: a copied pixel saves about 9 bits,
// an emitted match costs its escape code plus the extension bits
const SAVED_PIXEL_BITS: i64 = 9;
const LEN_PREFIX_COST: i64 = 5;
const DIST_PREFIX_COST: i64 = 7;

const NO_ENTRY: u32 = u32::MAX;

// largest length category: bit_length(MAX_MATCH - MIN_MATCH)
const MAX_LEN_CATEGORY: usize = 12;
const MAX_DIST_CATEGORY: usize = 20;


/// One accepted pixel copy: `length` pixels at `offset`
/// repeat the pixels starting `distance` before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Match {
    pub offset: u32,
    pub distance: u32,
    pub length: u16,
}

#[inline]
fn hash_pixel_pair(first: u32, second: u32) -> usize {
    let packed = ((first as u64) << 32) | second as u64;
    (packed.wrapping_mul(HASH_MULT) >> (64 - HASH_BITS)) as usize
}

#[inline]
fn estimated_saving(length: usize, distance: usize) -> i64 {
    length as i64 * SAVED_PIXEL_BITS
        - (LEN_PREFIX_COST + ceil_log2(length) + DIST_PREFIX_COST + ceil_log2(distance))
}

#[inline]
fn ceil_log2(value: usize) -> i64 {
    crate::math::ceil_log2(value) as i64
}


/// Search the image for profitable pixel copies, in scan order.
///
/// `pixels` are whole RGBA values, `masked` marks pixels the match must not
/// touch: neither as copy source nor as copy target. Accepted matches never
/// overlap each other, so they can be consumed front to back during the
/// pixel scan.
pub fn find_matches(pixels: &[u32], masked: &[bool]) -> Vec<Match> {
    debug_assert_eq!(pixels.len(), masked.len());

    let count = pixels.len();
    let mut matches = Vec::new();
    if count < MIN_MATCH { return matches }

    let mut table = vec![NO_ENTRY; HASH_SIZE];
    let mut chain = vec![NO_ENTRY; count];

    let mut insert = |table: &mut Vec<u32>, chain: &mut Vec<u32>, position: usize| {
        if position + MIN_MATCH <= count {
            let hash = hash_pixel_pair(pixels[position], pixels[position + 1]);
            chain[position] = table[hash];
            table[hash] = position as u32;
        }
    };

    let mut offset = 0;
    while offset + MIN_MATCH <= count {
        let mut best: Option<(usize, usize)> = None; // (length, distance)

        if !masked[offset] && !masked[offset + 1] {
            let hash = hash_pixel_pair(pixels[offset], pixels[offset + 1]);
            let mut candidate = table[hash];
            let mut depth = 0;

            while candidate != NO_ENTRY && depth < CHAIN_LIMIT {
                let start = candidate as usize;
                if offset - start > WINDOW_SIZE { break }

                let limit = (count - offset).min(MAX_MATCH);
                let mut length = 0;
                while length < limit
                    && pixels[start + length] == pixels[offset + length]
                    && !masked[start + length] && !masked[offset + length]
                {
                    length += 1;
                }

                if length >= MIN_MATCH {
                    let distance = offset - start;

                    if estimated_saving(length, distance) > 0 {
                        let better = match best {
                            None => true,
                            // longest, then nearest
                            Some((best_length, best_distance)) =>
                                length > best_length ||
                                (length == best_length && distance < best_distance),
                        };

                        if better { best = Some((length, distance)); }
                    }
                }

                candidate = chain[start];
                depth += 1;
            }
        }

        match best {
            Some((length, distance)) => {
                matches.push(Match {
                    offset: offset as u32,
                    distance: distance as u32,
                    length: length as u16,
                });

                // covered pixels still feed the chain so later rows
                // can reference into this copy
                for position in offset .. offset + length {
                    insert(&mut table, &mut chain, position);
                }

                offset += length;
            },

            None => {
                insert(&mut table, &mut chain, offset);
                offset += 1;
            },
        }
    }

    matches
}


/// The Y-alphabet escape index for a match length.
#[inline]
pub fn length_category(length: usize) -> usize {
    debug_assert!(length >= MIN_MATCH && length <= MAX_MATCH);
    bit_length(length - MIN_MATCH)
}

/// Append the length extension bits, the leading one bit elided.
pub fn write_length_extra(length: usize, writer: &mut BitWriter<impl Write>) -> UnitResult {
    let code = length - MIN_MATCH;
    let category = bit_length(code);

    if category > 1 {
        writer.write_bits((code - (1 << (category - 1))) as u64, category - 1)?;
    }

    Ok(())
}

/// Rebuild a match length from its escape category and extension bits.
pub fn read_length(category: usize, reader: &mut BitReader<'_>) -> Result<usize> {
    if category > MAX_LEN_CATEGORY {
        return Err(Error::corrupt("lz length category"));
    }

    let code = if category == 0 { 0 }
        else { (1 << (category - 1)) + reader.read_bits(category - 1)? as usize };

    Ok(code + MIN_MATCH)
}

/// Append a match distance: a 5-bit bit-range, then the extension bits.
pub fn write_distance(distance: usize, writer: &mut BitWriter<impl Write>) -> UnitResult {
    debug_assert!(distance >= 1 && distance <= WINDOW_SIZE);
    let code = distance - 1;
    let category = bit_length(code);

    writer.write_bits(category as u64, 5)?;
    if category > 1 {
        writer.write_bits((code - (1 << (category - 1))) as u64, category - 1)?;
    }

    Ok(())
}

/// Read a match distance written by [`write_distance`].
pub fn read_distance(reader: &mut BitReader<'_>) -> Result<usize> {
    let category = reader.read_bits(5)? as usize;
    if category > MAX_DIST_CATEGORY {
        return Err(Error::corrupt("lz distance category"));
    }

    let code = if category == 0 { 0 }
        else { (1 << (category - 1)) + reader.read_bits(category - 1)? as usize };

    Ok(code + 1)
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn repeated_scanline_is_one_match(){
        // two identical 64-pixel rows: the second is one copy of the first
        let row: Vec<u32> = (0 .. 64_u32).map(|x| 0xff00_0000 | x * 3).collect();
        let mut pixels = row.clone();
        pixels.extend_from_slice(&row);
        let masked = vec![false; pixels.len()];

        let matches = find_matches(&pixels, &masked);
        assert!(!matches.is_empty());

        let second_row = matches.iter().find(|m| m.offset >= 64).unwrap();
        assert_eq!(second_row.distance, 64);
        assert!(second_row.length as usize >= 32);
    }

    #[test]
    fn matches_never_touch_masked_pixels(){
        let mut pixels = vec![0xaabb_ccdd_u32; 256];
        let mut masked = vec![false; 256];
        for index in 100 .. 120 {
            pixels[index] = 0;
            masked[index] = true;
        }

        for m in find_matches(&pixels, &masked) {
            let target = m.offset as usize .. m.offset as usize + m.length as usize;
            let source_start = m.offset as usize - m.distance as usize;
            let source = source_start .. source_start + m.length as usize;

            assert!(target.clone().all(|p| !masked[p]));
            assert!(source.clone().all(|p| !masked[p]));
            assert!(m.distance >= 1);
            assert!((m.length as usize) >= MIN_MATCH);
        }
    }

    #[test]
    fn short_unprofitable_matches_are_skipped(){
        // a two-pixel echo at a huge distance saves nothing
        let mut pixels: Vec<u32> = (0 .. 5000_u32).map(|x| x.wrapping_mul(2654435761)).collect();
        pixels[4998] = pixels[10];
        pixels[4999] = pixels[11];
        let masked = vec![false; pixels.len()];

        assert!(find_matches(&pixels, &masked).is_empty());
    }

    #[test]
    fn length_and_distance_roundtrip(){
        for &length in &[2_usize, 3, 4, 7, 8, 100, 4095, 4096] {
            for &distance in &[1_usize, 2, 64, 1000, WINDOW_SIZE] {
                let mut writer = BitWriter::new(Vec::new());
                let category = length_category(length);
                assert!(category < ESCAPE_SYMS);

                write_length_extra(length, &mut writer).unwrap();
                write_distance(distance, &mut writer).unwrap();
                let bytes = writer.finish().unwrap();

                let mut reader = BitReader::new(&bytes);
                assert_eq!(read_length(category, &mut reader).unwrap(), length);
                assert_eq!(read_distance(&mut reader).unwrap(), distance);
            }
        }
    }
}
