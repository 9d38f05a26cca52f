
//! Bit-level stream writer and reader.
//!
//! Bits are packed most significant first into a 64-bit accumulator and
//! flushed to bytes. The reader mirrors the writer and additionally supports
//! peeking ahead, which the Huffman lookup-table decoder relies on.

use std::io::Write;
use lebe::prelude::*;

use crate::error::{Result, UnitResult, Error};


/// Largest bit count accepted by a single `write_bits`/`read_bits` call.
pub const MAX_FIELD_BITS: usize = 32;

#[inline]
fn low_mask(count: usize) -> u64 {
    if count >= 64 { u64::MAX } else { (1_u64 << count) - 1 }
}


/// Packs bit fields most-significant first and flushes whole bytes
/// to the underlying byte writer.
#[derive(Debug)]
pub struct BitWriter<W> {
    inner: W,
    accumulator: u64,
    filled: usize,
    bits_written: usize,
}

impl<W: Write> BitWriter<W> {

    pub fn new(inner: W) -> Self {
        BitWriter { inner, accumulator: 0, filled: 0, bits_written: 0 }
    }

    /// Number of bits pushed into this writer so far.
    pub fn bits_written(&self) -> usize { self.bits_written }

    /// Append the lowest `count` bits of `value`.
    pub fn write_bits(&mut self, value: u64, count: usize) -> UnitResult {
        debug_assert!(count <= MAX_FIELD_BITS, "bit field too wide: {}", count);
        debug_assert_eq!(value & !low_mask(count), 0, "value does not fit the field");

        self.accumulator = (self.accumulator << count) | (value & low_mask(count));
        self.filled += count;
        self.bits_written += count;

        while self.filled >= 8 {
            self.filled -= 8;
            let byte = (self.accumulator >> self.filled) as u8;
            self.inner.write_as_little_endian(&byte)?;
        }

        self.accumulator &= low_mask(self.filled);
        Ok(())
    }

    /// Append a single bit.
    #[inline]
    pub fn write_bit(&mut self, bit: bool) -> UnitResult {
        self.write_bits(bit as u64, 1)
    }

    /// Pad the last partial byte with zero bits and
    /// return the underlying byte writer.
    pub fn finish(mut self) -> Result<W> {
        if self.filled > 0 {
            let byte = (self.accumulator << (8 - self.filled)) as u8;
            self.inner.write_as_little_endian(&byte)?;
            self.filled = 0;
        }

        Ok(self.inner)
    }
}


/// Reads bit fields most-significant first from a byte slice.
#[derive(Debug, Clone)]
pub struct BitReader<'s> {
    bytes: &'s [u8],
    accumulator: u64,
    filled: usize,
}

impl<'s> BitReader<'s> {

    pub fn new(bytes: &'s [u8]) -> Self {
        BitReader { bytes, accumulator: 0, filled: 0 }
    }

    #[inline]
    fn fill(&mut self) {
        while self.filled + 8 <= 64 && !self.bytes.is_empty() {
            self.accumulator = (self.accumulator << 8) | self.bytes[0] as u64;
            self.bytes = &self.bytes[1 ..];
            self.filled += 8;
        }
    }

    /// Bits remaining in the stream, including the final byte padding.
    #[inline]
    pub fn remaining_bits(&self) -> usize {
        self.filled + self.bytes.len() * 8
    }

    /// Read the next `count` bits as an unsigned value.
    pub fn read_bits(&mut self, count: usize) -> Result<u64> {
        debug_assert!(count <= MAX_FIELD_BITS, "bit field too wide: {}", count);
        if count == 0 { return Ok(0) }

        self.fill();
        if self.filled < count { return Err(Error::Truncated) }

        self.filled -= count;
        let value = (self.accumulator >> self.filled) & low_mask(count);
        self.accumulator &= low_mask(self.filled);
        Ok(value)
    }

    /// Read a single bit.
    #[inline]
    pub fn read_bit(&mut self) -> Result<bool> {
        Ok(self.read_bits(1)? != 0)
    }

    /// Look at the next `count` bits without consuming them.
    /// Missing bits past the end of the stream are padded with zeroes,
    /// so that the final symbols of a stream can still be matched.
    pub fn peek(&mut self, count: usize) -> u64 {
        debug_assert!(count <= MAX_FIELD_BITS);
        self.fill();

        if self.filled >= count {
            (self.accumulator >> (self.filled - count)) & low_mask(count)
        }
        else {
            (self.accumulator << (count - self.filled)) & low_mask(count)
        }
    }

    /// Discard `count` bits previously inspected with `peek`.
    pub fn consume(&mut self, count: usize) -> UnitResult {
        self.fill();
        if self.filled < count { return Err(Error::Truncated) }

        self.filled -= count;
        self.accumulator &= low_mask(self.filled);
        Ok(())
    }
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn roundtrip_fields(){
        let mut writer = BitWriter::new(Vec::new());
        writer.write_bits(0b101, 3).unwrap();
        writer.write_bit(false).unwrap();
        writer.write_bits(0xffff_ffff, 32).unwrap();
        writer.write_bits(1234, 11).unwrap();
        let bytes = writer.finish().unwrap();

        let mut reader = BitReader::new(&bytes);
        assert_eq!(reader.read_bits(3).unwrap(), 0b101);
        assert_eq!(reader.read_bit().unwrap(), false);
        assert_eq!(reader.read_bits(32).unwrap(), 0xffff_ffff);
        assert_eq!(reader.read_bits(11).unwrap(), 1234);
    }

    #[test]
    fn peeking_pads_with_zeroes(){
        let mut writer = BitWriter::new(Vec::new());
        writer.write_bits(0b11, 2).unwrap();
        let bytes = writer.finish().unwrap();

        let mut reader = BitReader::new(&bytes);
        assert_eq!(reader.peek(2), 0b11);
        assert_eq!(reader.peek(4), 0b1100);
        reader.consume(2).unwrap();

        // only the padding of the final byte remains
        assert_eq!(reader.remaining_bits(), 6);
        assert!(reader.read_bits(7).is_err());
    }

    #[test]
    fn truncated_read_is_detected(){
        let mut reader = BitReader::new(&[0xab]);
        assert_eq!(reader.read_bits(8).unwrap(), 0xab);
        assert!(matches!(reader.read_bits(1), Err(Error::Truncated)));
    }
}
