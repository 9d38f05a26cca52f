
//! The entropy bank: histogram-based entropy estimation for the planner,
//! and the per-chaos-bin symbol codec with zero-run folding.
//!
//! Every table's alphabet starts with its literal range, followed by 128
//! zero-run-length symbols. A maximal run of L ≥ 1 zero symbols emits one
//! ZRL symbol for `min(L, 128)` zeroes, with 16 raw bits of extra length
//! when the run reaches 128. Literal zero is therefore never coded
//! directly, which keeps code length free for the symbols that need it.
//!
//! Because the channels are interleaved in one bit-stream, the ZRL symbol
//! must appear at the position of the run's *first* zero, where the decoder
//! consumes it. The statistics pass therefore records every run length it
//! sees, and the emission pass replays that queue as its lookahead.

use std::io::Write;

use crate::bits::{BitWriter, BitReader};
use crate::huffman::{Encoding, Decoding};
use crate::error::{Result, UnitResult};


/// Number of zero-run-length symbols in every table.
pub const ZRL_SYMS: usize = 128;

/// Zeroes covered by one ZRL symbol with its extra bits saturated.
const MAX_RUN_CHUNK: u32 = 128 + u16::MAX as u32;


// fixed-point log2 in 1/16 bit steps, keyed on a 4-bit mantissa
const LOG2_FRACTION: [u64; 16] = [0, 1, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 15];

/// `log2(value) * 16`, rounded. Integer math only, so entropy comparisons
/// come out identical on every platform.
#[inline]
pub fn log2_fp16(value: u32) -> u64 {
    debug_assert_ne!(value, 0);
    let bits = 31 - value.leading_zeros();

    let fraction = if bits >= 4 { (value >> (bits - 4)) & 15 }
        else { (value << (4 - bits)) & 15 };

    bits as u64 * 16 + LOG2_FRACTION[fraction as usize]
}


/// A running byte histogram with symmetric add and subtract,
/// scoring candidate residual blocks for the tile planner.
///
/// Costs are reported in 1/16 bit units.
#[derive(Debug, Clone)]
pub struct EntropyEstimator {
    histogram: [u32; 256],
    total: u32,
}

impl EntropyEstimator {

    pub fn new() -> Self {
        EntropyEstimator { histogram: [0; 256], total: 0 }
    }

    pub fn add(&mut self, codes: &[u8]) {
        for &code in codes {
            self.histogram[code as usize] += 1;
        }
        self.total += codes.len() as u32;
    }

    pub fn subtract(&mut self, codes: &[u8]) {
        for &code in codes {
            debug_assert_ne!(self.histogram[code as usize], 0);
            self.histogram[code as usize] -= 1;
        }
        self.total -= codes.len() as u32;
    }

    pub fn add_single(&mut self, code: u8) {
        self.histogram[code as usize] += 1;
        self.total += 1;
    }

    /// Estimated bits to code the block against the current histogram,
    /// without modifying it. Laplace-smoothed so unseen symbols stay finite.
    pub fn cost_of(&self, codes: &[u8]) -> u64 {
        let total_cost = log2_fp16(self.total + 1);
        codes.iter()
            .map(|&code| total_cost - log2_fp16(self.histogram[code as usize] + 1))
            .sum()
    }

    /// Estimated bits to code everything counted so far.
    pub fn overall(&self) -> u64 {
        if self.total == 0 { return 0 }

        let total_cost = log2_fp16(self.total);
        self.histogram.iter()
            .filter(|&&count| count > 0)
            .map(|&count| count as u64 * (total_cost - log2_fp16(count)))
            .sum()
    }

    /// Rough cost of transmitting a Huffman descriptor
    /// for this distribution, in 1/16 bit units.
    pub fn table_cost(&self) -> u64 {
        let distinct = self.histogram.iter().filter(|&&count| count > 0).count() as u64;
        (distinct * 6 + 16) * 16
    }
}


#[derive(Debug, Clone, Copy)]
struct ZeroRun {
    length: u32,
    bin: usize,
}

/// Per-bin symbol frequency collection. The statistics pass walks the
/// exact stream the emission pass will produce, counting symbols with
/// zero runs already folded, and remembers every run length so the
/// emission pass can write each ZRL code at its run's first zero.
#[derive(Debug)]
pub struct SymbolStats {
    literal_count: usize,
    bins: Vec<Vec<u32>>,
    run: Option<ZeroRun>,
    runs: Vec<u32>,
}

impl SymbolStats {

    /// `alphabet` is the full table size including the ZRL range
    /// and any escape symbols beyond it.
    pub fn new(levels: usize, alphabet: usize, literal_count: usize) -> Self {
        debug_assert!(alphabet >= literal_count + ZRL_SYMS);
        SymbolStats {
            literal_count,
            bins: vec![vec![0; alphabet]; levels],
            run: None,
            runs: Vec::new(),
        }
    }

    /// Record one symbol of the stream, in stream order.
    pub fn record(&mut self, bin: usize, symbol: u16) {
        if symbol == 0 {
            let mut run = self.run.take()
                .unwrap_or(ZeroRun { length: 0, bin });

            run.length += 1;

            // a saturated run closes here; the next zero opens
            // a fresh run with the bin at its own position
            if run.length == MAX_RUN_CHUNK { self.close_run(run); }
            else { self.run = Some(run); }
        }
        else {
            if let Some(pending) = self.run.take() {
                self.close_run(pending);
            }

            self.bins[bin][symbol as usize] += 1;
        }
    }

    fn close_run(&mut self, run: ZeroRun) {
        let covered = run.length.min(128) as usize;
        self.bins[run.bin][self.literal_count + covered - 1] += 1;
        self.runs.push(run.length);
    }

    /// Flush a pending zero run and expose the final frequencies
    /// together with the recorded run lengths.
    fn into_parts(mut self) -> (Vec<Vec<u32>>, Vec<u32>) {
        if let Some(pending) = self.run.take() {
            self.close_run(pending);
        }

        (self.bins, self.runs)
    }
}


/// Streams symbols through one static Huffman table per chaos bin.
/// Zero runs were measured by the statistics pass; replaying the recorded
/// lengths lets each ZRL code land at its run's first zero, where the
/// decoder consumes it in between the other interleaved channels.
#[derive(Debug)]
pub struct SymbolWriter {
    literal_count: usize,
    encodings: Vec<Encoding>,
    runs: Vec<u32>,
    next_run: usize,
    suppressed: u32,
}

impl SymbolWriter {

    pub fn new(stats: SymbolStats) -> Result<Self> {
        let literal_count = stats.literal_count;
        let (frequencies, runs) = stats.into_parts();

        let encodings = frequencies.iter()
            .map(|bin| Encoding::from_frequencies(bin))
            .collect::<Result<Vec<Encoding>>>()?;

        Ok(SymbolWriter { literal_count, encodings, runs, next_run: 0, suppressed: 0 })
    }

    /// Append every bin's table descriptor to the stream.
    pub fn write_tables(&self, writer: &mut BitWriter<impl Write>) -> UnitResult {
        for encoding in &self.encodings {
            encoding.write_table(writer)?;
        }
        Ok(())
    }

    /// Append one symbol of the stream, in the exact order
    /// the statistics pass saw it.
    pub fn write(&mut self, bin: usize, symbol: u16, writer: &mut BitWriter<impl Write>) -> UnitResult {
        if self.suppressed > 0 {
            debug_assert_eq!(symbol, 0, "statistics pass saw a different stream");
            self.suppressed -= 1;
            return Ok(());
        }

        if symbol == 0 {
            let length = self.runs.get(self.next_run).copied()
                .expect("statistics pass saw fewer zero runs");
            self.next_run += 1;

            let covered = length.min(128);
            self.encodings[bin]
                .write_symbol(self.literal_count + covered as usize - 1, writer)?;

            if covered == 128 {
                writer.write_bits((length - 128) as u64, 16)?;
            }

            self.suppressed = length - 1;
            return Ok(());
        }

        self.encodings[bin].write_symbol(symbol as usize, writer)
    }

    /// Assert the emitted stream matched the statistics pass.
    /// Call once after the last symbol.
    pub fn finish(&mut self, _writer: &mut BitWriter<impl Write>) -> UnitResult {
        debug_assert_eq!(self.next_run, self.runs.len(), "unreplayed zero runs remain");
        debug_assert_eq!(self.suppressed, 0, "a zero run outran the stream");
        Ok(())
    }
}


/// Decodes one channel's symbol stream, unfolding zero runs.
#[derive(Debug)]
pub struct SymbolReader {
    literal_count: usize,
    decodings: Vec<Decoding>,
    pending_zeroes: u32,
}

impl SymbolReader {

    /// Read one table descriptor per chaos bin.
    pub fn read_tables(
        reader: &mut BitReader<'_>,
        levels: usize, alphabet: usize, literal_count: usize,
    ) -> Result<Self> {
        debug_assert!(alphabet >= literal_count + ZRL_SYMS);

        let decodings = (0 .. levels)
            .map(|_| Decoding::read_table(reader, alphabet))
            .collect::<Result<Vec<Decoding>>>()?;

        Ok(SymbolReader { literal_count, decodings, pending_zeroes: 0 })
    }

    /// The next symbol of this channel. Returns either a value below the
    /// literal range (zeroes of a folded run included), or an escape symbol
    /// past the ZRL range.
    pub fn read(&mut self, bin: usize, reader: &mut BitReader<'_>) -> Result<u16> {
        if self.pending_zeroes > 0 {
            self.pending_zeroes -= 1;
            return Ok(0);
        }

        let symbol = self.decodings[bin].read_symbol(reader)?;
        let zrl_base = self.literal_count as u16;

        if symbol >= zrl_base && symbol < zrl_base + ZRL_SYMS as u16 {
            let covered = symbol - zrl_base;
            let mut run = covered as u32 + 1;
            if covered as usize == ZRL_SYMS - 1 {
                run += reader.read_bits(16)? as u32;
            }

            self.pending_zeroes = run - 1;
            return Ok(0);
        }

        // a literal, or an escape past the ZRL range (Y tables only)
        Ok(symbol)
    }
}


#[cfg(test)]
mod test {
    use super::*;

    fn roundtrip_stream(symbols: &[(usize, u16)], levels: usize, literal_count: usize) {
        let alphabet = literal_count + ZRL_SYMS;

        let mut stats = SymbolStats::new(levels, alphabet, literal_count);
        for &(bin, symbol) in symbols {
            stats.record(bin, symbol);
        }

        let mut writer = SymbolWriter::new(stats).unwrap();
        let mut bits = BitWriter::new(Vec::new());
        writer.write_tables(&mut bits).unwrap();
        for &(bin, symbol) in symbols {
            writer.write(bin, symbol, &mut bits).unwrap();
        }
        writer.finish(&mut bits).unwrap();
        let bytes = bits.finish().unwrap();

        let mut reader = BitReader::new(&bytes);
        let mut symbols_in = SymbolReader::read_tables(&mut reader, levels, alphabet, literal_count).unwrap();
        for &(bin, symbol) in symbols {
            assert_eq!(symbols_in.read(bin, &mut reader).unwrap(), symbol);
        }
    }

    #[test]
    fn literals_roundtrip(){
        let symbols: Vec<(usize, u16)> = (0 .. 200_u16)
            .map(|i| ((i % 3) as usize, 1 + (i * 7) % 255))
            .collect();
        roundtrip_stream(&symbols, 3, 256);
    }

    #[test]
    fn zero_runs_roundtrip(){
        let mut symbols = vec![(0, 5_u16)];
        symbols.extend(std::iter::repeat((0, 0_u16)).take(1000));
        symbols.push((1, 9));
        symbols.extend(std::iter::repeat((1, 0_u16)).take(3)); // trailing run
        roundtrip_stream(&symbols, 2, 256);
    }

    #[test]
    fn small_alphabet_roundtrip(){
        let symbols: Vec<(usize, u16)> = (0 .. 64_u16).map(|i| (0, i % 5)).collect();
        roundtrip_stream(&symbols, 1, 5);
    }

    #[test]
    fn giant_zero_run_saturates_and_continues(){
        let mut symbols = Vec::new();
        symbols.extend(std::iter::repeat((0, 0_u16)).take(MAX_RUN_CHUNK as usize + 77));
        symbols.push((0, 3));
        roundtrip_stream(&symbols, 1, 256);
    }

    #[test]
    fn estimator_prefers_flat_blocks(){
        let mut estimator = EntropyEstimator::new();
        estimator.add(&[0; 64]);
        estimator.add(&[1, 2, 3, 4, 5, 6, 7, 8]);

        let flat = estimator.cost_of(&[0; 16]);
        let noisy = estimator.cost_of(&[9, 17, 33, 65, 2, 250, 128, 199, 9, 17, 33, 65, 2, 250, 128, 199]);
        assert!(flat < noisy);

        // add and subtract cancel exactly
        let before = estimator.overall();
        estimator.add(&[42, 42, 42]);
        estimator.subtract(&[42, 42, 42]);
        assert_eq!(estimator.overall(), before);
    }
}
