
//! Rebuilds one monochrome plane from its interleaved symbol stream.

use smallvec::SmallVec;

use crate::bits::BitReader;
use crate::chaos::ChaosRow;
use crate::entropy::{SymbolReader, ZRL_SYMS};
use crate::error::{Result, UnitResult, Error};
use crate::filters::{
    MonoFilterFn, MONO_FILTERS, MONO_COUNT,
    MAX_FILTERS, MAX_CHAOS_LEVELS,
};
use crate::huffman::Decoding;
use crate::math::Vec2;
use super::{
    TileGrid, predict, row_filter_prediction, tile_bits_field_width,
    MIN_TILE_BITS, MAX_TILE_BITS, RECURSE_THRESH, MAX_PALETTE,
};


/// Decodes one plane lazily: the parent engine requests values in its own
/// scan order, and tile filter ids are read just in time on the first
/// request inside each tile.
#[derive(Debug)]
pub struct MonoReader {
    size: Vec2<usize>,
    num_syms: usize,
    grid: TileGrid,

    filters: SmallVec<[MonoFilterFn; MAX_FILTERS]>,
    sympal: SmallVec<[u8; MAX_PALETTE]>,
    normal_count: usize,
    filter_count: usize,

    chaos: ChaosRow,
    symbols: SymbolReader,

    child: Option<Box<MonoReader>>,
    rf_decoding: Option<Decoding>,
    current_row_filter: u8,

    id_buffer: Vec<u8>,
    tile_seen: Vec<bool>,
    values: Vec<u8>,
    row_consumed: Vec<bool>,
    current_row: usize,
}

impl MonoReader {

    /// Read this engine's header block, recursing into the child engine
    /// when the stream says the filter-id plane is itself compressed.
    pub fn read_tables(reader: &mut BitReader<'_>, size: Vec2<usize>, num_syms: usize) -> Result<Self> {
        let bits_offset = reader.read_bits(tile_bits_field_width())? as usize;
        if bits_offset > MAX_TILE_BITS - MIN_TILE_BITS {
            return Err(Error::corrupt("tile size"));
        }

        let grid = TileGrid::new(size, MAX_TILE_BITS - bits_offset);

        let normal_count = reader.read_bits(5)? as usize + 1;
        let mut filters = SmallVec::new();
        for _ in 0 .. normal_count {
            let index = reader.read_bits(7)? as usize;
            if index >= MONO_COUNT {
                return Err(Error::corrupt("plane filter id"));
            }

            filters.push(MONO_FILTERS[index]);
        }

        let sympal_count = reader.read_bits(4)? as usize;
        if normal_count + sympal_count > MAX_FILTERS {
            return Err(Error::corrupt("active filter count"));
        }

        let mut sympal = SmallVec::new();
        for _ in 0 .. sympal_count {
            let value = reader.read_bits(8)? as usize;
            if value >= num_syms {
                return Err(Error::corrupt("palette value"));
            }

            sympal.push(value as u8);
        }

        let filter_count = normal_count + sympal_count;

        let chaos_levels = reader.read_bits(4)? as usize + 1;
        if chaos_levels > MAX_CHAOS_LEVELS {
            return Err(Error::corrupt("chaos levels"));
        }

        let symbols = SymbolReader::read_tables(
            reader, chaos_levels, num_syms + ZRL_SYMS, num_syms)?;

        let (child, rf_decoding) = if reader.read_bit()? {
            if grid.count() < RECURSE_THRESH {
                return Err(Error::corrupt("recursion below the tile threshold"));
            }

            let child = MonoReader::read_tables(reader, grid.tiles, filter_count)?;
            (Some(Box::new(child)), None)
        }
        else {
            (None, Some(Decoding::read_table(reader, filter_count)?))
        };

        Ok(MonoReader {
            num_syms,
            filters, sympal, normal_count, filter_count,
            chaos: ChaosRow::new(size.width(), chaos_levels),
            symbols,
            child, rf_decoding,
            current_row_filter: 0,
            id_buffer: vec![0; grid.count()],
            tile_seen: vec![false; grid.tiles.width()],
            values: vec![0; size.area()],
            row_consumed: vec![false; size.width()],
            current_row: 0,
            size, grid,
        })
    }

    /// Advance to plane row `y`. Must be called for every row in order,
    /// before any read or skip in that row.
    pub fn enter_row(&mut self, y: usize, reader: &mut BitReader<'_>) -> UnitResult {
        for x in 0 .. self.size.width() {
            if !self.row_consumed[x] { self.chaos.zero_above(x); }
            self.row_consumed[x] = false;
        }

        self.chaos.start_row();
        self.current_row = y;

        if y & (self.grid.edge() - 1) == 0 {
            for seen in &mut self.tile_seen { *seen = false; }
            let ty = y >> self.grid.bits;

            match &mut self.child {
                Some(child) => child.enter_row(ty, reader)?,
                None => self.current_row_filter = reader.read_bits(2)? as u8,
            }
        }

        Ok(())
    }

    /// Decode the value at column `x` of the current row.
    pub fn read(&mut self, x: usize, reader: &mut BitReader<'_>) -> Result<u8> {
        let position = self.current_row * self.size.width() + x;

        let tx = x >> self.grid.bits;
        let ty = self.current_row >> self.grid.bits;
        let tile = ty * self.grid.tiles.width() + tx;

        if !self.tile_seen[tx] {
            self.tile_seen[tx] = true;

            let id = match &mut self.child {
                Some(child) => child.read(tx, reader)?,
                None => {
                    let residual = self.rf_decoding.as_ref()
                        .expect("row filter table missing")
                        .read_symbol(reader)? as usize;

                    let prediction = row_filter_prediction(
                        self.current_row_filter, &self.id_buffer, self.grid.tiles, tx, ty);

                    ((residual + prediction as usize) % self.filter_count) as u8
                },
            };

            self.id_buffer[tile] = id;
        }

        let id = self.id_buffer[tile] as usize;

        if id >= self.normal_count {
            // palette tile: the value is implied, nothing further travels
            let value = self.sympal[id - self.normal_count];
            self.values[position] = value;
            self.chaos.skip(x);
            self.row_consumed[x] = true;
            return Ok(value);
        }

        let bin = self.chaos.bin(x);
        let symbol = self.symbols.read(bin, reader)?;
        debug_assert!((symbol as usize) < self.num_syms);

        let prediction = predict(
            self.filters[id], &self.values, self.size,
            x, self.current_row, self.num_syms);

        let value = ((symbol as usize + prediction as usize) % self.num_syms) as u8;
        self.values[position] = value;
        self.chaos.store(x, symbol as u8);
        self.row_consumed[x] = true;
        Ok(value)
    }

    /// The parent visited column `x` of the current row
    /// without consuming a value.
    pub fn skip(&mut self, x: usize) {
        self.chaos.skip(x);
        self.row_consumed[x] = true;
    }
}
