
//! Designs and emits one monochrome plane.

use std::io::Write;
use smallvec::SmallVec;

use crate::bits::BitWriter;
use crate::chaos::ChaosRow;
use crate::entropy::{EntropyEstimator, SymbolStats, SymbolWriter, ZRL_SYMS};
use crate::error::{Result, UnitResult};
use crate::filters::{
    MonoFilterFn, MONO_FILTERS, MONO_COUNT, MONO_FIXED,
    MAX_FILTERS, MAX_CHAOS_LEVELS, RESIDUAL_SCORE,
};
use crate::huffman::Encoding;
use crate::math::Vec2;
use crate::rgba::Knobs;
use super::{
    TileGrid, predict, row_filter_prediction, tile_bits_field_width,
    MAX_TILE_BITS, RECURSE_THRESH, MAX_PALETTE, MASK_TILE, ROW_FILTER_COUNT,
};

const MAX_PASSES: usize = 4;
const MAX_ROW_PASSES: usize = 2;

// one neighbor match is worth about one bit of map compression
const NEIGHBOR_REWARD: i64 = 16;


/// The plane handed to [`MonoWriter::design`].
///
/// `consumed` marks the positions the parent will actually request during
/// its scan; all other positions must hold zero, matching the decoder's
/// freshly initialized reconstruction buffer.
#[derive(Debug, Clone, Copy)]
pub struct MonoParams<'p> {
    pub plane: &'p [u8],
    pub size: Vec2<usize>,
    pub num_syms: usize,
    pub consumed: &'p [bool],
}


/// One fully designed plane compressor, including the recursively
/// compressed map of its own tile filters.
#[derive(Debug)]
pub struct MonoWriter {
    plane: Vec<u8>,
    consumed: Vec<bool>,
    size: Vec2<usize>,
    num_syms: usize,

    grid: TileGrid,
    tiles: Vec<u8>,

    filter_indices: SmallVec<[u8; MAX_FILTERS]>,
    filters: SmallVec<[MonoFilterFn; MAX_FILTERS]>,
    sympal: SmallVec<[u8; MAX_PALETTE]>,
    normal_count: usize,
    filter_count: usize,

    residuals: Vec<u8>,
    row_filters: Vec<u8>,
    chaos_levels: usize,

    child: Option<Box<MonoWriter>>,

    /// Estimated stream cost in 1/16 bit units, for the tile-edge search
    /// and the recurse-or-row-filter decision of the parent.
    total_entropy: u64,

    // scan state, reset between the statistics and emission passes
    emitting: bool,
    stats: Option<SymbolStats>,
    coder: Option<SymbolWriter>,
    rf_frequencies: Vec<u32>,
    rf_encoding: Option<Encoding>,
    chaos: ChaosRow,
    id_buffer: Vec<u8>,
    tile_seen: Vec<bool>,
    row_consumed: Vec<bool>,
    current_row: usize,

    // mirrors the reader's reconstruction buffer: positions not yet
    // consumed read as zero, whatever the plane holds there. Predictions
    // must come from here, since the parent may request a tile-row's
    // positions out of column order.
    decoded: Vec<u8>,
}

impl MonoWriter {

    /// Run all design passes, trying every tile edge in the search range
    /// and keeping the one with the lowest estimated total entropy.
    pub fn design(params: MonoParams<'_>, knobs: &Knobs) -> Result<Self> {
        debug_assert_eq!(params.plane.len(), params.size.area());
        debug_assert_eq!(params.consumed.len(), params.size.area());
        debug_assert!(params.num_syms >= 1 && params.num_syms <= 256);

        let mut best: Option<MonoWriter> = None;

        for bits in knobs.min_bits ..= knobs.max_bits {
            let candidate = Self::design_with_bits(params, knobs, bits)?;

            let keep = match &best {
                None => true,
                Some(best) => candidate.total_entropy < best.total_entropy,
            };

            if keep { best = Some(candidate); }
        }

        Ok(best.expect("tile edge search range is empty"))
    }

    /// The estimated stream cost of this design, in 1/16 bit units.
    pub fn estimated_entropy(&self) -> u64 { self.total_entropy }

    fn design_with_bits(params: MonoParams<'_>, knobs: &Knobs, bits: usize) -> Result<Self> {
        let grid = TileGrid::new(params.size, bits);

        let mut this = MonoWriter {
            plane: params.plane.to_vec(),
            consumed: params.consumed.to_vec(),
            size: params.size,
            num_syms: params.num_syms,

            tiles: vec![0; grid.count()],
            grid,

            filter_indices: SmallVec::new(),
            filters: SmallVec::new(),
            sympal: SmallVec::new(),
            normal_count: 0,
            filter_count: 0,

            residuals: vec![0; params.size.area()],
            row_filters: vec![0; grid.tiles.height()],
            chaos_levels: 1,

            child: None,
            total_entropy: 0,

            emitting: false,
            stats: None,
            coder: None,
            rf_frequencies: Vec::new(),
            rf_encoding: None,
            chaos: ChaosRow::new(params.size.width(), 1),
            id_buffer: Vec::new(),
            tile_seen: Vec::new(),
            row_consumed: Vec::new(),
            current_row: 0,
            decoded: Vec::new(),
        };

        this.mask_tiles();
        let uniform_values = this.find_uniform_tiles();
        this.design_palette_filters(knobs, &uniform_values);
        this.design_filters(knobs);
        this.design_palette_tiles(&uniform_values);
        this.design_tiles(knobs);
        this.compute_residuals();
        let row_filter_entropy = this.design_row_filters();
        this.recurse_compress(knobs, row_filter_entropy)?;
        let chaos_entropy = this.design_chaos();

        let map_entropy = match &this.child {
            Some(child) => child.total_entropy,
            None => row_filter_entropy,
        };

        this.total_entropy = chaos_entropy + map_entropy;
        Ok(this)
    }

    fn tile_positions(&self, tile: usize) -> impl Iterator<Item = (usize, usize)> {
        let edge = self.grid.edge();
        let (tx, ty) = (tile % self.grid.tiles.width(), tile / self.grid.tiles.width());
        let (width, height) = (self.size.width(), self.size.height());

        let x_range = tx * edge .. ((tx + 1) * edge).min(width);
        let y_range = ty * edge .. ((ty + 1) * edge).min(height);

        y_range.flat_map(move |y| x_range.clone().map(move |x| (x, y)))
    }

    /// Tiles with no consumed position at all never emit anything.
    fn mask_tiles(&mut self) {
        for tile in 0 .. self.grid.count() {
            let live = self.tile_positions(tile)
                .any(|(x, y)| self.consumed[y * self.size.width() + x]);

            if !live { self.tiles[tile] = MASK_TILE; }
        }
    }

    /// The single value of each tile whose consumed positions all agree.
    fn find_uniform_tiles(&self) -> Vec<Option<u8>> {
        (0 .. self.grid.count()).map(|tile| {
            if self.tiles[tile] == MASK_TILE { return None }

            let mut uniform = None;
            for (x, y) in self.tile_positions(tile) {
                let position = y * self.size.width() + x;
                if !self.consumed[position] { continue }

                let value = self.plane[position];
                match uniform {
                    None => uniform = Some(value),
                    Some(seen) if seen != value => return None,
                    Some(_) => {},
                }
            }

            uniform
        }).collect()
    }

    /// Values backing enough uniform tiles become palette filters,
    /// emitting their value with no residual at all.
    fn design_palette_filters(&mut self, knobs: &Knobs, uniform_values: &[Option<u8>]) {
        let mut histogram = vec![0_u64; self.num_syms];
        for value in uniform_values.iter().flatten() {
            histogram[*value as usize] += 1;
        }

        let threshold = (knobs.sympal_thresh * self.grid.count() as f32) as u64;

        for (value, &coverage) in histogram.iter().enumerate() {
            if coverage > threshold {
                self.sympal.push(value as u8);
                if self.sympal.len() >= MAX_PALETTE { break }
            }
        }
    }

    /// Shortlist the predictor catalog by award-weighted voting over the
    /// cheap residual-score proxy, then keep candidates until their
    /// cumulative coverage satisfies the threshold.
    fn design_filters(&mut self, knobs: &Knobs) {
        let mut awards = [0_u64; MONO_COUNT];

        for tile in 0 .. self.grid.count() {
            if self.tiles[tile] == MASK_TILE { continue }

            let mut scores = [0_u64; MONO_COUNT];
            for (x, y) in self.tile_positions(tile) {
                let position = y * self.size.width() + x;
                if !self.consumed[position] { continue }

                let value = self.plane[position];
                for (filter, score) in scores.iter_mut().enumerate() {
                    let prediction = predict(
                        MONO_FILTERS[filter], &self.plane, self.size, x, y, self.num_syms);

                    let residual = (value as usize + self.num_syms - prediction as usize)
                        % self.num_syms;

                    *score += RESIDUAL_SCORE[residual] as u64;
                }
            }

            let mut ranking: SmallVec<[usize; MONO_COUNT]> = (0 .. MONO_COUNT).collect();
            ranking.sort_by_key(|&filter| (scores[filter], filter));

            for (rank, &filter) in ranking.iter().take(knobs.award_count).enumerate() {
                awards[filter] += knobs.awards[rank] as u64;
            }
        }

        for fixed in 0 .. MONO_FIXED {
            self.filter_indices.push(fixed as u8);
        }

        let threshold = (knobs.filter_thresh * self.grid.count() as f32) as u64;
        let max_normal = MAX_FILTERS - self.sympal.len();
        let mut coverage = 0;

        let mut ranking: SmallVec<[usize; MONO_COUNT]> = (0 .. MONO_COUNT).collect();
        ranking.sort_by_key(|&filter| (u64::MAX - awards[filter], filter));

        for &filter in &ranking {
            if coverage >= threshold || awards[filter] == 0 { break }
            coverage += awards[filter] / knobs.awards[0] as u64;

            if filter >= MONO_FIXED {
                self.filter_indices.push(filter as u8);
                if self.filter_indices.len() >= max_normal { break }
            }
        }

        self.filter_indices.sort();
        self.filters = self.filter_indices.iter()
            .map(|&index| MONO_FILTERS[index as usize])
            .collect();

        self.normal_count = self.filters.len();
        self.filter_count = self.normal_count + self.sympal.len();
    }

    /// Tag tiles matching a surviving palette value. They bypass
    /// the refinement passes and the residual stream entirely.
    fn design_palette_tiles(&mut self, uniform_values: &[Option<u8>]) {
        for (tile, uniform) in uniform_values.iter().enumerate() {
            if let Some(value) = uniform {
                if let Some(palette) = self.sympal.iter().position(|v| v == value) {
                    self.tiles[tile] = (self.normal_count + palette) as u8;
                }
            }
        }
    }

    fn tile_codes(&self, tile: usize, filter: usize, codes: &mut Vec<u8>) {
        codes.clear();

        for (x, y) in self.tile_positions(tile) {
            let position = y * self.size.width() + x;
            if !self.consumed[position] { continue }

            let prediction = predict(
                self.filters[filter], &self.plane, self.size, x, y, self.num_syms);

            let residual = (self.plane[position] as usize + self.num_syms
                - prediction as usize) % self.num_syms;

            codes.push(residual as u8);
        }
    }

    fn tile_neighbor_ids(&self, tile: usize) -> [u8; 4] {
        let tiles_x = self.grid.tiles.width();
        let (tx, ty) = (tile % tiles_x, tile / tiles_x);

        let left = if tx > 0 { self.tiles[tile - 1] } else { MASK_TILE };
        let up = if ty > 0 { self.tiles[tile - tiles_x] } else { MASK_TILE };
        let up_left = if tx > 0 && ty > 0 { self.tiles[tile - tiles_x - 1] } else { MASK_TILE };
        let up_right = if ty > 0 && tx + 1 < tiles_x { self.tiles[tile - tiles_x + 1] } else { MASK_TILE };

        [left, up, up_left, up_right]
    }

    /// Per-tile best-filter selection against the running global histogram,
    /// with revisit passes that subtract a tile's old contribution before
    /// re-scoring it.
    fn design_tiles(&mut self, knobs: &Knobs) {
        let mut estimator = EntropyEstimator::new();
        let mut codes = Vec::with_capacity(self.grid.edge() * self.grid.edge());
        let mut revisit_budget = knobs.mono_revisit_count;

        for pass in 0 .. MAX_PASSES {
            let mut changed = 0;

            for tile in 0 .. self.grid.count() {
                let current = self.tiles[tile];
                if current == MASK_TILE || current as usize >= self.normal_count { continue }

                if pass > 0 {
                    if revisit_budget == 0 { return }
                    revisit_budget -= 1;

                    self.tile_codes(tile, current as usize, &mut codes);
                    estimator.subtract(&codes);
                }

                let neighbors = self.tile_neighbor_ids(tile);
                let mut best_filter = 0;
                let mut best_score = i64::MAX;

                for filter in 0 .. self.normal_count {
                    self.tile_codes(tile, filter, &mut codes);

                    let cost = estimator.cost_of(&codes) as i64;
                    let mut score = cost;
                    if cost == 0 { score -= NEIGHBOR_REWARD; }

                    for &neighbor in &neighbors {
                        if neighbor as usize == filter { score -= NEIGHBOR_REWARD; }
                    }

                    if score < best_score {
                        best_score = score;
                        best_filter = filter;
                    }
                }

                if best_filter != current as usize { changed += 1; }
                self.tiles[tile] = best_filter as u8;

                self.tile_codes(tile, best_filter, &mut codes);
                estimator.add(&codes);
            }

            if pass > 0 && changed == 0 { break }
        }
    }

    /// Execute the chosen tiles into the residual plane.
    fn compute_residuals(&mut self) {
        for tile in 0 .. self.grid.count() {
            let filter = self.tiles[tile];
            if filter == MASK_TILE || filter as usize >= self.normal_count { continue }

            for (x, y) in self.tile_positions(tile) {
                let position = y * self.size.width() + x;
                if !self.consumed[position] { continue }

                let prediction = predict(
                    self.filters[filter as usize], &self.plane, self.size,
                    x, y, self.num_syms);

                self.residuals[position] = ((self.plane[position] as usize
                    + self.num_syms - prediction as usize) % self.num_syms) as u8;
            }
        }
    }

    /// Choose one neighbor-subtract filter per tile-row for the
    /// non-recursive transmission of the filter-id plane.
    /// Returns the estimated cost of that scheme.
    fn design_row_filters(&mut self) -> u64 {
        let tiles = self.grid.tiles;
        let mut estimator = EntropyEstimator::new();
        let mut total_entropy = 0;

        // per row, the four candidate code streams over live tiles
        let mut candidates: [Vec<u8>; ROW_FILTER_COUNT] = Default::default();

        for pass in 0 .. MAX_ROW_PASSES {
            total_entropy = 0;

            for ty in 0 .. tiles.height() {
                for candidate in &mut candidates { candidate.clear(); }

                for tx in 0 .. tiles.width() {
                    let tile = ty * tiles.width() + tx;
                    let id = self.tiles[tile];
                    if id == MASK_TILE { continue }

                    let neighbor = |dx: isize, dy: isize| -> u8 {
                        let (nx, ny) = (tx as isize + dx, ty as isize + dy);
                        if nx < 0 || ny < 0 { return 0 }

                        let value = self.tiles[ny as usize * tiles.width() + nx as usize];
                        if value == MASK_TILE { 0 } else { value }
                    };

                    let predictions = [0, neighbor(-1, 0), neighbor(0, -1), neighbor(-1, -1)];
                    for (candidate, prediction) in candidates.iter_mut().zip(&predictions) {
                        candidate.push(((id as usize + self.filter_count
                            - *prediction as usize) % self.filter_count) as u8);
                    }
                }

                if pass > 0 {
                    estimator.subtract(&candidates[self.row_filters[ty] as usize]);
                }

                let (mut best, mut best_cost) = (0, u64::MAX);
                for (row_filter, candidate) in candidates.iter().enumerate() {
                    let cost = estimator.cost_of(candidate);
                    if cost < best_cost {
                        best_cost = cost;
                        best = row_filter;
                    }
                }

                self.row_filters[ty] = best as u8;
                total_entropy += best_cost;
                estimator.add(&candidates[best]);
            }
        }

        total_entropy + estimator.table_cost()
    }

    /// Hand the filter-id plane to a child engine when the grid is large,
    /// keeping the child only if it beats the row-filter scheme.
    fn recurse_compress(&mut self, knobs: &Knobs, row_filter_entropy: u64) -> UnitResult {
        if self.grid.count() < RECURSE_THRESH { return Ok(()) }

        let child_plane: Vec<u8> = self.tiles.iter()
            .map(|&id| if id == MASK_TILE { 0 } else { id })
            .collect();

        let child_consumed: Vec<bool> = self.tiles.iter()
            .map(|&id| id != MASK_TILE)
            .collect();

        let child = MonoWriter::design(MonoParams {
            plane: &child_plane,
            size: self.grid.tiles,
            num_syms: self.filter_count,
            consumed: &child_consumed,
        }, knobs)?;

        if child.total_entropy < row_filter_entropy {
            self.child = Some(Box::new(child));
        }

        Ok(())
    }

    /// Pick the chaos level count by simulating every choice over the
    /// residual plane and keeping the cheapest, tables included.
    fn design_chaos(&mut self) -> u64 {
        let mut best_entropy = u64::MAX;
        let mut best_levels = 1;

        for levels in 1 ..= MAX_CHAOS_LEVELS {
            let mut chaos = ChaosRow::new(self.size.width(), levels);
            let mut estimators: Vec<EntropyEstimator> =
                (0 .. levels).map(|_| EntropyEstimator::new()).collect();

            for y in 0 .. self.size.height() {
                chaos.start_row();

                for x in 0 .. self.size.width() {
                    let position = y * self.size.width() + x;
                    let id = self.tiles[self.grid.index_of(x, y)];

                    if id == MASK_TILE
                        || !self.consumed[position]
                        || id as usize >= self.normal_count
                    {
                        chaos.skip(x);
                        continue;
                    }

                    let residual = self.residuals[position];
                    estimators[chaos.bin(x)].add_single(residual);
                    chaos.store(x, residual);
                }
            }

            let entropy: u64 = estimators.iter()
                .map(|estimator| estimator.overall() + estimator.table_cost())
                .sum();

            if entropy < best_entropy {
                best_entropy = entropy;
                best_levels = levels;
            }
        }

        self.chaos_levels = best_levels;
        best_entropy
    }


    // ---- interleaved emission, driven by the parent's scan ----

    /// Prepare the statistics pass.
    pub fn init_scan(&mut self) {
        self.stats = Some(SymbolStats::new(
            self.chaos_levels, self.num_syms + ZRL_SYMS, self.num_syms));

        self.coder = None;
        self.rf_encoding = None;
        self.rf_frequencies = vec![0; self.filter_count];
        self.emitting = false;
        self.reset_scan_state();

        if let Some(child) = &mut self.child { child.init_scan(); }
    }

    /// Freeze the collected statistics into Huffman tables.
    pub fn build_tables(&mut self) -> UnitResult {
        let stats = self.stats.take().expect("statistics pass did not run");
        self.coder = Some(SymbolWriter::new(stats)?);

        if self.child.is_none() {
            self.rf_encoding = Some(Encoding::from_frequencies(&self.rf_frequencies)?);
        }

        if let Some(child) = &mut self.child { child.build_tables()?; }
        Ok(())
    }

    /// Prepare the emission pass.
    pub fn start_emit(&mut self) {
        self.emitting = true;
        self.reset_scan_state();
        if let Some(child) = &mut self.child { child.start_emit(); }
    }

    fn reset_scan_state(&mut self) {
        self.chaos = ChaosRow::new(self.size.width(), self.chaos_levels);
        self.id_buffer = vec![0; self.grid.count()];
        self.tile_seen = vec![false; self.grid.tiles.width()];
        self.row_consumed = vec![false; self.size.width()];
        self.current_row = 0;
        self.decoded = vec![0; self.size.area()];
    }

    /// Write this engine's header block:
    /// tile edge, filter subset, palette, chaos levels, symbol tables,
    /// and either the recursive child's header or the row-filter table.
    pub fn write_tables<W: Write>(&self, writer: &mut BitWriter<W>) -> UnitResult {
        writer.write_bits(
            (MAX_TILE_BITS - self.grid.bits) as u64,
            tile_bits_field_width())?;

        writer.write_bits(self.normal_count as u64 - 1, 5)?;
        for &index in &self.filter_indices {
            writer.write_bits(index as u64, 7)?;
        }

        writer.write_bits(self.sympal.len() as u64, 4)?;
        for &value in &self.sympal {
            writer.write_bits(value as u64, 8)?;
        }

        writer.write_bits(self.chaos_levels as u64 - 1, 4)?;

        self.coder.as_ref().expect("tables not built").write_tables(writer)?;

        match &self.child {
            Some(child) => {
                writer.write_bit(true)?;
                child.write_tables(writer)?;
            },
            None => {
                writer.write_bit(false)?;
                self.rf_encoding.as_ref().expect("tables not built").write_table(writer)?;
            },
        }

        Ok(())
    }

    /// Advance to plane row `y`. Must be called for every row in order,
    /// before any emit or skip in that row.
    pub fn enter_row<W: Write>(&mut self, y: usize, writer: &mut BitWriter<W>) -> UnitResult {
        // columns the finished row never touched read as quiet from now on
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
                Some(child) => child.enter_row(ty, writer)?,
                None => if self.emitting {
                    writer.write_bits(self.row_filters[ty] as u64, 2)?;
                },
            }
        }

        Ok(())
    }

    /// Emit the value at column `x` of the current row.
    /// On first use of a tile within its tile-row, its filter id is
    /// transmitted just in time, possibly through the recursive child.
    pub fn emit<W: Write>(&mut self, x: usize, writer: &mut BitWriter<W>) -> UnitResult {
        let position = self.current_row * self.size.width() + x;
        debug_assert!(self.consumed[position], "emitting an unconsumed position");

        let tx = x >> self.grid.bits;
        let ty = self.current_row >> self.grid.bits;
        let tile = ty * self.grid.tiles.width() + tx;

        if !self.tile_seen[tx] {
            self.tile_seen[tx] = true;

            let id = self.tiles[tile];
            debug_assert_ne!(id, MASK_TILE, "emitting inside a masked tile");

            match &mut self.child {
                Some(child) => child.emit(tx, writer)?,
                None => {
                    let prediction = row_filter_prediction(
                        self.row_filters[ty], &self.id_buffer, self.grid.tiles, tx, ty);

                    let residual = (id as usize + self.filter_count
                        - prediction as usize) % self.filter_count;

                    if self.emitting {
                        self.rf_encoding.as_ref().expect("tables not built")
                            .write_symbol(residual, writer)?;
                    }
                    else {
                        self.rf_frequencies[residual] += 1;
                    }
                },
            }

            self.id_buffer[tile] = id;
        }

        let id = self.tiles[tile];
        if id as usize >= self.normal_count {
            // palette tile: the value is implied, no residual travels
            self.decoded[position] = self.sympal[id as usize - self.normal_count];
            self.chaos.skip(x);
            self.row_consumed[x] = true;
            return Ok(());
        }

        // predict from the reconstruction mirror, not the plane: the
        // decoder has only seen what was consumed so far
        let value = self.plane[position];
        let prediction = predict(
            self.filters[id as usize], &self.decoded, self.size,
            x, self.current_row, self.num_syms);

        let residual = ((value as usize + self.num_syms
            - prediction as usize) % self.num_syms) as u8;

        let bin = self.chaos.bin(x);

        if self.emitting {
            self.coder.as_mut().expect("tables not built")
                .write(bin, residual as u16, writer)?;
        }
        else {
            self.stats.as_mut().expect("statistics pass not prepared")
                .record(bin, residual as u16);
        }

        self.decoded[position] = value;
        self.chaos.store(x, residual);
        self.row_consumed[x] = true;
        Ok(())
    }

    /// The parent visited column `x` of the current row
    /// without consuming a value.
    pub fn skip(&mut self, x: usize) {
        self.chaos.skip(x);
        self.row_consumed[x] = true;
    }

    /// Flush trailing zero runs. Call once after the full scan.
    pub fn finish_stream<W: Write>(&mut self, writer: &mut BitWriter<W>) -> UnitResult {
        if self.emitting {
            self.coder.as_mut().expect("tables not built").finish(writer)?;
        }

        if let Some(child) = &mut self.child { child.finish_stream(writer)?; }
        Ok(())
    }
}
