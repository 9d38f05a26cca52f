
//! Designs and emits one RGBA image.

use std::collections::BTreeMap;
use std::io::Write;
use smallvec::SmallVec;

use crate::bits::BitWriter;
use crate::chaos::RgbChaos;
use crate::entropy::{EntropyEstimator, SymbolStats, SymbolWriter};
use crate::error::{Result, UnitResult, Error};
use crate::filters::{
    SpatialFilterFn, ColorFilterFn, SPATIAL_FILTERS, RGB_TO_YUV,
    SF_COUNT, SF_FIXED, CF_COUNT, MAX_FILTERS, MAX_CHAOS_LEVELS, RESIDUAL_SCORE,
};
use crate::lz::{self, Match};
use crate::mask::Mask;
use crate::math::{Vec2, bit_length};
use crate::mono::{MonoWriter, MonoParams, TileGrid, tile_bits_field_width, MAX_TILE_BITS, MASK_TILE, MAX_PALETTE};
use super::{
    Knobs, rgb_neighbors, pack_pixel,
    NUM_LITERALS, Y_ALPHABET, UV_ALPHABET, LZ_ESCAPE_BASE,
};

const MAX_PASSES: usize = 4;
const NEIGHBOR_REWARD: i64 = 16;


/// Encodes one image. `init` validates the input,
/// `write` produces the bit-stream.
#[derive(Debug)]
pub struct RgbaEncoder {
    // the input with masked pixels replaced by the mask color,
    // equal to what the decoder will reconstruct
    recon: Vec<u8>,
    size: Vec2<usize>,
    masked: Vec<bool>,
    knobs: Knobs,

    grid: TileGrid,
    tiles_sf: Vec<u8>,
    tiles_cf: Vec<u8>,
    sf_indices: SmallVec<[u8; MAX_FILTERS]>,
    cf_indices: SmallVec<[u8; CF_COUNT]>,
    sympal: SmallVec<[[u8; 4]; MAX_PALETTE]>,
    normal_count: usize,
    matches: Vec<Match>,
    residuals: Vec<[u8; 3]>,
    chaos_levels: usize,
    designed: bool,

    sf_engine: Option<MonoWriter>,
    cf_engine: Option<MonoWriter>,
    a_engine: Option<MonoWriter>,

    emitting: bool,
    y_stats: Option<SymbolStats>,
    u_stats: Option<SymbolStats>,
    v_stats: Option<SymbolStats>,
    y_coder: Option<SymbolWriter>,
    u_coder: Option<SymbolWriter>,
    v_coder: Option<SymbolWriter>,
    chaos: RgbChaos,
    tile_seen: Vec<bool>,
}

/// One candidate tile plan, produced per tried tile edge.
struct TilePlan {
    grid: TileGrid,
    tiles_sf: Vec<u8>,
    tiles_cf: Vec<u8>,
    sf_indices: SmallVec<[u8; MAX_FILTERS]>,
    cf_indices: SmallVec<[u8; CF_COUNT]>,
    sympal: SmallVec<[[u8; 4]; MAX_PALETTE]>,
    normal_count: usize,
    estimate: u64,
}

fn tile_positions(grid: TileGrid, size: Vec2<usize>, tile: usize) -> impl Iterator<Item = (usize, usize)> {
    let edge = grid.edge();
    let (tx, ty) = (tile % grid.tiles.width(), tile / grid.tiles.width());

    let x_range = tx * edge .. ((tx + 1) * edge).min(size.width());
    let y_range = ty * edge .. ((ty + 1) * edge).min(size.height());

    y_range.flat_map(move |y| x_range.clone().map(move |x| (x, y)))
}

/// Routes a symbol to the statistics pass or the emission pass,
/// whichever is active.
fn put<W: Write>(
    stats: &mut Option<SymbolStats>, coder: &mut Option<SymbolWriter>,
    bin: usize, symbol: u16, writer: &mut BitWriter<W>,
) -> UnitResult {
    match coder {
        Some(coder) => coder.write(bin, symbol, writer),
        None => {
            stats.as_mut().expect("channel statistics not prepared").record(bin, symbol);
            Ok(())
        },
    }
}

impl RgbaEncoder {

    /// Validate the inputs and take a working copy of the image.
    ///
    /// `rgba` must hold `width * height * 4` bytes; the mask must have been
    /// built for the same dimensions. Knobs outside their documented ranges
    /// are rejected here, before any work happens.
    pub fn init(rgba: &[u8], width: usize, height: usize, mask: &Mask, knobs: Knobs) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::invalid("image dimensions must not be zero"));
        }

        if width > u16::MAX as usize || height > u16::MAX as usize {
            return Err(Error::invalid("image dimensions exceed 16 bits"));
        }

        if rgba.len() != width * height * 4 {
            return Err(Error::invalid("pixel buffer size does not match the dimensions"));
        }

        if mask.size() != Vec2(width, height) {
            return Err(Error::invalid("mask size does not match the image"));
        }

        knobs.validate()?;

        let size = Vec2(width, height);
        let mut recon = rgba.to_vec();
        let mut masked = vec![false; width * height];

        for y in 0 .. height {
            for x in 0 .. width {
                if mask.is_masked(x, y) {
                    let position = y * width + x;
                    masked[position] = true;
                    recon[position * 4 .. position * 4 + 4].copy_from_slice(&mask.color());
                }
            }
        }

        Ok(RgbaEncoder {
            recon, size, masked,
            grid: TileGrid::new(size, knobs.max_bits),
            knobs,

            tiles_sf: Vec::new(),
            tiles_cf: Vec::new(),
            sf_indices: SmallVec::new(),
            cf_indices: SmallVec::new(),
            sympal: SmallVec::new(),
            normal_count: 0,
            matches: Vec::new(),
            residuals: Vec::new(),
            chaos_levels: 1,
            designed: false,

            sf_engine: None,
            cf_engine: None,
            a_engine: None,

            emitting: false,
            y_stats: None, u_stats: None, v_stats: None,
            y_coder: None, u_coder: None, v_coder: None,
            chaos: RgbChaos::new(width, 1),
            tile_seen: Vec::new(),
        })
    }

    /// Produce the bit-stream. Given the same image, mask and knobs,
    /// the output is byte-identical on every run.
    pub fn write(&mut self, write: impl Write) -> UnitResult {
        if !self.designed {
            self.design()?;
            self.designed = true;
        }

        // statistics pass: walk the exact emission order once
        // so every table fits the stream it will code
        self.prepare_stats();
        let mut sink = BitWriter::new(std::io::sink());
        self.scan(&mut sink)?;
        self.build_tables()?;

        let mut writer = BitWriter::new(write);
        self.write_header(&mut writer)?;

        self.start_emit();
        self.scan(&mut writer)?;
        self.finish_streams(&mut writer)?;

        writer.finish()?;
        Ok(())
    }


    // ---- design passes ----

    fn design(&mut self) -> UnitResult {
        // tiles are planned blind to LZ; copies are then forbidden from
        // touching palette tiles, whose pixels never decode a Y symbol
        let untouched = vec![false; self.size.area()];

        let mut best: Option<TilePlan> = None;
        for bits in self.knobs.min_bits ..= self.knobs.max_bits {
            let candidate = self.plan_tiles(bits, &untouched, &untouched);
            let keep = match &best {
                None => true,
                Some(best) => candidate.estimate < best.estimate,
            };
            if keep { best = Some(candidate); }
        }

        self.apply_plan(best.expect("tile edge search range is empty"));

        if self.knobs.lz_enable {
            let pixels: Vec<u32> = (0 .. self.size.area())
                .map(|position| pack_pixel(&self.recon[position * 4 .. position * 4 + 4]))
                .collect();

            let blocked: Vec<bool> = (0 .. self.size.area()).map(|position| {
                let (x, y) = (position % self.size.width(), position / self.size.width());
                self.masked[position]
                    || self.tiles_sf[self.grid.index_of(x, y)] as usize >= self.normal_count
            }).collect();

            self.matches = lz::find_matches(&pixels, &blocked);
        }

        let (copied, starts) = self.coverage_flags();

        // a tile whose every filter-reading pixel got covered by copies
        // is never requested after all
        for tile in 0 .. self.grid.count() {
            if self.tiles_sf[tile] == MASK_TILE { continue }

            let requested = tile_positions(self.grid, self.size, tile).any(|(x, y)| {
                let position = y * self.size.width() + x;
                !self.masked[position] && (!copied[position] || starts[position])
            });

            if !requested { self.tiles_sf[tile] = MASK_TILE; }
        }

        self.compute_residuals(&copied);
        self.design_chaos(&copied);
        self.design_engines(&copied)
    }

    /// Per-pixel coverage of the current match list:
    /// all copied positions, and the copy start positions.
    fn coverage_flags(&self) -> (Vec<bool>, Vec<bool>) {
        let mut copied = vec![false; self.size.area()];
        let mut starts = vec![false; self.size.area()];

        for candidate in &self.matches {
            let offset = candidate.offset as usize;
            starts[offset] = true;
            for position in offset .. offset + candidate.length as usize {
                copied[position] = true;
            }
        }

        (copied, starts)
    }

    fn plan_tiles(&self, bits: usize, copied: &[bool], starts: &[bool]) -> TilePlan {
        let size = self.size;
        let grid = TileGrid::new(size, bits);
        let tile_count = grid.count();

        // a pixel carries residuals unless masked or copied; a pixel still
        // reads its tile's filters if it is a copy start
        let eligible = |position: usize| !self.masked[position] && !copied[position];
        let reads_filters = |position: usize|
            !self.masked[position] && (!copied[position] || starts[position]);

        let live: Vec<bool> = (0 .. tile_count).map(|tile|
            tile_positions(grid, size, tile)
                .any(|(x, y)| reads_filters(y * size.width() + x))
        ).collect();

        // palette candidates: tiles whose residual-carrying pixels
        // all hold one pixel value
        let uniform: Vec<Option<[u8; 4]>> = (0 .. tile_count).map(|tile| {
            if !live[tile] { return None }

            let mut seen: Option<[u8; 4]> = None;
            for (x, y) in tile_positions(grid, size, tile) {
                let position = y * size.width() + x;
                if !eligible(position) { continue }

                let mut pixel = [0; 4];
                pixel.copy_from_slice(&self.recon[position * 4 .. position * 4 + 4]);

                match seen {
                    None => seen = Some(pixel),
                    Some(first) if first != pixel => return None,
                    Some(_) => {},
                }
            }

            seen
        }).collect();

        let mut histogram: BTreeMap<u32, u64> = BTreeMap::new();
        for pixel in uniform.iter().flatten() {
            *histogram.entry(pack_pixel(pixel)).or_insert(0) += 1;
        }

        let sympal_threshold = (self.knobs.sympal_thresh * tile_count as f32) as u64;
        let mut sympal: SmallVec<[[u8; 4]; MAX_PALETTE]> = SmallVec::new();
        for (&packed, &coverage) in &histogram {
            if coverage > sympal_threshold {
                sympal.push(packed.to_le_bytes());
                if sympal.len() >= MAX_PALETTE { break }
            }
        }

        // candidate shortlist by award-weighted voting over
        // the raw residual magnitude proxy
        let mut awards = [0_u64; SF_COUNT];
        for tile in 0 .. tile_count {
            if !live[tile] { continue }

            let mut scores = [0_u64; SF_COUNT];
            for (x, y) in tile_positions(grid, size, tile) {
                let position = y * size.width() + x;
                if !eligible(position) { continue }

                let neighbors = rgb_neighbors(&self.recon, size, x, y);
                let pixel = [
                    self.recon[position * 4],
                    self.recon[position * 4 + 1],
                    self.recon[position * 4 + 2],
                ];

                for (filter, score) in scores.iter_mut().enumerate() {
                    let prediction = SPATIAL_FILTERS[filter](&neighbors);
                    for channel in 0 .. 3 {
                        let residual = pixel[channel].wrapping_sub(prediction[channel]);
                        *score += RESIDUAL_SCORE[residual as usize] as u64;
                    }
                }
            }

            let mut ranking: SmallVec<[usize; SF_COUNT]> = (0 .. SF_COUNT).collect();
            ranking.sort_by_key(|&filter| (scores[filter], filter));

            for (rank, &filter) in ranking.iter().take(self.knobs.award_count).enumerate() {
                awards[filter] += self.knobs.awards[rank] as u64;
            }
        }

        let mut candidates: SmallVec<[u8; MAX_FILTERS]> = (0 .. SF_FIXED as u8).collect();
        let coverage_threshold = (self.knobs.filter_thresh * tile_count as f32) as u64;
        let max_candidates = MAX_FILTERS - sympal.len();
        let mut coverage = 0;

        let mut ranking: SmallVec<[usize; SF_COUNT]> = (0 .. SF_COUNT).collect();
        ranking.sort_by_key(|&filter| (u64::MAX - awards[filter], filter));

        for &filter in &ranking {
            if coverage >= coverage_threshold || awards[filter] == 0 { break }
            coverage += awards[filter] / self.knobs.awards[0] as u64;

            if filter >= SF_FIXED {
                candidates.push(filter as u8);
                if candidates.len() >= max_candidates { break }
            }
        }

        candidates.sort();
        let candidate_count = candidates.len();

        // assign tiles: masked, palette, or refined below
        let mut tiles_sf = vec![0_u8; tile_count];
        let mut tiles_cf = vec![0_u8; tile_count];

        for tile in 0 .. tile_count {
            if !live[tile] {
                tiles_sf[tile] = MASK_TILE;
                continue;
            }

            if let Some(pixel) = uniform[tile] {
                if let Some(palette) = sympal.iter().position(|&v| v == pixel) {
                    tiles_sf[tile] = (candidate_count + palette) as u8;
                }
            }
        }

        // refined selection: every candidate spatial filter crossed with
        // every color transform, scored against the running histograms
        let mut est_y = EntropyEstimator::new();
        let mut est_u = EntropyEstimator::new();
        let mut est_v = EntropyEstimator::new();

        let mut codes: [Vec<u8>; 3] = Default::default();
        let mut revisit_budget = self.knobs.mono_revisit_count;
        let mut done = false;

        for pass in 0 .. MAX_PASSES {
            if done { break }
            let mut changed = 0;

            for tile in 0 .. tile_count {
                let current = tiles_sf[tile];
                if current == MASK_TILE || current as usize >= candidate_count { continue }

                if pass > 0 {
                    if revisit_budget == 0 { done = true; break }
                    revisit_budget -= 1;

                    self.tile_codes(grid, tile, &eligible,
                        SPATIAL_FILTERS[candidates[current as usize] as usize],
                        RGB_TO_YUV[tiles_cf[tile] as usize], &mut codes);

                    est_y.subtract(&codes[0]);
                    est_u.subtract(&codes[1]);
                    est_v.subtract(&codes[2]);
                }

                let neighbors = tile_neighbor_ids(&tiles_sf, grid.tiles, tile);
                let mut best = (0_usize, 0_usize);
                let mut best_score = i64::MAX;

                for candidate in 0 .. candidate_count {
                    let spatial = SPATIAL_FILTERS[candidates[candidate] as usize];

                    for color in 0 .. CF_COUNT {
                        self.tile_codes(grid, tile, &eligible,
                            spatial, RGB_TO_YUV[color], &mut codes);

                        let cost = (est_y.cost_of(&codes[0])
                            + est_u.cost_of(&codes[1])
                            + est_v.cost_of(&codes[2])) as i64;

                        let mut score = cost;
                        if cost == 0 { score -= NEIGHBOR_REWARD; }

                        for &neighbor in &neighbors {
                            if neighbor as usize == candidate { score -= NEIGHBOR_REWARD; }
                        }

                        if score < best_score {
                            best_score = score;
                            best = (candidate, color);
                        }
                    }
                }

                if best.0 != current as usize || best.1 != tiles_cf[tile] as usize {
                    changed += 1;
                }

                tiles_sf[tile] = best.0 as u8;
                tiles_cf[tile] = best.1 as u8;

                self.tile_codes(grid, tile, &eligible,
                    SPATIAL_FILTERS[candidates[best.0] as usize],
                    RGB_TO_YUV[best.1], &mut codes);

                est_y.add(&codes[0]);
                est_u.add(&codes[1]);
                est_v.add(&codes[2]);
            }

            if pass > 0 && changed == 0 { break }
        }

        // transmit only what any tile actually uses
        let mut sf_used = vec![false; candidate_count];
        let mut cf_used = [false; CF_COUNT];

        for tile in 0 .. tile_count {
            let id = tiles_sf[tile];
            if id == MASK_TILE || id as usize >= candidate_count { continue }

            sf_used[id as usize] = true;
            cf_used[tiles_cf[tile] as usize] = true;
        }

        let mut sf_indices: SmallVec<[u8; MAX_FILTERS]> = SmallVec::new();
        let mut sf_remap = vec![0_u8; candidate_count];
        for candidate in 0 .. candidate_count {
            if sf_used[candidate] {
                sf_remap[candidate] = sf_indices.len() as u8;
                sf_indices.push(candidates[candidate]);
            }
        }
        if sf_indices.is_empty() { sf_indices.push(0); }

        let mut cf_indices: SmallVec<[u8; CF_COUNT]> = SmallVec::new();
        let mut cf_remap = [0_u8; CF_COUNT];
        for color in 0 .. CF_COUNT {
            if cf_used[color] {
                cf_remap[color] = cf_indices.len() as u8;
                cf_indices.push(color as u8);
            }
        }
        if cf_indices.is_empty() { cf_indices.push(0); }

        let normal_count = sf_indices.len();
        let mut live_tiles = 0;

        for tile in 0 .. tile_count {
            let id = tiles_sf[tile];
            if id == MASK_TILE { continue }

            live_tiles += 1;
            if (id as usize) < candidate_count {
                tiles_sf[tile] = sf_remap[id as usize];
                tiles_cf[tile] = cf_remap[tiles_cf[tile] as usize];
            }
            else {
                // palette ids rebase onto the used-filter count
                tiles_sf[tile] = (normal_count + (id as usize - candidate_count)) as u8;
            }
        }

        // body cost plus a rough per-tile map cost, so that smaller tiles
        // pay for their larger filter maps in the comparison
        let map_bits = bit_length(normal_count + sympal.len()) + bit_length(cf_indices.len());
        let estimate = est_y.overall() + est_u.overall() + est_v.overall()
            + live_tiles as u64 * map_bits as u64 * 16;

        TilePlan {
            grid, tiles_sf, tiles_cf, sf_indices, cf_indices,
            sympal, normal_count, estimate,
        }
    }

    /// The YUV residual streams of one tile under a filter pair.
    fn tile_codes(
        &self, grid: TileGrid, tile: usize, eligible: &dyn Fn(usize) -> bool,
        spatial: SpatialFilterFn, color: ColorFilterFn, codes: &mut [Vec<u8>; 3],
    ) {
        for channel in codes.iter_mut() { channel.clear(); }

        for (x, y) in tile_positions(grid, self.size, tile) {
            let position = y * self.size.width() + x;
            if !eligible(position) { continue }

            let neighbors = rgb_neighbors(&self.recon, self.size, x, y);
            let prediction = spatial(&neighbors);

            let residual = [
                self.recon[position * 4].wrapping_sub(prediction[0]),
                self.recon[position * 4 + 1].wrapping_sub(prediction[1]),
                self.recon[position * 4 + 2].wrapping_sub(prediction[2]),
            ];

            let yuv = color(residual);
            codes[0].push(yuv[0]);
            codes[1].push(yuv[1]);
            codes[2].push(yuv[2]);
        }
    }

    fn apply_plan(&mut self, plan: TilePlan) {
        self.grid = plan.grid;
        self.tiles_sf = plan.tiles_sf;
        self.tiles_cf = plan.tiles_cf;
        self.sf_indices = plan.sf_indices;
        self.cf_indices = plan.cf_indices;
        self.sympal = plan.sympal;
        self.normal_count = plan.normal_count;
    }

    /// Execute the chosen filter pairs into the YUV residual plane.
    fn compute_residuals(&mut self, copied: &[bool]) {
        self.residuals = vec![[0; 3]; self.size.area()];

        for tile in 0 .. self.grid.count() {
            let id = self.tiles_sf[tile];
            if id == MASK_TILE || id as usize >= self.normal_count { continue }

            let spatial = SPATIAL_FILTERS[self.sf_indices[id as usize] as usize];
            let color = RGB_TO_YUV[self.cf_indices[self.tiles_cf[tile] as usize] as usize];

            for (x, y) in tile_positions(self.grid, self.size, tile) {
                let position = y * self.size.width() + x;
                if self.masked[position] || copied[position] { continue }

                let neighbors = rgb_neighbors(&self.recon, self.size, x, y);
                let prediction = spatial(&neighbors);

                let residual = [
                    self.recon[position * 4].wrapping_sub(prediction[0]),
                    self.recon[position * 4 + 1].wrapping_sub(prediction[1]),
                    self.recon[position * 4 + 2].wrapping_sub(prediction[2]),
                ];

                self.residuals[position] = color(residual);
            }
        }
    }

    /// Try every chaos level count over the residual plane
    /// and keep the cheapest, tables included.
    fn design_chaos(&mut self, copied: &[bool]) {
        let mut best_entropy = u64::MAX;
        let mut best_levels = 1;

        for levels in 1 ..= MAX_CHAOS_LEVELS {
            let mut chaos = RgbChaos::new(self.size.width(), levels);
            let mut estimators: Vec<[EntropyEstimator; 3]> = (0 .. levels)
                .map(|_| [EntropyEstimator::new(), EntropyEstimator::new(), EntropyEstimator::new()])
                .collect();

            for y in 0 .. self.size.height() {
                chaos.start_row();

                for x in 0 .. self.size.width() {
                    let position = y * self.size.width() + x;
                    let id = self.tiles_sf[self.grid.index_of(x, y)];

                    if self.masked[position] || copied[position]
                        || id == MASK_TILE || id as usize >= self.normal_count
                    {
                        chaos.skip(x);
                        continue;
                    }

                    let [ys, us, vs] = self.residuals[position];
                    estimators[chaos.y.bin(x)][0].add_single(ys);
                    estimators[chaos.u.bin(x)][1].add_single(us);
                    estimators[chaos.v.bin(x)][2].add_single(vs);

                    chaos.y.store(x, ys);
                    chaos.u.store(x, us);
                    chaos.v.store(x, vs);
                }
            }

            let entropy: u64 = estimators.iter().flatten()
                .map(|estimator| estimator.overall() + estimator.table_cost())
                .sum();

            if entropy < best_entropy {
                best_entropy = entropy;
                best_levels = levels;
            }
        }

        self.chaos_levels = best_levels;
    }

    /// Design the three sub-engines over their consumption sets.
    fn design_engines(&mut self, copied: &[bool]) -> UnitResult {
        let size = self.size;
        let area = size.area();
        let sf_count = self.normal_count + self.sympal.len();

        // alpha plane: inverted, zero wherever no symbol will travel
        let mut a_plane = vec![0_u8; area];
        let mut a_consumed = vec![false; area];

        for position in 0 .. area {
            let (x, y) = (position % size.width(), position / size.width());
            let id = self.tiles_sf[self.grid.index_of(x, y)];

            if !self.masked[position] && !copied[position]
                && id != MASK_TILE && (id as usize) < self.normal_count
            {
                a_plane[position] = !self.recon[position * 4 + 3];
                a_consumed[position] = true;
            }
        }

        self.a_engine = Some(MonoWriter::design(MonoParams {
            plane: &a_plane, size, num_syms: NUM_LITERALS, consumed: &a_consumed,
        }, &self.knobs)?);

        // the filter maps: one value per tile, quiet where never requested
        let tiles = self.grid.tiles;
        let sf_plane: Vec<u8> = self.tiles_sf.iter()
            .map(|&id| if id == MASK_TILE { 0 } else { id })
            .collect();
        let sf_consumed: Vec<bool> = self.tiles_sf.iter()
            .map(|&id| id != MASK_TILE)
            .collect();

        self.sf_engine = Some(MonoWriter::design(MonoParams {
            plane: &sf_plane, size: tiles, num_syms: sf_count, consumed: &sf_consumed,
        }, &self.knobs)?);

        let cf_consumed: Vec<bool> = self.tiles_sf.iter()
            .map(|&id| id != MASK_TILE && (id as usize) < self.normal_count)
            .collect();
        let cf_plane: Vec<u8> = self.tiles_cf.iter().zip(&cf_consumed)
            .map(|(&id, &consumed)| if consumed { id } else { 0 })
            .collect();

        self.cf_engine = Some(MonoWriter::design(MonoParams {
            plane: &cf_plane, size: tiles, num_syms: self.cf_indices.len(), consumed: &cf_consumed,
        }, &self.knobs)?);

        Ok(())
    }


    // ---- the two-pass pixel scan ----

    fn prepare_stats(&mut self) {
        self.y_stats = Some(SymbolStats::new(self.chaos_levels, Y_ALPHABET, NUM_LITERALS));
        self.u_stats = Some(SymbolStats::new(self.chaos_levels, UV_ALPHABET, NUM_LITERALS));
        self.v_stats = Some(SymbolStats::new(self.chaos_levels, UV_ALPHABET, NUM_LITERALS));

        self.y_coder = None;
        self.u_coder = None;
        self.v_coder = None;

        self.emitting = false;
        self.reset_scan_state();

        self.sf_engine.as_mut().expect("engines not designed").init_scan();
        self.cf_engine.as_mut().expect("engines not designed").init_scan();
        self.a_engine.as_mut().expect("engines not designed").init_scan();
    }

    fn build_tables(&mut self) -> UnitResult {
        self.y_coder = Some(SymbolWriter::new(self.y_stats.take().expect("statistics pass did not run"))?);
        self.u_coder = Some(SymbolWriter::new(self.u_stats.take().expect("statistics pass did not run"))?);
        self.v_coder = Some(SymbolWriter::new(self.v_stats.take().expect("statistics pass did not run"))?);

        self.sf_engine.as_mut().expect("engines not designed").build_tables()?;
        self.cf_engine.as_mut().expect("engines not designed").build_tables()?;
        self.a_engine.as_mut().expect("engines not designed").build_tables()?;
        Ok(())
    }

    fn start_emit(&mut self) {
        self.emitting = true;
        self.reset_scan_state();

        self.sf_engine.as_mut().expect("engines not designed").start_emit();
        self.cf_engine.as_mut().expect("engines not designed").start_emit();
        self.a_engine.as_mut().expect("engines not designed").start_emit();
    }

    fn reset_scan_state(&mut self) {
        self.chaos = RgbChaos::new(self.size.width(), self.chaos_levels);
        self.tile_seen = vec![false; self.grid.tiles.width()];
    }

    fn write_header<W: Write>(&self, writer: &mut BitWriter<W>) -> UnitResult {
        writer.write_bits(self.size.width() as u64, 16)?;
        writer.write_bits(self.size.height() as u64, 16)?;

        writer.write_bits((MAX_TILE_BITS - self.grid.bits) as u64, tile_bits_field_width())?;

        writer.write_bits(self.normal_count as u64 - 1, 5)?;
        for &index in &self.sf_indices {
            writer.write_bits(index as u64, 7)?;
        }

        writer.write_bits(self.sympal.len() as u64, 4)?;
        for value in &self.sympal {
            for &byte in value {
                writer.write_bits(byte as u64, 8)?;
            }
        }

        writer.write_bits(self.cf_indices.len() as u64 - 1, 4)?;
        for &index in &self.cf_indices {
            writer.write_bits(index as u64, 8)?;
        }

        writer.write_bits(self.chaos_levels as u64 - 1, 4)?;

        self.y_coder.as_ref().expect("tables not built").write_tables(writer)?;
        self.u_coder.as_ref().expect("tables not built").write_tables(writer)?;
        self.v_coder.as_ref().expect("tables not built").write_tables(writer)?;

        self.sf_engine.as_ref().expect("engines not designed").write_tables(writer)?;
        self.cf_engine.as_ref().expect("engines not designed").write_tables(writer)?;
        self.a_engine.as_ref().expect("engines not designed").write_tables(writer)?;

        Ok(())
    }

    /// The pixel scan shared by the statistics and emission passes.
    /// Its structure is the encoder-side mirror of the decoder's read loop;
    /// any change here changes the bit-stream contract.
    fn scan<W: Write>(&mut self, writer: &mut BitWriter<W>) -> UnitResult {
        let size = self.size;
        let grid = self.grid;
        let edge = grid.edge();
        let normal_count = self.normal_count;
        let emitting = self.emitting;

        let mut next_match = 0;
        let mut copy_pending = 0_usize;

        for y in 0 .. size.height() {
            self.a_engine.as_mut().expect("engines not designed").enter_row(y, writer)?;

            if y & (edge - 1) == 0 {
                let ty = y >> grid.bits;
                self.sf_engine.as_mut().expect("engines not designed").enter_row(ty, writer)?;
                self.cf_engine.as_mut().expect("engines not designed").enter_row(ty, writer)?;
                for seen in &mut self.tile_seen { *seen = false; }
            }

            self.chaos.start_row();

            for x in 0 .. size.width() {
                let position = y * size.width() + x;

                if self.masked[position] {
                    self.chaos.skip(x);
                    self.a_engine.as_mut().expect("engines not designed").skip(x);
                    continue;
                }

                if copy_pending > 0 {
                    copy_pending -= 1;
                    self.chaos.skip(x);
                    self.a_engine.as_mut().expect("engines not designed").skip(x);
                    continue;
                }

                let tx = x >> grid.bits;
                let tile = grid.index_of(x, y);

                if !self.tile_seen[tx] {
                    self.tile_seen[tx] = true;
                    self.sf_engine.as_mut().expect("engines not designed").emit(tx, writer)?;

                    if (self.tiles_sf[tile] as usize) < normal_count {
                        self.cf_engine.as_mut().expect("engines not designed").emit(tx, writer)?;
                    }
                }

                if self.tiles_sf[tile] as usize >= normal_count {
                    // palette tile: the pixel is implied by the filter id
                    self.chaos.skip(x);
                    self.a_engine.as_mut().expect("engines not designed").skip(x);
                    continue;
                }

                if next_match < self.matches.len()
                    && self.matches[next_match].offset as usize == position
                {
                    let found = self.matches[next_match];
                    next_match += 1;

                    let escape = LZ_ESCAPE_BASE
                        + lz::length_category(found.length as usize) as u16;

                    let bin = self.chaos.y.bin(x);
                    put(&mut self.y_stats, &mut self.y_coder, bin, escape, writer)?;

                    if emitting {
                        lz::write_length_extra(found.length as usize, writer)?;
                        lz::write_distance(found.distance as usize, writer)?;
                    }

                    copy_pending = found.length as usize - 1;
                    self.chaos.skip(x);
                    self.a_engine.as_mut().expect("engines not designed").skip(x);
                    continue;
                }

                let [ys, us, vs] = self.residuals[position];

                let bin = self.chaos.y.bin(x);
                put(&mut self.y_stats, &mut self.y_coder, bin, ys as u16, writer)?;

                let bin = self.chaos.u.bin(x);
                put(&mut self.u_stats, &mut self.u_coder, bin, us as u16, writer)?;

                let bin = self.chaos.v.bin(x);
                put(&mut self.v_stats, &mut self.v_coder, bin, vs as u16, writer)?;

                self.chaos.y.store(x, ys);
                self.chaos.u.store(x, us);
                self.chaos.v.store(x, vs);

                self.a_engine.as_mut().expect("engines not designed").emit(x, writer)?;
            }
        }

        Ok(())
    }

    fn finish_streams<W: Write>(&mut self, writer: &mut BitWriter<W>) -> UnitResult {
        self.y_coder.as_mut().expect("tables not built").finish(writer)?;
        self.u_coder.as_mut().expect("tables not built").finish(writer)?;
        self.v_coder.as_mut().expect("tables not built").finish(writer)?;

        self.sf_engine.as_mut().expect("engines not designed").finish_stream(writer)?;
        self.cf_engine.as_mut().expect("engines not designed").finish_stream(writer)?;
        self.a_engine.as_mut().expect("engines not designed").finish_stream(writer)?;
        Ok(())
    }
}

fn tile_neighbor_ids(tiles_sf: &[u8], tiles: Vec2<usize>, tile: usize) -> [u8; 4] {
    let tiles_x = tiles.width();
    let (tx, ty) = (tile % tiles_x, tile / tiles_x);

    let left = if tx > 0 { tiles_sf[tile - 1] } else { MASK_TILE };
    let up = if ty > 0 { tiles_sf[tile - tiles_x] } else { MASK_TILE };
    let up_left = if tx > 0 && ty > 0 { tiles_sf[tile - tiles_x - 1] } else { MASK_TILE };
    let up_right = if ty > 0 && tx + 1 < tiles_x { tiles_sf[tile - tiles_x + 1] } else { MASK_TILE };

    [left, up, up_left, up_right]
}
