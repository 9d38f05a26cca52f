
//! The fixed filter catalogs.
//!
//! Spatial filters predict a pixel from its already-decoded neighborhood,
//! color filters are invertible RGB↔YUV transforms applied to residuals.
//! All entries are pure functions addressed by stable numeric id; the wire
//! format carries ids, never function pointers.
//!
//! Filters never inspect coordinates: the scan loops fetch the neighborhood
//! with edge substitution on the image border and directly in the interior,
//! so the hot inner loop stays monomorphic.

/// Number of spatial filters in the RGBA catalog.
pub const SF_COUNT: usize = 20;

/// The first catalog entries are canonical and always enter
/// the per-image candidate set.
pub const SF_FIXED: usize = 4;

/// Number of color transforms in the catalog.
pub const CF_COUNT: usize = 8;

/// Number of predictors in the monochrome catalog.
pub const MONO_COUNT: usize = 16;

/// Canonical monochrome predictors, always candidates.
pub const MONO_FIXED: usize = 4;

/// Most spatial filters an image may activate, including palette filters.
pub const MAX_FILTERS: usize = 32;

/// Most chaos bins a channel may use.
pub const MAX_CHAOS_LEVELS: usize = 8;


/// The already-decoded pixels a spatial filter may look at:
/// left, up, up-left and up-right of the current position.
#[derive(Debug, Clone, Copy, Default)]
pub struct Neighbors {
    pub a: [u8; 3],
    pub b: [u8; 3],
    pub c: [u8; 3],
    pub d: [u8; 3],
}

/// Predicts the RGB channels of one pixel.
pub type SpatialFilterFn = fn(&Neighbors) -> [u8; 3];

/// Transforms an RGB residual into YUV, or back.
pub type ColorFilterFn = fn([u8; 3]) -> [u8; 3];

/// Predicts one plane value from its neighborhood.
pub type MonoFilterFn = fn(&MonoNeighbors) -> u8;

/// The already-decoded plane values around the current position.
#[derive(Debug, Clone, Copy, Default)]
pub struct MonoNeighbors {
    pub a: u8,
    pub b: u8,
    pub c: u8,
    pub d: u8,
}


#[inline]
fn average(x: u8, y: u8) -> u8 {
    ((x as u16 + y as u16) >> 1) as u8
}

#[inline]
fn average4(a: u8, b: u8, c: u8, d: u8) -> u8 {
    ((a as u16 + b as u16 + c as u16 + d as u16) >> 2) as u8
}

#[inline]
fn average3(a: u8, b: u8, c: u8) -> u8 {
    ((a as u16 + b as u16 + c as u16) / 3) as u8
}

#[inline]
fn paeth(a: u8, b: u8, c: u8) -> u8 {
    let p = a as i16 + b as i16 - c as i16;
    let pa = (p - a as i16).abs();
    let pb = (p - b as i16).abs();
    let pc = (p - c as i16).abs();

    if pa <= pb && pa <= pc { a }
    else if pb <= pc { b }
    else { c }
}

#[inline]
fn clamped_gradient(a: u8, b: u8, c: u8) -> u8 {
    let low = a.min(b) as i16;
    let high = a.max(b) as i16;
    (a as i16 + b as i16 - c as i16).max(low).min(high) as u8
}

/// The LOCO-I median predictor: picks an edge direction, falls back
/// to the plane gradient.
#[inline]
fn select(a: u8, b: u8, c: u8) -> u8 {
    if c >= a.max(b) { a.min(b) }
    else if c <= a.min(b) { a.max(b) }
    else { (a as i16 + b as i16 - c as i16) as u8 }
}

/// The plane gradient without clamping, wrapping mod 256.
#[inline]
fn plane(a: u8, b: u8, c: u8) -> u8 {
    a.wrapping_add(b).wrapping_sub(c)
}

#[inline]
fn per_channel(n: &Neighbors, f: impl Fn(u8, u8, u8, u8) -> u8) -> [u8; 3] {
    [
        f(n.a[0], n.b[0], n.c[0], n.d[0]),
        f(n.a[1], n.b[1], n.c[1], n.d[1]),
        f(n.a[2], n.b[2], n.c[2], n.d[2]),
    ]
}


/// The spatial filter catalog. Indexed by stable catalog id.
pub static SPATIAL_FILTERS: [SpatialFilterFn; SF_COUNT] = [
    |n| n.a,                                                      //  0: left
    |n| n.b,                                                      //  1: up
    |n| per_channel(n, |a, b, _, _| average(a, b)),               //  2: avg(A, B)
    |n| per_channel(n, |a, b, c, _| paeth(a, b, c)),              //  3: paeth
    |_| [0, 0, 0],                                                //  4: zero
    |n| n.c,                                                      //  5: up-left
    |n| n.d,                                                      //  6: up-right
    |n| per_channel(n, |a, b, c, _| clamped_gradient(a, b, c)),   //  7: clamped gradient
    |n| per_channel(n, |a, b, c, _| select(a, b, c)),             //  8: select
    |n| per_channel(n, |a, b, c, _| plane(a, b, c)),              //  9: plane
    |n| per_channel(n, |a, _, c, _| average(a, c)),               // 10: avg(A, C)
    |n| per_channel(n, |a, _, _, d| average(a, d)),               // 11: avg(A, D)
    |n| per_channel(n, |_, b, c, _| average(b, c)),               // 12: avg(B, C)
    |n| per_channel(n, |_, b, _, d| average(b, d)),               // 13: avg(B, D)
    |n| per_channel(n, |_, _, c, d| average(c, d)),               // 14: avg(C, D)
    |n| per_channel(n, |a, b, c, _| average3(a, b, c)),           // 15: avg(A, B, C)
    |n| per_channel(n, |_, b, c, d| average3(b, c, d)),           // 16: avg(B, C, D)
    |n| per_channel(n, |a, b, c, d| average4(a, b, c, d)),        // 17: avg(A, B, C, D)
    |n| per_channel(n, |a, b, _, d| clamped_gradient(a, d, b)),   // 18: clamped gradient towards D
    |n| per_channel(n, |a, b, c, _| average(average(a, b), c)),   // 19: avg(avg(A, B), C)
];


/// RGB residual → YUV, per catalog id.
pub static RGB_TO_YUV: [ColorFilterFn; CF_COUNT] = [
    |[r, g, b]| [r, g, b],                                                  // 0: noop
    ycocg_forward,                                                          // 1: YCoCg-R
    |[r, g, b]| [g, r.wrapping_sub(g), b.wrapping_sub(g)],                  // 2: subtract green
    |[r, g, b]| [r, g.wrapping_sub(r), b.wrapping_sub(r)],                  // 3: subtract red
    |[r, g, b]| [b, r.wrapping_sub(b), g.wrapping_sub(b)],                  // 4: subtract blue
    |[r, g, b]| [g, b.wrapping_sub(g), r.wrapping_sub(b)],                  // 5: green, then chained
    |[r, g, b]| [r, g.wrapping_sub(r), b.wrapping_sub(g)],                  // 6: red, then chained
    |[r, g, b]| [b, g.wrapping_sub(b), r.wrapping_sub(g)],                  // 7: blue, then chained
];

/// YUV → RGB residual, inverse of [`RGB_TO_YUV`] entry by entry.
pub static YUV_TO_RGB: [ColorFilterFn; CF_COUNT] = [
    |[y, u, v]| [y, u, v],
    ycocg_inverse,
    |[y, u, v]| [u.wrapping_add(y), y, v.wrapping_add(y)],
    |[y, u, v]| [y, u.wrapping_add(y), v.wrapping_add(y)],
    |[y, u, v]| [u.wrapping_add(y), v.wrapping_add(y), y],
    |[y, u, v]| {
        let b = u.wrapping_add(y);
        [v.wrapping_add(b), y, b]
    },
    |[y, u, v]| {
        let g = u.wrapping_add(y);
        [y, g, v.wrapping_add(g)]
    },
    |[y, u, v]| {
        let g = u.wrapping_add(y);
        [v.wrapping_add(g), g, y]
    },
];

/// The reversible YCoCg transform, wrapping mod 256 per channel.
fn ycocg_forward([r, g, b]: [u8; 3]) -> [u8; 3] {
    let co = r.wrapping_sub(b);
    let t = b.wrapping_add(co >> 1);
    let cg = g.wrapping_sub(t);
    let y = t.wrapping_add(cg >> 1);
    [y, co, cg]
}

fn ycocg_inverse([y, co, cg]: [u8; 3]) -> [u8; 3] {
    let t = y.wrapping_sub(cg >> 1);
    let g = cg.wrapping_add(t);
    let b = t.wrapping_sub(co >> 1);
    let r = co.wrapping_add(b);
    [r, g, b]
}


/// The monochrome predictor catalog. Indexed by stable catalog id.
pub static MONO_FILTERS: [MonoFilterFn; MONO_COUNT] = [
    |n| n.a,                                            //  0: left
    |n| n.b,                                            //  1: up
    |n| average(n.a, n.b),                              //  2: avg(A, B)
    |n| paeth(n.a, n.b, n.c),                           //  3: paeth
    |_| 0,                                              //  4: zero
    |n| n.c,                                            //  5: up-left
    |n| n.d,                                            //  6: up-right
    |n| clamped_gradient(n.a, n.b, n.c),                //  7: clamped gradient
    |n| select(n.a, n.b, n.c),                          //  8: select
    |n| plane(n.a, n.b, n.c),                           //  9: plane
    |n| average(n.a, n.c),                              // 10: avg(A, C)
    |n| average(n.a, n.d),                              // 11: avg(A, D)
    |n| average(n.b, n.c),                              // 12: avg(B, C)
    |n| average(n.b, n.d),                              // 13: avg(B, D)
    |n| average(n.c, n.d),                              // 14: avg(C, D)
    |n| average4(n.a, n.b, n.c, n.d),                   // 15: avg(A, B, C, D)
];


/// Saturating residual magnitude → small score, as a lookup table.
/// Residuals wrap mod 256, so 255 is as quiet as 1.
pub static RESIDUAL_SCORE: [u8; 256] = compute_residual_scores();

const fn compute_residual_scores() -> [u8; 256] {
    let mut scores = [0_u8; 256];

    let mut value = 1_usize;
    while value < 256 {
        let magnitude = if value < 128 { value } else { 256 - value };

        let mut bits = 0_u8;
        let mut remaining = magnitude;
        while remaining > 0 {
            bits += 1;
            remaining >>= 1;
        }

        scores[value] = bits;
        value += 1;
    }

    scores
}

/// Maps the sum of two neighbor scores (0 ..= 16) to a chaos bin.
pub fn chaos_map(levels: usize) -> [u8; 17] {
    debug_assert!(levels >= 1 && levels <= MAX_CHAOS_LEVELS);

    let mut map = [0_u8; 17];
    for (sum, bin) in map.iter_mut().enumerate() {
        *bin = sum.min(levels - 1) as u8;
    }

    map
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn color_filters_invert(){
        for id in 0 .. CF_COUNT {
            for &rgb in &[[0, 0, 0], [255, 255, 255], [1, 254, 128], [200, 13, 77], [128, 127, 129]] {
                let yuv = RGB_TO_YUV[id](rgb);
                assert_eq!(YUV_TO_RGB[id](yuv), rgb, "color filter {} is not invertible", id);
            }
        }
    }

    #[test]
    fn color_filters_invert_exhaustively_on_one_channel_pairs(){
        // sweep two channels through all values with the third fixed
        for id in 0 .. CF_COUNT {
            for r in (0 ..= 255).step_by(17) {
                for g in (0 ..= 255).step_by(13) {
                    let rgb = [r as u8, g as u8, 99];
                    assert_eq!(YUV_TO_RGB[id](RGB_TO_YUV[id](rgb)), rgb);
                }
            }
        }
    }

    #[test]
    fn residual_scores_are_symmetric(){
        assert_eq!(RESIDUAL_SCORE[0], 0);
        for value in 1 .. 256 {
            assert_eq!(RESIDUAL_SCORE[value], RESIDUAL_SCORE[256 - value]);
        }
        assert_eq!(RESIDUAL_SCORE[1], 1);
        assert_eq!(RESIDUAL_SCORE[255], 1);
        assert_eq!(RESIDUAL_SCORE[128], 8);
    }

    #[test]
    fn chaos_maps_saturate(){
        let map = chaos_map(1);
        assert!(map.iter().all(|&bin| bin == 0));

        let map = chaos_map(8);
        assert_eq!(map[0], 0);
        assert_eq!(map[7], 7);
        assert_eq!(map[16], 7);
    }

    #[test]
    fn predictors_are_exact_on_flat_regions(){
        let flat = Neighbors { a: [7; 3], b: [7; 3], c: [7; 3], d: [7; 3] };
        for (id, filter) in SPATIAL_FILTERS.iter().enumerate() {
            if id == 4 { continue } // zero predictor
            assert_eq!(filter(&flat), [7; 3], "spatial filter {}", id);
        }

        let flat = MonoNeighbors { a: 9, b: 9, c: 9, d: 9 };
        for (id, filter) in MONO_FILTERS.iter().enumerate() {
            if id == 4 { continue }
            assert_eq!(filter(&flat), 9, "mono filter {}", id);
        }
    }
}
