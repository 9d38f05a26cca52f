
//! Round-trip the codec over the scenarios the format was designed for:
//! transparent sprites, palette artwork, repeated scanlines, gradients,
//! and randomized images of awkward dimensions.

use spritec::prelude::*;
use spritec::rgba::RgbaEncoder;

use rand::prelude::*;


fn encode(rgba: &[u8], width: usize, height: usize, mask: &Mask, knobs: Knobs) -> Vec<u8> {
    let mut encoder = RgbaEncoder::init(rgba, width, height, mask, knobs)
        .expect("encoder rejected valid input");

    let mut stream = Vec::new();
    encoder.write(&mut stream).expect("encoding failed");
    stream
}

fn roundtrip_with(rgba: &[u8], width: usize, height: usize, mask: &Mask, knobs: Knobs) -> Vec<u8> {
    let stream = encode(rgba, width, height, mask, knobs);
    let decoded = RgbaDecoder::read(&stream, mask).expect("decoding failed");

    assert_eq!(decoded.width, width);
    assert_eq!(decoded.height, height);
    assert_eq!(decoded.rgba, rgba, "pixels changed across the roundtrip");
    stream
}

fn roundtrip(rgba: &[u8], width: usize, height: usize, mask: &Mask) -> Vec<u8> {
    roundtrip_with(rgba, width, height, mask, Knobs::default())
}

/// A mask covering every fully transparent pixel,
/// reconstructing them as transparent black.
fn transparency_mask(rgba: &[u8], width: usize, height: usize) -> Mask {
    let covered = rgba.chunks_exact(4).map(|pixel| pixel[3] == 0).collect();
    Mask::new(width, height, covered, [0, 0, 0, 0]).expect("mask size")
}

fn solid(width: usize, height: usize, pixel: [u8; 4]) -> Vec<u8> {
    pixel.iter().copied().cycle().take(width * height * 4).collect()
}


#[test]
fn all_transparent_16x16(){
    let image = solid(16, 16, [0, 0, 0, 0]);
    let mask = transparency_mask(&image, 16, 16);
    assert_eq!(mask.covered_count(), 256);

    let stream = roundtrip(&image, 16, 16, &mask);

    // the mask covers everything: no pixel symbols at all,
    // just the header and near-empty tables
    assert!(stream.len() < 128, "stream too large: {} bytes", stream.len());
}

#[test]
fn single_opaque_pixel_in_transparent_frame(){
    let mut image = solid(4, 4, [0, 0, 0, 0]);
    image[0 .. 4].copy_from_slice(&[255, 0, 0, 255]);

    let mask = transparency_mask(&image, 4, 4);
    assert_eq!(mask.covered_count(), 15);

    let stream = roundtrip(&image, 4, 4, &mask);
    let decoded = RgbaDecoder::read(&stream, &mask).unwrap();

    assert_eq!(&decoded.rgba[0 .. 4], &[255, 0, 0, 255]);
    assert!(decoded.rgba[4 ..].iter().all(|&byte| byte == 0));
}

#[test]
fn vertical_stripes_compress_to_zero_runs(){
    // rows repeat an 8-pixel stripe pattern; the left predictor
    // zeroes everything except the stripe boundaries
    let (width, height) = (64, 8);
    let mut image = Vec::with_capacity(width * height * 4);
    for _ in 0 .. height {
        for x in 0 .. width {
            let stripe = if (x / 8) % 2 == 0 { [200, 40, 40, 255] } else { [40, 40, 200, 255] };
            image.extend_from_slice(&stripe);
        }
    }

    let mask = Mask::all_clear(width, height);
    let knobs = Knobs { lz_enable: false, .. Knobs::default() };
    let stream = roundtrip_with(&image, width, height, &mask, knobs);

    assert!(stream.len() < width * height, "stripes did not compress: {} bytes", stream.len());
}

#[test]
fn repeated_scanlines_roundtrip_with_lz(){
    let width = 64;
    let row: Vec<u8> = (0 .. width).flat_map(|x|
        [(x * 3) as u8, (x * 7) as u8, 31, 255]).collect();

    let mut image = row.clone();
    image.extend_from_slice(&row);

    let mask = Mask::all_clear(width, 2);
    roundtrip(&image, width, 2, &mask);

    let without_lz = Knobs { lz_enable: false, .. Knobs::default() };
    roundtrip_with(&image, width, 2, &mask, without_lz);
}

#[test]
fn uniform_gray_needs_no_residuals(){
    let image = solid(32, 32, [128, 128, 128, 255]);
    let mask = Mask::all_clear(32, 32);

    let stream = roundtrip(&image, 32, 32, &mask);

    // every tile matches the palette filter: no residual symbols travel
    assert!(stream.len() < 256, "uniform image too large: {} bytes", stream.len());
}

#[test]
fn horizontal_gradient_stays_lean(){
    let width = 256;
    let image: Vec<u8> = (0 .. width).flat_map(|x| [x as u8, 0, 0, 255]).collect();
    let mask = Mask::all_clear(width, 1);

    let stream = roundtrip(&image, width, 1, &mask);
    assert!(stream.len() < 512, "gradient too large: {} bytes", stream.len());
}

#[test]
fn boundary_dimensions_roundtrip(){
    let sizes = [(1, 1), (1, 17), (17, 1), (2, 2), (8, 8), (9, 7)];

    for &(width, height) in &sizes {
        let opaque = solid(width, height, [13, 200, 77, 255]);
        roundtrip(&opaque, width, height, &Mask::all_clear(width, height));

        let transparent = solid(width, height, [0, 0, 0, 0]);
        let mask = transparency_mask(&transparent, width, height);
        roundtrip(&transparent, width, height, &mask);
    }
}

#[test]
fn encoding_is_deterministic(){
    let mut random = StdRng::seed_from_u64(603);
    let (width, height) = (33, 21);

    let image: Vec<u8> = (0 .. width * height * 4).map(|_| random.gen()).collect();
    let mask = Mask::all_clear(width, height);

    let first = encode(&image, width, height, &mask, Knobs::default());
    let second = encode(&image, width, height, &mask, Knobs::default());
    assert_eq!(first, second, "two encodes of the same image differ");
}

#[test]
fn randomized_images_roundtrip(){
    let mut random = StdRng::seed_from_u64(31337);

    for &(width, height) in &[(3, 2), (13, 9), (16, 16), (33, 17), (40, 5)] {
        // mix of flat regions and noise, like real sprite sheets
        let mut image = vec![0_u8; width * height * 4];
        for y in 0 .. height {
            for x in 0 .. width {
                let position = (y * width + x) * 4;
                let pixel: [u8; 4] = if random.gen_bool(0.6) {
                    [50, 100, 150, 255]
                } else {
                    [random.gen(), random.gen(), random.gen(), random.gen::<u8>() | 1]
                };
                image[position .. position + 4].copy_from_slice(&pixel);
            }
        }

        roundtrip(&image, width, height, &Mask::all_clear(width, height));
    }
}

#[test]
fn randomized_masks_roundtrip(){
    let mut random = StdRng::seed_from_u64(4711);
    let (width, height) = (24, 19);
    let color = [9, 9, 9, 0];

    let mut covered = vec![false; width * height];
    let mut image = vec![0_u8; width * height * 4];

    for position in 0 .. width * height {
        if random.gen_bool(0.4) {
            covered[position] = true;
            image[position * 4 .. position * 4 + 4].copy_from_slice(&color);
        }
        else {
            let pixel = [random.gen(), random.gen(), 7, 255];
            image[position * 4 .. position * 4 + 4].copy_from_slice(&pixel);
        }
    }

    let mask = Mask::new(width, height, covered, color).unwrap();
    roundtrip(&image, width, height, &mask);
}

#[test]
fn mask_wins_over_pixel_contents(){
    // the encoder never sees masked pixel values, and the decoder
    // reconstructs them from the mask alone
    let mut random = StdRng::seed_from_u64(99);
    let (width, height) = (16, 12);
    let color = [30, 60, 90, 255];

    let mut covered = vec![false; width * height];
    let mut image = vec![0_u8; width * height * 4];

    for position in 0 .. width * height {
        if position % 3 == 0 {
            covered[position] = true;
            // garbage where the mask rules: it must not leak through
            let garbage: [u8; 4] = [random.gen(), random.gen(), random.gen(), random.gen()];
            image[position * 4 .. position * 4 + 4].copy_from_slice(&garbage);
        }
        else {
            image[position * 4 .. position * 4 + 4].copy_from_slice(&[200, 10, 10, 255]);
        }
    }

    let mask = Mask::new(width, height, covered.clone(), color).unwrap();
    let stream = encode(&image, width, height, &mask, Knobs::default());
    let decoded = RgbaDecoder::read(&stream, &mask).unwrap();

    for position in 0 .. width * height {
        let pixel = &decoded.rgba[position * 4 .. position * 4 + 4];
        if covered[position] {
            assert_eq!(pixel, &color, "masked pixel not forced to the mask color");
        }
        else {
            assert_eq!(pixel, &[200, 10, 10, 255]);
        }
    }
}

#[test]
fn truncated_streams_error_instead_of_panicking(){
    let image = solid(16, 16, [1, 2, 3, 255]);
    let mask = Mask::all_clear(16, 16);
    let stream = encode(&image, 16, 16, &mask, Knobs::default());

    for cut in [0, 1, 2, stream.len() / 2, stream.len().saturating_sub(1)] {
        assert!(
            RgbaDecoder::read(&stream[.. cut], &mask).is_err(),
            "decoding {} of {} bytes should fail", cut, stream.len()
        );
    }
}

#[test]
fn invalid_inputs_are_rejected(){
    let image = solid(4, 4, [0, 0, 0, 255]);
    let mask = Mask::all_clear(4, 4);

    assert!(matches!(
        RgbaEncoder::init(&image, 0, 4, &Mask::all_clear(0, 4), Knobs::default()),
        Err(Error::Invalid(_))
    ));

    assert!(matches!(
        RgbaEncoder::init(&image, 4, 4, &Mask::all_clear(5, 4), Knobs::default()),
        Err(Error::Invalid(_))
    ));

    assert!(matches!(
        RgbaEncoder::init(&image[.. 8], 4, 4, &mask, Knobs::default()),
        Err(Error::Invalid(_))
    ));

    let bad_knobs = Knobs { sympal_thresh: 2.0, .. Knobs::default() };
    assert!(matches!(
        RgbaEncoder::init(&image, 4, 4, &mask, bad_knobs),
        Err(Error::Invalid(_))
    ));
}

#[test]
fn larger_sprite_sheet_roundtrips(){
    // a synthetic sprite sheet: transparent background, a few solid
    // shapes, a dithered block and a repeated tile row
    let (width, height) = (96, 64);
    let mut image = vec![0_u8; width * height * 4];

    let mut put = |x: usize, y: usize, pixel: [u8; 4]| {
        let position = (y * width + x) * 4;
        image[position .. position + 4].copy_from_slice(&pixel);
    };

    for y in 8 .. 24 {
        for x in 8 .. 40 {
            put(x, y, [220, 50, 50, 255]);
        }
    }

    for y in 30 .. 62 {
        for x in 4 .. 36 {
            let shade = if (x + y) % 2 == 0 { 90 } else { 110 };
            put(x, y, [shade, shade, 200, 255]);
        }
    }

    for y in 8 .. 56 {
        for x in 48 .. 92 {
            put(x, y, [40, (y * 4) as u8, 60, 255]);
        }
    }

    let mask = transparency_mask(&image, width, height);
    let stream = roundtrip(&image, width, height, &mask);

    assert!(stream.len() < width * height * 4 / 4,
        "sprite sheet compressed poorly: {} bytes", stream.len());
}
