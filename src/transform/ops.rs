//! Pixel operations that the image crate does not provide directly.
//!
//! Every function takes the current image by reference and returns a new
//! image, so the engine can thread one image value through the pipeline.

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, Luma, Rgba, RgbaImage};

use super::font::{self, GLYPH_HEIGHT, GLYPH_SPACING, GLYPH_WIDTH};
use super::spec::{Gravity, MAX_DIMENSION, MAX_PIXELS};
use crate::error::TransformError;

/// Resampling filter used for every resize.
pub const RESIZE_FILTER: FilterType = FilterType::Lanczos3;

/// Watermark opacity, out of 255.
const WATERMARK_ALPHA: u16 = 128;

/// Resize to `width` and/or `height`.
///
/// With both dimensions the image is scaled to cover the box and cropped from
/// the center. With one, the other follows the source aspect ratio and the
/// result may be no larger than [`MAX_DIMENSION`] on either side.
pub fn resize(
    img: &DynamicImage,
    width: Option<u32>,
    height: Option<u32>,
) -> Result<DynamicImage, TransformError> {
    let (src_w, src_h) = img.dimensions();
    let (target_w, target_h) = match (width, height) {
        (Some(w), Some(h)) => cover_dimensions(src_w, src_h, w, h),
        (Some(w), None) => (w, scale_dimension(src_h, w, src_w)),
        (None, Some(h)) => (scale_dimension(src_w, h, src_h), h),
        (None, None) => return Ok(img.clone()),
    };

    let exact = width.is_none() || height.is_none();
    if exact && target_w.max(target_h) > MAX_DIMENSION {
        return Err(resize_error(format!(
            "result {}x{} exceeds the maximum dimension {}",
            target_w, target_h, MAX_DIMENSION
        )));
    }
    check_pixel_budget(src_w, target_w, target_h)?;

    Ok(match (width, height) {
        (Some(w), Some(h)) => img.resize_to_fill(w, h, RESIZE_FILTER),
        _ => img.resize_exact(target_w, target_h, RESIZE_FILTER),
    })
}

/// Size the source is scaled to before `resize_to_fill` crops it to `w x h`.
fn cover_dimensions(src_w: u32, src_h: u32, w: u32, h: u32) -> (u32, u32) {
    if u64::from(w) * u64::from(src_h) >= u64::from(h) * u64::from(src_w) {
        (w, scale_dimension(src_h, w, src_w))
    } else {
        (scale_dimension(src_w, h, src_h), h)
    }
}

/// The resampler scales vertically first, so besides the target it holds a
/// `src_w x target_h` intermediate buffer.
fn check_pixel_budget(src_w: u32, target_w: u32, target_h: u32) -> Result<(), TransformError> {
    let target = u64::from(target_w) * u64::from(target_h);
    let vertical_pass = u64::from(src_w) * u64::from(target_h);
    if target.max(vertical_pass) > MAX_PIXELS {
        return Err(resize_error(format!(
            "scaling to {}x{} needs more than {} pixels",
            target_w, target_h, MAX_PIXELS
        )));
    }
    Ok(())
}

fn resize_error(message: String) -> TransformError {
    TransformError::OperationFailure {
        op: "resize",
        message,
    }
}

/// `value * numerator / denominator`, rounded, never zero.
fn scale_dimension(value: u32, numerator: u32, denominator: u32) -> u32 {
    let scaled = (u64::from(value) * u64::from(numerator) + u64::from(denominator) / 2)
        / u64::from(denominator.max(1));
    scaled.clamp(1, u64::from(u32::MAX)) as u32
}

pub fn crop(
    img: &DynamicImage,
    x: u32,
    y: u32,
    width: u32,
    height: u32,
) -> Result<DynamicImage, TransformError> {
    let (img_w, img_h) = img.dimensions();
    let fits = x.checked_add(width).is_some_and(|right| right <= img_w)
        && y.checked_add(height).is_some_and(|bottom| bottom <= img_h);

    if !fits {
        return Err(TransformError::OperationFailure {
            op: "crop",
            message: format!(
                "rectangle {}x{} at ({}, {}) exceeds image bounds {}x{}",
                width, height, x, y, img_w, img_h
            ),
        });
    }

    Ok(img.crop_imm(x, y, width, height))
}

pub fn rotate(img: &DynamicImage, degrees: u32) -> DynamicImage {
    match degrees {
        90 => img.rotate90(),
        180 => img.rotate180(),
        270 => img.rotate270(),
        _ => img.clone(),
    }
}

/// Rec. 601 luma of an RGB triple.
fn luma(r: f32, g: f32, b: f32) -> f32 {
    0.299 * r + 0.587 * g + 0.114 * b
}

/// Recolor towards `(r, g, b)` while keeping each pixel's luminance.
pub fn tint(img: &DynamicImage, r: u8, g: u8, b: u8) -> DynamicImage {
    let target = [f32::from(r), f32::from(g), f32::from(b)];
    let target_luma = luma(target[0], target[1], target[2]);

    let mut rgba = img.to_rgba8();
    for pixel in rgba.pixels_mut() {
        let l = luma(
            f32::from(pixel[0]),
            f32::from(pixel[1]),
            f32::from(pixel[2]),
        );
        for (channel, t) in target.iter().enumerate() {
            pixel[channel] = (l + t - target_luma).round().clamp(0.0, 255.0) as u8;
        }
    }
    DynamicImage::ImageRgba8(rgba)
}

/// Median filter with a square `size` window; edges are clamped.
pub fn median(img: &DynamicImage, size: u32) -> DynamicImage {
    let src = img.to_rgba8();
    let (w, h) = src.dimensions();
    let radius = i64::from(size / 2);
    let max_x = i64::from(w) - 1;
    let max_y = i64::from(h) - 1;

    let mut out = RgbaImage::new(w, h);
    let mut window: Vec<u8> = Vec::with_capacity((size * size) as usize);

    for y in 0..h {
        for x in 0..w {
            let mut px = [0u8; 4];
            for (channel, value) in px.iter_mut().enumerate() {
                window.clear();
                for dy in -radius..=radius {
                    let sy = (i64::from(y) + dy).clamp(0, max_y) as u32;
                    for dx in -radius..=radius {
                        let sx = (i64::from(x) + dx).clamp(0, max_x) as u32;
                        window.push(src.get_pixel(sx, sy)[channel]);
                    }
                }
                window.sort_unstable();
                *value = window[window.len() / 2];
            }
            out.put_pixel(x, y, Rgba(px));
        }
    }

    DynamicImage::ImageRgba8(out)
}

/// Stretch each color channel to the full 0..=255 range.
pub fn normalize(img: &DynamicImage) -> DynamicImage {
    let mut rgba = img.to_rgba8();
    let mut lo = [u8::MAX; 3];
    let mut hi = [u8::MIN; 3];

    for pixel in rgba.pixels() {
        for c in 0..3 {
            lo[c] = lo[c].min(pixel[c]);
            hi[c] = hi[c].max(pixel[c]);
        }
    }

    for pixel in rgba.pixels_mut() {
        for c in 0..3 {
            if hi[c] > lo[c] {
                let span = u32::from(hi[c] - lo[c]);
                let offset = u32::from(pixel[c] - lo[c]);
                pixel[c] = ((offset * 255 + span / 2) / span) as u8;
            }
        }
    }

    DynamicImage::ImageRgba8(rgba)
}

/// Grayscale, then 255 where luminance >= `value`, 0 elsewhere.
pub fn threshold(img: &DynamicImage, value: u8) -> DynamicImage {
    let mut gray = img.to_luma8();
    for pixel in gray.pixels_mut() {
        *pixel = Luma([if pixel[0] >= value { 255 } else { 0 }]);
    }
    DynamicImage::ImageLuma8(gray)
}

/// Stamp `text` in semi-transparent white at `position`.
///
/// The text is scaled to at most 60% of the width and 20% of the height,
/// never below one pixel per font unit. Glyphs falling outside the canvas
/// are clipped.
pub fn watermark(img: &DynamicImage, text: &str, position: Gravity) -> DynamicImage {
    let mut canvas = img.to_rgba8();
    let (w, h) = canvas.dimensions();
    let units = font::text_width(text);
    if units == 0 {
        return DynamicImage::ImageRgba8(canvas);
    }

    let scale = ((w * 6 / 10) / units)
        .min((h / 5) / GLYPH_HEIGHT)
        .max(1);
    let text_w = i64::from(units * scale);
    let text_h = i64::from(GLYPH_HEIGHT * scale);
    let (origin_x, origin_y) = place(position, i64::from(w), i64::from(h), text_w, text_h, i64::from(scale));

    let advance = i64::from((GLYPH_WIDTH + GLYPH_SPACING) * scale);
    for (index, c) in text.chars().enumerate() {
        let glyph = font::glyph(c);
        let glyph_x = origin_x + index as i64 * advance;
        for row in 0..GLYPH_HEIGHT {
            for col in 0..GLYPH_WIDTH {
                if !font::is_set(&glyph, col, row) {
                    continue;
                }
                let block_x = glyph_x + i64::from(col * scale);
                let block_y = origin_y + i64::from(row * scale);
                for py in block_y..block_y + i64::from(scale) {
                    for px in block_x..block_x + i64::from(scale) {
                        if px < 0 || py < 0 || px >= i64::from(w) || py >= i64::from(h) {
                            continue;
                        }
                        let pixel = canvas.get_pixel_mut(px as u32, py as u32);
                        for channel in pixel.0.iter_mut() {
                            *channel = blend_white(*channel);
                        }
                    }
                }
            }
        }
    }

    DynamicImage::ImageRgba8(canvas)
}

fn blend_white(value: u8) -> u8 {
    ((u16::from(value) * (255 - WATERMARK_ALPHA) + 255 * WATERMARK_ALPHA + 127) / 255) as u8
}

/// Top-left corner of a `text_w` x `text_h` box placed by gravity.
fn place(
    position: Gravity,
    w: i64,
    h: i64,
    text_w: i64,
    text_h: i64,
    margin: i64,
) -> (i64, i64) {
    let left = margin;
    let right = w - text_w - margin;
    let center_x = (w - text_w) / 2;
    let top = margin;
    let bottom = h - text_h - margin;
    let center_y = (h - text_h) / 2;

    match position {
        Gravity::Center => (center_x, center_y),
        Gravity::North => (center_x, top),
        Gravity::South => (center_x, bottom),
        Gravity::East => (right, center_y),
        Gravity::West => (left, center_y),
        Gravity::NorthEast => (right, top),
        Gravity::NorthWest => (left, top),
        Gravity::SouthEast => (right, bottom),
        Gravity::SouthWest => (left, bottom),
    }
}
