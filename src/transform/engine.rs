//! The transform engine.
//!
//! [`TransformEngine`] decodes image bytes once, threads a single image value
//! through every operation of a [`TransformSpec`] in canonical order, and
//! encodes the result. It performs no I/O and keeps no state between calls,
//! so the same bytes and spec always produce the same output.
//!
//! # Output encoding
//!
//! The output keeps the input's format unless an operation overrides it:
//! `compress` switches to JPEG at the given quality and `format` (which runs
//! last) picks the final encoding. JPEG output drops the alpha channel.

use std::io::Cursor;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageReader, Limits};

use super::ops;
use super::spec::{
    Operation, OutputFormat, TransformSpec, DEFAULT_COMPRESS_QUALITY, MAX_DIMENSION, MAX_PIXELS,
    SEPIA_TINT,
};
use crate::error::TransformError;

/// Sigma used by `sharpen`.
pub const SHARPEN_SIGMA: f32 = 1.0;

/// Unsharp-mask threshold used by `sharpen`.
pub const SHARPEN_THRESHOLD: i32 = 1;

/// Encoded output of a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformedImage {
    pub bytes: Bytes,
    pub format: OutputFormat,
}

/// Where the pipeline will encode to, updated by `compress` and `format`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Encoding {
    format: OutputFormat,
    quality: u8,
}

/// Applies transform specs to image bytes.
#[derive(Debug, Clone, Default)]
pub struct TransformEngine {}

impl TransformEngine {
    pub fn new() -> Self {
        Self {}
    }

    /// Apply `spec` to `source` and return the encoded bytes.
    pub fn apply(&self, source: &[u8], spec: &TransformSpec) -> Result<Bytes, TransformError> {
        self.render(source, spec).map(|out| out.bytes)
    }

    /// Apply `spec` to `source`, also reporting the output format.
    ///
    /// An empty spec still requires decodable input, and returns the input
    /// bytes untouched.
    pub fn render(
        &self,
        source: &[u8],
        spec: &TransformSpec,
    ) -> Result<TransformedImage, TransformError> {
        let (mut img, input_format) = decode(source)?;

        let mut encoding = Encoding {
            format: input_format.unwrap_or(OutputFormat::Png),
            quality: DEFAULT_COMPRESS_QUALITY,
        };

        if spec.is_empty() {
            return Ok(TransformedImage {
                bytes: Bytes::copy_from_slice(source),
                format: encoding.format,
            });
        }

        for op in spec.operations() {
            img = apply_operation(img, op, &mut encoding)?;
        }

        let bytes = encode(&img, encoding)?;
        Ok(TransformedImage {
            bytes,
            format: encoding.format,
        })
    }
}

/// Decoder limits for untrusted sources.
///
/// Either side may be at most [`MAX_DIMENSION`], and the decoder may allocate
/// room for [`MAX_PIXELS`] pixels at up to 8 bytes each (16-bit RGBA).
pub fn decode_limits() -> Limits {
    let mut limits = Limits::default();
    limits.max_image_width = Some(MAX_DIMENSION);
    limits.max_image_height = Some(MAX_DIMENSION);
    limits.max_alloc = Some(MAX_PIXELS * 8);
    limits
}

fn decode(source: &[u8]) -> Result<(DynamicImage, Option<OutputFormat>), TransformError> {
    let mut reader = ImageReader::new(Cursor::new(source))
        .with_guessed_format()
        .map_err(|e| TransformError::DecodeFailure {
            message: e.to_string(),
        })?;
    reader.limits(decode_limits());

    let format = reader.format().and_then(OutputFormat::from_image_format);

    let img = reader.decode().map_err(|e| TransformError::DecodeFailure {
        message: e.to_string(),
    })?;

    Ok((img, format))
}

fn apply_operation(
    img: DynamicImage,
    op: &Operation,
    encoding: &mut Encoding,
) -> Result<DynamicImage, TransformError> {
    let next = match op {
        Operation::Resize { width, height } => ops::resize(&img, *width, *height)?,
        Operation::Crop {
            x,
            y,
            width,
            height,
        } => ops::crop(&img, *x, *y, *width, *height)?,
        Operation::Rotate { degrees } => ops::rotate(&img, *degrees),
        Operation::Filters { grayscale, sepia } => {
            let mut out = if *grayscale { img.grayscale() } else { img };
            if *sepia {
                let (r, g, b) = SEPIA_TINT;
                out = ops::tint(&out, r, g, b);
            }
            out
        }
        Operation::Flip => img.flipv(),
        Operation::Flop => img.fliph(),
        Operation::Watermark { text, position } => ops::watermark(&img, text, *position),
        Operation::Compress { quality } => {
            encoding.format = OutputFormat::Jpeg;
            encoding.quality = *quality;
            img
        }
        Operation::Blur { sigma } => img.blur(*sigma),
        Operation::Sharpen => img.unsharpen(SHARPEN_SIGMA, SHARPEN_THRESHOLD),
        Operation::Median { size } => ops::median(&img, *size),
        Operation::Tint { r, g, b } => ops::tint(&img, *r, *g, *b),
        Operation::Normalize => ops::normalize(&img),
        Operation::Threshold { value } => ops::threshold(&img, *value),
        Operation::Format { format } => {
            encoding.format = *format;
            img
        }
    };
    Ok(next)
}

fn encode(img: &DynamicImage, encoding: Encoding) -> Result<Bytes, TransformError> {
    let mut output = Vec::new();

    let result = match encoding.format {
        OutputFormat::Jpeg => {
            let rgb = img.to_rgb8();
            JpegEncoder::new_with_quality(&mut output, encoding.quality).encode_image(&rgb)
        }
        format => DynamicImage::ImageRgba8(img.to_rgba8())
            .write_to(&mut Cursor::new(&mut output), format.image_format()),
    };

    result.map_err(|e| TransformError::EncodeFailure {
        format: encoding.format.to_string(),
        message: e.to_string(),
    })?;

    Ok(Bytes::from(output))
}
