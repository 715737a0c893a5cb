//! Transform recipes and the engine that executes them.
//!
//! - [`TransformSpec`] validates the raw `{operation: params}` mapping and
//!   holds the operations in canonical order.
//! - [`TransformEngine`] applies a spec to encoded image bytes.

mod engine;
mod font;
mod ops;
mod spec;

pub use engine::{
    decode_limits, TransformEngine, TransformedImage, SHARPEN_SIGMA, SHARPEN_THRESHOLD,
};
pub use spec::{
    Gravity, Operation, OutputFormat, TransformSpec, BLUR_SIGMA_RANGE, CANONICAL_ORDER,
    DEFAULT_COMPRESS_QUALITY, DEFAULT_MEDIAN_SIZE, DEFAULT_THRESHOLD, MAX_DIMENSION,
    MAX_MEDIAN_SIZE, MAX_PIXELS, SEPIA_TINT,
};
