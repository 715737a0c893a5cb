//! Transformation recipes.
//!
//! A [`TransformSpec`] is built from the loosely-shaped JSON mapping clients
//! send (`{"resize": {"width": 100}, "rotate": 90, ...}`) and holds one
//! [`Operation`] per recognized key, always sorted into the canonical
//! execution order:
//!
//! ```text
//! resize → crop → rotate → filters → flip → flop → watermark → compress
//!        → blur → sharpen → median → tint → normalize → threshold → format
//! ```
//!
//! The key order of the incoming mapping is irrelevant; two mappings with the
//! same entries always yield equal specs and therefore identical pipelines.
//!
//! Validation fails closed: unknown keys are never ignored, and every unknown
//! key and malformed parameter is reported in a single [`SpecError`].

use std::fmt;

use image::ImageFormat;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value};

use crate::error::SpecError;

/// Operation names in canonical execution order.
pub const CANONICAL_ORDER: [&str; 15] = [
    "resize",
    "crop",
    "rotate",
    "filters",
    "flip",
    "flop",
    "watermark",
    "compress",
    "blur",
    "sharpen",
    "median",
    "tint",
    "normalize",
    "threshold",
    "format",
];

/// Default JPEG quality used by `compress` when none is given.
pub const DEFAULT_COMPRESS_QUALITY: u8 = 80;

/// Default window size for `median`.
pub const DEFAULT_MEDIAN_SIZE: u32 = 3;

/// Largest accepted `median` window.
pub const MAX_MEDIAN_SIZE: u32 = 15;

/// Default cut-off for `threshold`.
pub const DEFAULT_THRESHOLD: u8 = 128;

/// Accepted range for `blur` sigma.
pub const BLUR_SIGMA_RANGE: (f32, f32) = (0.3, 1000.0);

/// Upper bound for `resize` dimensions and for either side of a decoded source.
pub const MAX_DIMENSION: u32 = 16_384;

/// Upper bound on the pixel count of any image the engine will allocate.
pub const MAX_PIXELS: u64 = 32 * 1024 * 1024;

/// Color applied by the `sepia` filter.
pub const SEPIA_TINT: (u8, u8, u8) = (112, 66, 20);

// =============================================================================
// Parameter Types
// =============================================================================

/// Placement of a watermark inside the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Gravity {
    #[default]
    Center,
    North,
    South,
    East,
    West,
    NorthEast,
    NorthWest,
    SouthEast,
    SouthWest,
}

impl Gravity {
    pub fn parse(name: &str) -> Option<Self> {
        let gravity = match name.to_ascii_lowercase().as_str() {
            "center" | "centre" => Gravity::Center,
            "north" => Gravity::North,
            "south" => Gravity::South,
            "east" => Gravity::East,
            "west" => Gravity::West,
            "northeast" => Gravity::NorthEast,
            "northwest" => Gravity::NorthWest,
            "southeast" => Gravity::SouthEast,
            "southwest" => Gravity::SouthWest,
            _ => return None,
        };
        Some(gravity)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Gravity::Center => "center",
            Gravity::North => "north",
            Gravity::South => "south",
            Gravity::East => "east",
            Gravity::West => "west",
            Gravity::NorthEast => "northeast",
            Gravity::NorthWest => "northwest",
            Gravity::SouthEast => "southeast",
            Gravity::SouthWest => "southwest",
        }
    }
}

/// Output encodings a variant can be written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Jpeg,
    Png,
    Gif,
    WebP,
    Tiff,
    Bmp,
}

impl OutputFormat {
    pub fn parse(name: &str) -> Option<Self> {
        let format = match name.to_ascii_lowercase().as_str() {
            "jpeg" | "jpg" => OutputFormat::Jpeg,
            "png" => OutputFormat::Png,
            "gif" => OutputFormat::Gif,
            "webp" => OutputFormat::WebP,
            "tiff" | "tif" => OutputFormat::Tiff,
            "bmp" => OutputFormat::Bmp,
            _ => return None,
        };
        Some(format)
    }

    /// Map a decoded input format to an output format, if we can encode it.
    pub fn from_image_format(format: ImageFormat) -> Option<Self> {
        match format {
            ImageFormat::Jpeg => Some(OutputFormat::Jpeg),
            ImageFormat::Png => Some(OutputFormat::Png),
            ImageFormat::Gif => Some(OutputFormat::Gif),
            ImageFormat::WebP => Some(OutputFormat::WebP),
            ImageFormat::Tiff => Some(OutputFormat::Tiff),
            ImageFormat::Bmp => Some(OutputFormat::Bmp),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "jpeg",
            OutputFormat::Png => "png",
            OutputFormat::Gif => "gif",
            OutputFormat::WebP => "webp",
            OutputFormat::Tiff => "tiff",
            OutputFormat::Bmp => "bmp",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "jpg",
            other => other.name(),
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Png => "image/png",
            OutputFormat::Gif => "image/gif",
            OutputFormat::WebP => "image/webp",
            OutputFormat::Tiff => "image/tiff",
            OutputFormat::Bmp => "image/bmp",
        }
    }

    pub fn image_format(self) -> ImageFormat {
        match self {
            OutputFormat::Jpeg => ImageFormat::Jpeg,
            OutputFormat::Png => ImageFormat::Png,
            OutputFormat::Gif => ImageFormat::Gif,
            OutputFormat::WebP => ImageFormat::WebP,
            OutputFormat::Tiff => ImageFormat::Tiff,
            OutputFormat::Bmp => ImageFormat::Bmp,
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Operation
// =============================================================================

/// One validated step of a transform pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Resize; with both dimensions the image covers the box and is centre-cropped.
    Resize {
        width: Option<u32>,
        height: Option<u32>,
    },
    /// Extract a rectangle.
    Crop {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    },
    /// Clockwise rotation, normalized to 0, 90, 180 or 270.
    Rotate { degrees: u32 },
    /// Grayscale, then sepia.
    Filters { grayscale: bool, sepia: bool },
    /// Mirror vertically (top becomes bottom).
    Flip,
    /// Mirror horizontally (left becomes right).
    Flop,
    Watermark { text: String, position: Gravity },
    /// Encode as JPEG at the given quality.
    Compress { quality: u8 },
    Blur { sigma: f32 },
    Sharpen,
    Median { size: u32 },
    Tint { r: u8, g: u8, b: u8 },
    Normalize,
    Threshold { value: u8 },
    Format { format: OutputFormat },
}

impl Operation {
    /// The key this operation is spelled as in a raw mapping.
    pub fn name(&self) -> &'static str {
        CANONICAL_ORDER[self.stage()]
    }

    /// Position of this operation in the canonical order.
    pub fn stage(&self) -> usize {
        match self {
            Operation::Resize { .. } => 0,
            Operation::Crop { .. } => 1,
            Operation::Rotate { .. } => 2,
            Operation::Filters { .. } => 3,
            Operation::Flip => 4,
            Operation::Flop => 5,
            Operation::Watermark { .. } => 6,
            Operation::Compress { .. } => 7,
            Operation::Blur { .. } => 8,
            Operation::Sharpen => 9,
            Operation::Median { .. } => 10,
            Operation::Tint { .. } => 11,
            Operation::Normalize => 12,
            Operation::Threshold { .. } => 13,
            Operation::Format { .. } => 14,
        }
    }

    /// Parameters in their canonical external shape.
    pub fn params(&self) -> Value {
        match self {
            Operation::Resize { width, height } => {
                let mut params = Map::new();
                if let Some(width) = width {
                    params.insert("width".into(), json!(width));
                }
                if let Some(height) = height {
                    params.insert("height".into(), json!(height));
                }
                Value::Object(params)
            }
            Operation::Crop {
                x,
                y,
                width,
                height,
            } => json!({ "x": x, "y": y, "width": width, "height": height }),
            Operation::Rotate { degrees } => json!({ "degrees": degrees }),
            Operation::Filters { grayscale, sepia } => {
                json!({ "grayscale": grayscale, "sepia": sepia })
            }
            Operation::Flip | Operation::Flop | Operation::Sharpen | Operation::Normalize => {
                Value::Bool(true)
            }
            Operation::Watermark { text, position } => {
                json!({ "text": text, "position": position.as_str() })
            }
            Operation::Compress { quality } => json!({ "quality": quality }),
            Operation::Blur { sigma } => json!({ "sigma": sigma }),
            Operation::Median { size } => json!({ "size": size }),
            Operation::Tint { r, g, b } => json!({ "r": r, "g": g, "b": b }),
            Operation::Threshold { value } => json!({ "value": value }),
            Operation::Format { format } => json!({ "name": format.name() }),
        }
    }
}

// =============================================================================
// TransformSpec
// =============================================================================

/// A validated transform recipe, held in canonical order.
///
/// Serializes to (and deserializes from) the external mapping shape, so it
/// can travel inside job messages and image records unchanged.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TransformSpec {
    operations: Vec<Operation>,
}

impl TransformSpec {
    /// The identity recipe.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a spec from operations given in any order.
    ///
    /// A later operation replaces an earlier one of the same kind.
    pub fn from_operations(operations: impl IntoIterator<Item = Operation>) -> Self {
        let mut spec = Self::empty();
        for op in operations {
            spec.insert(op);
        }
        spec
    }

    /// Validate a raw JSON value. Anything but an object is rejected.
    pub fn from_value(raw: &Value) -> Result<Self, SpecError> {
        match raw {
            Value::Object(map) => Self::from_map(map),
            other => Err(SpecError::malformed(format!(
                "transformations must be an object, got {}",
                json_type(other)
            ))),
        }
    }

    /// Validate a raw mapping of operation name to parameters.
    pub fn from_map(raw: &Map<String, Value>) -> Result<Self, SpecError> {
        let mut unknown_keys = Vec::new();
        let mut problems = Vec::new();
        let mut spec = Self::empty();

        for (key, params) in raw {
            if !CANONICAL_ORDER.contains(&key.as_str()) {
                unknown_keys.push(key.clone());
                continue;
            }
            match parse_operation(key, params) {
                Ok(Some(op)) => spec.insert(op),
                Ok(None) => {}
                Err(problem) => problems.push(problem),
            }
        }

        if unknown_keys.is_empty() && problems.is_empty() {
            Ok(spec)
        } else {
            Err(SpecError {
                unknown_keys,
                problems,
            })
        }
    }

    /// Operations in execution order.
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Operation names in execution order.
    pub fn operation_names(&self) -> Vec<&'static str> {
        self.operations.iter().map(Operation::name).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// The canonical external mapping for this spec.
    pub fn to_map(&self) -> Map<String, Value> {
        self.operations
            .iter()
            .map(|op| (op.name().to_string(), op.params()))
            .collect()
    }

    fn insert(&mut self, op: Operation) {
        let stage = op.stage();
        match self
            .operations
            .binary_search_by_key(&stage, Operation::stage)
        {
            Ok(index) => self.operations[index] = op,
            Err(index) => self.operations.insert(index, op),
        }
    }
}

impl Serialize for TransformSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_map().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TransformSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Map::<String, Value>::deserialize(deserializer)?;
        TransformSpec::from_map(&raw).map_err(D::Error::custom)
    }
}

// =============================================================================
// Parameter Parsing
// =============================================================================

fn parse_operation(name: &str, params: &Value) -> Result<Option<Operation>, String> {
    let op = match name {
        "resize" => {
            let obj = object(name, params)?;
            let width = optional_dimension(name, obj, "width")?;
            let height = optional_dimension(name, obj, "height")?;
            if width.is_none() && height.is_none() {
                return Err("resize requires width and/or height".to_string());
            }
            Operation::Resize { width, height }
        }
        "crop" => {
            let obj = object(name, params)?;
            let width = required_u32(name, obj, "width")?;
            let height = required_u32(name, obj, "height")?;
            if width == 0 || height == 0 {
                return Err("crop.width and crop.height must be greater than 0".to_string());
            }
            Operation::Crop {
                x: required_u32(name, obj, "x")?,
                y: required_u32(name, obj, "y")?,
                width,
                height,
            }
        }
        "rotate" => {
            let degrees = scalar_or_field(name, params, "degrees")?
                .ok_or_else(|| "rotate.degrees is required".to_string())?;
            let degrees = as_i64(degrees)
                .ok_or_else(|| "rotate.degrees must be an integer".to_string())?;
            if degrees % 90 != 0 {
                return Err(format!(
                    "rotate.degrees must be a multiple of 90, got {}",
                    degrees
                ));
            }
            Operation::Rotate {
                degrees: degrees.rem_euclid(360) as u32,
            }
        }
        "filters" => {
            let obj = object(name, params)?;
            if let Some(key) = obj.keys().find(|k| *k != "grayscale" && *k != "sepia") {
                return Err(format!("filters.{} is not a recognized filter", key));
            }
            let grayscale = optional_bool(name, obj, "grayscale")?;
            let sepia = optional_bool(name, obj, "sepia")?;
            if !grayscale && !sepia {
                return Ok(None);
            }
            Operation::Filters { grayscale, sepia }
        }
        "flip" | "flop" | "sharpen" | "normalize" => {
            if !flag(name, params)? {
                return Ok(None);
            }
            match name {
                "flip" => Operation::Flip,
                "flop" => Operation::Flop,
                "sharpen" => Operation::Sharpen,
                _ => Operation::Normalize,
            }
        }
        "watermark" => {
            let obj = object(name, params)?;
            let text = match obj.get("text") {
                Some(Value::String(text)) if !text.trim().is_empty() => text.clone(),
                _ => return Err("watermark.text must be a non-empty string".to_string()),
            };
            let position = match obj.get("position") {
                None | Some(Value::Null) => Gravity::default(),
                Some(Value::String(pos)) => Gravity::parse(pos)
                    .ok_or_else(|| format!("watermark.position '{}' is not a gravity", pos))?,
                Some(_) => return Err("watermark.position must be a string".to_string()),
            };
            Operation::Watermark { text, position }
        }
        "compress" => {
            let quality = match params {
                Value::Bool(true) => u32::from(DEFAULT_COMPRESS_QUALITY),
                Value::Bool(false) => return Ok(None),
                _ => {
                    let obj = object(name, params)?;
                    match obj.get("quality") {
                        None | Some(Value::Null) => u32::from(DEFAULT_COMPRESS_QUALITY),
                        Some(v) => as_u32(v).ok_or_else(|| {
                            "compress.quality must be an integer between 1 and 100".to_string()
                        })?,
                    }
                }
            };
            if !(1..=100).contains(&quality) {
                return Err(format!(
                    "compress.quality must be between 1 and 100, got {}",
                    quality
                ));
            }
            Operation::Compress {
                quality: quality as u8,
            }
        }
        "blur" => {
            let sigma = scalar_or_field(name, params, "sigma")?
                .ok_or_else(|| "blur.sigma is required".to_string())?;
            let sigma = sigma
                .as_f64()
                .ok_or_else(|| "blur.sigma must be a number".to_string())?
                as f32;
            let (min, max) = BLUR_SIGMA_RANGE;
            if !(min..=max).contains(&sigma) {
                return Err(format!(
                    "blur.sigma must be between {} and {}, got {}",
                    min, max, sigma
                ));
            }
            Operation::Blur { sigma }
        }
        "median" => {
            let size = match scalar_or_field(name, params, "size")? {
                None => DEFAULT_MEDIAN_SIZE,
                Some(v) => as_u32(v)
                    .ok_or_else(|| "median.size must be a positive integer".to_string())?,
            };
            if size == 0 || size % 2 == 0 || size > MAX_MEDIAN_SIZE {
                return Err(format!(
                    "median.size must be an odd integer between 1 and {}, got {}",
                    MAX_MEDIAN_SIZE, size
                ));
            }
            Operation::Median { size }
        }
        "tint" => {
            let obj = object(name, params)?;
            Operation::Tint {
                r: channel(obj, "r")?,
                g: channel(obj, "g")?,
                b: channel(obj, "b")?,
            }
        }
        "threshold" => {
            let value = match scalar_or_field(name, params, "value")? {
                None => u32::from(DEFAULT_THRESHOLD),
                Some(v) => as_u32(v)
                    .ok_or_else(|| "threshold.value must be an integer".to_string())?,
            };
            if value > 255 {
                return Err(format!(
                    "threshold.value must be between 0 and 255, got {}",
                    value
                ));
            }
            Operation::Threshold { value: value as u8 }
        }
        "format" => {
            let format_name = match params {
                Value::String(s) => s.as_str(),
                Value::Object(obj) => match obj.get("name") {
                    Some(Value::String(s)) => s.as_str(),
                    _ => return Err("format.name must be a string".to_string()),
                },
                _ => return Err("format must be a string or {name}".to_string()),
            };
            let format = OutputFormat::parse(format_name)
                .ok_or_else(|| format!("format '{}' is not supported", format_name))?;
            Operation::Format { format }
        }
        _ => unreachable!("operation names are checked against CANONICAL_ORDER"),
    };
    Ok(Some(op))
}

fn object<'a>(name: &str, params: &'a Value) -> Result<&'a Map<String, Value>, String> {
    params
        .as_object()
        .ok_or_else(|| format!("{} expects an object, got {}", name, json_type(params)))
}

/// Accept both `op: <number>` and `op: {field: <number>}`; `true` means defaults.
fn scalar_or_field<'a>(
    name: &str,
    params: &'a Value,
    field: &str,
) -> Result<Option<&'a Value>, String> {
    match params {
        Value::Number(_) => Ok(Some(params)),
        Value::Bool(true) => Ok(None),
        Value::Object(obj) => Ok(obj.get(field).filter(|v| !v.is_null())),
        other => Err(format!(
            "{} expects a number or {{{}}}, got {}",
            name,
            field,
            json_type(other)
        )),
    }
}

fn flag(name: &str, params: &Value) -> Result<bool, String> {
    match params {
        Value::Bool(b) => Ok(*b),
        Value::Object(obj) if obj.is_empty() => Ok(true),
        other => Err(format!(
            "{} expects true or {{}}, got {}",
            name,
            json_type(other)
        )),
    }
}

fn required_u32(name: &str, obj: &Map<String, Value>, field: &str) -> Result<u32, String> {
    obj.get(field)
        .and_then(as_u32)
        .ok_or_else(|| format!("{}.{} must be a non-negative integer", name, field))
}

fn optional_dimension(
    name: &str,
    obj: &Map<String, Value>,
    field: &str,
) -> Result<Option<u32>, String> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => match as_u32(v) {
            Some(d) if d > 0 && d <= MAX_DIMENSION => Ok(Some(d)),
            _ => Err(format!(
                "{}.{} must be an integer between 1 and {}",
                name, field, MAX_DIMENSION
            )),
        },
    }
}

fn optional_bool(name: &str, obj: &Map<String, Value>, field: &str) -> Result<bool, String> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(false),
        Some(Value::Bool(b)) => Ok(*b),
        Some(_) => Err(format!("{}.{} must be a boolean", name, field)),
    }
}

fn channel(obj: &Map<String, Value>, field: &str) -> Result<u8, String> {
    match obj.get(field).and_then(as_u32) {
        Some(v) if v <= 255 => Ok(v as u8),
        _ => Err(format!("tint.{} must be an integer between 0 and 255", field)),
    }
}

/// Integers, including integral floats such as `100.0`.
fn as_i64(value: &Value) -> Option<i64> {
    if let Some(i) = value.as_i64() {
        return Some(i);
    }
    value
        .as_f64()
        .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
        .map(|f| f as i64)
}

fn as_u32(value: &Value) -> Option<u32> {
    as_i64(value).and_then(|i| u32::try_from(i).ok())
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// =============================================================================
// Tests
// =============================================================================
