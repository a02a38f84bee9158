//! Typed values carried as command parameters and results.
//!
//! Every [`Value`] variant corresponds to exactly one tag of the binary
//! typed-value format, so a decoded value compares equal to the value that was
//! encoded. Conversions from native Rust values pick the wire type
//! automatically:
//!
//! | Native                    | Value                                        |
//! |---------------------------|----------------------------------------------|
//! | integers                  | smallest of `I32`, `U32`, `I64`, `U64` that fits |
//! | `f32` / `f64`             | `F64`                                        |
//! | `bool`                    | `Bool`                                       |
//! | `&str` / `String`         | `String`                                     |
//! | `Vec<T>`                  | `Array`                                      |
//! | `()` / `None`             | `Null`                                       |
//! | [`Value::bytes`]          | `Binary` (`application/octet-stream`)        |

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

/// String-keyed map of values. Iteration order is key order.
pub type ValueMap = BTreeMap<String, Value>;

/// Largest integer magnitude an IEEE-754 double represents exactly (2^53).
pub const MAX_SAFE_INTEGER: u64 = 1 << 53;

/// A self-describing typed value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    /// Absent value; JSON has no counterpart and renders it as `null`.
    Void,
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    String(String),
    Array(Vec<Value>),
    Map(ValueMap),
    Binary(Binary),
    Canvas(Canvas),
}

/// Opaque binary blob tagged with a MIME type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binary {
    pub mime: String,
    pub data: Vec<u8>,
}

impl Binary {
    pub fn new(mime: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            mime: mime.into(),
            data,
        }
    }
}

/// Pixel layout of a [`Canvas`]. Drives the per-pixel byte stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Sint8,
    Sint32,
    Float32,
    Float32x2,
    Float32x3,
    Float32x4,
    Rgb,
    Rgba,
    Rgbe,
    Rgbea,
    Rgb16,
    Rgba16,
    RgbFp,
    Color,
}

impl PixelFormat {
    pub const ALL: [PixelFormat; 14] = [
        PixelFormat::Sint8,
        PixelFormat::Sint32,
        PixelFormat::Float32,
        PixelFormat::Float32x2,
        PixelFormat::Float32x3,
        PixelFormat::Float32x4,
        PixelFormat::Rgb,
        PixelFormat::Rgba,
        PixelFormat::Rgbe,
        PixelFormat::Rgbea,
        PixelFormat::Rgb16,
        PixelFormat::Rgba16,
        PixelFormat::RgbFp,
        PixelFormat::Color,
    ];

    /// Bytes per pixel.
    pub fn stride(self) -> usize {
        match self {
            PixelFormat::Sint8 => 1,
            PixelFormat::Sint32 => 4,
            PixelFormat::Float32 => 4,
            PixelFormat::Float32x2 => 8,
            PixelFormat::Float32x3 => 12,
            PixelFormat::Float32x4 => 16,
            PixelFormat::Rgb => 3,
            PixelFormat::Rgba => 4,
            PixelFormat::Rgbe => 4,
            PixelFormat::Rgbea => 5,
            PixelFormat::Rgb16 => 6,
            PixelFormat::Rgba16 => 8,
            PixelFormat::RgbFp => 12,
            PixelFormat::Color => 16,
        }
    }

    /// Name used on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            PixelFormat::Sint8 => "Sint8",
            PixelFormat::Sint32 => "Sint32",
            PixelFormat::Float32 => "Float32",
            PixelFormat::Float32x2 => "Float32<2>",
            PixelFormat::Float32x3 => "Float32<3>",
            PixelFormat::Float32x4 => "Float32<4>",
            PixelFormat::Rgb => "Rgb",
            PixelFormat::Rgba => "Rgba",
            PixelFormat::Rgbe => "Rgbe",
            PixelFormat::Rgbea => "Rgbea",
            PixelFormat::Rgb16 => "Rgb_16",
            PixelFormat::Rgba16 => "Rgba_16",
            PixelFormat::RgbFp => "Rgb_fp",
            PixelFormat::Color => "Color",
        }
    }
}

impl FromStr for PixelFormat {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PixelFormat::ALL
            .iter()
            .copied()
            .find(|format| format.as_str() == s)
            .ok_or_else(|| ValueError::UnknownPixelFormat(s.to_string()))
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Multi-layer pixel buffer. Every layer holds `width * height * stride` bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Canvas {
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
    layers: Vec<Vec<u8>>,
}

impl Canvas {
    pub fn new(
        width: u32,
        height: u32,
        pixel_format: PixelFormat,
        layers: Vec<Vec<u8>>,
    ) -> Result<Self, ValueError> {
        let expected = Self::layer_len(width, height, pixel_format)?;
        if let Some(bad) = layers.iter().find(|layer| layer.len() != expected) {
            return Err(ValueError::CanvasLayerSize {
                expected,
                actual: bad.len(),
            });
        }
        Ok(Self {
            width,
            height,
            pixel_format,
            layers,
        })
    }

    /// Byte length of one layer for the given geometry.
    pub fn layer_len(
        width: u32,
        height: u32,
        pixel_format: PixelFormat,
    ) -> Result<usize, ValueError> {
        (width as usize)
            .checked_mul(height as usize)
            .and_then(|pixels| pixels.checked_mul(pixel_format.stride()))
            .ok_or(ValueError::CanvasTooLarge {
                width,
                height,
                pixel_format,
            })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    pub fn layers(&self) -> &[Vec<u8>] {
        &self.layers
    }
}

/// Errors raised while building or converting values.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValueError {
    #[error("{0} values cannot be represented as JSON")]
    NotJsonEncodable(&'static str),
    #[error("non-finite float {0} cannot be represented as JSON")]
    NonFiniteFloat(f64),
    #[error("canvas layer holds {actual} bytes, expected {expected}")]
    CanvasLayerSize { expected: usize, actual: usize },
    #[error("{width}x{height} {pixel_format} canvas does not fit in memory")]
    CanvasTooLarge {
        width: u32,
        height: u32,
        pixel_format: PixelFormat,
    },
    #[error("unknown pixel format {0:?}")]
    UnknownPixelFormat(String),
}

impl Value {
    /// Integral value in the smallest signed/unsigned 32- or 64-bit type.
    pub fn from_i64(n: i64) -> Self {
        if n >= 0 {
            return Self::from_u64(n as u64);
        }
        match i32::try_from(n) {
            Ok(small) => Value::I32(small),
            Err(_) => Value::I64(n),
        }
    }

    /// Non-negative integral value; prefers `I32`, then `U32`, `I64`, `U64`.
    pub fn from_u64(n: u64) -> Self {
        if let Ok(small) = i32::try_from(n) {
            Value::I32(small)
        } else if let Ok(word) = u32::try_from(n) {
            Value::U32(word)
        } else if let Ok(wide) = i64::try_from(n) {
            Value::I64(wide)
        } else {
            Value::U64(n)
        }
    }

    /// Raw bytes as an `application/octet-stream` blob.
    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        Value::Binary(Binary::new("application/octet-stream", data.into()))
    }

    /// Empty map value.
    pub fn map() -> Self {
        Value::Map(ValueMap::new())
    }

    /// Builder-style insert; no-op unless `self` is a map.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        if let Value::Map(ref mut map) = self {
            map.insert(key.into(), value.into());
        }
        self
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null | Value::Void)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Any integer variant that fits in `i64`.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Value::I8(n) => Some(n.into()),
            Value::U8(n) => Some(n.into()),
            Value::I16(n) => Some(n.into()),
            Value::U16(n) => Some(n.into()),
            Value::I32(n) => Some(n.into()),
            Value::U32(n) => Some(n.into()),
            Value::I64(n) => Some(n),
            Value::U64(n) => i64::try_from(n).ok(),
            _ => None,
        }
    }

    /// Any integer variant that fits in `u64`.
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Value::U64(n) => Some(n),
            _ => self.as_i64().and_then(|n| u64::try_from(n).ok()),
        }
    }

    /// Any numeric variant, widened to `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::F32(n) => Some(n.into()),
            Value::F64(n) => Some(n),
            Value::U64(n) => Some(n as f64),
            _ => self.as_i64().map(|n| n as f64),
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&ValueMap> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    /// Map lookup; `None` for missing keys and non-map values.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|map| map.get(key))
    }

    /// Variant name, used in diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Void => "void",
            Value::Bool(_) => "bool",
            Value::I8(_) => "i8",
            Value::U8(_) => "u8",
            Value::I16(_) => "i16",
            Value::U16(_) => "u16",
            Value::I32(_) => "i32",
            Value::U32(_) => "u32",
            Value::I64(_) => "i64",
            Value::U64(_) => "u64",
            Value::F32(_) => "f32",
            Value::F64(_) => "f64",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::Binary(_) => "binary",
            Value::Canvas(_) => "canvas",
        }
    }

    /// JSON rendition for the HTTP transport.
    pub fn to_json(&self) -> Result<serde_json::Value, ValueError> {
        use serde_json::Value as Json;
        Ok(match self {
            Value::Null | Value::Void => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::I8(_) | Value::I16(_) | Value::I32(_) | Value::I64(_) => {
                Json::from(self.as_i64().unwrap_or_default())
            }
            Value::U8(_) | Value::U16(_) | Value::U32(_) | Value::U64(_) => {
                Json::from(self.as_u64().unwrap_or_default())
            }
            Value::F32(n) => float_to_json(f64::from(*n))?,
            Value::F64(n) => float_to_json(*n)?,
            Value::String(s) => Json::String(s.clone()),
            Value::Array(items) => Json::Array(
                items
                    .iter()
                    .map(Value::to_json)
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            Value::Map(map) => {
                let mut object = serde_json::Map::with_capacity(map.len());
                for (key, value) in map {
                    object.insert(key.clone(), value.to_json()?);
                }
                Json::Object(object)
            }
            Value::Binary(_) => return Err(ValueError::NotJsonEncodable("binary")),
            Value::Canvas(_) => return Err(ValueError::NotJsonEncodable("canvas")),
        })
    }
}

fn float_to_json(n: f64) -> Result<serde_json::Value, ValueError> {
    serde_json::Number::from_f64(n)
        .map(serde_json::Value::Number)
        .ok_or(ValueError::NonFiniteFloat(n))
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        use serde_json::Value as Json;
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::from_i64(i)
                } else if let Some(u) = n.as_u64() {
                    Value::from_u64(u)
                } else {
                    Value::F64(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Json::String(s) => Value::String(s),
            Json::Array(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            Json::Object(object) => Value::Map(
                object
                    .into_iter()
                    .map(|(key, value)| (key, Value::from(value)))
                    .collect(),
            ),
        }
    }
}

macro_rules! signed_from {
    ($($t:ty),*) => {$(
        impl From<$t> for Value {
            fn from(n: $t) -> Self {
                Value::from_i64(n as i64)
            }
        }
    )*};
}

macro_rules! unsigned_from {
    ($($t:ty),*) => {$(
        impl From<$t> for Value {
            fn from(n: $t) -> Self {
                Value::from_u64(n as u64)
            }
        }
    )*};
}

signed_from!(i8, i16, i32, i64, isize);
unsigned_from!(u8, u16, u32, u64, usize);

impl From<f32> for Value {
    fn from(n: f32) -> Self {
        Value::F64(f64::from(n))
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::F64(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Null
    }
}

impl From<Binary> for Value {
    fn from(binary: Binary) -> Self {
        Value::Binary(binary)
    }
}

impl From<Canvas> for Value {
    fn from(canvas: Canvas) -> Self {
        Value::Canvas(canvas)
    }
}

impl From<ValueMap> for Value {
    fn from(map: ValueMap) -> Self {
        Value::Map(map)
    }
}

impl<T: Into<Value>> From<HashMap<String, T>> for Value {
    fn from(map: HashMap<String, T>) -> Self {
        Value::Map(map.into_iter().map(|(k, v)| (k, v.into())).collect())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::Array(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map_or(Value::Null, Into::into)
    }
}
