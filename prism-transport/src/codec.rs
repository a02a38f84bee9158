//! Typed-value codec for the binary WebSocket transport.
//!
//! Wire format (tag-length-value, byte order negotiated at handshake):
//! ```text
//! ┌──────┬───────────────────────────────────────────────────────────┐
//! │ tag  │ payload                                                   │
//! │ 1 B  │ variable                                                  │
//! └──────┴───────────────────────────────────────────────────────────┘
//!
//! 0x00 null   0x01 void   0x02 true   0x03 false   0x04 bool(u8)
//! 0x05 i8     0x06 u8     0x07 i16    0x08 u16     0x09 i32    0x0A u32
//! 0x0B i64    0x0C u64    0x0D f32    0x0E f64
//! 0x0F string       u32 len, utf-8 bytes
//! 0x10 array        u32 n, n tagged values
//! 0x11 typed array  elem tag, u32 n, n untagged numbers
//! 0x12 map          u32 n, n × (u32 len + utf-8 key, tagged value)
//! 0x13 binary       u32 len + mime, u32 len, bytes
//! 0x14 canvas       u32 w, u32 h, u32 len + pixel format, u32 layers,
//!                   layers × (w·h·stride) bytes
//! ```
//!
//! 64-bit integers travel as two 32-bit halves (low half first in little
//! endian, high half first in big endian) and are recombined as
//! `low + high·2^32` in integer arithmetic, so the full range survives.
//! Values beyond ±2^53 still decode exactly but are reported as
//! [`PrecisionWarning`]s, since peers working in doubles cannot hold them.

use log::warn;
use prism_core::{Binary, Canvas, PixelFormat, Value, ValueError, ValueMap, MAX_SAFE_INTEGER};

/// Byte order negotiated during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

/// Wire type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TypeTag {
    Null = 0x00,
    Void = 0x01,
    True = 0x02,
    False = 0x03,
    Bool = 0x04,
    I8 = 0x05,
    U8 = 0x06,
    I16 = 0x07,
    U16 = 0x08,
    I32 = 0x09,
    U32 = 0x0A,
    I64 = 0x0B,
    U64 = 0x0C,
    F32 = 0x0D,
    F64 = 0x0E,
    String = 0x0F,
    Array = 0x10,
    TypedArray = 0x11,
    Map = 0x12,
    Binary = 0x13,
    Canvas = 0x14,
}

impl TypeTag {
    pub fn from_u8(byte: u8) -> Option<Self> {
        Some(match byte {
            0x00 => TypeTag::Null,
            0x01 => TypeTag::Void,
            0x02 => TypeTag::True,
            0x03 => TypeTag::False,
            0x04 => TypeTag::Bool,
            0x05 => TypeTag::I8,
            0x06 => TypeTag::U8,
            0x07 => TypeTag::I16,
            0x08 => TypeTag::U16,
            0x09 => TypeTag::I32,
            0x0A => TypeTag::U32,
            0x0B => TypeTag::I64,
            0x0C => TypeTag::U64,
            0x0D => TypeTag::F32,
            0x0E => TypeTag::F64,
            0x0F => TypeTag::String,
            0x10 => TypeTag::Array,
            0x11 => TypeTag::TypedArray,
            0x12 => TypeTag::Map,
            0x13 => TypeTag::Binary,
            0x14 => TypeTag::Canvas,
            _ => return None,
        })
    }

    /// Tags that may appear as typed-array elements.
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            TypeTag::I8
                | TypeTag::U8
                | TypeTag::I16
                | TypeTag::U16
                | TypeTag::I32
                | TypeTag::U32
                | TypeTag::I64
                | TypeTag::U64
                | TypeTag::F32
                | TypeTag::F64
        )
    }

    /// Tag used for `value` when no explicit type is requested.
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => TypeTag::Null,
            Value::Void => TypeTag::Void,
            Value::Bool(true) => TypeTag::True,
            Value::Bool(false) => TypeTag::False,
            Value::I8(_) => TypeTag::I8,
            Value::U8(_) => TypeTag::U8,
            Value::I16(_) => TypeTag::I16,
            Value::U16(_) => TypeTag::U16,
            Value::I32(_) => TypeTag::I32,
            Value::U32(_) => TypeTag::U32,
            Value::I64(_) => TypeTag::I64,
            Value::U64(_) => TypeTag::U64,
            Value::F32(_) => TypeTag::F32,
            Value::F64(_) => TypeTag::F64,
            Value::String(_) => TypeTag::String,
            Value::Array(items) if homogeneous_numeric(items).is_some() => TypeTag::TypedArray,
            Value::Array(_) => TypeTag::Array,
            Value::Map(_) => TypeTag::Map,
            Value::Binary(_) => TypeTag::Binary,
            Value::Canvas(_) => TypeTag::Canvas,
        }
    }
}

/// Element tag when every item is the same numeric variant.
fn homogeneous_numeric(items: &[Value]) -> Option<TypeTag> {
    let first = TypeTag::of(items.first()?);
    if !first.is_numeric() {
        return None;
    }
    items
        .iter()
        .all(|item| TypeTag::of(item) == first)
        .then_some(first)
}

/// Codec errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CodecError {
    #[error("unexpected end of buffer: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof { needed: usize, remaining: usize },
    #[error("unknown type tag 0x{0:02x}")]
    UnknownTag(u8),
    #[error("type tag {0:?} cannot be used for typed array elements")]
    InvalidElementTag(TypeTag),
    #[error("invalid utf-8 in string")]
    InvalidUtf8,
    #[error("length {0} does not fit the 32-bit length field")]
    LengthOverflow(usize),
    #[error("{value} cannot be encoded as {tag:?}")]
    Coercion { value: String, tag: TypeTag },
    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),
    #[error("values nested deeper than {0} levels")]
    TooDeep(usize),
    #[error(transparent)]
    Value(#[from] ValueError),
}

/// A 64-bit integer outside the range a double represents exactly.
#[derive(Debug, Clone, PartialEq)]
pub struct PrecisionWarning {
    /// Offset of the value's payload in the decoded buffer.
    pub offset: usize,
    pub value: Value,
}

/// Appends typed values to a byte buffer.
#[derive(Debug, Clone)]
pub struct Encoder {
    buf: Vec<u8>,
    order: ByteOrder,
}

impl Encoder {
    pub fn new(order: ByteOrder) -> Self {
        Self {
            buf: Vec::new(),
            order,
        }
    }

    pub fn with_capacity(order: ByteOrder, capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            order,
        }
    }

    pub fn order(&self) -> ByteOrder {
        self.order
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    pub fn put_u8(&mut self, n: u8) {
        self.buf.push(n);
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn put_u16(&mut self, n: u16) {
        match self.order {
            ByteOrder::Little => self.put_bytes(&n.to_le_bytes()),
            ByteOrder::Big => self.put_bytes(&n.to_be_bytes()),
        }
    }

    pub fn put_u32(&mut self, n: u32) {
        match self.order {
            ByteOrder::Little => self.put_bytes(&n.to_le_bytes()),
            ByteOrder::Big => self.put_bytes(&n.to_be_bytes()),
        }
    }

    pub fn put_i32(&mut self, n: i32) {
        self.put_u32(n as u32);
    }

    /// Writes two 32-bit halves in byte order.
    pub fn put_u64(&mut self, n: u64) {
        let low = n as u32;
        let high = (n >> 32) as u32;
        match self.order {
            ByteOrder::Little => {
                self.put_u32(low);
                self.put_u32(high);
            }
            ByteOrder::Big => {
                self.put_u32(high);
                self.put_u32(low);
            }
        }
    }

    pub fn put_i64(&mut self, n: i64) {
        self.put_u64(n as u64);
    }

    pub fn put_f32(&mut self, n: f32) {
        self.put_u32(n.to_bits());
    }

    pub fn put_f64(&mut self, n: f64) {
        self.put_u64(n.to_bits());
    }

    pub fn put_len(&mut self, len: usize) -> Result<(), CodecError> {
        let len = u32::try_from(len).map_err(|_| CodecError::LengthOverflow(len))?;
        self.put_u32(len);
        Ok(())
    }

    /// Length-prefixed UTF-8, untagged.
    pub fn put_str(&mut self, s: &str) -> Result<(), CodecError> {
        self.put_len(s.len())?;
        self.put_bytes(s.as_bytes());
        Ok(())
    }

    /// Writes `value` with its derived tag.
    pub fn write_value(&mut self, value: &Value) -> Result<(), CodecError> {
        match value {
            Value::Null => self.put_u8(TypeTag::Null as u8),
            Value::Void => self.put_u8(TypeTag::Void as u8),
            Value::Bool(true) => self.put_u8(TypeTag::True as u8),
            Value::Bool(false) => self.put_u8(TypeTag::False as u8),
            Value::String(s) => {
                self.put_u8(TypeTag::String as u8);
                self.put_str(s)?;
            }
            Value::Array(items) => match homogeneous_numeric(items) {
                Some(elem) => self.write_typed_array(items, elem)?,
                None => {
                    self.put_u8(TypeTag::Array as u8);
                    self.put_len(items.len())?;
                    for item in items {
                        self.write_value(item)?;
                    }
                }
            },
            Value::Map(map) => {
                self.put_u8(TypeTag::Map as u8);
                self.put_len(map.len())?;
                for (key, item) in map {
                    self.put_str(key)?;
                    self.write_value(item)?;
                }
            }
            Value::Binary(binary) => {
                self.put_u8(TypeTag::Binary as u8);
                self.put_str(&binary.mime)?;
                self.put_len(binary.data.len())?;
                self.put_bytes(&binary.data);
            }
            Value::Canvas(canvas) => {
                self.put_u8(TypeTag::Canvas as u8);
                self.put_u32(canvas.width());
                self.put_u32(canvas.height());
                self.put_str(canvas.pixel_format().as_str())?;
                self.put_len(canvas.layers().len())?;
                for layer in canvas.layers() {
                    self.put_bytes(layer);
                }
            }
            numeric => {
                let tag = TypeTag::of(numeric);
                self.put_u8(tag as u8);
                self.put_number(numeric, tag)?;
            }
        }
        Ok(())
    }

    /// Writes `value` coerced to an explicit tag.
    ///
    /// Numbers are range-checked; `Null`/`Void` accept any value.
    pub fn write_as(&mut self, value: &Value, tag: TypeTag) -> Result<(), CodecError> {
        match tag {
            TypeTag::Null | TypeTag::Void => self.put_u8(tag as u8),
            TypeTag::True | TypeTag::False | TypeTag::Bool => {
                let b = value.as_bool().ok_or_else(|| coercion(value, tag))?;
                if tag == TypeTag::Bool {
                    self.put_u8(tag as u8);
                    self.put_u8(u8::from(b));
                } else {
                    let singleton = if b { TypeTag::True } else { TypeTag::False };
                    self.put_u8(singleton as u8);
                }
            }
            TypeTag::TypedArray => {
                let items = value.as_array().ok_or_else(|| coercion(value, tag))?;
                let elem = items.first().map_or(TypeTag::F64, TypeTag::of);
                self.write_typed_array(items, elem)?;
            }
            _ if tag.is_numeric() => {
                self.put_u8(tag as u8);
                self.put_number(value, tag)?;
            }
            _ if TypeTag::of(value) == tag
                || (tag == TypeTag::Array && matches!(value, Value::Array(_))) =>
            {
                if let Value::Array(items) = value {
                    self.put_u8(TypeTag::Array as u8);
                    self.put_len(items.len())?;
                    for item in items {
                        self.write_value(item)?;
                    }
                } else {
                    self.write_value(value)?;
                }
            }
            _ => return Err(coercion(value, tag)),
        }
        Ok(())
    }

    /// Homogeneous numeric array; every item is coerced to `elem`.
    pub fn write_typed_array(&mut self, items: &[Value], elem: TypeTag) -> Result<(), CodecError> {
        if !elem.is_numeric() {
            return Err(CodecError::InvalidElementTag(elem));
        }
        self.put_u8(TypeTag::TypedArray as u8);
        self.put_u8(elem as u8);
        self.put_len(items.len())?;
        for item in items {
            self.put_number(item, elem)?;
        }
        Ok(())
    }

    fn put_number(&mut self, value: &Value, tag: TypeTag) -> Result<(), CodecError> {
        match tag {
            TypeTag::I8 => self.put_u8(int_as::<i8>(value, tag)? as u8),
            TypeTag::U8 => self.put_u8(int_as::<u8>(value, tag)?),
            TypeTag::I16 => self.put_u16(int_as::<i16>(value, tag)? as u16),
            TypeTag::U16 => self.put_u16(int_as::<u16>(value, tag)?),
            TypeTag::I32 => self.put_i32(int_as::<i32>(value, tag)?),
            TypeTag::U32 => self.put_u32(int_as::<u32>(value, tag)?),
            TypeTag::I64 => self.put_i64(int_as::<i64>(value, tag)?),
            TypeTag::U64 => self.put_u64(int_as::<u64>(value, tag)?),
            TypeTag::F32 => {
                let n = value.as_f64().ok_or_else(|| coercion(value, tag))?;
                self.put_f32(n as f32);
            }
            TypeTag::F64 => {
                let n = value.as_f64().ok_or_else(|| coercion(value, tag))?;
                self.put_f64(n);
            }
            other => return Err(CodecError::InvalidElementTag(other)),
        }
        Ok(())
    }
}

fn coercion(value: &Value, tag: TypeTag) -> CodecError {
    CodecError::Coercion {
        value: value.kind().to_string(),
        tag,
    }
}

/// Integer view of `value` in the target width. Integral floats qualify.
fn int_as<T>(value: &Value, tag: TypeTag) -> Result<T, CodecError>
where
    T: TryFrom<i64> + TryFrom<u64>,
{
    let fits = |n: Option<T>| n.ok_or_else(|| coercion(value, tag));
    if let Some(n) = value.as_i64() {
        return fits(T::try_from(n).ok());
    }
    if let Some(n) = value.as_u64() {
        return fits(T::try_from(n).ok());
    }
    match value {
        Value::F32(_) | Value::F64(_) => {
            let f = value.as_f64().unwrap_or(f64::NAN);
            if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
                fits(T::try_from(f as i64).ok())
            } else {
                Err(coercion(value, tag))
            }
        }
        _ => Err(coercion(value, tag)),
    }
}

/// Deepest array/map nesting the decoder accepts.
pub const MAX_DEPTH: usize = 128;

/// Reads typed values from a byte slice.
#[derive(Debug)]
pub struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
    order: ByteOrder,
    depth: usize,
    warnings: Vec<PrecisionWarning>,
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8], order: ByteOrder) -> Self {
        Self {
            buf,
            pos: 0,
            order,
            depth: 0,
            warnings: Vec::new(),
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Precision warnings collected so far.
    pub fn warnings(&self) -> &[PrecisionWarning] {
        &self.warnings
    }

    pub fn take_warnings(&mut self) -> Vec<PrecisionWarning> {
        std::mem::take(&mut self.warnings)
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::UnexpectedEof {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let buf: &'a [u8] = self.buf;
        let slice = &buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        let bytes = self.take_array::<2>()?;
        Ok(match self.order {
            ByteOrder::Little => u16::from_le_bytes(bytes),
            ByteOrder::Big => u16::from_be_bytes(bytes),
        })
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        let bytes = self.take_array::<4>()?;
        Ok(match self.order {
            ByteOrder::Little => u32::from_le_bytes(bytes),
            ByteOrder::Big => u32::from_be_bytes(bytes),
        })
    }

    pub fn read_i32(&mut self) -> Result<i32, CodecError> {
        Ok(self.read_u32()? as i32)
    }

    /// Reads two 32-bit halves and combines them as `low + high·2^32`.
    pub fn read_u64(&mut self) -> Result<u64, CodecError> {
        let (low, high) = match self.order {
            ByteOrder::Little => {
                let low = self.read_u32()?;
                (low, self.read_u32()?)
            }
            ByteOrder::Big => {
                let high = self.read_u32()?;
                (self.read_u32()?, high)
            }
        };
        Ok(u64::from(low) + (u64::from(high) << 32))
    }

    pub fn read_i64(&mut self) -> Result<i64, CodecError> {
        Ok(self.read_u64()? as i64)
    }

    pub fn read_f32(&mut self) -> Result<f32, CodecError> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    pub fn read_f64(&mut self) -> Result<f64, CodecError> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    fn read_len(&mut self) -> Result<usize, CodecError> {
        Ok(self.read_u32()? as usize)
    }

    /// Length-prefixed UTF-8, untagged.
    pub fn read_str(&mut self) -> Result<String, CodecError> {
        let len = self.read_len()?;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }

    /// Reads one tagged value.
    pub fn read_value(&mut self) -> Result<Value, CodecError> {
        let byte = self.read_u8()?;
        let tag = TypeTag::from_u8(byte).ok_or(CodecError::UnknownTag(byte))?;
        match tag {
            TypeTag::Null => Ok(Value::Null),
            TypeTag::Void => Ok(Value::Void),
            TypeTag::True => Ok(Value::Bool(true)),
            TypeTag::False => Ok(Value::Bool(false)),
            TypeTag::Bool => Ok(Value::Bool(self.read_u8()? != 0)),
            TypeTag::String => Ok(Value::String(self.read_str()?)),
            TypeTag::Array => {
                let n = self.read_len()?;
                let mut items = Vec::with_capacity(n.min(self.remaining()));
                for _ in 0..n {
                    items.push(self.read_nested()?);
                }
                Ok(Value::Array(items))
            }
            TypeTag::TypedArray => {
                let elem_byte = self.read_u8()?;
                let elem = TypeTag::from_u8(elem_byte).ok_or(CodecError::UnknownTag(elem_byte))?;
                if !elem.is_numeric() {
                    return Err(CodecError::InvalidElementTag(elem));
                }
                let n = self.read_len()?;
                let mut items = Vec::with_capacity(n.min(self.remaining()));
                for _ in 0..n {
                    items.push(self.read_number(elem)?);
                }
                Ok(Value::Array(items))
            }
            TypeTag::Map => {
                let n = self.read_len()?;
                let mut map = ValueMap::new();
                for _ in 0..n {
                    let key = self.read_str()?;
                    let value = self.read_nested()?;
                    map.insert(key, value);
                }
                Ok(Value::Map(map))
            }
            TypeTag::Binary => {
                let mime = self.read_str()?;
                let len = self.read_len()?;
                let data = self.take(len)?.to_vec();
                Ok(Value::Binary(Binary::new(mime, data)))
            }
            TypeTag::Canvas => {
                let width = self.read_u32()?;
                let height = self.read_u32()?;
                let format: PixelFormat = self.read_str()?.parse()?;
                let count = self.read_len()?;
                let layer_len = Canvas::layer_len(width, height, format)?;
                let needed = layer_len.saturating_mul(count);
                if needed > self.remaining() {
                    return Err(CodecError::UnexpectedEof {
                        needed,
                        remaining: self.remaining(),
                    });
                }
                let mut layers = Vec::with_capacity(count.min(self.remaining()));
                for _ in 0..count {
                    layers.push(self.take(layer_len)?.to_vec());
                }
                Ok(Value::Canvas(Canvas::new(width, height, format, layers)?))
            }
            numeric => self.read_number(numeric),
        }
    }

    fn read_nested(&mut self) -> Result<Value, CodecError> {
        if self.depth >= MAX_DEPTH {
            return Err(CodecError::TooDeep(MAX_DEPTH));
        }
        self.depth += 1;
        let value = self.read_value();
        self.depth -= 1;
        value
    }

    fn read_number(&mut self, tag: TypeTag) -> Result<Value, CodecError> {
        let offset = self.pos;
        let value = match tag {
            TypeTag::I8 => Value::I8(self.read_u8()? as i8),
            TypeTag::U8 => Value::U8(self.read_u8()?),
            TypeTag::I16 => Value::I16(self.read_u16()? as i16),
            TypeTag::U16 => Value::U16(self.read_u16()?),
            TypeTag::I32 => Value::I32(self.read_i32()?),
            TypeTag::U32 => Value::U32(self.read_u32()?),
            TypeTag::I64 => {
                let n = self.read_i64()?;
                if n.unsigned_abs() > MAX_SAFE_INTEGER {
                    self.warn_precision(offset, Value::I64(n));
                }
                Value::I64(n)
            }
            TypeTag::U64 => {
                let n = self.read_u64()?;
                if n > MAX_SAFE_INTEGER {
                    self.warn_precision(offset, Value::U64(n));
                }
                Value::U64(n)
            }
            TypeTag::F32 => Value::F32(self.read_f32()?),
            TypeTag::F64 => Value::F64(self.read_f64()?),
            other => return Err(CodecError::InvalidElementTag(other)),
        };
        Ok(value)
    }

    fn warn_precision(&mut self, offset: usize, value: Value) {
        warn!("64-bit integer {value:?} at offset {offset} exceeds 2^53; double-based peers lose precision");
        self.warnings.push(PrecisionWarning { offset, value });
    }
}

/// Encodes a single value.
pub fn encode_value(value: &Value, order: ByteOrder) -> Result<Vec<u8>, CodecError> {
    let mut encoder = Encoder::new(order);
    encoder.write_value(value)?;
    Ok(encoder.finish())
}

/// Decodes a buffer holding exactly one value.
pub fn decode_value(bytes: &[u8], order: ByteOrder) -> Result<Value, CodecError> {
    let mut decoder = Decoder::new(bytes, order);
    let value = decoder.read_value()?;
    if !decoder.is_empty() {
        return Err(CodecError::TrailingBytes(decoder.remaining()));
    }
    Ok(value)
}
