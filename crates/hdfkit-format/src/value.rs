//! Decoded element values and their conversion to and from raw bytes.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::datatype::{decode_int, Datatype, Endian, StringPadding, StringSize};
use crate::error::FormatError;
use crate::global_heap::VlenDescriptor;

/// One decoded element of a dataset or attribute.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    /// Opaque bytes.
    Bytes(Vec<u8>),
    /// Fields in declaration order.
    Compound(Vec<(String, Value)>),
    Array(Vec<Value>),
    /// Enumeration value with its member name, when one matches.
    Enum { name: Option<String>, value: i64 },
    /// Object reference (header address).
    Reference(u64),
    /// Seconds since the epoch.
    Time(i64),
    /// Variable-length sequence.
    VarLen(Vec<Value>),
}

impl Value {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) | Value::Time(v) => Some(*v as f64),
            Value::UInt(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::Enum { value, .. } => Some(*value as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) | Value::Time(v) => Some(*v),
            Value::UInt(v) => i64::try_from(*v).ok(),
            Value::Enum { value, .. } => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Value::Int(_) => "signed integer",
            Value::UInt(_) => "unsigned integer",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Compound(_) => "compound",
            Value::Array(_) => "array",
            Value::Enum { .. } => "enum",
            Value::Reference(_) => "reference",
            Value::Time(_) => "time",
            Value::VarLen(_) => "variable-length sequence",
        }
    }
}

/// Source of global heap objects for variable-length elements.
pub trait HeapReader {
    fn read_object(&self, collection: u64, index: u32) -> Result<Vec<u8>, FormatError>;
}

/// Sink that stores variable-length payloads and returns their heap location.
pub trait HeapWriter {
    fn write_object(&mut self, data: &[u8]) -> (u64, u32);
}

/// A heap reader for types that never touch the global heap.
pub struct NoHeap;

impl HeapReader for NoHeap {
    fn read_object(&self, collection: u64, index: u32) -> Result<Vec<u8>, FormatError> {
        Err(FormatError::GlobalHeapObjectNotFound { collection, index })
    }
}

/// Decode every element in `bytes`, which must be a whole number of elements.
pub fn decode_all(
    bytes: &[u8],
    dt: &Datatype,
    heap: &dyn HeapReader,
) -> Result<Vec<Value>, FormatError> {
    let size = dt.size() as usize;
    if size == 0 {
        return Err(FormatError::InvalidDatatype("zero-sized element".into()));
    }
    if bytes.len() % size != 0 {
        return Err(FormatError::ChunkSizeMismatch {
            expected: bytes.len() / size * size,
            actual: bytes.len(),
        });
    }
    bytes
        .chunks_exact(size)
        .map(|b| decode(b, dt, heap))
        .collect()
}

/// Decode a single element. `bytes` must be exactly `dt.size()` long.
pub fn decode(bytes: &[u8], dt: &Datatype, heap: &dyn HeapReader) -> Result<Value, FormatError> {
    match dt {
        Datatype::Integer {
            size,
            signed,
            order,
        } => {
            if *size > 8 {
                return Err(FormatError::InvalidDatatype(format!("{size}-byte integer")));
            }
            let v = decode_int(bytes, *signed, *order);
            Ok(if *signed {
                Value::Int(v)
            } else {
                Value::UInt(v as u64)
            })
        }
        Datatype::Float { size, order } => Ok(Value::Float(decode_float(bytes, *size, *order))),
        Datatype::Time { order, .. } => Ok(Value::Time(decode_int(bytes, true, *order))),
        Datatype::Bitfield { order, .. } => {
            Ok(Value::UInt(decode_int(bytes, false, *order) as u64))
        }
        Datatype::Opaque { .. } => Ok(Value::Bytes(bytes.to_vec())),
        Datatype::Reference { .. } => Ok(Value::Reference(decode_int(bytes, false, Endian::Little) as u64)),
        Datatype::String {
            size: StringSize::Fixed(_),
            padding,
            ..
        } => Ok(Value::String(trim_fixed(bytes, *padding))),
        Datatype::String {
            size: StringSize::Variable { offset_size },
            ..
        } => {
            let desc = VlenDescriptor::parse(bytes, *offset_size)?;
            let raw = read_vlen(&desc, heap)?;
            let raw = &raw[..raw.len().min(desc.length as usize)];
            let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
            Ok(Value::String(String::from_utf8_lossy(&raw[..end]).into_owned()))
        }
        Datatype::VarLen { base, offset_size } => {
            let desc = VlenDescriptor::parse(bytes, *offset_size)?;
            let raw = read_vlen(&desc, heap)?;
            let base_size = base.size() as usize;
            let needed = desc.length as usize * base_size;
            if raw.len() < needed {
                return Err(FormatError::UnexpectedEof {
                    expected: needed,
                    available: raw.len(),
                });
            }
            let items = decode_all(&raw[..needed], base, heap)?;
            Ok(Value::VarLen(items))
        }
        Datatype::Enum { base, members } => {
            let (signed, order) = match base.as_ref() {
                Datatype::Integer { signed, order, .. } => (*signed, *order),
                _ => (false, Endian::Little),
            };
            let value = decode_int(bytes, signed, order);
            let name = members
                .iter()
                .find(|m| m.value == value)
                .map(|m| m.name.clone());
            Ok(Value::Enum { name, value })
        }
        Datatype::Compound { fields, .. } => {
            let mut out = Vec::with_capacity(fields.len());
            for f in fields {
                let start = f.offset as usize;
                let end = start + f.datatype.size() as usize;
                let slice = bytes.get(start..end).ok_or(FormatError::UnexpectedEof {
                    expected: end,
                    available: bytes.len(),
                })?;
                out.push((f.name.clone(), decode(slice, &f.datatype, heap)?));
            }
            Ok(Value::Compound(out))
        }
        Datatype::Array { base, .. } => Ok(Value::Array(decode_all(bytes, base, heap)?)),
    }
}

fn read_vlen(desc: &VlenDescriptor, heap: &dyn HeapReader) -> Result<Vec<u8>, FormatError> {
    if desc.length == 0 {
        return Ok(Vec::new());
    }
    heap.read_object(desc.collection, desc.index)
}

fn trim_fixed(bytes: &[u8], padding: StringPadding) -> String {
    let end = match padding {
        StringPadding::NullTerminate | StringPadding::NullPad => {
            bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len())
        }
        StringPadding::SpacePad => bytes
            .iter()
            .rposition(|&b| b != b' ' && b != 0)
            .map_or(0, |p| p + 1),
    };
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn decode_float(bytes: &[u8], size: u32, order: Endian) -> f64 {
    match (size, order) {
        (2, Endian::Little) => f16_to_f64(LittleEndian::read_u16(bytes)),
        (2, Endian::Big) => f16_to_f64(BigEndian::read_u16(bytes)),
        (4, Endian::Little) => LittleEndian::read_f32(bytes) as f64,
        (4, Endian::Big) => BigEndian::read_f32(bytes) as f64,
        (_, Endian::Little) => LittleEndian::read_f64(bytes),
        (_, Endian::Big) => BigEndian::read_f64(bytes),
    }
}

/// Convert an IEEE 754 half-precision bit pattern to `f64`.
pub fn f16_to_f64(bits: u16) -> f64 {
    let sign = if bits & 0x8000 != 0 { -1.0 } else { 1.0 };
    let exp = ((bits >> 10) & 0x1F) as i32;
    let mant = (bits & 0x03FF) as f64;
    match exp {
        0 => sign * mant * 2f64.powi(-24),
        0x1F if mant == 0.0 => sign * f64::INFINITY,
        0x1F => f64::NAN,
        _ => sign * (1.0 + mant / 1024.0) * 2f64.powi(exp - 15),
    }
}

/// Convert `f64` to the nearest half-precision bit pattern.
pub fn f64_to_f16(v: f64) -> u16 {
    if v.is_nan() {
        return 0x7E00;
    }
    let sign: u16 = if v.is_sign_negative() { 0x8000 } else { 0 };
    let a = v.abs();
    if a >= 65520.0 {
        return sign | 0x7C00;
    }
    if a < 2f64.powi(-14) {
        // subnormal: units of 2^-24
        let m = (a / 2f64.powi(-24)).round() as u16;
        return sign | m;
    }
    let mut exp = a.log2().floor() as i32;
    let mut mant = ((a / 2f64.powi(exp) - 1.0) * 1024.0).round() as u32;
    if mant == 1024 {
        mant = 0;
        exp += 1;
    }
    sign | (((exp + 15) as u16) << 10) | mant as u16
}

/// Encode `values` as consecutive elements of `dt`.
pub fn encode_all(
    values: &[Value],
    dt: &Datatype,
    heap: &mut dyn HeapWriter,
) -> Result<Vec<u8>, FormatError> {
    let mut out = Vec::with_capacity(values.len() * dt.size() as usize);
    for v in values {
        encode(v, dt, heap, &mut out)?;
    }
    Ok(out)
}

fn mismatch(dt: &Datatype, v: &Value) -> FormatError {
    FormatError::ValueMismatch {
        expected: dt.describe(),
        found: v.kind().to_string(),
    }
}

/// Append the encoding of one element, checking that `v` fits `dt`.
pub fn encode(
    v: &Value,
    dt: &Datatype,
    heap: &mut dyn HeapWriter,
    out: &mut Vec<u8>,
) -> Result<(), FormatError> {
    match dt {
        Datatype::Integer {
            size,
            signed,
            order,
        } => {
            let raw = match (v, signed) {
                (Value::Int(i), true) => fits_signed(*i, *size).then_some(*i as u64),
                (Value::Int(i), false) => (*i >= 0 && fits_unsigned(*i as u64, *size))
                    .then_some(*i as u64),
                (Value::UInt(u), true) => {
                    (i64::try_from(*u).is_ok_and(|i| fits_signed(i, *size))).then_some(*u)
                }
                (Value::UInt(u), false) => fits_unsigned(*u, *size).then_some(*u),
                _ => return Err(mismatch(dt, v)),
            }
            .ok_or_else(|| mismatch(dt, v))?;
            put_int(out, raw, *size, *order, *signed);
        }
        Datatype::Float { size, order } => {
            let f = match v {
                Value::Float(f) => *f,
                Value::Int(i) => *i as f64,
                Value::UInt(u) => *u as f64,
                _ => return Err(mismatch(dt, v)),
            };
            let mut b = [0u8; 8];
            match (size, order) {
                (2, Endian::Little) => LittleEndian::write_u16(&mut b, f64_to_f16(f)),
                (2, Endian::Big) => BigEndian::write_u16(&mut b, f64_to_f16(f)),
                (4, Endian::Little) => LittleEndian::write_f32(&mut b, f as f32),
                (4, Endian::Big) => BigEndian::write_f32(&mut b, f as f32),
                (_, Endian::Little) => LittleEndian::write_f64(&mut b, f),
                (_, Endian::Big) => BigEndian::write_f64(&mut b, f),
            }
            out.extend_from_slice(&b[..*size as usize]);
        }
        Datatype::Time { size, order } => match v {
            Value::Time(t) | Value::Int(t) => put_int(out, *t as u64, *size, *order, true),
            _ => return Err(mismatch(dt, v)),
        },
        Datatype::Bitfield { size, order } => match v {
            Value::UInt(u) => put_int(out, *u, *size, *order, false),
            _ => return Err(mismatch(dt, v)),
        },
        Datatype::Opaque { size, .. } => match v {
            Value::Bytes(b) if b.len() == *size as usize => out.extend_from_slice(b),
            _ => return Err(mismatch(dt, v)),
        },
        Datatype::Reference { size } => match v {
            Value::Reference(a) => put_int(out, *a, *size, Endian::Little, false),
            _ => return Err(mismatch(dt, v)),
        },
        Datatype::String {
            size: StringSize::Fixed(n),
            padding,
            ..
        } => {
            let s = v.as_str().ok_or_else(|| mismatch(dt, v))?;
            let n = *n as usize;
            let limit = if *padding == StringPadding::NullTerminate {
                n.saturating_sub(1)
            } else {
                n
            };
            if s.len() > limit {
                return Err(FormatError::ValueMismatch {
                    expected: dt.describe(),
                    found: format!("string of {} bytes", s.len()),
                });
            }
            let fill = if *padding == StringPadding::SpacePad { b' ' } else { 0 };
            let start = out.len();
            out.extend_from_slice(s.as_bytes());
            out.resize(start + n, fill);
        }
        Datatype::String {
            size: StringSize::Variable { offset_size },
            ..
        } => {
            let s = v.as_str().ok_or_else(|| mismatch(dt, v))?;
            put_vlen(out, s.len() as u32, s.as_bytes(), heap, *offset_size)?;
        }
        Datatype::VarLen { base, offset_size } => match v {
            Value::VarLen(items) => {
                let payload = encode_all(items, base, heap)?;
                put_vlen(out, items.len() as u32, &payload, heap, *offset_size)?;
            }
            _ => return Err(mismatch(dt, v)),
        },
        Datatype::Enum { base, members } => {
            let value = match v {
                Value::Enum {
                    name: Some(name), ..
                } => members
                    .iter()
                    .find(|m| &m.name == name)
                    .map(|m| m.value)
                    .ok_or_else(|| mismatch(dt, v))?,
                Value::Enum { value, .. } | Value::Int(value) => *value,
                Value::UInt(u) => *u as i64,
                _ => return Err(mismatch(dt, v)),
            };
            if !members.iter().any(|m| m.value == value) {
                return Err(FormatError::ValueMismatch {
                    expected: dt.describe(),
                    found: format!("enum value {value}"),
                });
            }
            let (signed, order) = match base.as_ref() {
                Datatype::Integer { signed, order, .. } => (*signed, *order),
                _ => (false, Endian::Little),
            };
            put_int(out, value as u64, base.size(), order, signed);
        }
        Datatype::Compound { size, fields } => {
            let Value::Compound(given) = v else {
                return Err(mismatch(dt, v));
            };
            let start = out.len();
            out.resize(start + *size as usize, 0);
            for f in fields {
                let fv = given
                    .iter()
                    .find(|(n, _)| n == &f.name)
                    .map(|(_, fv)| fv)
                    .ok_or_else(|| FormatError::ValueMismatch {
                        expected: dt.describe(),
                        found: format!("compound without field {:?}", f.name),
                    })?;
                let mut field_bytes = Vec::with_capacity(f.datatype.size() as usize);
                encode(fv, &f.datatype, heap, &mut field_bytes)?;
                let at = start + f.offset as usize;
                out[at..at + field_bytes.len()].copy_from_slice(&field_bytes);
            }
        }
        Datatype::Array { base, dims } => {
            let Value::Array(items) = v else {
                return Err(mismatch(dt, v));
            };
            let count = dims.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d as usize));
            if count != Some(items.len()) {
                return Err(FormatError::ValueMismatch {
                    expected: dt.describe(),
                    found: format!("array of {} elements", items.len()),
                });
            }
            for item in items {
                encode(item, base, heap, out)?;
            }
        }
    }
    Ok(())
}

fn fits_signed(v: i64, size: u32) -> bool {
    if size >= 8 {
        return true;
    }
    let bits = size * 8;
    let min = -(1i64 << (bits - 1));
    let max = (1i64 << (bits - 1)) - 1;
    (min..=max).contains(&v)
}

fn fits_unsigned(v: u64, size: u32) -> bool {
    size >= 8 || v < (1u64 << (size * 8))
}

/// Append the low `size` bytes of `raw`. Integers wider than 8 bytes are
/// extended on their high-order side, with sign bits when `signed`.
fn put_int(out: &mut Vec<u8>, raw: u64, size: u32, order: Endian, signed: bool) {
    let le = raw.to_le_bytes();
    let n = (size as usize).min(8);
    let extend = size as usize - n;
    let fill = if signed && (raw as i64) < 0 { 0xFF } else { 0 };
    match order {
        Endian::Little => {
            out.extend_from_slice(&le[..n]);
            out.resize(out.len() + extend, fill);
        }
        Endian::Big => {
            out.resize(out.len() + extend, fill);
            out.extend(le[..n].iter().rev());
        }
    }
}

fn put_vlen(
    out: &mut Vec<u8>,
    length: u32,
    payload: &[u8],
    heap: &mut dyn HeapWriter,
    offset_size: u8,
) -> Result<(), FormatError> {
    let (collection, index) = if payload.is_empty() {
        (0, 0)
    } else {
        heap.write_object(payload)
    };
    VlenDescriptor {
        length,
        collection,
        index,
    }
    .write(out, offset_size)
}
