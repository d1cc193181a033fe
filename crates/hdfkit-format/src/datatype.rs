//! HDF5 Datatype message (type 0x0003): decode and encode.
//!
//! [`Datatype`] is a closed sum type with one variant per supported class.
//! Compound, enumeration, array, and variable-length types are decoded by
//! re-entering [`Datatype::parse`] on the remainder of the enclosing message,
//! so every nested call sees a strictly shorter slice and malformed input
//! cannot recurse past the message's own length.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::{Feature, FormatError};
use crate::util::{ensure_len, pad_to_8, read_cstr, read_uint};

/// Heap address width of variable-length types built by this crate.
pub const DEFAULT_VLEN_OFFSET_SIZE: u8 = 8;

/// Size in bytes of a variable-length descriptor: a 4-byte length, the heap
/// collection address and a 4-byte object index.
pub const fn vlen_descriptor_size(offset_size: u8) -> u32 {
    8 + offset_size as u32
}

/// Byte order of numeric data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringPadding {
    NullTerminate,
    NullPad,
    SpacePad,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharacterSet {
    Ascii,
    Utf8,
}

/// Storage of a string datatype.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringSize {
    /// Fixed number of bytes per element.
    Fixed(u32),
    /// Stored in the global heap; each element holds a descriptor whose
    /// heap address is `offset_size` bytes wide.
    Variable { offset_size: u8 },
}

/// A named member of a compound datatype.
#[derive(Debug, Clone, PartialEq)]
pub struct CompoundField {
    pub name: String,
    /// Byte offset within the compound element.
    pub offset: u64,
    pub datatype: Datatype,
}

/// A named value of an enumeration datatype.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumMember {
    pub name: String,
    pub value: i64,
}

/// A decoded HDF5 datatype.
#[derive(Debug, Clone, PartialEq)]
pub enum Datatype {
    /// Class 0: fixed-point integers.
    Integer { size: u32, signed: bool, order: Endian },
    /// Class 1: IEEE floating point (2, 4, or 8 bytes).
    Float { size: u32, order: Endian },
    /// Class 2: time values (seconds as an integer).
    Time { size: u32, order: Endian },
    /// Class 3 (fixed) or class 9 string flavour (variable).
    String {
        size: StringSize,
        padding: StringPadding,
        charset: CharacterSet,
    },
    /// Class 4.
    Bitfield { size: u32, order: Endian },
    /// Class 5: uninterpreted bytes with an ASCII tag.
    Opaque { size: u32, tag: String },
    /// Class 6.
    Compound { size: u32, fields: Vec<CompoundField> },
    /// Class 7: object references.
    Reference { size: u32 },
    /// Class 8: named integer values.
    Enum {
        base: Box<Datatype>,
        members: Vec<EnumMember>,
    },
    /// Class 9 sequence flavour.
    VarLen { base: Box<Datatype>, offset_size: u8 },
    /// Class 10: fixed-shape array of a base type.
    Array { base: Box<Datatype>, dims: Vec<u32> },
}

fn parse_endian(bits: u8) -> Endian {
    if bits & 0x01 == 0 {
        Endian::Little
    } else {
        Endian::Big
    }
}

fn parse_padding(val: u8) -> Result<StringPadding, FormatError> {
    match val {
        0 => Ok(StringPadding::NullTerminate),
        1 => Ok(StringPadding::NullPad),
        2 => Ok(StringPadding::SpacePad),
        _ => Err(FormatError::InvalidDatatype(format!("string padding {val}"))),
    }
}

fn parse_charset(val: u8) -> Result<CharacterSet, FormatError> {
    match val {
        0 => Ok(CharacterSet::Ascii),
        1 => Ok(CharacterSet::Utf8),
        _ => Err(FormatError::InvalidDatatype(format!("character set {val}"))),
    }
}

/// Bytes used for member offsets in a version 3 compound of the given size.
fn offset_width(compound_size: u32) -> u8 {
    match compound_size {
        0..=0xFF => 1,
        0x100..=0xFFFF => 2,
        0x1_0000..=0xFF_FFFF => 3,
        _ => 4,
    }
}

impl Datatype {
    /// Parse a datatype message.
    ///
    /// Returns the datatype and the number of bytes it occupied.
    pub fn parse(data: &[u8]) -> Result<(Datatype, usize), FormatError> {
        ensure_len(data, 0, 8)?;

        let class_id = data[0] & 0x0F;
        let version = data[0] >> 4;
        let bf = [data[1], data[2], data[3]];
        let size = LittleEndian::read_u32(&data[4..8]);
        let pos = 8;

        match class_id {
            0 => {
                ensure_len(data, pos, 4)?;
                let dt = Datatype::Integer {
                    size,
                    signed: bf[0] & 0x08 != 0,
                    order: parse_endian(bf[0]),
                };
                Ok((dt, pos + 4))
            }
            1 => {
                ensure_len(data, pos, 12)?;
                if bf[0] & 0x40 != 0 {
                    return Err(FormatError::InvalidDatatype("VAX float byte order".into()));
                }
                if !matches!(size, 2 | 4 | 8) {
                    return Err(FormatError::InvalidDatatype(format!(
                        "{size}-byte floating point"
                    )));
                }
                let dt = Datatype::Float {
                    size,
                    order: parse_endian(bf[0]),
                };
                Ok((dt, pos + 12))
            }
            2 => {
                ensure_len(data, pos, 2)?;
                let dt = Datatype::Time {
                    size,
                    order: parse_endian(bf[0]),
                };
                Ok((dt, pos + 2))
            }
            3 => {
                let dt = Datatype::String {
                    size: StringSize::Fixed(size),
                    padding: parse_padding(bf[0] & 0x0F)?,
                    charset: parse_charset(bf[0] >> 4)?,
                };
                Ok((dt, pos))
            }
            4 => {
                ensure_len(data, pos, 4)?;
                let dt = Datatype::Bitfield {
                    size,
                    order: parse_endian(bf[0]),
                };
                Ok((dt, pos + 4))
            }
            5 => {
                let tag_len = bf[0] as usize;
                ensure_len(data, pos, tag_len)?;
                let raw = &data[pos..pos + tag_len];
                let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
                let tag = String::from_utf8_lossy(&raw[..end]).into_owned();
                Ok((Datatype::Opaque { size, tag }, pos + pad_to_8(tag_len)))
            }
            6 => Self::parse_compound(data, version, u16::from_le_bytes([bf[0], bf[1]]), size),
            7 => match bf[0] & 0x0F {
                0 => Ok((Datatype::Reference { size }, pos)),
                1 => Err(FormatError::UnsupportedFeature(Feature::RegionReference)),
                t => Err(FormatError::InvalidDatatype(format!("reference type {t}"))),
            },
            8 => Self::parse_enum(data, version, u16::from_le_bytes([bf[0], bf[1]])),
            9 => {
                let offset_size = match size.checked_sub(8) {
                    Some(n @ (2 | 4 | 8)) => n as u8,
                    _ => {
                        return Err(FormatError::InvalidDatatype(format!(
                            "{size}-byte variable-length descriptor"
                        )))
                    }
                };
                let (base, used) = Datatype::parse(&data[pos..])?;
                let dt = match bf[0] & 0x0F {
                    0 => Datatype::VarLen {
                        base: Box::new(base),
                        offset_size,
                    },
                    1 => Datatype::String {
                        size: StringSize::Variable { offset_size },
                        padding: parse_padding(bf[0] >> 4)?,
                        charset: parse_charset(bf[1] & 0x0F)?,
                    },
                    t => return Err(FormatError::InvalidDatatype(format!("vlen type {t}"))),
                };
                Ok((dt, pos + used))
            }
            10 => Self::parse_array(data, version),
            11 => Err(FormatError::UnsupportedFeature(Feature::ComplexNumbers)),
            c => Err(FormatError::InvalidDatatype(format!("class {c}"))),
        }
    }

    fn parse_compound(
        data: &[u8],
        version: u8,
        count: u16,
        size: u32,
    ) -> Result<(Datatype, usize), FormatError> {
        if !(1..=3).contains(&version) {
            return Err(FormatError::InvalidMessageVersion {
                message: "compound datatype",
                version,
            });
        }
        let mut pos = 8;
        let mut fields = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (name, used) = read_cstr(data, pos)?;
            pos += if version == 3 { used } else { pad_to_8(used) };

            let offset;
            let mut dims = Vec::new();
            if version == 3 {
                let w = offset_width(size);
                offset = read_uint(data, pos, w)?;
                pos += w as usize;
            } else {
                offset = read_uint(data, pos, 4)?;
                pos += 4;
                if version == 1 {
                    // rank(1) reserved(3) permutation(4) reserved(4) dims(4 x 4)
                    ensure_len(data, pos, 28)?;
                    let rank = (data[pos] as usize).min(4);
                    for d in 0..rank {
                        dims.push(LittleEndian::read_u32(&data[pos + 12 + 4 * d..]));
                    }
                    pos += 28;
                }
            }

            let (mut datatype, used) = Datatype::parse(&data[pos..])?;
            pos += used;
            if !dims.is_empty() {
                checked_array_size(&datatype, &dims)?;
                datatype = Datatype::Array {
                    base: Box::new(datatype),
                    dims,
                };
            }

            let member_size = datatype.size() as u64;
            if offset + member_size > size as u64 {
                return Err(FormatError::CompoundMemberOutOfBounds {
                    name,
                    offset,
                    size: member_size,
                    compound_size: size as u64,
                });
            }
            fields.push(CompoundField {
                name,
                offset,
                datatype,
            });
        }
        Ok((Datatype::Compound { size, fields }, pos))
    }

    fn parse_enum(data: &[u8], version: u8, count: u16) -> Result<(Datatype, usize), FormatError> {
        let mut pos = 8;
        let (base, used) = Datatype::parse(&data[pos..])?;
        pos += used;
        let (base_size, signed) = match &base {
            Datatype::Integer { size, signed, .. } if *size <= 8 => (*size as usize, *signed),
            other => {
                return Err(FormatError::InvalidDatatype(format!(
                    "enum base type {other:?}"
                )))
            }
        };

        let mut names = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let (name, used) = read_cstr(data, pos)?;
            pos += if version >= 3 { used } else { pad_to_8(used) };
            names.push(name);
        }

        let mut members = Vec::with_capacity(count as usize);
        for name in names {
            ensure_len(data, pos, base_size)?;
            let value = decode_int(&data[pos..pos + base_size], signed, base.order());
            pos += base_size;
            members.push(EnumMember { name, value });
        }
        Ok((
            Datatype::Enum {
                base: Box::new(base),
                members,
            },
            pos,
        ))
    }

    fn parse_array(data: &[u8], version: u8) -> Result<(Datatype, usize), FormatError> {
        let mut pos = 8;
        ensure_len(data, pos, 1)?;
        let rank = data[pos] as usize;
        pos += if version >= 3 { 1 } else { 4 };
        ensure_len(data, pos, 4 * rank)?;
        let dims: Vec<u32> = (0..rank)
            .map(|i| LittleEndian::read_u32(&data[pos + 4 * i..]))
            .collect();
        pos += 4 * rank;
        if version < 3 {
            // permutation indices
            pos += 4 * rank;
        }
        let (base, used) = Datatype::parse(data.get(pos..).unwrap_or(&[]))?;
        pos += used;
        checked_array_size(&base, &dims)?;
        Ok((
            Datatype::Array {
                base: Box::new(base),
                dims,
            },
            pos,
        ))
    }

    /// Size in bytes of one element of this type.
    pub fn size(&self) -> u32 {
        match self {
            Datatype::Integer { size, .. }
            | Datatype::Float { size, .. }
            | Datatype::Time { size, .. }
            | Datatype::Bitfield { size, .. }
            | Datatype::Opaque { size, .. }
            | Datatype::Compound { size, .. }
            | Datatype::Reference { size } => *size,
            Datatype::String {
                size: StringSize::Fixed(n),
                ..
            } => *n,
            Datatype::String {
                size: StringSize::Variable { offset_size },
                ..
            }
            | Datatype::VarLen { offset_size, .. } => vlen_descriptor_size(*offset_size),
            Datatype::Enum { base, .. } => base.size(),
            // parsed arrays are checked to fit; saturate for hand-built ones
            Datatype::Array { base, dims } => dims
                .iter()
                .fold(base.size(), |acc, &d| acc.saturating_mul(d)),
        }
    }

    fn order(&self) -> Endian {
        match self {
            Datatype::Integer { order, .. }
            | Datatype::Float { order, .. }
            | Datatype::Time { order, .. }
            | Datatype::Bitfield { order, .. } => *order,
            _ => Endian::Little,
        }
    }

    /// Whether elements of this type reference the global heap.
    pub fn is_variable_length(&self) -> bool {
        match self {
            Datatype::String {
                size: StringSize::Variable { .. },
                ..
            }
            | Datatype::VarLen { .. } => true,
            Datatype::Compound { fields, .. } => {
                fields.iter().any(|f| f.datatype.is_variable_length())
            }
            Datatype::Array { base, .. } => base.is_variable_length(),
            _ => false,
        }
    }

    /// Short human-readable name for diagnostics.
    pub fn describe(&self) -> String {
        match self {
            Datatype::Integer { size, signed, .. } => {
                format!("{}{}", if *signed { "i" } else { "u" }, size * 8)
            }
            Datatype::Float { size, .. } => format!("f{}", size * 8),
            Datatype::Time { .. } => "time".into(),
            Datatype::String {
                size: StringSize::Fixed(n),
                ..
            } => format!("string[{n}]"),
            Datatype::String { .. } => "vlen string".into(),
            Datatype::Bitfield { size, .. } => format!("bitfield{}", size * 8),
            Datatype::Opaque { tag, .. } => format!("opaque({tag})"),
            Datatype::Compound { fields, .. } => format!("compound({} fields)", fields.len()),
            Datatype::Reference { .. } => "object reference".into(),
            Datatype::Enum { base, .. } => format!("enum({})", base.describe()),
            Datatype::VarLen { base, .. } => format!("vlen({})", base.describe()),
            Datatype::Array { base, dims } => format!("{}{dims:?}", base.describe()),
        }
    }

    pub fn u8() -> Self {
        Self::int(1, false)
    }

    pub fn i32() -> Self {
        Self::int(4, true)
    }

    pub fn i64() -> Self {
        Self::int(8, true)
    }

    pub fn f32() -> Self {
        Datatype::Float {
            size: 4,
            order: Endian::Little,
        }
    }

    pub fn f64() -> Self {
        Datatype::Float {
            size: 8,
            order: Endian::Little,
        }
    }

    /// Little-endian integer of `size` bytes.
    pub fn int(size: u32, signed: bool) -> Self {
        Datatype::Integer {
            size,
            signed,
            order: Endian::Little,
        }
    }

    /// Null-padded fixed-length UTF-8 string.
    pub fn fixed_string(len: u32) -> Self {
        Datatype::String {
            size: StringSize::Fixed(len),
            padding: StringPadding::NullPad,
            charset: CharacterSet::Utf8,
        }
    }

    /// Variable-length UTF-8 string.
    pub fn vlen_string() -> Self {
        Datatype::String {
            size: StringSize::Variable {
                offset_size: DEFAULT_VLEN_OFFSET_SIZE,
            },
            padding: StringPadding::NullTerminate,
            charset: CharacterSet::Utf8,
        }
    }

    /// Boolean as stored by h5py: an enum over `u8` with FALSE=0, TRUE=1.
    pub fn boolean() -> Self {
        Datatype::Enum {
            base: Box::new(Self::u8()),
            members: vec![
                EnumMember {
                    name: "FALSE".into(),
                    value: 0,
                },
                EnumMember {
                    name: "TRUE".into(),
                    value: 1,
                },
            ],
        }
    }

    /// Encode as a datatype message.
    ///
    /// Compound, enum, and array types are written at version 3, the rest
    /// at version 1.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        let order_bit = |o: &Endian| if *o == Endian::Big { 0x01 } else { 0x00 };
        match self {
            Datatype::Integer {
                size,
                signed,
                order,
            } => {
                let bf0 = order_bit(order) | if *signed { 0x08 } else { 0 };
                header(buf, 0, 1, [bf0, 0, 0], *size);
                buf.extend_from_slice(&0u16.to_le_bytes());
                buf.extend_from_slice(&((*size * 8) as u16).to_le_bytes());
            }
            Datatype::Float { size, order } => {
                // (sign bit, exponent location, exponent bits, mantissa bits, bias)
                let (sign, exp_loc, exp_size, mant_size, bias): (u8, u8, u8, u8, u32) =
                    match size {
                        2 => (15, 10, 5, 10, 15),
                        4 => (31, 23, 8, 23, 127),
                        _ => (63, 52, 11, 52, 1023),
                    };
                header(buf, 1, 1, [0x20 | order_bit(order), sign, 0], *size);
                buf.extend_from_slice(&0u16.to_le_bytes());
                buf.extend_from_slice(&((*size * 8) as u16).to_le_bytes());
                buf.extend_from_slice(&[exp_loc, exp_size, 0, mant_size]);
                buf.extend_from_slice(&bias.to_le_bytes());
            }
            Datatype::Time { size, order } => {
                header(buf, 2, 1, [order_bit(order), 0, 0], *size);
                buf.extend_from_slice(&((*size * 8) as u16).to_le_bytes());
            }
            Datatype::String {
                size: StringSize::Fixed(n),
                padding,
                charset,
            } => {
                let bf0 = padding_bits(*padding) | (charset_bits(*charset) << 4);
                header(buf, 3, 1, [bf0, 0, 0], *n);
            }
            Datatype::String {
                size: StringSize::Variable { offset_size },
                padding,
                charset,
            } => {
                let bf0 = 0x01 | (padding_bits(*padding) << 4);
                let size = vlen_descriptor_size(*offset_size);
                header(buf, 9, 1, [bf0, charset_bits(*charset), 0], size);
                // base type: one byte character string
                header(buf, 3, 1, [charset_bits(*charset) << 4, 0, 0], 1);
            }
            Datatype::Bitfield { size, order } => {
                header(buf, 4, 1, [order_bit(order), 0, 0], *size);
                buf.extend_from_slice(&0u16.to_le_bytes());
                buf.extend_from_slice(&((*size * 8) as u16).to_le_bytes());
            }
            Datatype::Opaque { size, tag } => {
                let padded = pad_to_8(tag.len() + 1);
                header(buf, 5, 1, [padded as u8, 0, 0], *size);
                let start = buf.len();
                buf.extend_from_slice(tag.as_bytes());
                buf.resize(start + padded, 0);
            }
            Datatype::Compound { size, fields } => {
                let n = fields.len() as u16;
                header(buf, 6, 3, [n as u8, (n >> 8) as u8, 0], *size);
                let w = offset_width(*size) as usize;
                for field in fields {
                    buf.extend_from_slice(field.name.as_bytes());
                    buf.push(0);
                    buf.extend_from_slice(&field.offset.to_le_bytes()[..w]);
                    field.datatype.encode_into(buf);
                }
            }
            Datatype::Reference { size } => {
                header(buf, 7, 1, [0, 0, 0], *size);
            }
            Datatype::Enum { base, members } => {
                let n = members.len() as u16;
                header(buf, 8, 3, [n as u8, (n >> 8) as u8, 0], base.size());
                base.encode_into(buf);
                for m in members {
                    buf.extend_from_slice(m.name.as_bytes());
                    buf.push(0);
                }
                let width = base.size() as usize;
                for m in members {
                    buf.extend_from_slice(&m.value.to_le_bytes()[..width.min(8)]);
                }
            }
            Datatype::VarLen { base, offset_size } => {
                header(buf, 9, 1, [0, 0, 0], vlen_descriptor_size(*offset_size));
                base.encode_into(buf);
            }
            Datatype::Array { base, dims } => {
                header(buf, 10, 3, [0, 0, 0], self.size());
                buf.push(dims.len() as u8);
                for d in dims {
                    buf.extend_from_slice(&d.to_le_bytes());
                }
                base.encode_into(buf);
            }
        }
    }
}

/// Byte size of `dims` elements of `base`, rejecting sizes past `u32::MAX`.
fn checked_array_size(base: &Datatype, dims: &[u32]) -> Result<u32, FormatError> {
    dims.iter()
        .try_fold(base.size(), |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| {
            FormatError::InvalidDatatype(format!(
                "array {dims:?} of {} overflows the element size",
                base.describe()
            ))
        })
}

fn header(buf: &mut Vec<u8>, class: u8, version: u8, bf: [u8; 3], size: u32) {
    buf.push((version << 4) | class);
    buf.extend_from_slice(&bf);
    buf.extend_from_slice(&size.to_le_bytes());
}

fn padding_bits(p: StringPadding) -> u8 {
    match p {
        StringPadding::NullTerminate => 0,
        StringPadding::NullPad => 1,
        StringPadding::SpacePad => 2,
    }
}

fn charset_bits(c: CharacterSet) -> u8 {
    match c {
        CharacterSet::Ascii => 0,
        CharacterSet::Utf8 => 1,
    }
}

/// Decode an integer of up to 8 bytes, sign-extending when `signed`.
pub fn decode_int(bytes: &[u8], signed: bool, order: Endian) -> i64 {
    let n = bytes.len().min(8);
    let mut raw = [0u8; 8];
    match order {
        Endian::Little => raw[..n].copy_from_slice(&bytes[..n]),
        Endian::Big => {
            for (i, b) in bytes[..n].iter().rev().enumerate() {
                raw[i] = *b;
            }
        }
    }
    let v = u64::from_le_bytes(raw);
    if signed && n < 8 && n > 0 {
        let shift = 64 - 8 * n as u32;
        ((v << shift) as i64) >> shift
    } else {
        v as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(dt: &Datatype) -> Datatype {
        let bytes = dt.encode();
        let (parsed, used) = Datatype::parse(&bytes).unwrap();
        assert_eq!(used, bytes.len(), "consumed length for {}", dt.describe());
        parsed
    }

    #[test]
    fn parse_i32_le() {
        let data = [0x10, 0x08, 0, 0, 4, 0, 0, 0, 0, 0, 32, 0];
        let (dt, used) = Datatype::parse(&data).unwrap();
        assert_eq!(used, 12);
        assert_eq!(dt, Datatype::i32());
    }

    #[test]
    fn parse_u16_be() {
        let data = [0x10, 0x01, 0, 0, 2, 0, 0, 0, 0, 0, 16, 0];
        let (dt, _) = Datatype::parse(&data).unwrap();
        assert_eq!(
            dt,
            Datatype::Integer {
                size: 2,
                signed: false,
                order: Endian::Big
            }
        );
    }

    #[test]
    fn scalar_types_roundtrip() {
        for dt in [
            Datatype::u8(),
            Datatype::i64(),
            Datatype::f32(),
            Datatype::f64(),
            Datatype::Float {
                size: 2,
                order: Endian::Little,
            },
            Datatype::fixed_string(7),
            Datatype::vlen_string(),
            Datatype::Time {
                size: 8,
                order: Endian::Little,
            },
            Datatype::Bitfield {
                size: 1,
                order: Endian::Little,
            },
            Datatype::Opaque {
                size: 4,
                tag: "raw".into(),
            },
            Datatype::Reference { size: 8 },
        ] {
            assert_eq!(roundtrip(&dt), dt);
        }
    }

    #[test]
    fn compound_roundtrip_and_nesting() {
        let inner = Datatype::Compound {
            size: 12,
            fields: vec![
                CompoundField {
                    name: "x".into(),
                    offset: 0,
                    datatype: Datatype::f64(),
                },
                CompoundField {
                    name: "n".into(),
                    offset: 8,
                    datatype: Datatype::i32(),
                },
            ],
        };
        let outer = Datatype::Compound {
            size: 20,
            fields: vec![
                CompoundField {
                    name: "point".into(),
                    offset: 0,
                    datatype: inner,
                },
                CompoundField {
                    name: "label".into(),
                    offset: 12,
                    datatype: Datatype::fixed_string(8),
                },
            ],
        };
        assert_eq!(roundtrip(&outer), outer);
        assert_eq!(outer.size(), 20);
    }

    #[test]
    fn compound_member_overflow_is_rejected() {
        let bad = Datatype::Compound {
            size: 6,
            fields: vec![CompoundField {
                name: "v".into(),
                offset: 0,
                datatype: Datatype::f64(),
            }],
        };
        assert!(matches!(
            Datatype::parse(&bad.encode()),
            Err(FormatError::CompoundMemberOutOfBounds { compound_size: 6, .. })
        ));
    }

    #[test]
    fn enum_and_boolean() {
        let b = Datatype::boolean();
        assert_eq!(roundtrip(&b), b);
        assert_eq!(b.size(), 1);

        let e = Datatype::Enum {
            base: Box::new(Datatype::int(2, true)),
            members: vec![
                EnumMember {
                    name: "LOW".into(),
                    value: -1,
                },
                EnumMember {
                    name: "HIGH".into(),
                    value: 300,
                },
            ],
        };
        assert_eq!(roundtrip(&e), e);
    }

    #[test]
    fn array_and_vlen_roundtrip() {
        let a = Datatype::Array {
            base: Box::new(Datatype::i32()),
            dims: vec![2, 3],
        };
        assert_eq!(a.size(), 24);
        assert_eq!(roundtrip(&a), a);

        let v = Datatype::VarLen {
            base: Box::new(Datatype::f64()),
            offset_size: DEFAULT_VLEN_OFFSET_SIZE,
        };
        assert_eq!(roundtrip(&v), v);
        assert!(v.is_variable_length());
    }

    #[test]
    fn vlen_size_follows_offset_size() {
        // vlen string with a 12-byte descriptor, as written with 4-byte addresses
        let mut data = vec![0x19, 0x01, 0x01, 0, 12, 0, 0, 0];
        data.extend_from_slice(&[0x13, 0x10, 0, 0, 1, 0, 0, 0]);
        let (dt, used) = Datatype::parse(&data).unwrap();
        assert_eq!(used, data.len());
        assert_eq!(dt.size(), 12);
        assert_eq!(
            dt,
            Datatype::String {
                size: StringSize::Variable { offset_size: 4 },
                padding: StringPadding::NullTerminate,
                charset: CharacterSet::Utf8,
            }
        );
        assert_eq!(roundtrip(&dt), dt);

        data[4] = 11;
        assert!(matches!(
            Datatype::parse(&data),
            Err(FormatError::InvalidDatatype(_))
        ));
    }

    #[test]
    fn oversized_array_is_rejected() {
        // array v3, rank 2, dims [65536, 65536] of u64
        let mut data = vec![0x3A, 0, 0, 0, 0, 0, 0, 0, 2];
        data.extend_from_slice(&65536u32.to_le_bytes());
        data.extend_from_slice(&65536u32.to_le_bytes());
        data.extend_from_slice(&Datatype::int(8, false).encode());
        assert!(matches!(
            Datatype::parse(&data),
            Err(FormatError::InvalidDatatype(_))
        ));

        let built = Datatype::Array {
            base: Box::new(Datatype::i64()),
            dims: vec![65536, 65536],
        };
        assert_eq!(built.size(), u32::MAX);
    }

    #[test]
    fn compound_v1_member_dims_overflow_is_rejected() {
        let mut data = vec![0x16, 1, 0, 0, 8, 0, 0, 0];
        data.extend_from_slice(b"a\0\0\0\0\0\0\0");
        data.extend_from_slice(&0u32.to_le_bytes());
        data.push(2);
        data.extend_from_slice(&[0; 11]);
        data.extend_from_slice(&u32::MAX.to_le_bytes());
        data.extend_from_slice(&u32::MAX.to_le_bytes());
        data.extend_from_slice(&[0; 8]);
        data.extend_from_slice(&Datatype::i32().encode());
        assert!(matches!(
            Datatype::parse(&data),
            Err(FormatError::InvalidDatatype(_))
        ));
    }

    #[test]
    fn parse_compound_v1_with_array_member() {
        // compound v1, one member "a" at offset 0, rank 1 dims [3], base i32
        let mut data = vec![0x16, 1, 0, 0, 12, 0, 0, 0];
        data.extend_from_slice(b"a\0\0\0\0\0\0\0");
        data.extend_from_slice(&0u32.to_le_bytes());
        data.push(1);
        data.extend_from_slice(&[0; 3]);
        data.extend_from_slice(&[0; 4]);
        data.extend_from_slice(&[0; 4]);
        data.extend_from_slice(&3u32.to_le_bytes());
        data.extend_from_slice(&[0; 12]);
        data.extend_from_slice(&Datatype::i32().encode());
        let (dt, used) = Datatype::parse(&data).unwrap();
        assert_eq!(used, data.len());
        match dt {
            Datatype::Compound { fields, .. } => assert_eq!(
                fields[0].datatype,
                Datatype::Array {
                    base: Box::new(Datatype::i32()),
                    dims: vec![3]
                }
            ),
            other => panic!("expected compound, got {other:?}"),
        }
    }

    #[test]
    fn unsupported_classes() {
        let region = [0x17, 0x01, 0, 0, 12, 0, 0, 0];
        assert_eq!(
            Datatype::parse(&region).unwrap_err(),
            FormatError::UnsupportedFeature(Feature::RegionReference)
        );
        let complex = [0x1B, 0, 0, 0, 16, 0, 0, 0];
        assert_eq!(
            Datatype::parse(&complex).unwrap_err(),
            FormatError::UnsupportedFeature(Feature::ComplexNumbers)
        );
        let unknown = [0x1E, 0, 0, 0, 4, 0, 0, 0];
        assert!(matches!(
            Datatype::parse(&unknown),
            Err(FormatError::InvalidDatatype(_))
        ));
    }

    #[test]
    fn truncated_nested_type_fails_cleanly() {
        let a = Datatype::Array {
            base: Box::new(Datatype::Compound {
                size: 8,
                fields: vec![CompoundField {
                    name: "v".into(),
                    offset: 0,
                    datatype: Datatype::f64(),
                }],
            }),
            dims: vec![4],
        };
        let bytes = a.encode();
        for cut in 0..bytes.len() {
            assert!(Datatype::parse(&bytes[..cut]).is_err(), "cut at {cut}");
        }
    }

    #[test]
    fn decode_int_sign_extension() {
        assert_eq!(decode_int(&[0xFF, 0xFF], true, Endian::Little), -1);
        assert_eq!(decode_int(&[0xFF, 0xFF], false, Endian::Little), 65535);
        assert_eq!(decode_int(&[0x01, 0x00], false, Endian::Big), 256);
    }
}
