//! Bounded little-endian field readers and writers shared by all parsers.

use byteorder::{ByteOrder, LittleEndian};

use crate::error::FormatError;

/// The all-ones address HDF5 uses for "not allocated".
pub const UNDEFINED_ADDRESS: u64 = u64::MAX;

pub fn ensure_len(data: &[u8], pos: usize, needed: usize) -> Result<(), FormatError> {
    match pos.checked_add(needed) {
        Some(end) if end <= data.len() => Ok(()),
        _ => Err(FormatError::UnexpectedEof {
            expected: pos.saturating_add(needed),
            available: data.len(),
        }),
    }
}

/// Read an unsigned little-endian integer of `size` bytes (1..=8) at `pos`.
pub fn read_uint(data: &[u8], pos: usize, size: u8) -> Result<u64, FormatError> {
    ensure_len(data, pos, size as usize)?;
    let slice = &data[pos..pos + size as usize];
    Ok(match size {
        1 => slice[0] as u64,
        2 => LittleEndian::read_u16(slice) as u64,
        4 => LittleEndian::read_u32(slice) as u64,
        8 => LittleEndian::read_u64(slice),
        3 | 5 | 6 | 7 => LittleEndian::read_uint(slice, size as usize),
        _ => return Err(FormatError::InvalidOffsetSize(size)),
    })
}

/// Read a file address, mapping the all-ones pattern to [`UNDEFINED_ADDRESS`].
pub fn read_address(data: &[u8], pos: usize, size: u8) -> Result<u64, FormatError> {
    let v = read_uint(data, pos, size)?;
    Ok(if is_undefined(v, size) {
        UNDEFINED_ADDRESS
    } else {
        v
    })
}

pub fn read_u16(data: &[u8], pos: usize) -> Result<u16, FormatError> {
    ensure_len(data, pos, 2)?;
    Ok(LittleEndian::read_u16(&data[pos..]))
}

pub fn read_u32(data: &[u8], pos: usize) -> Result<u32, FormatError> {
    ensure_len(data, pos, 4)?;
    Ok(LittleEndian::read_u32(&data[pos..]))
}

pub fn read_u64(data: &[u8], pos: usize) -> Result<u64, FormatError> {
    ensure_len(data, pos, 8)?;
    Ok(LittleEndian::read_u64(&data[pos..]))
}

/// Whether `addr` is the undefined address for an `offset_size`-byte field.
pub fn is_undefined(addr: u64, offset_size: u8) -> bool {
    match offset_size {
        8 => addr == u64::MAX,
        s if s < 8 => addr == (1u64 << (s as u32 * 8)) - 1,
        _ => false,
    }
}

/// Append `value` as a little-endian integer of `size` bytes.
pub fn write_uint(buf: &mut Vec<u8>, value: u64, size: u8) {
    let bytes = value.to_le_bytes();
    buf.extend_from_slice(&bytes[..size as usize]);
}

/// Overwrite `size` bytes at `pos` with `value`.
pub fn patch_uint(buf: &mut [u8], pos: usize, value: u64, size: u8) {
    let bytes = value.to_le_bytes();
    buf[pos..pos + size as usize].copy_from_slice(&bytes[..size as usize]);
}

pub fn pad_to_8(len: usize) -> usize {
    (len + 7) & !7
}

/// Convert a file address to a slice index, checking it lies inside `data`.
pub fn checked_address(data: &[u8], address: u64) -> Result<usize, FormatError> {
    if address == UNDEFINED_ADDRESS || address >= data.len() as u64 {
        return Err(FormatError::AddressOutOfBounds {
            address,
            len: data.len(),
        });
    }
    Ok(address as usize)
}

/// Read a null-terminated string starting at `pos`.
pub fn read_cstr(data: &[u8], pos: usize) -> Result<(String, usize), FormatError> {
    ensure_len(data, pos, 1)?;
    let end = data[pos..]
        .iter()
        .position(|&b| b == 0)
        .ok_or(FormatError::UnexpectedEof {
            expected: data.len() + 1,
            available: data.len(),
        })?;
    let s = String::from_utf8_lossy(&data[pos..pos + end]).into_owned();
    Ok((s, end + 1))
}
