//! HDF5 Local Heap: the name store of a symbol table group.

use crate::error::FormatError;
use crate::util::{checked_address, ensure_len, pad_to_8, read_address, read_cstr, read_uint, write_uint};

const HEAP_SIGNATURE: [u8; 4] = *b"HEAP";

/// A parsed local heap with its data segment copied out.
#[derive(Debug, Clone)]
pub struct LocalHeap {
    pub address: u64,
    pub data_segment_address: u64,
    pub free_list_head: u64,
    segment: Vec<u8>,
}

impl LocalHeap {
    pub fn parse(
        data: &[u8],
        address: u64,
        offset_size: u8,
        length_size: u8,
    ) -> Result<LocalHeap, FormatError> {
        let start = checked_address(data, address)?;
        let ls = length_size as usize;
        ensure_len(data, start, 8 + 2 * ls + offset_size as usize)?;

        if data[start..start + 4] != HEAP_SIGNATURE {
            return Err(FormatError::InvalidLocalHeap {
                address,
                reason: "bad signature".into(),
            });
        }
        if data[start + 4] != 0 {
            return Err(FormatError::InvalidMessageVersion {
                message: "local heap",
                version: data[start + 4],
            });
        }
        let size = read_uint(data, start + 8, length_size)?;
        let free_list_head = read_uint(data, start + 8 + ls, length_size)?;
        let data_segment_address = read_address(data, start + 8 + 2 * ls, offset_size)?;

        let seg = checked_address(data, data_segment_address)?;
        let size = usize::try_from(size).map_err(|_| FormatError::InvalidLocalHeap {
            address,
            reason: format!("data segment size {size}"),
        })?;
        ensure_len(data, seg, size)?;

        Ok(LocalHeap {
            address,
            data_segment_address,
            free_list_head,
            segment: data[seg..seg + size].to_vec(),
        })
    }

    /// Read the NUL-terminated name stored at `offset` in the data segment.
    pub fn name_at(&self, offset: u64) -> Result<String, FormatError> {
        let pos = usize::try_from(offset)
            .ok()
            .filter(|&p| p < self.segment.len())
            .ok_or_else(|| FormatError::InvalidLocalHeap {
                address: self.address,
                reason: format!(
                    "name offset {offset} outside {}-byte data segment",
                    self.segment.len()
                ),
            })?;
        if !self.segment[pos..].contains(&0) {
            return Err(FormatError::InvalidLocalHeap {
                address: self.address,
                reason: format!("unterminated name at offset {offset}"),
            });
        }
        read_cstr(&self.segment, pos).map(|(s, _)| s)
    }

    pub fn segment_len(&self) -> usize {
        self.segment.len()
    }
}

/// Collects names for a new local heap. Offset 0 holds the empty name.
#[derive(Debug)]
pub struct LocalHeapWriter {
    segment: Vec<u8>,
}

impl Default for LocalHeapWriter {
    fn default() -> Self {
        LocalHeapWriter {
            segment: vec![0; 8],
        }
    }
}

impl LocalHeapWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `name` and return its offset in the data segment.
    pub fn add(&mut self, name: &str) -> u64 {
        let offset = self.segment.len() as u64;
        self.segment.extend_from_slice(name.as_bytes());
        self.segment.push(0);
        self.segment.resize(pad_to_8(self.segment.len()), 0);
        offset
    }

    /// Size of the heap header plus its data segment.
    pub fn encoded_len(&self, offset_size: u8, length_size: u8) -> usize {
        Self::header_len(offset_size, length_size) + self.segment.len()
    }

    fn header_len(offset_size: u8, length_size: u8) -> usize {
        pad_to_8(8 + 2 * length_size as usize + offset_size as usize)
    }

    /// Serialize the header at `address` followed directly by the data segment.
    pub fn finish(self, address: u64, offset_size: u8, length_size: u8) -> Vec<u8> {
        let header_len = Self::header_len(offset_size, length_size);
        let mut buf = Vec::with_capacity(header_len + self.segment.len());
        buf.extend_from_slice(&HEAP_SIGNATURE);
        buf.extend_from_slice(&[0, 0, 0, 0]);
        write_uint(&mut buf, self.segment.len() as u64, length_size);
        // no free list
        write_uint(&mut buf, u64::MAX, length_size);
        write_uint(&mut buf, address + header_len as u64, offset_size);
        buf.resize(header_len, 0);
        buf.extend_from_slice(&self.segment);
        buf
    }
}
