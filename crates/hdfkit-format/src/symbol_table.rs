//! Symbol Table message (type 0x0011) and Symbol Table Nodes (SNOD).

use crate::error::FormatError;
use crate::util::{checked_address, ensure_len, read_address, read_u16, read_u32, read_uint, write_uint};

const SNOD_SIGNATURE: [u8; 4] = *b"SNOD";

/// Cache type of an entry whose scratch pad holds a group's B-tree and heap.
pub const CACHE_GROUP: u32 = 1;
/// Cache type of a soft link; the scratch pad holds the target's heap offset.
pub const CACHE_SOFT_LINK: u32 = 2;

/// Locates the B-tree and local heap of a symbol table group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SymbolTableMessage {
    pub btree_address: u64,
    pub heap_address: u64,
}

impl SymbolTableMessage {
    pub fn parse(data: &[u8], offset_size: u8) -> Result<SymbolTableMessage, FormatError> {
        Ok(SymbolTableMessage {
            btree_address: read_address(data, 0, offset_size)?,
            heap_address: read_address(data, offset_size as usize, offset_size)?,
        })
    }

    pub fn serialize(&self, offset_size: u8) -> Vec<u8> {
        let mut buf = Vec::with_capacity(2 * offset_size as usize);
        write_uint(&mut buf, self.btree_address, offset_size);
        write_uint(&mut buf, self.heap_address, offset_size);
        buf
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolTableEntry {
    /// Offset of the link name in the group's local heap.
    pub name_offset: u64,
    pub object_header_address: u64,
    pub cache_type: u32,
    pub scratch_pad: [u8; 16],
}

impl SymbolTableEntry {
    pub fn encoded_len(offset_size: u8) -> usize {
        2 * offset_size as usize + 24
    }

    pub fn hard(name_offset: u64, object_header_address: u64) -> Self {
        SymbolTableEntry {
            name_offset,
            object_header_address,
            cache_type: 0,
            scratch_pad: [0; 16],
        }
    }

    /// A group entry caching the child's symbol table addresses.
    pub fn group(name_offset: u64, object_header_address: u64, stab: SymbolTableMessage, offset_size: u8) -> Self {
        let mut scratch_pad = [0u8; 16];
        let cached = stab.serialize(offset_size);
        scratch_pad[..cached.len()].copy_from_slice(&cached);
        SymbolTableEntry {
            name_offset,
            object_header_address,
            cache_type: CACHE_GROUP,
            scratch_pad,
        }
    }

    /// A soft link whose target path is stored in the local heap at `value_offset`.
    pub fn soft_link(name_offset: u64, value_offset: u32) -> Self {
        let mut scratch_pad = [0u8; 16];
        scratch_pad[..4].copy_from_slice(&value_offset.to_le_bytes());
        SymbolTableEntry {
            name_offset,
            object_header_address: crate::util::UNDEFINED_ADDRESS,
            cache_type: CACHE_SOFT_LINK,
            scratch_pad,
        }
    }

    /// Heap offset of a soft link's target, for cache type 2 entries.
    pub fn soft_link_offset(&self) -> Option<u64> {
        (self.cache_type == CACHE_SOFT_LINK).then(|| {
            u32::from_le_bytes([
                self.scratch_pad[0],
                self.scratch_pad[1],
                self.scratch_pad[2],
                self.scratch_pad[3],
            ]) as u64
        })
    }

    pub fn parse(data: &[u8], pos: usize, offset_size: u8) -> Result<SymbolTableEntry, FormatError> {
        let os = offset_size as usize;
        ensure_len(data, pos, Self::encoded_len(offset_size))?;
        let mut scratch_pad = [0u8; 16];
        scratch_pad.copy_from_slice(&data[pos + 2 * os + 8..pos + 2 * os + 24]);
        Ok(SymbolTableEntry {
            name_offset: read_uint(data, pos, offset_size)?,
            object_header_address: read_address(data, pos + os, offset_size)?,
            cache_type: read_u32(data, pos + 2 * os)?,
            scratch_pad,
        })
    }

    pub fn write(&self, buf: &mut Vec<u8>, offset_size: u8) {
        write_uint(buf, self.name_offset, offset_size);
        write_uint(buf, self.object_header_address, offset_size);
        buf.extend_from_slice(&self.cache_type.to_le_bytes());
        buf.extend_from_slice(&[0; 4]);
        buf.extend_from_slice(&self.scratch_pad);
    }
}

/// A B-tree leaf of a symbol table group: entries sorted by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolTableNode {
    pub entries: Vec<SymbolTableEntry>,
}

impl SymbolTableNode {
    pub fn parse(data: &[u8], address: u64, offset_size: u8) -> Result<SymbolTableNode, FormatError> {
        let start = checked_address(data, address)?;
        ensure_len(data, start, 8)?;
        if data[start..start + 4] != SNOD_SIGNATURE || data[start + 4] != 1 {
            return Err(FormatError::InvalidSymbolTableNode { address });
        }
        let count = read_u16(data, start + 6)? as usize;
        let entry_len = SymbolTableEntry::encoded_len(offset_size);
        ensure_len(data, start + 8, count * entry_len)?;

        let entries = (0..count)
            .map(|i| SymbolTableEntry::parse(data, start + 8 + i * entry_len, offset_size))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(SymbolTableNode { entries })
    }

    /// Serialize padded to `2 * leaf_k` entries.
    pub fn serialize(&self, offset_size: u8, leaf_k: u16) -> Vec<u8> {
        let capacity = (2 * leaf_k as usize).max(self.entries.len());
        let mut buf = Vec::with_capacity(8 + capacity * SymbolTableEntry::encoded_len(offset_size));
        buf.extend_from_slice(&SNOD_SIGNATURE);
        buf.extend_from_slice(&[1, 0]);
        buf.extend_from_slice(&(self.entries.len() as u16).to_le_bytes());
        for e in &self.entries {
            e.write(&mut buf, offset_size);
        }
        buf.resize(8 + capacity * SymbolTableEntry::encoded_len(offset_size), 0);
        buf
    }
}
