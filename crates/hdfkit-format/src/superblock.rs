//! HDF5 Superblock parsing for versions 0, 1, 2, and 3, and v0 serialization.

use byteorder::{ByteOrder, LittleEndian};
use tracing::trace;

use crate::checksum;
use crate::error::FormatError;
use crate::signature::HDF5_SIGNATURE;
use crate::util::{read_address, write_uint, UNDEFINED_ADDRESS};

/// Parsed HDF5 superblock (all versions).
///
/// Addresses stored here are relative to the file's base address, which is
/// the byte offset where the signature was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    /// Superblock version (0–3).
    pub version: u8,
    /// Size of offsets in bytes (2, 4, or 8).
    pub offset_size: u8,
    /// Size of lengths in bytes (2, 4, or 8).
    pub length_size: u8,
    /// Base address as stored in the file.
    pub base_address: u64,
    /// Absolute offset of the signature; the effective base for all addresses.
    pub signature_offset: u64,
    /// End-of-file address.
    pub eof_address: u64,
    /// Root group object header address.
    pub root_group_address: u64,
    /// Group leaf node K (v0/v1 only).
    pub group_leaf_node_k: Option<u16>,
    /// Group internal node K (v0/v1 only).
    pub group_internal_node_k: Option<u16>,
    /// Indexed storage internal node K (v1 only).
    pub indexed_storage_internal_node_k: Option<u16>,
    /// File consistency flags.
    pub consistency_flags: u32,
    /// Superblock extension address (v2/v3 only).
    pub superblock_extension_address: Option<u64>,
}

fn validate_sizes(offset_size: u8, length_size: u8) -> Result<(), FormatError> {
    if !matches!(offset_size, 2 | 4 | 8) {
        return Err(FormatError::InvalidOffsetSize(offset_size));
    }
    if !matches!(length_size, 2 | 4 | 8) {
        return Err(FormatError::InvalidLengthSize(length_size));
    }
    Ok(())
}

fn ensure_len(data: &[u8], needed: usize) -> Result<(), FormatError> {
    if data.len() < needed {
        Err(FormatError::UnexpectedEof {
            expected: needed,
            available: data.len(),
        })
    } else {
        Ok(())
    }
}

impl Superblock {
    /// Parse a superblock from `data` starting at `signature_offset`.
    ///
    /// The signature must be present at the given offset.
    pub fn parse(data: &[u8], signature_offset: usize) -> Result<Superblock, FormatError> {
        let d = data.get(signature_offset..).unwrap_or(&[]);
        ensure_len(d, 9)?;

        if d[..8] != HDF5_SIGNATURE {
            return Err(FormatError::SignatureNotFound {
                searched_up_to: signature_offset,
            });
        }

        let version = d[8];
        trace!(version, signature_offset, "parsing superblock");
        let mut sb = match version {
            0 | 1 => Self::parse_v0v1(d, version)?,
            2 | 3 => Self::parse_v2v3(d, version)?,
            v => return Err(FormatError::UnsupportedSuperblockVersion(v)),
        };
        sb.signature_offset = signature_offset as u64;
        if sb.base_address != sb.signature_offset {
            trace!(
                stored = sb.base_address,
                effective = sb.signature_offset,
                "stored base address differs from signature offset"
            );
        }
        Ok(sb)
    }

    fn parse_v0v1(d: &[u8], version: u8) -> Result<Superblock, FormatError> {
        // sig(8) + version(1) + free_space_ver(1) + root_grp_ver(1) + reserved(1)
        // + shared_hdr_ver(1) + offset_size(1) + length_size(1) + reserved(1)
        // + group_leaf_k(2) + group_internal_k(2) [+ indexed_k(2) + reserved(2)]
        // + consistency_flags(4)
        let fixed = if version == 0 { 24 } else { 28 };
        ensure_len(d, fixed)?;

        let offset_size = d[13];
        let length_size = d[14];
        validate_sizes(offset_size, length_size)?;

        let group_leaf_node_k = LittleEndian::read_u16(&d[16..18]);
        let group_internal_node_k = LittleEndian::read_u16(&d[18..20]);
        let indexed_storage_internal_node_k = if version == 1 {
            Some(LittleEndian::read_u16(&d[20..22]))
        } else {
            None
        };
        let consistency_flags = LittleEndian::read_u32(&d[fixed - 4..fixed]);

        let os = offset_size as usize;
        // 4 addresses + root symbol table entry
        let entry_size = 2 * os + 4 + 4 + 16;
        ensure_len(d, fixed + 4 * os + entry_size)?;

        let mut pos = fixed;
        let base_address = read_address(d, pos, offset_size)?;
        pos += 2 * os; // base, free space
        let eof_address = read_address(d, pos, offset_size)?;
        pos += 2 * os; // eof, driver info

        pos += os; // root entry link name offset
        let root_group_address = read_address(d, pos, offset_size)?;

        Ok(Superblock {
            version,
            offset_size,
            length_size,
            base_address,
            signature_offset: 0,
            eof_address,
            root_group_address,
            group_leaf_node_k: Some(group_leaf_node_k),
            group_internal_node_k: Some(group_internal_node_k),
            indexed_storage_internal_node_k,
            consistency_flags,
            superblock_extension_address: None,
        })
    }

    fn parse_v2v3(d: &[u8], version: u8) -> Result<Superblock, FormatError> {
        // sig(8) + version(1) + offset_size(1) + length_size(1) + consistency_flags(1) = 12
        ensure_len(d, 12)?;

        let offset_size = d[9];
        let length_size = d[10];
        validate_sizes(offset_size, length_size)?;
        let consistency_flags = d[11] as u32;

        let os = offset_size as usize;
        let total = 12 + 4 * os + 4;
        ensure_len(d, total)?;
        checksum::verify_trailing("superblock", &d[..total])?;

        let mut pos = 12;
        let base_address = read_address(d, pos, offset_size)?;
        pos += os;
        let ext = read_address(d, pos, offset_size)?;
        pos += os;
        let eof_address = read_address(d, pos, offset_size)?;
        pos += os;
        let root_group_address = read_address(d, pos, offset_size)?;

        Ok(Superblock {
            version,
            offset_size,
            length_size,
            base_address,
            signature_offset: 0,
            eof_address,
            root_group_address,
            group_leaf_node_k: None,
            group_internal_node_k: None,
            indexed_storage_internal_node_k: None,
            consistency_flags,
            superblock_extension_address: (ext != UNDEFINED_ADDRESS).then_some(ext),
        })
    }

    /// Size in bytes of a version 0 superblock with the given field widths.
    pub fn v0_size(offset_size: u8) -> usize {
        let os = offset_size as usize;
        24 + 4 * os + 2 * os + 24
    }

    /// Serialize as a version 0 superblock.
    ///
    /// The root symbol table entry is written with cache type 1, carrying the
    /// root group's B-tree and local heap addresses in its scratch pad.
    pub fn serialize_v0(&self, root_btree: u64, root_heap: u64) -> Vec<u8> {
        let os = self.offset_size;
        let mut buf = Vec::with_capacity(Self::v0_size(os));
        buf.extend_from_slice(&HDF5_SIGNATURE);
        buf.extend_from_slice(&[0, 0, 0, 0, 0]); // versions + reserved
        buf.push(os);
        buf.push(self.length_size);
        buf.push(0);
        buf.extend_from_slice(&self.group_leaf_node_k.unwrap_or(4).to_le_bytes());
        buf.extend_from_slice(&self.group_internal_node_k.unwrap_or(16).to_le_bytes());
        buf.extend_from_slice(&self.consistency_flags.to_le_bytes());
        write_uint(&mut buf, self.base_address, os);
        write_uint(&mut buf, UNDEFINED_ADDRESS, os); // free space
        write_uint(&mut buf, self.eof_address, os);
        write_uint(&mut buf, UNDEFINED_ADDRESS, os); // driver info
        write_uint(&mut buf, 0, os); // link name offset
        write_uint(&mut buf, self.root_group_address, os);
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        let mut scratch = Vec::with_capacity(16);
        write_uint(&mut scratch, root_btree, os);
        write_uint(&mut scratch, root_heap, os);
        scratch.resize(16, 0);
        buf.extend_from_slice(&scratch);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::jenkins_lookup3;

    fn build_v0_bytes(offset_size: u8) -> Vec<u8> {
        Superblock {
            version: 0,
            offset_size,
            length_size: offset_size,
            base_address: 0,
            signature_offset: 0,
            eof_address: 4096,
            root_group_address: 96,
            group_leaf_node_k: Some(4),
            group_internal_node_k: Some(16),
            indexed_storage_internal_node_k: None,
            consistency_flags: 0,
            superblock_extension_address: None,
        }
        .serialize_v0(136, 680)
    }

    fn build_v1_bytes(offset_size: u8) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&HDF5_SIGNATURE);
        buf.extend_from_slice(&[1, 0, 0, 0, 0]);
        buf.push(offset_size);
        buf.push(offset_size);
        buf.push(0);
        buf.extend_from_slice(&4u16.to_le_bytes());
        buf.extend_from_slice(&16u16.to_le_bytes());
        buf.extend_from_slice(&32u16.to_le_bytes()); // indexed storage K
        buf.extend_from_slice(&0u16.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        write_uint(&mut buf, 0, offset_size);
        write_uint(&mut buf, u64::MAX, offset_size);
        write_uint(&mut buf, 8192, offset_size);
        write_uint(&mut buf, u64::MAX, offset_size);
        write_uint(&mut buf, 0, offset_size);
        write_uint(&mut buf, 200, offset_size);
        buf.extend_from_slice(&[0u8; 24]);
        buf
    }

    fn build_v2_bytes(offset_size: u8, version: u8) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&HDF5_SIGNATURE);
        buf.push(version);
        buf.push(offset_size);
        buf.push(offset_size);
        buf.push(0);
        write_uint(&mut buf, 0, offset_size);
        write_uint(&mut buf, u64::MAX, offset_size);
        write_uint(&mut buf, 2048, offset_size);
        write_uint(&mut buf, 48, offset_size);
        let checksum = jenkins_lookup3(&buf);
        buf.extend_from_slice(&checksum.to_le_bytes());
        buf
    }

    #[test]
    fn parse_v0_8byte_offsets() {
        let data = build_v0_bytes(8);
        assert_eq!(data.len(), 96);
        let sb = Superblock::parse(&data, 0).unwrap();
        assert_eq!(sb.version, 0);
        assert_eq!(sb.offset_size, 8);
        assert_eq!(sb.eof_address, 4096);
        assert_eq!(sb.root_group_address, 96);
        assert_eq!(sb.group_leaf_node_k, Some(4));
        assert_eq!(sb.group_internal_node_k, Some(16));
        assert_eq!(sb.indexed_storage_internal_node_k, None);
    }

    #[test]
    fn parse_v0_4byte_offsets() {
        let data = build_v0_bytes(4);
        assert_eq!(data.len(), Superblock::v0_size(4));
        let sb = Superblock::parse(&data, 0).unwrap();
        assert_eq!(sb.offset_size, 4);
        assert_eq!(sb.root_group_address, 96);
    }

    #[test]
    fn parse_v1() {
        let data = build_v1_bytes(8);
        let sb = Superblock::parse(&data, 0).unwrap();
        assert_eq!(sb.version, 1);
        assert_eq!(sb.eof_address, 8192);
        assert_eq!(sb.root_group_address, 200);
        assert_eq!(sb.indexed_storage_internal_node_k, Some(32));
    }

    #[test]
    fn parse_v2_and_v3() {
        for version in [2, 3] {
            let data = build_v2_bytes(8, version);
            let sb = Superblock::parse(&data, 0).unwrap();
            assert_eq!(sb.version, version);
            assert_eq!(sb.root_group_address, 48);
            assert_eq!(sb.superblock_extension_address, None);
            assert_eq!(sb.group_leaf_node_k, None);
        }
    }

    #[test]
    fn v2_2byte_offsets() {
        let data = build_v2_bytes(2, 2);
        let sb = Superblock::parse(&data, 0).unwrap();
        assert_eq!(sb.offset_size, 2);
        assert_eq!(sb.eof_address, 2048);
    }

    #[test]
    fn checksum_mismatch_v2() {
        let mut data = build_v2_bytes(8, 2);
        let len = data.len();
        data[len - 1] ^= 0xFF;
        assert!(matches!(
            Superblock::parse(&data, 0),
            Err(FormatError::ChecksumMismatch { structure: "superblock", .. })
        ));
    }

    #[test]
    fn unsupported_version() {
        let mut data = vec![0u8; 64];
        data[..8].copy_from_slice(&HDF5_SIGNATURE);
        data[8] = 99;
        assert_eq!(
            Superblock::parse(&data, 0),
            Err(FormatError::UnsupportedSuperblockVersion(99))
        );
    }

    #[test]
    fn truncated_v0() {
        let mut data = vec![0u8; 20];
        data[..8].copy_from_slice(&HDF5_SIGNATURE);
        data[13] = 8;
        data[14] = 8;
        assert!(matches!(
            Superblock::parse(&data, 0),
            Err(FormatError::UnexpectedEof { .. })
        ));
    }

    #[test]
    fn invalid_sizes() {
        let mut data = vec![0u8; 64];
        data[..8].copy_from_slice(&HDF5_SIGNATURE);
        data[13] = 3;
        data[14] = 8;
        assert_eq!(
            Superblock::parse(&data, 0),
            Err(FormatError::InvalidOffsetSize(3))
        );
        data[13] = 8;
        data[14] = 5;
        assert_eq!(
            Superblock::parse(&data, 0),
            Err(FormatError::InvalidLengthSize(5))
        );
    }

    #[test]
    fn parse_after_user_block() {
        let mut data = vec![0u8; 1024];
        let v0 = build_v0_bytes(8);
        data[512..512 + v0.len()].copy_from_slice(&v0);
        let sb = Superblock::parse(&data, 512).unwrap();
        assert_eq!(sb.signature_offset, 512);
        assert_eq!(sb.root_group_address, 96);
    }

    #[test]
    fn parse_past_end_of_data() {
        let data = vec![0u8; 16];
        assert!(Superblock::parse(&data, 512).is_err());
    }
}
