//! HDF5 Data Layout message (type 0x0008), versions 1 through 4.

use crate::error::{Feature, FormatError};
use crate::util::{ensure_len, read_address, read_u16, read_u32, read_uint, write_uint, UNDEFINED_ADDRESS};

/// How a chunked dataset locates its chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkIndex {
    /// Version 1 B-tree keyed by chunk coordinates.
    BTreeV1 { address: u64 },
    /// The dataset is exactly one chunk.
    SingleChunk {
        address: u64,
        /// Stored size and filter mask when the chunk is filtered.
        filtered: Option<(u64, u32)>,
    },
    /// Chunks laid out back to back in row-major chunk order, unfiltered.
    Implicit { address: u64 },
}

impl ChunkIndex {
    pub fn address(&self) -> u64 {
        match self {
            ChunkIndex::BTreeV1 { address }
            | ChunkIndex::SingleChunk { address, .. }
            | ChunkIndex::Implicit { address } => *address,
        }
    }
}

/// Parsed data layout message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataLayout {
    /// Raw data stored inline in the message.
    Compact { data: Vec<u8> },
    /// Raw data at one address; `UNDEFINED_ADDRESS` when never allocated.
    Contiguous { address: u64, size: u64 },
    Chunked {
        /// Chunk shape in elements, one entry per dataset dimension.
        chunk_dims: Vec<u64>,
        /// Element size recorded in the trailing chunk dimension.
        element_size: u32,
        index: ChunkIndex,
    },
}

impl DataLayout {
    /// Parse a data layout message.
    ///
    /// `offset_size` and `length_size` come from the superblock.
    pub fn parse(data: &[u8], offset_size: u8, length_size: u8) -> Result<DataLayout, FormatError> {
        ensure_len(data, 0, 2)?;
        match data[0] {
            1 | 2 => Self::parse_v1v2(data, offset_size),
            3 | 4 => Self::parse_v3v4(data, offset_size, length_size),
            v => Err(FormatError::InvalidMessageVersion {
                message: "data layout",
                version: v,
            }),
        }
    }

    fn parse_v1v2(data: &[u8], offset_size: u8) -> Result<DataLayout, FormatError> {
        // version(1) dimensionality(1) class(1) reserved(5)
        ensure_len(data, 0, 8)?;
        let ndims = data[1] as usize;
        let class = data[2];
        let mut pos = 8;

        let address = if class != 0 {
            let a = read_address(data, pos, offset_size)?;
            pos += offset_size as usize;
            a
        } else {
            UNDEFINED_ADDRESS
        };

        ensure_len(data, pos, 4 * ndims)?;
        let mut dims = Vec::with_capacity(ndims);
        for _ in 0..ndims {
            dims.push(read_u32(data, pos)? as u64);
            pos += 4;
        }

        match class {
            0 => {
                let size = read_u32(data, pos)? as usize;
                ensure_len(data, pos + 4, size)?;
                Ok(DataLayout::Compact {
                    data: data[pos + 4..pos + 4 + size].to_vec(),
                })
            }
            1 => Ok(DataLayout::Contiguous {
                address,
                size: dims.iter().product(),
            }),
            2 => {
                let element_size = read_u32(data, pos)?;
                dims.pop();
                Ok(DataLayout::Chunked {
                    chunk_dims: dims,
                    element_size,
                    index: ChunkIndex::BTreeV1 { address },
                })
            }
            c => Err(FormatError::invalid("data layout", format!("layout class {c}"))),
        }
    }

    fn parse_v3v4(data: &[u8], offset_size: u8, length_size: u8) -> Result<DataLayout, FormatError> {
        let version = data[0];
        let class = data[1];
        let pos = 2;
        let os = offset_size as usize;

        match class {
            0 => {
                let size = read_u16(data, pos)? as usize;
                ensure_len(data, pos + 2, size)?;
                Ok(DataLayout::Compact {
                    data: data[pos + 2..pos + 2 + size].to_vec(),
                })
            }
            1 => Ok(DataLayout::Contiguous {
                address: read_address(data, pos, offset_size)?,
                size: read_uint(data, pos + os, length_size)?,
            }),
            2 if version == 3 => {
                ensure_len(data, pos, 1)?;
                let ndims = data[pos] as usize;
                let address = read_address(data, pos + 1, offset_size)?;
                let mut p = pos + 1 + os;
                let mut dims = Vec::with_capacity(ndims);
                for _ in 0..ndims {
                    dims.push(read_u32(data, p)? as u64);
                    p += 4;
                }
                let element_size = dims.pop().ok_or_else(|| {
                    FormatError::invalid("data layout", "chunked layout without dimensions")
                })? as u32;
                Ok(DataLayout::Chunked {
                    chunk_dims: dims,
                    element_size,
                    index: ChunkIndex::BTreeV1 { address },
                })
            }
            2 => Self::parse_v4_chunked(data, offset_size, length_size),
            3 => Err(FormatError::UnsupportedFeature(Feature::VirtualDataset)),
            c => Err(FormatError::invalid("data layout", format!("layout class {c}"))),
        }
    }

    fn parse_v4_chunked(
        data: &[u8],
        offset_size: u8,
        length_size: u8,
    ) -> Result<DataLayout, FormatError> {
        // flags(1) dimensionality(1) dim_width(1) dims... index_type(1) ...
        ensure_len(data, 2, 3)?;
        let flags = data[2];
        let ndims = data[3] as usize;
        let width = data[4];
        if !(1..=8).contains(&width) {
            return Err(FormatError::invalid(
                "data layout",
                format!("chunk dimension width {width}"),
            ));
        }
        let mut p = 5;
        let mut dims = Vec::with_capacity(ndims);
        for _ in 0..ndims {
            dims.push(read_uint(data, p, width)?);
            p += width as usize;
        }
        let element_size = dims
            .pop()
            .ok_or_else(|| FormatError::invalid("data layout", "chunked layout without dimensions"))?
            as u32;

        ensure_len(data, p, 1)?;
        let index_type = data[p];
        p += 1;
        let index = match index_type {
            1 => {
                let filtered = if flags & 0x02 != 0 {
                    let size = read_uint(data, p, length_size)?;
                    let mask = read_u32(data, p + length_size as usize)?;
                    p += length_size as usize + 4;
                    Some((size, mask))
                } else {
                    None
                };
                ChunkIndex::SingleChunk {
                    address: read_address(data, p, offset_size)?,
                    filtered,
                }
            }
            2 => ChunkIndex::Implicit {
                address: read_address(data, p, offset_size)?,
            },
            3 => return Err(FormatError::UnsupportedFeature(Feature::ChunkIndex("fixed array"))),
            4 => {
                return Err(FormatError::UnsupportedFeature(Feature::ChunkIndex(
                    "extensible array",
                )))
            }
            5 => return Err(FormatError::UnsupportedFeature(Feature::ChunkIndex("version 2 B-tree"))),
            t => {
                return Err(FormatError::invalid(
                    "data layout",
                    format!("chunk index type {t}"),
                ))
            }
        };

        Ok(DataLayout::Chunked {
            chunk_dims: dims,
            element_size,
            index,
        })
    }

    /// Serialize as a version 3 message.
    ///
    /// Chunked layouts must use a v1 B-tree index.
    pub fn serialize(&self, offset_size: u8, length_size: u8) -> Result<Vec<u8>, FormatError> {
        let mut buf = vec![3];
        match self {
            DataLayout::Compact { data } => {
                let len = u16::try_from(data.len()).map_err(|_| {
                    FormatError::InvalidOptions(format!(
                        "compact data of {} bytes exceeds 65535",
                        data.len()
                    ))
                })?;
                buf.push(0);
                buf.extend_from_slice(&len.to_le_bytes());
                buf.extend_from_slice(data);
            }
            DataLayout::Contiguous { address, size } => {
                buf.push(1);
                write_uint(&mut buf, *address, offset_size);
                write_uint(&mut buf, *size, length_size);
            }
            DataLayout::Chunked {
                chunk_dims,
                element_size,
                index: ChunkIndex::BTreeV1 { address },
            } => {
                buf.push(2);
                buf.push(chunk_dims.len() as u8 + 1);
                write_uint(&mut buf, *address, offset_size);
                for d in chunk_dims {
                    buf.extend_from_slice(&(*d as u32).to_le_bytes());
                }
                buf.extend_from_slice(&element_size.to_le_bytes());
            }
            DataLayout::Chunked { .. } => {
                return Err(FormatError::InvalidOptions(
                    "only B-tree chunk indexes can be written".into(),
                ))
            }
        }
        Ok(buf)
    }
}
