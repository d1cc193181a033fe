//! HDF5 Filter Pipeline message parsing (message type 0x000B).

use crate::error::FormatError;
use crate::util::{ensure_len, pad_to_8, read_u16, read_u32};

/// Well-known filter IDs.
pub const FILTER_DEFLATE: u16 = 1;
pub const FILTER_SHUFFLE: u16 = 2;
pub const FILTER_FLETCHER32: u16 = 3;
pub const FILTER_SZIP: u16 = 4;
pub const FILTER_NBIT: u16 = 5;
pub const FILTER_SCALEOFFSET: u16 = 6;
/// Registered third-party LZF filter.
pub const FILTER_LZF: u16 = 32000;

/// Filter flag bit: failure to apply is not an error.
pub const FLAG_OPTIONAL: u16 = 0x0001;

/// One filter in a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterDescription {
    pub filter_id: u16,
    pub name: Option<String>,
    pub flags: u16,
    pub client_data: Vec<u32>,
}

impl FilterDescription {
    pub fn new(filter_id: u16, client_data: Vec<u32>) -> Self {
        FilterDescription {
            filter_id,
            name: None,
            flags: 0,
            client_data,
        }
    }

    pub fn optional(mut self) -> Self {
        self.flags |= FLAG_OPTIONAL;
        self
    }

    pub fn is_optional(&self) -> bool {
        self.flags & FLAG_OPTIONAL != 0
    }
}

/// Ordered filters applied to every chunk on write, reversed on read.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FilterPipeline {
    pub filters: Vec<FilterDescription>,
}

fn name_from(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

impl FilterPipeline {
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn parse(data: &[u8]) -> Result<FilterPipeline, FormatError> {
        ensure_len(data, 0, 2)?;
        let count = data[1] as usize;
        if count > 32 {
            return Err(FormatError::invalid(
                "filter pipeline",
                format!("{count} filters"),
            ));
        }
        match data[0] {
            1 => Self::parse_v1(data, count),
            2 => Self::parse_v2(data, count),
            v => Err(FormatError::InvalidMessageVersion {
                message: "filter pipeline",
                version: v,
            }),
        }
    }

    fn parse_v1(data: &[u8], count: usize) -> Result<FilterPipeline, FormatError> {
        // version(1) nfilters(1) reserved(6)
        ensure_len(data, 0, 8)?;
        let mut pos = 8;
        let mut filters = Vec::with_capacity(count);

        for _ in 0..count {
            let filter_id = read_u16(data, pos)?;
            let name_length = read_u16(data, pos + 2)? as usize;
            let flags = read_u16(data, pos + 4)?;
            let ncd = read_u16(data, pos + 6)? as usize;
            pos += 8;

            let name = if name_length > 0 {
                ensure_len(data, pos, name_length)?;
                let n = name_from(&data[pos..pos + name_length]);
                pos += pad_to_8(name_length);
                Some(n)
            } else {
                None
            };

            let client_data = Self::client_data(data, &mut pos, ncd)?;
            if ncd % 2 != 0 {
                pos += 4;
            }

            filters.push(FilterDescription {
                filter_id,
                name,
                flags,
                client_data,
            });
        }

        Ok(FilterPipeline { filters })
    }

    fn parse_v2(data: &[u8], count: usize) -> Result<FilterPipeline, FormatError> {
        let mut pos = 2;
        let mut filters = Vec::with_capacity(count);

        for _ in 0..count {
            let filter_id = read_u16(data, pos)?;
            pos += 2;
            // IDs below 256 carry no name length
            let name_length = if filter_id >= 256 {
                let n = read_u16(data, pos)? as usize;
                pos += 2;
                n
            } else {
                0
            };
            let flags = read_u16(data, pos)?;
            let ncd = read_u16(data, pos + 2)? as usize;
            pos += 4;

            let name = if name_length > 0 {
                ensure_len(data, pos, name_length)?;
                let n = name_from(&data[pos..pos + name_length]);
                pos += name_length;
                Some(n)
            } else {
                None
            };

            let client_data = Self::client_data(data, &mut pos, ncd)?;
            filters.push(FilterDescription {
                filter_id,
                name,
                flags,
                client_data,
            });
        }

        Ok(FilterPipeline { filters })
    }

    fn client_data(data: &[u8], pos: &mut usize, n: usize) -> Result<Vec<u32>, FormatError> {
        ensure_len(data, *pos, n * 4)?;
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(read_u32(data, *pos)?);
            *pos += 4;
        }
        Ok(out)
    }

    /// Serialize as a version 1 message.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = vec![1, self.filters.len() as u8, 0, 0, 0, 0, 0, 0];

        for f in &self.filters {
            let name_bytes = match &f.name {
                Some(name) => {
                    let mut nb = name.as_bytes().to_vec();
                    nb.push(0);
                    nb
                }
                None => Vec::new(),
            };
            buf.extend_from_slice(&f.filter_id.to_le_bytes());
            buf.extend_from_slice(&(pad_to_8(name_bytes.len()) as u16).to_le_bytes());
            buf.extend_from_slice(&f.flags.to_le_bytes());
            buf.extend_from_slice(&(f.client_data.len() as u16).to_le_bytes());

            if !name_bytes.is_empty() {
                let padded = pad_to_8(name_bytes.len());
                buf.extend_from_slice(&name_bytes);
                buf.resize(buf.len() + padded - name_bytes.len(), 0);
            }
            for v in &f.client_data {
                buf.extend_from_slice(&v.to_le_bytes());
            }
            if f.client_data.len() % 2 != 0 {
                buf.extend_from_slice(&[0; 4]);
            }
        }
        buf
    }
}
