//! Link messages (type 0x0006) and the Link Info message (type 0x0002)
//! of compact, link-message based groups.

use crate::datatype::CharacterSet;
use crate::error::{Feature, FormatError};
use crate::util::{ensure_len, read_address, read_u16, read_u64, read_uint, write_uint, UNDEFINED_ADDRESS};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkTarget {
    Hard { address: u64 },
    Soft { path: String },
    External { file: String, path: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub name: String,
    pub target: LinkTarget,
    pub creation_order: Option<u64>,
    pub charset: CharacterSet,
}

fn text(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

impl Link {
    pub fn hard(name: &str, address: u64) -> Self {
        Link {
            name: name.to_string(),
            target: LinkTarget::Hard { address },
            creation_order: None,
            charset: CharacterSet::Utf8,
        }
    }

    pub fn soft(name: &str, path: &str) -> Self {
        Link {
            name: name.to_string(),
            target: LinkTarget::Soft {
                path: path.to_string(),
            },
            creation_order: None,
            charset: CharacterSet::Utf8,
        }
    }

    pub fn parse(data: &[u8], offset_size: u8) -> Result<Link, FormatError> {
        ensure_len(data, 0, 2)?;
        if data[0] != 1 {
            return Err(FormatError::InvalidMessageVersion {
                message: "link",
                version: data[0],
            });
        }
        let flags = data[1];
        let mut pos = 2;

        let link_type = if flags & 0x08 != 0 {
            ensure_len(data, pos, 1)?;
            pos += 1;
            data[pos - 1]
        } else {
            0
        };
        let creation_order = if flags & 0x04 != 0 {
            pos += 8;
            Some(read_u64(data, pos - 8)?)
        } else {
            None
        };
        let charset = if flags & 0x10 != 0 {
            ensure_len(data, pos, 1)?;
            pos += 1;
            if data[pos - 1] == 1 {
                CharacterSet::Utf8
            } else {
                CharacterSet::Ascii
            }
        } else {
            CharacterSet::Ascii
        };

        let width = 1u8 << (flags & 0x03);
        let name_len = read_uint(data, pos, width)? as usize;
        pos += width as usize;
        ensure_len(data, pos, name_len)?;
        let name = String::from_utf8_lossy(&data[pos..pos + name_len]).into_owned();
        pos += name_len;

        let target = match link_type {
            0 => LinkTarget::Hard {
                address: read_address(data, pos, offset_size)?,
            },
            1 => {
                let len = read_u16(data, pos)? as usize;
                ensure_len(data, pos + 2, len)?;
                LinkTarget::Soft {
                    path: text(&data[pos + 2..pos + 2 + len]),
                }
            }
            64 => {
                let len = read_u16(data, pos)? as usize;
                ensure_len(data, pos + 2, len)?;
                let info = &data[pos + 2..pos + 2 + len];
                // flags byte, file name, object path
                let rest = info.get(1..).unwrap_or_default();
                let split = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
                LinkTarget::External {
                    file: text(&rest[..split]),
                    path: text(rest.get(split + 1..).unwrap_or_default()),
                }
            }
            t => {
                return Err(FormatError::invalid("link", format!("link type {t}")));
            }
        };

        Ok(Link {
            name,
            target,
            creation_order,
            charset,
        })
    }

    pub fn serialize(&self, offset_size: u8) -> Vec<u8> {
        let name = self.name.as_bytes();
        let (size_bits, width) = match name.len() {
            0..=0xFF => (0u8, 1u8),
            0x100..=0xFFFF => (1, 2),
            _ => (2, 4),
        };
        let mut flags = size_bits;
        if !matches!(self.target, LinkTarget::Hard { .. }) {
            flags |= 0x08;
        }
        if self.creation_order.is_some() {
            flags |= 0x04;
        }
        if self.charset == CharacterSet::Utf8 {
            flags |= 0x10;
        }

        let mut buf = vec![1, flags];
        match self.target {
            LinkTarget::Hard { .. } => {}
            LinkTarget::Soft { .. } => buf.push(1),
            LinkTarget::External { .. } => buf.push(64),
        }
        if let Some(co) = self.creation_order {
            buf.extend_from_slice(&co.to_le_bytes());
        }
        if self.charset == CharacterSet::Utf8 {
            buf.push(1);
        }
        write_uint(&mut buf, name.len() as u64, width);
        buf.extend_from_slice(name);

        match &self.target {
            LinkTarget::Hard { address } => write_uint(&mut buf, *address, offset_size),
            LinkTarget::Soft { path } => {
                buf.extend_from_slice(&(path.len() as u16).to_le_bytes());
                buf.extend_from_slice(path.as_bytes());
            }
            LinkTarget::External { file, path } => {
                let mut info = vec![0u8];
                info.extend_from_slice(file.as_bytes());
                info.push(0);
                info.extend_from_slice(path.as_bytes());
                info.push(0);
                buf.extend_from_slice(&(info.len() as u16).to_le_bytes());
                buf.extend_from_slice(&info);
            }
        }
        buf
    }
}

/// Link Info message. A defined fractal heap address means dense storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub max_creation_order: Option<u64>,
    pub fractal_heap_address: u64,
    pub name_index_address: u64,
}

impl LinkInfo {
    pub fn parse(data: &[u8], offset_size: u8) -> Result<LinkInfo, FormatError> {
        ensure_len(data, 0, 2)?;
        if data[0] != 0 {
            return Err(FormatError::InvalidMessageVersion {
                message: "link info",
                version: data[0],
            });
        }
        let flags = data[1];
        let mut pos = 2;
        let max_creation_order = if flags & 0x01 != 0 {
            pos += 8;
            Some(read_u64(data, pos - 8)?)
        } else {
            None
        };
        let fractal_heap_address = read_address(data, pos, offset_size)?;
        let name_index_address = read_address(data, pos + offset_size as usize, offset_size)?;
        Ok(LinkInfo {
            max_creation_order,
            fractal_heap_address,
            name_index_address,
        })
    }

    pub fn is_dense(&self) -> bool {
        self.fractal_heap_address != UNDEFINED_ADDRESS
    }

    /// Fails for groups whose links live in a fractal heap.
    pub fn require_compact(&self) -> Result<(), FormatError> {
        if self.is_dense() {
            return Err(FormatError::UnsupportedFeature(Feature::DenseLinks));
        }
        Ok(())
    }
}
