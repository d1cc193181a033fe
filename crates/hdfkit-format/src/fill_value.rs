//! Fill value messages: the old form (type 0x0004) and the current one (type 0x0005).

use crate::error::FormatError;
use crate::util::{ensure_len, read_u32};

/// When storage for a dataset is allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocTime {
    Default,
    Early,
    Late,
    Incremental,
}

impl AllocTime {
    fn from_bits(v: u8) -> Self {
        match v & 0x03 {
            1 => AllocTime::Early,
            2 => AllocTime::Late,
            3 => AllocTime::Incremental,
            _ => AllocTime::Default,
        }
    }

    fn bits(self) -> u8 {
        match self {
            AllocTime::Default => 0,
            AllocTime::Early => 1,
            AllocTime::Late => 2,
            AllocTime::Incremental => 3,
        }
    }
}

/// Fill value for unwritten elements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FillValue {
    pub alloc_time: AllocTime,
    /// Raw element bytes, when a fill value is defined.
    pub value: Option<Vec<u8>>,
}

impl Default for FillValue {
    fn default() -> Self {
        FillValue {
            alloc_time: AllocTime::Default,
            value: None,
        }
    }
}

impl FillValue {
    /// Parse a type 0x0005 message (versions 1–3).
    pub fn parse(data: &[u8]) -> Result<FillValue, FormatError> {
        ensure_len(data, 0, 1)?;
        match data[0] {
            1 | 2 => {
                ensure_len(data, 0, 4)?;
                let alloc_time = AllocTime::from_bits(data[1]);
                let defined = data[3] != 0;
                let value = if data[0] == 1 || defined {
                    Self::read_value(data, 4)?
                } else {
                    None
                };
                Ok(FillValue {
                    alloc_time,
                    value: if defined { value } else { None },
                })
            }
            3 => {
                ensure_len(data, 0, 2)?;
                let flags = data[1];
                let alloc_time = AllocTime::from_bits(flags);
                let value = if flags & 0x20 != 0 {
                    Self::read_value(data, 2)?
                } else {
                    None
                };
                Ok(FillValue { alloc_time, value })
            }
            v => Err(FormatError::InvalidMessageVersion {
                message: "fill value",
                version: v,
            }),
        }
    }

    /// Parse the old fill value message (type 0x0004): size + bytes.
    pub fn parse_old(data: &[u8]) -> Result<FillValue, FormatError> {
        Ok(FillValue {
            alloc_time: AllocTime::Default,
            value: Self::read_value(data, 0)?,
        })
    }

    fn read_value(data: &[u8], pos: usize) -> Result<Option<Vec<u8>>, FormatError> {
        let size = read_u32(data, pos)? as usize;
        if size == 0 {
            return Ok(None);
        }
        ensure_len(data, pos + 4, size)?;
        Ok(Some(data[pos + 4..pos + 4 + size].to_vec()))
    }

    /// Serialize as a version 2 message with fill time "if set".
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = vec![2, self.alloc_time.bits(), 2, u8::from(self.value.is_some())];
        if let Some(v) = &self.value {
            buf.extend_from_slice(&(v.len() as u32).to_le_bytes());
            buf.extend_from_slice(v);
        }
        buf
    }

    /// Bytes for one element of `element_size`, falling back to zeros.
    pub fn element_bytes(&self, element_size: usize) -> Vec<u8> {
        match &self.value {
            Some(v) if v.len() == element_size => v.clone(),
            _ => vec![0; element_size],
        }
    }
}
