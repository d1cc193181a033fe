//! HDF5 Dataspace message (type 0x0001).

use crate::error::FormatError;
use crate::util::{ensure_len, read_uint, write_uint};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataspaceType {
    Scalar,
    Simple,
    Null,
}

/// Shape of a dataset or attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataspace {
    pub space_type: DataspaceType,
    pub dims: Vec<u64>,
    /// Maximum dimensions; `u64::MAX` marks an unlimited dimension.
    pub max_dims: Option<Vec<u64>>,
}

impl Dataspace {
    pub fn scalar() -> Self {
        Dataspace {
            space_type: DataspaceType::Scalar,
            dims: Vec::new(),
            max_dims: None,
        }
    }

    pub fn simple(dims: &[u64]) -> Self {
        Dataspace {
            space_type: DataspaceType::Simple,
            dims: dims.to_vec(),
            max_dims: None,
        }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Number of elements. Scalars hold one, null dataspaces none.
    pub fn num_elements(&self) -> u64 {
        match self.space_type {
            DataspaceType::Scalar => 1,
            DataspaceType::Null => 0,
            DataspaceType::Simple => self.dims.iter().product(),
        }
    }

    pub fn parse(data: &[u8], length_size: u8) -> Result<Dataspace, FormatError> {
        ensure_len(data, 0, 4)?;
        let version = data[0];
        let rank = data[1] as usize;
        let flags = data[2];

        let (space_type, mut pos) = match version {
            1 => {
                let t = if rank == 0 {
                    DataspaceType::Scalar
                } else {
                    DataspaceType::Simple
                };
                (t, 8)
            }
            2 => {
                let t = match data[3] {
                    0 => DataspaceType::Scalar,
                    1 => DataspaceType::Simple,
                    2 => DataspaceType::Null,
                    other => {
                        return Err(FormatError::InvalidDataspace(format!(
                            "dataspace type {other}"
                        )))
                    }
                };
                (t, 4)
            }
            v => {
                return Err(FormatError::InvalidMessageVersion {
                    message: "dataspace",
                    version: v,
                })
            }
        };
        if rank > 32 {
            return Err(FormatError::InvalidDataspace(format!("rank {rank}")));
        }

        let ls = length_size as usize;
        let mut dims = Vec::with_capacity(rank);
        for _ in 0..rank {
            dims.push(read_uint(data, pos, length_size)?);
            pos += ls;
        }

        let max_dims = if flags & 0x01 != 0 {
            let mut m = Vec::with_capacity(rank);
            for _ in 0..rank {
                let v = read_uint(data, pos, length_size)?;
                m.push(if crate::util::is_undefined(v, length_size) {
                    u64::MAX
                } else {
                    v
                });
                pos += ls;
            }
            Some(m)
        } else {
            None
        };

        if let Some(m) = &max_dims {
            if let Some(i) = (0..rank).find(|&i| m[i] < dims[i]) {
                return Err(FormatError::InvalidDataspace(format!(
                    "dimension {i} is {} but its maximum is {}",
                    dims[i], m[i]
                )));
            }
        }

        Ok(Dataspace {
            space_type,
            dims,
            max_dims,
        })
    }

    /// Serialize the message; version 1 except for null dataspaces.
    pub fn serialize(&self, length_size: u8) -> Vec<u8> {
        let mut buf = Vec::new();
        let flags = u8::from(self.max_dims.is_some());
        match self.space_type {
            DataspaceType::Null => {
                buf.extend_from_slice(&[2, 0, 0, 2]);
                return buf;
            }
            _ => {
                buf.extend_from_slice(&[1, self.dims.len() as u8, flags, 0]);
                buf.extend_from_slice(&[0; 4]);
            }
        }
        for d in &self.dims {
            write_uint(&mut buf, *d, length_size);
        }
        if let Some(m) = &self.max_dims {
            for d in m {
                write_uint(&mut buf, *d, length_size);
            }
        }
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_roundtrip() {
        let mut ds = Dataspace::simple(&[10, 20]);
        ds.max_dims = Some(vec![10, u64::MAX]);
        let parsed = Dataspace::parse(&ds.serialize(8), 8).unwrap();
        assert_eq!(parsed, ds);
        assert_eq!(parsed.num_elements(), 200);
    }

    #[test]
    fn scalar_and_null() {
        let s = Dataspace::parse(&Dataspace::scalar().serialize(8), 8).unwrap();
        assert_eq!(s.space_type, DataspaceType::Scalar);
        assert_eq!(s.num_elements(), 1);

        let null = Dataspace {
            space_type: DataspaceType::Null,
            dims: vec![],
            max_dims: None,
        };
        let n = Dataspace::parse(&null.serialize(8), 8).unwrap();
        assert_eq!(n.num_elements(), 0);
    }

    #[test]
    fn parse_v2_simple() {
        let mut data = vec![2, 1, 0, 1];
        data.extend_from_slice(&5u64.to_le_bytes());
        let ds = Dataspace::parse(&data, 8).unwrap();
        assert_eq!(ds.dims, vec![5]);
    }

    #[test]
    fn four_byte_lengths() {
        let ds = Dataspace::simple(&[3, 4]);
        assert_eq!(Dataspace::parse(&ds.serialize(4), 4).unwrap(), ds);
    }

    #[test]
    fn max_smaller_than_current_is_rejected() {
        let mut ds = Dataspace::simple(&[10]);
        ds.max_dims = Some(vec![5]);
        assert!(matches!(
            Dataspace::parse(&ds.serialize(8), 8),
            Err(FormatError::InvalidDataspace(_))
        ));
    }

    #[test]
    fn bad_version_and_truncation() {
        assert!(matches!(
            Dataspace::parse(&[9, 0, 0, 0], 8),
            Err(FormatError::InvalidMessageVersion { .. })
        ));
        assert!(Dataspace::parse(&[1, 2, 0, 0, 0, 0, 0, 0, 1], 8).is_err());
    }
}
