//! HDF5 Attribute message parsing (message type 0x000C).

use crate::dataspace::Dataspace;
use crate::datatype::Datatype;
use crate::error::FormatError;
use crate::util::{ensure_len, pad_to_8, read_u16};
use crate::value::{decode_all, HeapReader, Value};

/// Resolves a datatype stored as a shared message.
pub type SharedDatatypeResolver<'a> = &'a dyn Fn(&[u8]) -> Result<Datatype, FormatError>;

/// An attribute with its value still in raw element bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeMessage {
    pub name: String,
    pub datatype: Datatype,
    pub dataspace: Dataspace,
    pub raw_data: Vec<u8>,
}

fn name_from(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

impl AttributeMessage {
    /// Parse versions 1 to 3. v1 pads each field to 8 bytes; v2 and v3 do not.
    pub fn parse(
        data: &[u8],
        length_size: u8,
        shared: SharedDatatypeResolver<'_>,
    ) -> Result<AttributeMessage, FormatError> {
        ensure_len(data, 0, 8)?;
        let version = data[0];
        let flags = data[1];
        let name_size = read_u16(data, 2)? as usize;
        let dt_size = read_u16(data, 4)? as usize;
        let ds_size = read_u16(data, 6)? as usize;

        let (mut pos, pad): (usize, fn(usize) -> usize) = match version {
            1 => (8, pad_to_8),
            2 => (8, |n| n),
            3 => (9, |n| n),
            v => {
                return Err(FormatError::InvalidMessageVersion {
                    message: "attribute",
                    version: v,
                })
            }
        };
        if version >= 2 && flags & 0x02 != 0 {
            return Err(FormatError::UnsupportedFeature(
                crate::error::Feature::SharedMessageHeap,
            ));
        }

        ensure_len(data, pos, name_size)?;
        let name = name_from(&data[pos..pos + name_size]);
        pos += pad(name_size);

        ensure_len(data, pos, dt_size)?;
        let dt_bytes = &data[pos..pos + dt_size];
        let datatype = if version >= 2 && flags & 0x01 != 0 {
            shared(dt_bytes)?
        } else {
            Datatype::parse(dt_bytes)?.0
        };
        pos += pad(dt_size);

        ensure_len(data, pos, ds_size)?;
        let dataspace = Dataspace::parse(&data[pos..pos + ds_size], length_size)?;
        pos += pad(ds_size);

        let raw_len = (dataspace.num_elements() as usize)
            .checked_mul(datatype.size() as usize)
            .ok_or_else(|| FormatError::invalid("attribute", "value size overflows"))?;
        ensure_len(data, pos, raw_len)?;

        Ok(AttributeMessage {
            name,
            datatype,
            dataspace,
            raw_data: data[pos..pos + raw_len].to_vec(),
        })
    }

    /// Decode the attribute's elements.
    pub fn values(&self, heap: &dyn HeapReader) -> Result<Vec<Value>, FormatError> {
        if self.raw_data.is_empty() {
            return Ok(Vec::new());
        }
        decode_all(&self.raw_data, &self.datatype, heap)
    }

    /// Serialize as a version 1 message.
    pub fn serialize(&self, length_size: u8) -> Vec<u8> {
        let mut name = self.name.as_bytes().to_vec();
        name.push(0);
        let dt = self.datatype.encode();
        let ds = self.dataspace.serialize(length_size);

        let mut buf = vec![1, 0];
        buf.extend_from_slice(&(name.len() as u16).to_le_bytes());
        buf.extend_from_slice(&(dt.len() as u16).to_le_bytes());
        buf.extend_from_slice(&(ds.len() as u16).to_le_bytes());
        for field in [&name, &dt, &ds] {
            buf.extend_from_slice(field);
            buf.resize(buf.len() + pad_to_8(field.len()) - field.len(), 0);
        }
        buf.extend_from_slice(&self.raw_data);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::NoHeap;

    fn no_shared(_: &[u8]) -> Result<Datatype, FormatError> {
        Err(FormatError::invalid("attribute", "unexpected shared datatype"))
    }

    #[test]
    fn v1_roundtrip() {
        let attr = AttributeMessage {
            name: "units".into(),
            datatype: Datatype::i32(),
            dataspace: Dataspace::simple(&[3]),
            raw_data: [1i32, -2, 3].iter().flat_map(|v| v.to_le_bytes()).collect(),
        };
        let bytes = attr.serialize(8);
        let parsed = AttributeMessage::parse(&bytes, 8, &no_shared).unwrap();
        assert_eq!(parsed, attr);
        assert_eq!(
            parsed.values(&NoHeap).unwrap(),
            vec![Value::Int(1), Value::Int(-2), Value::Int(3)]
        );
    }

    #[test]
    fn v3_unpadded_scalar() {
        let dt = Datatype::f64().encode();
        let ds = Dataspace::scalar().serialize(8);
        let mut data = vec![3u8, 0];
        data.extend_from_slice(&3u16.to_le_bytes());
        data.extend_from_slice(&(dt.len() as u16).to_le_bytes());
        data.extend_from_slice(&(ds.len() as u16).to_le_bytes());
        data.push(1);
        data.extend_from_slice(b"pi\0");
        data.extend_from_slice(&dt);
        data.extend_from_slice(&ds);
        data.extend_from_slice(&std::f64::consts::PI.to_le_bytes());

        let attr = AttributeMessage::parse(&data, 8, &no_shared).unwrap();
        assert_eq!(attr.name, "pi");
        assert_eq!(
            attr.values(&NoHeap).unwrap(),
            vec![Value::Float(std::f64::consts::PI)]
        );
    }

    #[test]
    fn shared_datatype_goes_through_resolver() {
        let ds = Dataspace::scalar().serialize(8);
        let mut data = vec![2u8, 0x01];
        data.extend_from_slice(&2u16.to_le_bytes());
        data.extend_from_slice(&10u16.to_le_bytes());
        data.extend_from_slice(&(ds.len() as u16).to_le_bytes());
        data.extend_from_slice(b"s\0");
        data.extend_from_slice(&[0u8; 10]);
        data.extend_from_slice(&ds);
        data.push(42);

        let resolve = |_: &[u8]| -> Result<Datatype, FormatError> { Ok(Datatype::u8()) };
        let attr = AttributeMessage::parse(&data, 8, &resolve).unwrap();
        assert_eq!(attr.values(&NoHeap).unwrap(), vec![Value::UInt(42)]);
    }

    #[test]
    fn truncated_value_is_an_error() {
        let attr = AttributeMessage {
            name: "x".into(),
            datatype: Datatype::f64(),
            dataspace: Dataspace::simple(&[4]),
            raw_data: vec![0; 32],
        };
        let mut bytes = attr.serialize(8);
        bytes.truncate(bytes.len() - 1);
        assert!(matches!(
            AttributeMessage::parse(&bytes, 8, &no_shared),
            Err(FormatError::UnexpectedEof { .. })
        ));
    }
}
