//! Typed view of an object header: the message map of a group or dataset.

use std::sync::Arc;

use crate::attribute::AttributeMessage;
use crate::data_layout::DataLayout;
use crate::dataspace::Dataspace;
use crate::datatype::Datatype;
use crate::error::{Feature, FormatError};
use crate::fill_value::FillValue;
use crate::filter_pipeline::FilterPipeline;
use crate::link::{Link, LinkInfo};
use crate::message_type::MessageType;
use crate::object_header::{HeaderMessage, ObjectHeader};
use crate::symbol_table::SymbolTableMessage;
use crate::util::{ensure_len, read_address, read_u16, UNDEFINED_ADDRESS};

/// Source of parsed object headers. The high-level crate caches these.
pub trait HeaderLoader {
    fn load_header(&self, address: u64) -> Result<Arc<ObjectHeader>, FormatError>;
}

/// Parses headers straight from file bytes.
pub struct FileHeaders<'a> {
    pub data: &'a [u8],
    pub offset_size: u8,
    pub length_size: u8,
}

impl HeaderLoader for FileHeaders<'_> {
    fn load_header(&self, address: u64) -> Result<Arc<ObjectHeader>, FormatError> {
        ObjectHeader::parse(self.data, address, self.offset_size, self.length_size).map(Arc::new)
    }
}

/// What an object header describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    Group,
    Dataset,
    /// A named datatype stored as its own object.
    Datatype,
    Unknown,
}

/// Address of the header holding the real payload of a shared message.
pub fn shared_message_address(data: &[u8], offset_size: u8) -> Result<u64, FormatError> {
    ensure_len(data, 0, 2)?;
    let address = match data[0] {
        1 => read_address(data, 8, offset_size)?,
        2 => read_address(data, 2, offset_size)?,
        3 => match data[1] {
            1 => return Err(FormatError::UnsupportedFeature(Feature::SharedMessageHeap)),
            _ => read_address(data, 2, offset_size)?,
        },
        v => {
            return Err(FormatError::InvalidMessageVersion {
                message: "shared message",
                version: v,
            })
        }
    };
    if address == UNDEFINED_ADDRESS {
        return Err(FormatError::invalid("shared message", "undefined target address"));
    }
    Ok(address)
}

/// Payload of `msg`, following a shared-message reference one hop.
fn payload(
    msg: &HeaderMessage,
    headers: &dyn HeaderLoader,
    offset_size: u8,
) -> Result<Vec<u8>, FormatError> {
    if !msg.is_shared() {
        return Ok(msg.data.clone());
    }
    resolve_shared(msg.msg_type, &msg.data, headers, offset_size)
}

fn resolve_shared(
    msg_type: MessageType,
    data: &[u8],
    headers: &dyn HeaderLoader,
    offset_size: u8,
) -> Result<Vec<u8>, FormatError> {
    let address = shared_message_address(data, offset_size)?;
    let target = headers.load_header(address)?;
    match target.find(msg_type) {
        Some(m) if !m.is_shared() => Ok(m.data.clone()),
        Some(_) => Err(FormatError::invalid(
            "shared message",
            format!("target at {address} is itself shared"),
        )),
        None => Err(FormatError::MissingMessage(msg_type)),
    }
}

/// Decoded messages of one object header.
#[derive(Debug, Clone)]
pub struct ObjectMessages {
    pub address: u64,
    pub datatype: Option<Datatype>,
    pub dataspace: Option<Dataspace>,
    pub layout: Option<DataLayout>,
    pub filters: FilterPipeline,
    pub fill_value: FillValue,
    pub attributes: Vec<AttributeMessage>,
    pub symbol_table: Option<SymbolTableMessage>,
    pub link_info: Option<LinkInfo>,
    pub links: Vec<Link>,
}

impl ObjectMessages {
    pub fn decode(
        header: &ObjectHeader,
        headers: &dyn HeaderLoader,
        offset_size: u8,
        length_size: u8,
    ) -> Result<ObjectMessages, FormatError> {
        if header.has(MessageType::ExternalDataFiles) {
            return Err(FormatError::UnsupportedFeature(Feature::ExternalStorage));
        }

        let mut out = ObjectMessages {
            address: header.address,
            datatype: None,
            dataspace: None,
            layout: None,
            filters: FilterPipeline::default(),
            fill_value: FillValue::default(),
            attributes: Vec::new(),
            symbol_table: None,
            link_info: None,
            links: Vec::new(),
        };
        let mut new_fill = false;

        for msg in &header.messages {
            match msg.msg_type {
                MessageType::Datatype => {
                    let bytes = payload(msg, headers, offset_size)?;
                    out.datatype = Some(Datatype::parse(&bytes)?.0);
                }
                MessageType::Dataspace => {
                    let bytes = payload(msg, headers, offset_size)?;
                    out.dataspace = Some(Dataspace::parse(&bytes, length_size)?);
                }
                MessageType::DataLayout => {
                    out.layout = Some(DataLayout::parse(&msg.data, offset_size, length_size)?);
                }
                MessageType::FilterPipeline => {
                    let bytes = payload(msg, headers, offset_size)?;
                    out.filters = FilterPipeline::parse(&bytes)?;
                }
                MessageType::FillValue => {
                    let bytes = payload(msg, headers, offset_size)?;
                    out.fill_value = FillValue::parse(&bytes)?;
                    new_fill = true;
                }
                MessageType::FillValueOld if !new_fill => {
                    out.fill_value = FillValue::parse_old(&msg.data)?;
                }
                MessageType::Attribute => {
                    let resolve = |data: &[u8]| -> Result<Datatype, FormatError> {
                        let bytes = resolve_shared(MessageType::Datatype, data, headers, offset_size)?;
                        Ok(Datatype::parse(&bytes)?.0)
                    };
                    out.attributes
                        .push(AttributeMessage::parse(&msg.data, length_size, &resolve)?);
                }
                MessageType::AttributeInfo => check_attribute_info(&msg.data, offset_size)?,
                MessageType::SymbolTable => {
                    out.symbol_table = Some(SymbolTableMessage::parse(&msg.data, offset_size)?);
                }
                MessageType::LinkInfo => {
                    out.link_info = Some(LinkInfo::parse(&msg.data, offset_size)?);
                }
                MessageType::Link => out.links.push(Link::parse(&msg.data, offset_size)?),
                _ => {}
            }
        }
        Ok(out)
    }

    /// Classify the object by the messages it carries. A dataspace marks a
    /// dataset even without its layout, so the gap surfaces from
    /// [`dataset_parts`](Self::dataset_parts) instead of hiding the object.
    pub fn kind(&self) -> ObjectKind {
        if self.layout.is_some() || self.dataspace.is_some() {
            ObjectKind::Dataset
        } else if self.symbol_table.is_some() || self.link_info.is_some() || !self.links.is_empty() {
            ObjectKind::Group
        } else if self.datatype.is_some() && self.dataspace.is_none() {
            ObjectKind::Datatype
        } else {
            ObjectKind::Unknown
        }
    }

    /// The three messages every dataset must carry.
    pub fn dataset_parts(&self) -> Result<(&Datatype, &Dataspace, &DataLayout), FormatError> {
        Ok((
            self.datatype
                .as_ref()
                .ok_or(FormatError::MissingMessage(MessageType::Datatype))?,
            self.dataspace
                .as_ref()
                .ok_or(FormatError::MissingMessage(MessageType::Dataspace))?,
            self.layout
                .as_ref()
                .ok_or(FormatError::MissingMessage(MessageType::DataLayout))?,
        ))
    }
}

/// Rejects attribute storage in a fractal heap.
fn check_attribute_info(data: &[u8], offset_size: u8) -> Result<(), FormatError> {
    ensure_len(data, 0, 2)?;
    if data[0] != 0 {
        return Err(FormatError::InvalidMessageVersion {
            message: "attribute info",
            version: data[0],
        });
    }
    let pos = if data[1] & 0x01 != 0 {
        read_u16(data, 2)?;
        4
    } else {
        2
    };
    if read_address(data, pos, offset_size)? != UNDEFINED_ADDRESS {
        return Err(FormatError::UnsupportedFeature(Feature::DenseAttributes));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_layout::ChunkIndex;
    use crate::object_header::tests::build_v1_header;

    fn decode_at(file: &[u8], address: u64) -> Result<ObjectMessages, FormatError> {
        let headers = FileHeaders {
            data: file,
            offset_size: 8,
            length_size: 8,
        };
        let header = headers.load_header(address)?;
        ObjectMessages::decode(&header, &headers, 8, 8)
    }

    fn layout() -> Vec<u8> {
        DataLayout::Chunked {
            chunk_dims: vec![2],
            element_size: 4,
            index: ChunkIndex::BTreeV1 { address: 999 },
        }
        .serialize(8, 8)
        .unwrap()
    }

    #[test]
    fn dataset_messages() {
        let file = build_v1_header(&[
            (0x03, Datatype::i32().encode()),
            (0x01, Dataspace::simple(&[4]).serialize(8)),
            (0x08, layout()),
        ]);
        let m = decode_at(&file, 0).unwrap();
        assert_eq!(m.kind(), ObjectKind::Dataset);
        let (dt, ds, _) = m.dataset_parts().unwrap();
        assert_eq!(dt, &Datatype::i32());
        assert_eq!(ds.dims, vec![4]);
        assert!(m.filters.is_empty());
    }

    #[test]
    fn missing_dataspace_is_reported() {
        let file = build_v1_header(&[(0x03, Datatype::i32().encode()), (0x08, layout())]);
        let m = decode_at(&file, 0).unwrap();
        assert_eq!(
            m.dataset_parts().unwrap_err(),
            FormatError::MissingMessage(MessageType::Dataspace)
        );
    }

    #[test]
    fn dataspace_without_layout_is_a_damaged_dataset() {
        let file = build_v1_header(&[
            (0x03, Datatype::i32().encode()),
            (0x01, Dataspace::simple(&[4]).serialize(8)),
        ]);
        let m = decode_at(&file, 0).unwrap();
        assert_eq!(m.kind(), ObjectKind::Dataset);
        assert_eq!(
            m.dataset_parts().unwrap_err(),
            FormatError::MissingMessage(MessageType::DataLayout)
        );
    }

    #[test]
    fn shared_datatype_resolved_from_other_header() {
        // committed datatype header at 0, dataset header after it
        let mut file = build_v1_header(&[(0x03, Datatype::f64().encode())]);
        let dataset_at = file.len() as u64;

        let mut shared = vec![2u8, 0];
        shared.extend_from_slice(&0u64.to_le_bytes());
        let mut dataset = build_v1_header(&[
            (0x03, shared),
            (0x01, Dataspace::simple(&[2]).serialize(8)),
            (0x08, layout()),
        ]);
        // first message flags byte sits at 16 + 4
        dataset[20] = crate::object_header::MSG_FLAG_SHARED;
        file.extend_from_slice(&dataset);

        let m = decode_at(&file, dataset_at).unwrap();
        assert_eq!(m.datatype, Some(Datatype::f64()));
        assert_eq!(decode_at(&file, 0).unwrap().kind(), ObjectKind::Datatype);
    }

    #[test]
    fn external_storage_rejected() {
        let file = build_v1_header(&[(0x07, vec![0; 8])]);
        assert_eq!(
            decode_at(&file, 0).unwrap_err(),
            FormatError::UnsupportedFeature(Feature::ExternalStorage)
        );
    }

    #[test]
    fn dense_attributes_rejected() {
        let mut info = vec![0u8, 0];
        info.extend_from_slice(&0x500u64.to_le_bytes());
        info.extend_from_slice(&u64::MAX.to_le_bytes());
        let file = build_v1_header(&[(0x15, info)]);
        assert_eq!(
            decode_at(&file, 0).unwrap_err(),
            FormatError::UnsupportedFeature(Feature::DenseAttributes)
        );
    }

    #[test]
    fn shared_message_heap_unsupported() {
        let mut data = vec![3u8, 1];
        data.extend_from_slice(&[0; 8]);
        assert_eq!(
            shared_message_address(&data, 8).unwrap_err(),
            FormatError::UnsupportedFeature(Feature::SharedMessageHeap)
        );
    }
}
