//! HDF5 Object Header parsing (v1 and v2).
//!
//! Headers may be split across several chunks linked by continuation
//! messages. The chain is walked with an explicit work queue and a set of
//! visited chunk addresses, so a malformed file whose continuations loop
//! back on themselves fails with [`FormatError::CyclicContinuation`] instead
//! of recursing forever.

use std::collections::{HashSet, VecDeque};

use byteorder::{ByteOrder, LittleEndian};
use tracing::trace;

use crate::checksum;
use crate::error::FormatError;
use crate::message_type::MessageType;
use crate::util::{checked_address, ensure_len, read_uint};

/// OHDR signature for v2 object headers.
const OHDR_SIGNATURE: [u8; 4] = *b"OHDR";

/// OCHK signature for v2 continuation chunks.
const OCHK_SIGNATURE: [u8; 4] = *b"OCHK";

/// Message flag: the payload is a reference to a shared message.
pub const MSG_FLAG_SHARED: u8 = 0x02;

const MSG_FLAG_FAIL_IF_UNKNOWN_WRITE: u8 = 0x08;
const MSG_FLAG_FAIL_IF_UNKNOWN_ALWAYS: u8 = 0x80;

/// A single parsed header message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderMessage {
    pub msg_type: MessageType,
    /// Message flags byte.
    pub flags: u8,
    /// Creation order (v2 only, when tracking is enabled).
    pub creation_order: Option<u16>,
    /// Raw message payload.
    pub data: Vec<u8>,
}

impl HeaderMessage {
    pub fn is_shared(&self) -> bool {
        self.flags & MSG_FLAG_SHARED != 0
    }
}

/// Parsed HDF5 object header.
#[derive(Debug, Clone)]
pub struct ObjectHeader {
    /// Address the header was parsed from.
    pub address: u64,
    /// Header version (1 or 2).
    pub version: u8,
    /// All non-NIL, non-continuation messages from every chunk, in file order.
    pub messages: Vec<HeaderMessage>,
    /// Object reference count (v1 only).
    pub reference_count: Option<u32>,
    /// Object header flags (v2 only; 0 for v1).
    pub flags: u8,
    /// Modification time (v2, when timestamps are stored).
    pub modification_time: Option<u32>,
}

#[derive(Clone, Copy)]
enum Framing {
    V1,
    V2 { creation_order: bool },
}

struct Walk<'a> {
    data: &'a [u8],
    offset_size: u8,
    length_size: u8,
    framing: Framing,
    messages: Vec<HeaderMessage>,
    pending: VecDeque<(u64, u64)>,
}

impl ObjectHeader {
    /// Parse an object header at `address` in `data`.
    ///
    /// `offset_size` and `length_size` come from the superblock.
    pub fn parse(
        data: &[u8],
        address: u64,
        offset_size: u8,
        length_size: u8,
    ) -> Result<ObjectHeader, FormatError> {
        let start = checked_address(data, address)?;
        ensure_len(data, start, 4)?;
        if data[start..start + 4] == OHDR_SIGNATURE {
            Self::parse_v2(data, address, offset_size, length_size)
        } else {
            Self::parse_v1(data, address, offset_size, length_size)
        }
    }

    /// First message of the given type.
    pub fn find(&self, msg_type: MessageType) -> Option<&HeaderMessage> {
        self.messages.iter().find(|m| m.msg_type == msg_type)
    }

    /// All messages of the given type, in header order.
    pub fn find_all(&self, msg_type: MessageType) -> impl Iterator<Item = &HeaderMessage> {
        self.messages.iter().filter(move |m| m.msg_type == msg_type)
    }

    pub fn has(&self, msg_type: MessageType) -> bool {
        self.find(msg_type).is_some()
    }

    fn parse_v1(
        data: &[u8],
        address: u64,
        offset_size: u8,
        length_size: u8,
    ) -> Result<ObjectHeader, FormatError> {
        // version(1) + reserved(1) + num_messages(2) + ref_count(4) + header_size(4),
        // then padding to 16 so messages are 8-byte aligned
        let offset = address as usize;
        ensure_len(data, offset, 16)?;

        let version = data[offset];
        if version != 1 {
            return Err(FormatError::InvalidObjectHeaderSignature { address });
        }
        let reference_count = LittleEndian::read_u32(&data[offset + 4..offset + 8]);
        let header_size = LittleEndian::read_u32(&data[offset + 8..offset + 12]) as usize;

        let msg_start = offset + 16;
        ensure_len(data, msg_start, header_size)?;

        let mut walk = Walk::new(data, offset_size, length_size, Framing::V1);
        walk.messages_in(msg_start, msg_start + header_size)?;
        walk.follow_continuations(address)?;

        Ok(ObjectHeader {
            address,
            version: 1,
            messages: walk.messages,
            reference_count: Some(reference_count),
            flags: 0,
            modification_time: None,
        })
    }

    fn parse_v2(
        data: &[u8],
        address: u64,
        offset_size: u8,
        length_size: u8,
    ) -> Result<ObjectHeader, FormatError> {
        let offset = address as usize;
        ensure_len(data, offset, 6)?;

        let version = data[offset + 4];
        if version != 2 {
            return Err(FormatError::InvalidObjectHeaderVersion(version));
        }
        let flags = data[offset + 5];
        let mut pos = offset + 6;

        let mut modification_time = None;
        if flags & 0x20 != 0 {
            // access, modification, change, birth
            ensure_len(data, pos, 16)?;
            modification_time = Some(LittleEndian::read_u32(&data[pos + 4..pos + 8]));
            pos += 16;
        }
        if flags & 0x10 != 0 {
            // max compact / min dense attribute counts
            pos += 4;
        }

        let width = 1u8 << (flags & 0x03);
        let chunk0_size = read_uint(data, pos, width)? as usize;
        pos += width as usize;

        let msg_end = pos
            .checked_add(chunk0_size)
            .ok_or(FormatError::AddressOutOfBounds {
                address,
                len: data.len(),
            })?;
        ensure_len(data, msg_end, 4)?;
        checksum::verify_trailing("object header", &data[offset..msg_end + 4])?;

        let framing = Framing::V2 {
            creation_order: flags & 0x04 != 0,
        };
        let mut walk = Walk::new(data, offset_size, length_size, framing);
        walk.messages_in(pos, msg_end)?;
        walk.follow_continuations(address)?;

        Ok(ObjectHeader {
            address,
            version: 2,
            messages: walk.messages,
            reference_count: None,
            flags,
            modification_time,
        })
    }
}

impl<'a> Walk<'a> {
    fn new(data: &'a [u8], offset_size: u8, length_size: u8, framing: Framing) -> Self {
        Walk {
            data,
            offset_size,
            length_size,
            framing,
            messages: Vec::new(),
            pending: VecDeque::new(),
        }
    }

    fn follow_continuations(&mut self, header_address: u64) -> Result<(), FormatError> {
        let mut visited = HashSet::new();
        visited.insert(header_address);

        while let Some((address, length)) = self.pending.pop_front() {
            if !visited.insert(address) {
                return Err(FormatError::CyclicContinuation { address });
            }
            trace!(header_address, address, length, "following header continuation");

            let start = checked_address(self.data, address)?;
            let len = length as usize;
            ensure_len(self.data, start, len)?;

            match self.framing {
                Framing::V1 => self.messages_in(start, start + len)?,
                Framing::V2 { .. } => {
                    if len < 8 || self.data[start..start + 4] != OCHK_SIGNATURE {
                        return Err(FormatError::InvalidObjectHeaderSignature { address });
                    }
                    let chunk = &self.data[start..start + len];
                    checksum::verify_trailing("object header continuation", chunk)?;
                    self.messages_in(start + 4, start + len - 4)?;
                }
            }
        }
        Ok(())
    }

    fn messages_in(&mut self, start: usize, end: usize) -> Result<(), FormatError> {
        let data = self.data;
        let header_len = match self.framing {
            Framing::V1 => 8,
            Framing::V2 { creation_order } => {
                if creation_order {
                    6
                } else {
                    4
                }
            }
        };

        let mut pos = start;
        while pos + header_len <= end {
            let (raw_type, size, flags, creation_order) = match self.framing {
                Framing::V1 => (
                    LittleEndian::read_u16(&data[pos..pos + 2]),
                    LittleEndian::read_u16(&data[pos + 2..pos + 4]) as usize,
                    data[pos + 4],
                    None,
                ),
                Framing::V2 { creation_order } => (
                    data[pos] as u16,
                    LittleEndian::read_u16(&data[pos + 1..pos + 3]) as usize,
                    data[pos + 3],
                    creation_order.then(|| LittleEndian::read_u16(&data[pos + 4..pos + 6])),
                ),
            };
            pos += header_len;

            if pos + size > end {
                return Err(FormatError::invalid(
                    "object header",
                    format!("message of {size} bytes overruns its chunk"),
                ));
            }
            let payload = &data[pos..pos + size];
            pos += size;

            let msg_type = MessageType::from_u16(raw_type);
            match msg_type {
                MessageType::Nil => {}
                MessageType::Continuation => {
                    let address = read_uint(payload, 0, self.offset_size)?;
                    let length =
                        read_uint(payload, self.offset_size as usize, self.length_size)?;
                    self.pending.push_back((address, length));
                }
                MessageType::Unknown(id)
                    if flags & (MSG_FLAG_FAIL_IF_UNKNOWN_WRITE | MSG_FLAG_FAIL_IF_UNKNOWN_ALWAYS)
                        != 0 =>
                {
                    return Err(FormatError::UnsupportedMessage(id));
                }
                _ => self.messages.push(HeaderMessage {
                    msg_type,
                    flags,
                    creation_order,
                    data: payload.to_vec(),
                }),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::checksum::jenkins_lookup3;

    /// Build a v1 header at `data[at..]` holding `msgs` (type, payload).
    pub(crate) fn build_v1_header(msgs: &[(u16, Vec<u8>)]) -> Vec<u8> {
        let mut body = Vec::new();
        for (ty, payload) in msgs {
            let padded = (payload.len() + 7) & !7;
            body.extend_from_slice(&ty.to_le_bytes());
            body.extend_from_slice(&(padded as u16).to_le_bytes());
            body.extend_from_slice(&[0, 0, 0, 0]);
            body.extend_from_slice(payload);
            body.resize(body.len() + padded - payload.len(), 0);
        }
        let mut buf = vec![1, 0];
        buf.extend_from_slice(&(msgs.len() as u16).to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&(body.len() as u32).to_le_bytes());
        buf.extend_from_slice(&[0; 4]);
        buf.extend_from_slice(&body);
        buf
    }

    fn build_v2_header(flags: u8, msgs: &[(u8, Vec<u8>)]) -> Vec<u8> {
        let mut body = Vec::new();
        for (i, (ty, payload)) in msgs.iter().enumerate() {
            body.push(*ty);
            body.extend_from_slice(&(payload.len() as u16).to_le_bytes());
            body.push(0);
            if flags & 0x04 != 0 {
                body.extend_from_slice(&(i as u16).to_le_bytes());
            }
            body.extend_from_slice(payload);
        }
        let mut buf = b"OHDR".to_vec();
        buf.push(2);
        buf.push(flags);
        if flags & 0x20 != 0 {
            for t in [10u32, 20, 30, 40] {
                buf.extend_from_slice(&t.to_le_bytes());
            }
        }
        match flags & 0x03 {
            0 => buf.push(body.len() as u8),
            1 => buf.extend_from_slice(&(body.len() as u16).to_le_bytes()),
            _ => buf.extend_from_slice(&(body.len() as u32).to_le_bytes()),
        }
        buf.extend_from_slice(&body);
        let sum = jenkins_lookup3(&buf);
        buf.extend_from_slice(&sum.to_le_bytes());
        buf
    }

    fn continuation_payload(address: u64, length: u64) -> Vec<u8> {
        let mut p = address.to_le_bytes().to_vec();
        p.extend_from_slice(&length.to_le_bytes());
        p
    }

    #[test]
    fn parse_v1_zero_messages() {
        let data = build_v1_header(&[]);
        let hdr = ObjectHeader::parse(&data, 0, 8, 8).unwrap();
        assert_eq!(hdr.version, 1);
        assert!(hdr.messages.is_empty());
        assert_eq!(hdr.reference_count, Some(1));
    }

    #[test]
    fn parse_v1_two_messages() {
        let data = build_v1_header(&[(0x0001, vec![1; 8]), (0x0003, vec![2; 12])]);
        let hdr = ObjectHeader::parse(&data, 0, 8, 8).unwrap();
        assert_eq!(hdr.messages.len(), 2);
        assert_eq!(hdr.messages[0].msg_type, MessageType::Dataspace);
        assert_eq!(hdr.messages[1].msg_type, MessageType::Datatype);
        assert_eq!(hdr.messages[1].data.len(), 16);
        assert!(hdr.has(MessageType::Datatype));
    }

    #[test]
    fn parse_v1_unknown_message_skipped_unless_required() {
        let data = build_v1_header(&[(0x00AB, vec![0; 8])]);
        let hdr = ObjectHeader::parse(&data, 0, 8, 8).unwrap();
        assert_eq!(hdr.messages[0].msg_type, MessageType::Unknown(0xAB));

        let mut data = build_v1_header(&[(0x00AB, vec![0; 8])]);
        data[16 + 4] = 0x08;
        assert_eq!(
            ObjectHeader::parse(&data, 0, 8, 8).unwrap_err(),
            FormatError::UnsupportedMessage(0xAB)
        );
    }

    #[test]
    fn parse_v1_follows_continuation() {
        // header at 0, continuation block at 256
        let mut data = build_v1_header(&[(0x0010, continuation_payload(256, 24))]);
        data.resize(256, 0);
        // raw v1 message in the continuation block
        data.extend_from_slice(&0x0011u16.to_le_bytes());
        data.extend_from_slice(&16u16.to_le_bytes());
        data.extend_from_slice(&[0; 4]);
        data.extend_from_slice(&[7; 16]);

        let hdr = ObjectHeader::parse(&data, 0, 8, 8).unwrap();
        assert_eq!(hdr.messages.len(), 1);
        assert_eq!(hdr.messages[0].msg_type, MessageType::SymbolTable);
    }

    #[test]
    fn cyclic_continuation_is_rejected() {
        // block at 256 continues back to itself
        let mut data = build_v1_header(&[(0x0010, continuation_payload(256, 24))]);
        data.resize(256, 0);
        data.extend_from_slice(&0x0010u16.to_le_bytes());
        data.extend_from_slice(&16u16.to_le_bytes());
        data.extend_from_slice(&[0; 4]);
        data.extend_from_slice(&continuation_payload(256, 24));

        assert_eq!(
            ObjectHeader::parse(&data, 0, 8, 8).unwrap_err(),
            FormatError::CyclicContinuation { address: 256 }
        );
    }

    #[test]
    fn continuation_back_to_header_is_rejected() {
        let data = build_v1_header(&[(0x0010, continuation_payload(0, 24))]);
        assert_eq!(
            ObjectHeader::parse(&data, 0, 8, 8).unwrap_err(),
            FormatError::CyclicContinuation { address: 0 }
        );
    }

    #[test]
    fn parse_v2_one_message() {
        let data = build_v2_header(0, &[(0x01, vec![9; 10])]);
        let hdr = ObjectHeader::parse(&data, 0, 8, 8).unwrap();
        assert_eq!(hdr.version, 2);
        assert_eq!(hdr.messages.len(), 1);
        assert_eq!(hdr.messages[0].data, vec![9; 10]);
        assert_eq!(hdr.modification_time, None);
    }

    #[test]
    fn parse_v2_with_timestamps_and_creation_order() {
        let data = build_v2_header(0x20 | 0x04 | 0x01, &[(0x01, vec![1; 4]), (0x03, vec![2; 4])]);
        let hdr = ObjectHeader::parse(&data, 0, 8, 8).unwrap();
        assert_eq!(hdr.modification_time, Some(20));
        assert_eq!(hdr.messages[1].creation_order, Some(1));
    }

    #[test]
    fn parse_v2_checksum_invalid() {
        let mut data = build_v2_header(0, &[(0x01, vec![1; 4])]);
        data[8] ^= 0xFF;
        assert!(matches!(
            ObjectHeader::parse(&data, 0, 8, 8),
            Err(FormatError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn parse_v2_continuation_chunk() {
        let mut data = build_v2_header(0, &[(0x10, continuation_payload(128, 4 + 4 + 4 + 4))]);
        data.resize(128, 0);
        let mut chunk = b"OCHK".to_vec();
        chunk.push(0x0C);
        chunk.extend_from_slice(&4u16.to_le_bytes());
        chunk.push(0);
        chunk.extend_from_slice(&[5; 4]);
        let sum = jenkins_lookup3(&chunk);
        chunk.extend_from_slice(&sum.to_le_bytes());
        data.extend_from_slice(&chunk);

        let hdr = ObjectHeader::parse(&data, 0, 8, 8).unwrap();
        assert_eq!(hdr.messages.len(), 1);
        assert_eq!(hdr.messages[0].msg_type, MessageType::Attribute);
    }

    #[test]
    fn address_out_of_bounds() {
        let data = build_v1_header(&[]);
        assert!(matches!(
            ObjectHeader::parse(&data, 4096, 8, 8),
            Err(FormatError::AddressOutOfBounds { address: 4096, .. })
        ));
    }

    #[test]
    fn truncated_header() {
        let data = vec![1u8, 0, 1, 0];
        assert!(ObjectHeader::parse(&data, 0, 8, 8).is_err());
    }
}
