//! Object header writer for the v1 format.

use crate::error::FormatError;
use crate::message_type::MessageType;
use crate::util::pad_to_8;

/// Message flag marking a message whose payload never changes.
pub const MSG_FLAG_CONSTANT: u8 = 0x01;

/// Writer for v1 object headers: a 16-byte prefix followed by messages
/// whose payloads are padded to multiples of 8 bytes.
#[derive(Debug, Default)]
pub struct ObjectHeaderWriter {
    messages: Vec<(MessageType, Vec<u8>, u8)>,
}

impl ObjectHeaderWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a message with default flags (0).
    pub fn add_message(&mut self, msg_type: MessageType, data: Vec<u8>) {
        self.messages.push((msg_type, data, 0));
    }

    pub fn add_message_with_flags(&mut self, msg_type: MessageType, data: Vec<u8>, flags: u8) {
        self.messages.push((msg_type, data, flags));
    }

    pub fn serialize(&self) -> Result<Vec<u8>, FormatError> {
        let body_len: usize = self.messages.iter().map(|(_, d, _)| 8 + pad_to_8(d.len())).sum();
        let mut buf = Vec::with_capacity(16 + body_len);
        buf.push(1);
        buf.push(0);
        buf.extend_from_slice(&(self.messages.len() as u16).to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes()); // reference count
        buf.extend_from_slice(&(body_len as u32).to_le_bytes());
        buf.extend_from_slice(&[0; 4]);

        for (msg_type, data, flags) in &self.messages {
            let padded = pad_to_8(data.len());
            let size = u16::try_from(padded).map_err(|_| {
                FormatError::InvalidOptions(format!(
                    "{msg_type:?} message of {} bytes does not fit an object header",
                    data.len()
                ))
            })?;
            buf.extend_from_slice(&msg_type.to_u16().to_le_bytes());
            buf.extend_from_slice(&size.to_le_bytes());
            buf.push(*flags);
            buf.extend_from_slice(&[0; 3]);
            buf.extend_from_slice(data);
            buf.resize(buf.len() + padded - data.len(), 0);
        }
        Ok(buf)
    }
}
