//! Object header message type codes.

/// Header message types this crate knows by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Nil,
    Dataspace,
    LinkInfo,
    Datatype,
    FillValueOld,
    FillValue,
    Link,
    ExternalDataFiles,
    DataLayout,
    GroupInfo,
    FilterPipeline,
    Attribute,
    Comment,
    SharedMessageTable,
    Continuation,
    SymbolTable,
    ModificationTime,
    BTreeKValues,
    AttributeInfo,
    ReferenceCount,
    /// Unknown message type with its raw type ID.
    Unknown(u16),
}

const TABLE: &[(u16, MessageType)] = &[
    (0x0000, MessageType::Nil),
    (0x0001, MessageType::Dataspace),
    (0x0002, MessageType::LinkInfo),
    (0x0003, MessageType::Datatype),
    (0x0004, MessageType::FillValueOld),
    (0x0005, MessageType::FillValue),
    (0x0006, MessageType::Link),
    (0x0007, MessageType::ExternalDataFiles),
    (0x0008, MessageType::DataLayout),
    (0x000A, MessageType::GroupInfo),
    (0x000B, MessageType::FilterPipeline),
    (0x000C, MessageType::Attribute),
    (0x000D, MessageType::Comment),
    (0x000F, MessageType::SharedMessageTable),
    (0x0010, MessageType::Continuation),
    (0x0011, MessageType::SymbolTable),
    (0x0012, MessageType::ModificationTime),
    (0x0013, MessageType::BTreeKValues),
    (0x0015, MessageType::AttributeInfo),
    (0x0016, MessageType::ReferenceCount),
];

impl MessageType {
    pub fn from_u16(val: u16) -> MessageType {
        TABLE
            .iter()
            .find(|(code, _)| *code == val)
            .map(|(_, t)| *t)
            .unwrap_or(MessageType::Unknown(val))
    }

    pub fn to_u16(self) -> u16 {
        match self {
            MessageType::Unknown(v) => v,
            known => TABLE
                .iter()
                .find(|(_, t)| *t == known)
                .map(|(code, _)| *code)
                .unwrap_or(0),
        }
    }
}
