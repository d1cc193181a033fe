//! Error types for HDF5 format parsing and serialization.

use crate::message_type::MessageType;

/// Broad class of a failure, used by callers to decide how to react.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// The bytes are not an HDF5 file (no signature in the search window).
    Signature,
    /// The file is HDF5 but uses a structure version this crate cannot read.
    Version,
    /// A structural invariant is violated: bad signature, checksum, cycle, missing message.
    Corruption,
    /// A path, group member, or heap object does not exist.
    NotFound,
    /// A known HDF5 feature that is deliberately not implemented.
    Unsupported,
    /// Data could not be decoded (decompression failure, bad datatype encoding).
    Decode,
    /// The caller passed arguments that do not fit the object.
    Usage,
    /// The underlying file could not be read or written.
    Io,
}

/// HDF5 features that are recognised but not implemented.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feature {
    /// Groups whose links live in a fractal heap.
    DenseLinks,
    /// Objects whose attributes live in a fractal heap.
    DenseAttributes,
    /// Links into another file.
    ExternalLink,
    /// Virtual dataset layout.
    VirtualDataset,
    /// Dataset region references.
    RegionReference,
    /// Raw data stored in external files.
    ExternalStorage,
    /// Complex number datatype (class 11).
    ComplexNumbers,
    /// Messages stored in the shared object header message heap.
    SharedMessageHeap,
    /// A chunk index other than the v1 B-tree, single chunk, or implicit index.
    ChunkIndex(&'static str),
    /// A filter identified by its registered id.
    Filter(u16),
}

impl std::fmt::Display for Feature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Feature::DenseLinks => write!(f, "dense (fractal heap) link storage"),
            Feature::DenseAttributes => write!(f, "dense (fractal heap) attribute storage"),
            Feature::ExternalLink => write!(f, "external links"),
            Feature::VirtualDataset => write!(f, "virtual datasets"),
            Feature::RegionReference => write!(f, "dataset region references"),
            Feature::ExternalStorage => write!(f, "external raw data storage"),
            Feature::ComplexNumbers => write!(f, "complex number datatypes"),
            Feature::SharedMessageHeap => write!(f, "shared object header message heap"),
            Feature::ChunkIndex(kind) => write!(f, "{kind} chunk index"),
            Feature::Filter(4) => write!(f, "SZIP filter"),
            Feature::Filter(5) => write!(f, "N-bit filter"),
            Feature::Filter(6) => write!(f, "scale-offset filter"),
            Feature::Filter(id) => write!(f, "filter {id}"),
        }
    }
}

/// Errors that can occur when parsing or producing HDF5 binary structures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    /// The HDF5 magic signature was not found at any probed offset.
    #[error("HDF5 signature not found in the first {searched_up_to} bytes")]
    SignatureNotFound { searched_up_to: usize },

    #[error("unsupported superblock version: {0}")]
    UnsupportedSuperblockVersion(u8),

    #[error("unexpected EOF: need {expected} bytes, have {available}")]
    UnexpectedEof { expected: usize, available: usize },

    #[error("invalid offset size: {0} (must be 2, 4, or 8)")]
    InvalidOffsetSize(u8),

    #[error("invalid length size: {0} (must be 2, 4, or 8)")]
    InvalidLengthSize(u8),

    #[error("address {address:#x} lies outside the file ({len} bytes)")]
    AddressOutOfBounds { address: u64, len: usize },

    #[error("{structure} checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    ChecksumMismatch {
        structure: &'static str,
        stored: u32,
        computed: u32,
    },

    #[error("invalid object header signature at {address:#x}")]
    InvalidObjectHeaderSignature { address: u64 },

    #[error("unsupported object header version: {0}")]
    InvalidObjectHeaderVersion(u8),

    #[error("object header continuation chain revisits {address:#x}")]
    CyclicContinuation { address: u64 },

    /// Unknown message type that is marked as must-understand.
    #[error("unsupported message type {0:#06x} marked as must-understand")]
    UnsupportedMessage(u16),

    #[error("required {0:?} message is missing from object header")]
    MissingMessage(MessageType),

    #[error("unsupported {message} message version {version}")]
    InvalidMessageVersion { message: &'static str, version: u8 },

    #[error("malformed {message} message: {reason}")]
    InvalidMessage {
        message: &'static str,
        reason: String,
    },

    #[error("invalid B-tree node signature at {address:#x}")]
    InvalidBTreeSignature { address: u64 },

    #[error("malformed B-tree node at {address:#x}: {reason}")]
    InvalidBTreeNode { address: u64, reason: String },

    #[error("invalid symbol table node signature at {address:#x}")]
    InvalidSymbolTableNode { address: u64 },

    #[error("invalid local heap at {address:#x}: {reason}")]
    InvalidLocalHeap { address: u64, reason: String },

    #[error("invalid global heap collection signature at {address:#x}")]
    InvalidGlobalHeapSignature { address: u64 },

    #[error("global heap collection {collection:#x} has no object {index}")]
    GlobalHeapObjectNotFound { collection: u64, index: u32 },

    #[error("invalid datatype encoding: {0}")]
    InvalidDatatype(String),

    #[error("compound member {name:?} (offset {offset}, size {size}) exceeds compound size {compound_size}")]
    CompoundMemberOutOfBounds {
        name: String,
        offset: u64,
        size: u64,
        compound_size: u64,
    },

    #[error("invalid dataspace: {0}")]
    InvalidDataspace(String),

    #[error("chunk decoded to {actual} bytes, expected {expected}")]
    ChunkSizeMismatch { expected: usize, actual: usize },

    #[error("decompression failed: {0}")]
    Decompression(String),

    #[error("fletcher32 checksum mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    Fletcher32Mismatch { stored: u32, computed: u32 },

    #[error("unsupported feature: {0}")]
    UnsupportedFeature(Feature),

    #[error("{name:?} not found")]
    NotFound { name: String, siblings: Vec<String> },

    #[error("{0:?} is not a group")]
    NotAGroup(String),

    #[error("soft link chain starting at {path:?} exceeds {limit} hops")]
    SoftLinkLimit { path: String, limit: usize },

    #[error("value does not match datatype: expected {expected}, found {found}")]
    ValueMismatch { expected: String, found: String },

    #[error("element count {actual} does not match dataspace size {expected}")]
    ShapeMismatch { expected: u64, actual: u64 },

    #[error("invalid selection: {0}")]
    InvalidSelection(String),

    #[error("invalid dataset options: {0}")]
    InvalidOptions(String),
}

impl FormatError {
    /// Returns the broad category this error belongs to.
    pub fn category(&self) -> ErrorCategory {
        use FormatError::*;
        match self {
            SignatureNotFound { .. } => ErrorCategory::Signature,
            UnsupportedSuperblockVersion(_)
            | InvalidObjectHeaderVersion(_)
            | InvalidMessageVersion { .. } => ErrorCategory::Version,
            UnexpectedEof { .. }
            | InvalidOffsetSize(_)
            | InvalidLengthSize(_)
            | AddressOutOfBounds { .. }
            | ChecksumMismatch { .. }
            | InvalidObjectHeaderSignature { .. }
            | CyclicContinuation { .. }
            | MissingMessage(_)
            | InvalidMessage { .. }
            | InvalidBTreeSignature { .. }
            | InvalidBTreeNode { .. }
            | InvalidSymbolTableNode { .. }
            | InvalidLocalHeap { .. }
            | InvalidGlobalHeapSignature { .. }
            | CompoundMemberOutOfBounds { .. }
            | InvalidDataspace(_)
            | ChunkSizeMismatch { .. }
            | SoftLinkLimit { .. } => ErrorCategory::Corruption,
            NotFound { .. } | GlobalHeapObjectNotFound { .. } | NotAGroup(_) => {
                ErrorCategory::NotFound
            }
            UnsupportedMessage(_) | UnsupportedFeature(_) => ErrorCategory::Unsupported,
            InvalidDatatype(_) | Decompression(_) | Fletcher32Mismatch { .. } => {
                ErrorCategory::Decode
            }
            ValueMismatch { .. }
            | ShapeMismatch { .. }
            | InvalidSelection(_)
            | InvalidOptions(_) => ErrorCategory::Usage,
        }
    }

    pub(crate) fn invalid(message: &'static str, reason: impl Into<String>) -> Self {
        FormatError::InvalidMessage {
            message,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories() {
        assert_eq!(
            FormatError::SignatureNotFound { searched_up_to: 0 }.category(),
            ErrorCategory::Signature
        );
        assert_eq!(
            FormatError::CyclicContinuation { address: 8 }.category(),
            ErrorCategory::Corruption
        );
        assert_eq!(
            FormatError::UnsupportedFeature(Feature::DenseLinks).category(),
            ErrorCategory::Unsupported
        );
        assert_eq!(
            FormatError::Decompression("bad".into()).category(),
            ErrorCategory::Decode
        );
    }

    #[test]
    fn filter_feature_names() {
        assert_eq!(Feature::Filter(4).to_string(), "SZIP filter");
        assert_eq!(Feature::Filter(6).to_string(), "scale-offset filter");
        assert_eq!(Feature::Filter(307).to_string(), "filter 307");
    }
}
