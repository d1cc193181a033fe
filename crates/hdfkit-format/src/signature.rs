//! HDF5 file signature (magic bytes) detection.

use tracing::trace;

use crate::error::FormatError;

/// The 8-byte HDF5 magic signature.
pub const HDF5_SIGNATURE: [u8; 8] = [0x89, b'H', b'D', b'F', b'\r', b'\n', 0x1A, b'\n'];

/// Default upper bound on the offsets probed for a signature.
pub const DEFAULT_SEARCH_LIMIT: usize = 64 * 1024 * 1024;

/// Search for the HDF5 signature at valid offsets.
///
/// The signature can appear at offset 0, 512, 1024, 2048, 4096, ... (a user
/// block of non-HDF5 data may precede it, as in MATLAB v7.3 files). Offsets
/// at or beyond `search_limit` are not probed.
///
/// Returns the byte offset where the signature was found.
pub fn find_signature(data: &[u8], search_limit: usize) -> Result<usize, FormatError> {
    let window = data.len().min(search_limit.max(8));
    let mut offset = 0usize;
    while offset + 8 <= window {
        trace!(offset, "probing for HDF5 signature");
        if data[offset..offset + 8] == HDF5_SIGNATURE {
            return Ok(offset);
        }
        offset = if offset == 0 { 512 } else { offset * 2 };
    }

    Err(FormatError::SignatureNotFound {
        searched_up_to: window,
    })
}
