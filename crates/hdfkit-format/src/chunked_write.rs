//! Chunked dataset writing: chunk shape selection, splitting, filtering and
//! the v1 chunk B-tree.

use tracing::trace;

use crate::btree_v1::{build_chunk_tree, ChunkEntry};
use crate::error::FormatError;
use crate::filter_pipeline::FilterPipeline;
use crate::filters::apply_forward;
use crate::selection::strides;

/// Bytes per chunk aimed for when no chunk shape is given.
pub const TARGET_CHUNK_BYTES: u64 = 1024 * 1024;

/// K of every chunk B-tree node written; matches the v0 superblock default.
pub const CHUNK_BTREE_K: u16 = 32;

/// Choose a chunk shape of roughly [`TARGET_CHUNK_BYTES`].
///
/// Starts from the full dataset shape and halves dimensions round-robin,
/// so the chunk keeps the dataset's proportions.
pub fn auto_chunk_dims(dims: &[u64], element_size: usize) -> Vec<u64> {
    let mut chunk: Vec<u64> = dims.iter().map(|&d| d.max(1)).collect();
    let bytes = |c: &[u64]| c.iter().product::<u64>() * element_size as u64;
    let mut d = 0;
    while bytes(&chunk) > TARGET_CHUNK_BYTES && chunk.iter().any(|&c| c > 1) {
        if chunk[d] > 1 {
            chunk[d] = chunk[d].div_ceil(2);
        }
        d = (d + 1) % chunk.len();
    }
    chunk
}

pub fn validate_chunk_dims(dims: &[u64], chunk_dims: &[u64]) -> Result<(), FormatError> {
    if dims.is_empty() {
        return Err(FormatError::InvalidOptions(
            "scalar datasets cannot be chunked".into(),
        ));
    }
    if chunk_dims.len() != dims.len() {
        return Err(FormatError::InvalidOptions(format!(
            "chunk shape {chunk_dims:?} has a different rank than dataset shape {dims:?}"
        )));
    }
    for (d, (&c, &n)) in chunk_dims.iter().zip(dims).enumerate() {
        if c == 0 || (n > 0 && c > n) || c > u32::MAX as u64 {
            return Err(FormatError::InvalidOptions(format!(
                "chunk extent {c} in dimension {d} must be between 1 and {n}"
            )));
        }
    }
    Ok(())
}

/// Split row-major `raw` into chunks, in chunk offset order.
///
/// Edge chunks are padded with `fill` (one element's bytes).
pub fn split_into_chunks(
    raw: &[u8],
    dims: &[u64],
    chunk_dims: &[u64],
    fill: &[u8],
) -> Vec<(Vec<u64>, Vec<u8>)> {
    let es = fill.len();
    let rank = dims.len();
    if dims.contains(&0) {
        return Vec::new();
    }
    let grid: Vec<u64> = dims.iter().zip(chunk_dims).map(|(d, c)| d.div_ceil(*c)).collect();
    let total: u64 = grid.iter().product();
    let ds_strides = strides(dims);
    let chunk_elems: u64 = chunk_dims.iter().product();
    let row = chunk_dims[rank - 1];

    let mut out = Vec::with_capacity(total as usize);
    for linear in 0..total {
        let mut rem = linear;
        let mut offsets = vec![0u64; rank];
        for d in (0..rank).rev() {
            offsets[d] = (rem % grid[d]) * chunk_dims[d];
            rem /= grid[d];
        }

        let mut bytes = fill.repeat(chunk_elems as usize);
        // copy whole rows of the last dimension at a time
        let rows = chunk_elems / row;
        let valid = (dims[rank - 1] - offsets[rank - 1]).min(row) as usize;
        'rows: for r in 0..rows {
            let mut rem = r;
            let mut src = 0u64;
            for d in (0..rank - 1).rev() {
                let coord = offsets[d] + rem % chunk_dims[d];
                rem /= chunk_dims[d];
                if coord >= dims[d] {
                    continue 'rows;
                }
                src += coord * ds_strides[d];
            }
            src += offsets[rank - 1];
            let src = src as usize * es;
            let dst = (r * row) as usize * es;
            bytes[dst..dst + valid * es].copy_from_slice(&raw[src..src + valid * es]);
        }
        out.push((offsets, bytes));
    }
    out
}

/// Filter every chunk, append chunk data and then the chunk B-tree to `out`
/// (which starts at file address `base`). Returns the B-tree root address.
#[allow(clippy::too_many_arguments)]
pub fn write_chunks(
    raw: &[u8],
    dims: &[u64],
    chunk_dims: &[u64],
    fill: &[u8],
    pipeline: &FilterPipeline,
    offset_size: u8,
    length_size: u8,
    base: u64,
    out: &mut Vec<u8>,
) -> Result<u64, FormatError> {
    validate_chunk_dims(dims, chunk_dims)?;
    let mut entries = Vec::new();
    for (offsets, bytes) in split_into_chunks(raw, dims, chunk_dims, fill) {
        let (stored, filter_mask) = apply_forward(pipeline, bytes, fill.len())?;
        let size = u32::try_from(stored.len()).map_err(|_| {
            FormatError::InvalidOptions(format!("chunk at {offsets:?} exceeds 4 GiB after filtering"))
        })?;
        let address = base + out.len() as u64;
        trace!(?offsets, address, size, filter_mask, "chunk written");
        out.extend_from_slice(&stored);
        entries.push(ChunkEntry {
            offsets,
            size,
            filter_mask,
            address,
        });
    }
    let tree_base = base + out.len() as u64;
    let mut tree = Vec::new();
    let root = build_chunk_tree(
        &entries,
        chunk_dims,
        CHUNK_BTREE_K,
        offset_size,
        length_size,
        tree_base,
        &mut tree,
    );
    out.extend_from_slice(&tree);
    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree_v1::{chunks_overlapping, FileNodes};
    use crate::filter_pipeline::{FilterDescription, FILTER_LZF, FILTER_SHUFFLE};
    use crate::filters::apply_reverse;

    #[test]
    fn auto_chunks_fit_target() {
        let c = auto_chunk_dims(&[1000, 1000], 8);
        assert!(c.iter().product::<u64>() * 8 <= TARGET_CHUNK_BYTES);
        assert_eq!(c, vec![250, 500]);

        assert_eq!(auto_chunk_dims(&[10, 20], 4), vec![10, 20]);
        assert_eq!(auto_chunk_dims(&[0, 5], 4), vec![1, 5]);
    }

    #[test]
    fn chunk_dims_validation() {
        assert!(validate_chunk_dims(&[10, 10], &[5, 5]).is_ok());
        assert!(validate_chunk_dims(&[10, 10], &[5]).is_err());
        assert!(validate_chunk_dims(&[10, 10], &[0, 5]).is_err());
        assert!(validate_chunk_dims(&[10, 10], &[11, 5]).is_err());
        assert!(validate_chunk_dims(&[], &[]).is_err());
    }

    #[test]
    fn split_pads_edge_chunks() {
        // 3x3 of u8, 2x2 chunks
        let raw: Vec<u8> = (1..=9).collect();
        let chunks = split_into_chunks(&raw, &[3, 3], &[2, 2], &[0]);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0], (vec![0, 0], vec![1, 2, 4, 5]));
        assert_eq!(chunks[1], (vec![0, 2], vec![3, 0, 6, 0]));
        assert_eq!(chunks[2], (vec![2, 0], vec![7, 8, 0, 0]));
        assert_eq!(chunks[3], (vec![2, 2], vec![9, 0, 0, 0]));
    }

    #[test]
    fn written_chunks_are_indexed_and_filtered() {
        let dims = [40u64, 3];
        let raw: Vec<u8> = (0..120u32).flat_map(|v| (v as u16).to_le_bytes()).collect();
        let pipeline = FilterPipeline {
            filters: vec![
                FilterDescription::new(FILTER_SHUFFLE, vec![2]),
                FilterDescription::new(FILTER_LZF, vec![]).optional(),
            ],
        };
        let mut file = vec![0u8; 16];
        let mut out = Vec::new();
        let root = write_chunks(&raw, &dims, &[4, 3], &[0, 0], &pipeline, 8, 8, 16, &mut out).unwrap();
        file.extend_from_slice(&out);

        let nodes = FileNodes {
            data: &file,
            offset_size: 8,
            length_size: 8,
        };
        let found = chunks_overlapping(&nodes, root, &[4, 3], &[0, 0], &[40, 3]).unwrap();
        assert_eq!(found.len(), 10);
        for (i, e) in found.iter().enumerate() {
            assert_eq!(e.offsets, vec![4 * i as u64, 0]);
            let stored = file[e.address as usize..e.address as usize + e.size as usize].to_vec();
            let back = apply_reverse(&pipeline, stored, 2, e.filter_mask).unwrap();
            assert_eq!(back, &raw[i * 24..(i + 1) * 24]);
        }
    }
}
