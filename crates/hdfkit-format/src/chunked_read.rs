//! Resolve the raw element bytes of a dataset selection.
//!
//! Compact and contiguous data are gathered straight from their storage.
//! Chunked data is assembled from the chunks that overlap the selection
//! only: each is fetched, run back through the filter pipeline, checked
//! against the expected chunk size and scattered into the output. Chunks
//! that were never written read as the fill value.

use tracing::trace;

use crate::btree_v1::{chunks_overlapping, ChunkEntry, NodeLoader};
use crate::data_layout::{ChunkIndex, DataLayout};
use crate::error::FormatError;
use crate::fill_value::FillValue;
use crate::filter_pipeline::FilterPipeline;
use crate::filters::apply_reverse;
use crate::selection::{scatter, Hyperslab};
use crate::util::{checked_address, ensure_len, UNDEFINED_ADDRESS};

/// What a read needs to know about one dataset.
#[derive(Debug, Clone, Copy)]
pub struct DatasetStorage<'a> {
    pub layout: &'a DataLayout,
    pub dims: &'a [u64],
    pub element_size: usize,
    pub filters: &'a FilterPipeline,
    pub fill: &'a FillValue,
}

impl DatasetStorage<'_> {
    fn fill_buffer(&self, elements: u64) -> Vec<u8> {
        let one = self.fill.element_bytes(self.element_size);
        if one.iter().all(|&b| b == 0) {
            return vec![0; elements as usize * self.element_size];
        }
        one.repeat(elements as usize)
    }
}

fn raw_extent(data: &[u8], address: u64, len: usize) -> Result<&[u8], FormatError> {
    let start = checked_address(data, address)?;
    ensure_len(data, start, len)?;
    Ok(&data[start..start + len])
}

fn chunk_grid(lo: &[u64], hi: &[u64], chunk_dims: &[u64]) -> Vec<Vec<u64>> {
    // chunk-aligned offsets of every chunk touching [lo, hi)
    let ranges: Vec<Vec<u64>> = (0..chunk_dims.len())
        .map(|d| {
            let first = lo[d] / chunk_dims[d];
            let last = (hi[d] - 1) / chunk_dims[d];
            (first..=last).map(|c| c * chunk_dims[d]).collect()
        })
        .collect();
    let mut out = vec![Vec::new()];
    for r in &ranges {
        out = out
            .into_iter()
            .flat_map(|prefix| {
                r.iter().map(move |&o| {
                    let mut p = prefix.clone();
                    p.push(o);
                    p
                })
            })
            .collect();
    }
    out
}

/// Chunks of a chunked dataset that intersect `sel`, sorted by offset.
///
/// Entries absent from the index are simply not returned.
pub fn overlapping_chunks(
    nodes: &dyn NodeLoader,
    storage: &DatasetStorage<'_>,
    sel: &Hyperslab,
) -> Result<Vec<ChunkEntry>, FormatError> {
    let DataLayout::Chunked {
        chunk_dims, index, ..
    } = storage.layout
    else {
        return Ok(Vec::new());
    };
    if chunk_dims.len() != storage.dims.len() || chunk_dims.contains(&0) {
        return Err(FormatError::invalid(
            "data layout",
            format!("chunk shape {chunk_dims:?} does not fit dataset shape {:?}", storage.dims),
        ));
    }
    if sel.num_elements() == 0 || index.address() == UNDEFINED_ADDRESS {
        return Ok(Vec::new());
    }
    let (lo, hi) = sel.bounds();
    let chunk_bytes = chunk_dims.iter().product::<u64>() * storage.element_size as u64;

    match index {
        ChunkIndex::BTreeV1 { address } => chunks_overlapping(nodes, *address, chunk_dims, &lo, &hi),
        ChunkIndex::SingleChunk { address, filtered } => {
            let (size, filter_mask) = filtered.unwrap_or((chunk_bytes, 0));
            Ok(vec![ChunkEntry {
                offsets: vec![0; chunk_dims.len()],
                size: size as u32,
                filter_mask,
                address: *address,
            }])
        }
        ChunkIndex::Implicit { address } => {
            let per_dim: Vec<u64> = storage
                .dims
                .iter()
                .zip(chunk_dims)
                .map(|(d, c)| d.div_ceil(*c))
                .collect();
            Ok(chunk_grid(&lo, &hi, chunk_dims)
                .into_iter()
                .map(|offsets| {
                    let linear = offsets
                        .iter()
                        .zip(chunk_dims)
                        .zip(&per_dim)
                        .fold(0u64, |acc, ((o, c), n)| acc * n + o / c);
                    ChunkEntry {
                        offsets,
                        size: chunk_bytes as u32,
                        filter_mask: 0,
                        address: address + linear * chunk_bytes,
                    }
                })
                .collect())
        }
    }
}

/// Decode one stored chunk to its raw element bytes.
pub fn decode_chunk(
    data: &[u8],
    storage: &DatasetStorage<'_>,
    chunk_dims: &[u64],
    entry: &ChunkEntry,
) -> Result<Vec<u8>, FormatError> {
    let raw = raw_extent(data, entry.address, entry.size as usize)?;
    let decoded = apply_reverse(storage.filters, raw.to_vec(), storage.element_size, entry.filter_mask)?;
    let expected = chunk_dims.iter().product::<u64>() as usize * storage.element_size;
    if decoded.len() != expected {
        return Err(FormatError::ChunkSizeMismatch {
            expected,
            actual: decoded.len(),
        });
    }
    Ok(decoded)
}

/// Raw bytes of the elements selected by `sel`, in row-major output order.
pub fn read_selection(
    data: &[u8],
    nodes: &dyn NodeLoader,
    storage: &DatasetStorage<'_>,
    sel: &Hyperslab,
) -> Result<Vec<u8>, FormatError> {
    let es = storage.element_size;
    let total = sel.num_elements();
    if total == 0 {
        return Ok(Vec::new());
    }
    let out_shape = sel.output_shape();
    let dims = storage.dims;
    let whole = dims.iter().product::<u64>() as usize * es;
    let origin = vec![0; dims.len()];

    match storage.layout {
        DataLayout::Compact { data: inline } => {
            if inline.len() < whole {
                return Err(FormatError::invalid(
                    "data layout",
                    format!("compact data holds {} bytes, dataset needs {whole}", inline.len()),
                ));
            }
            let mut out = vec![0; total as usize * es];
            if let Some(pos) = sel.block_positions(&origin, dims) {
                scatter(&pos, inline, dims, &mut out, &out_shape, es);
            }
            Ok(out)
        }
        DataLayout::Contiguous { address, .. } => {
            if *address == UNDEFINED_ADDRESS {
                trace!("contiguous storage never allocated, using fill value");
                return Ok(storage.fill_buffer(total));
            }
            let block = raw_extent(data, *address, whole)?;
            let mut out = vec![0; total as usize * es];
            if let Some(pos) = sel.block_positions(&origin, dims) {
                scatter(&pos, block, dims, &mut out, &out_shape, es);
            }
            Ok(out)
        }
        DataLayout::Chunked { chunk_dims, .. } => {
            let chunks = overlapping_chunks(nodes, storage, sel)?;
            let mut out = storage.fill_buffer(total);
            for entry in &chunks {
                let Some(pos) = sel.block_positions(&entry.offsets, chunk_dims) else {
                    continue;
                };
                trace!(offsets = ?entry.offsets, address = entry.address, size = entry.size, "chunk fetch");
                let block = decode_chunk(data, storage, chunk_dims, entry)?;
                scatter(&pos, &block, chunk_dims, &mut out, &out_shape, es);
            }
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree_v1::{build_chunk_tree, FileNodes};
    use crate::filter_pipeline::{FilterDescription, FILTER_SHUFFLE};
    use crate::filters::apply_forward;
    use std::cell::Cell;
    use std::sync::Arc;

    struct Counting<'a> {
        inner: FileNodes<'a>,
        loads: Cell<usize>,
    }

    impl NodeLoader for Counting<'_> {
        fn load_node(
            &self,
            address: u64,
            chunk_ndims: usize,
        ) -> Result<Arc<crate::btree_v1::BTreeNode>, FormatError> {
            self.loads.set(self.loads.get() + 1);
            self.inner.load_node(address, chunk_ndims)
        }
    }

    /// A 6x5 u8 dataset (value = 10*row + col) in 2x2 chunks, one chunk
    /// skipped. Returns (file, layout).
    fn chunked_file(pipeline: &FilterPipeline, skip: Option<[u64; 2]>) -> (Vec<u8>, DataLayout) {
        let dims = [6u64, 5];
        let chunk = [2u64, 2];
        let mut file = vec![0u8; 8];
        let mut entries = Vec::new();
        for r in (0..6).step_by(2) {
            for c in (0..5).step_by(2) {
                if skip == Some([r, c]) {
                    continue;
                }
                let mut bytes = Vec::new();
                for dr in 0..2 {
                    for dc in 0..2 {
                        let (row, col) = (r + dr, c + dc);
                        bytes.push(if col < dims[1] { (10 * row + col) as u8 } else { 0 });
                    }
                }
                let (stored, mask) = apply_forward(pipeline, bytes, 1).unwrap();
                entries.push(ChunkEntry {
                    offsets: vec![r, c],
                    size: stored.len() as u32,
                    filter_mask: mask,
                    address: file.len() as u64,
                });
                file.extend_from_slice(&stored);
            }
        }
        let mut tree = Vec::new();
        let base = file.len() as u64;
        let root = build_chunk_tree(&entries, &chunk, 2, 8, 8, base, &mut tree);
        file.extend_from_slice(&tree);
        let layout = DataLayout::Chunked {
            chunk_dims: chunk.to_vec(),
            element_size: 1,
            index: ChunkIndex::BTreeV1 { address: root },
        };
        (file, layout)
    }

    fn expected(sel: &Hyperslab) -> Vec<u8> {
        let mut out = Vec::new();
        for r in (sel.start[0]..sel.end[0]).step_by(sel.step[0] as usize) {
            for c in (sel.start[1]..sel.end[1]).step_by(sel.step[1] as usize) {
                out.push((10 * r + c) as u8);
            }
        }
        out
    }

    #[test]
    fn chunked_selection_matches_source() {
        let pipeline = FilterPipeline::default();
        let (file, layout) = chunked_file(&pipeline, None);
        let fill = FillValue::default();
        let storage = DatasetStorage {
            layout: &layout,
            dims: &[6, 5],
            element_size: 1,
            filters: &pipeline,
            fill: &fill,
        };
        let nodes = FileNodes {
            data: &file,
            offset_size: 8,
            length_size: 8,
        };
        for sel in [
            Hyperslab::all(&[6, 5]),
            Hyperslab::new(&[6, 5], &[1, 1], &[4, 5], None).unwrap(),
            Hyperslab::new(&[6, 5], &[0, 0], &[6, 5], Some(&[3, 2])).unwrap(),
        ] {
            assert_eq!(read_selection(&file, &nodes, &storage, &sel).unwrap(), expected(&sel));
        }
    }

    #[test]
    fn shuffled_chunks_read_like_plain_ones() {
        let shuffled = FilterPipeline {
            filters: vec![FilterDescription::new(FILTER_SHUFFLE, vec![1])],
        };
        let (file, layout) = chunked_file(&shuffled, None);
        let fill = FillValue::default();
        let storage = DatasetStorage {
            layout: &layout,
            dims: &[6, 5],
            element_size: 1,
            filters: &shuffled,
            fill: &fill,
        };
        let nodes = FileNodes {
            data: &file,
            offset_size: 8,
            length_size: 8,
        };
        let sel = Hyperslab::all(&[6, 5]);
        assert_eq!(read_selection(&file, &nodes, &storage, &sel).unwrap(), expected(&sel));
    }

    #[test]
    fn missing_chunk_reads_fill_value() {
        let pipeline = FilterPipeline::default();
        let (file, layout) = chunked_file(&pipeline, Some([2, 2]));
        let fill = FillValue {
            value: Some(vec![0xEE]),
            ..FillValue::default()
        };
        let storage = DatasetStorage {
            layout: &layout,
            dims: &[6, 5],
            element_size: 1,
            filters: &pipeline,
            fill: &fill,
        };
        let nodes = FileNodes {
            data: &file,
            offset_size: 8,
            length_size: 8,
        };
        let sel = Hyperslab::new(&[6, 5], &[2, 1], &[4, 4], None).unwrap();
        let got = read_selection(&file, &nodes, &storage, &sel).unwrap();
        assert_eq!(got, vec![21, 0xEE, 0xEE, 31, 0xEE, 0xEE]);
    }

    #[test]
    fn only_overlapping_chunks_are_fetched() {
        let pipeline = FilterPipeline::default();
        let (file, layout) = chunked_file(&pipeline, None);
        let fill = FillValue::default();
        let storage = DatasetStorage {
            layout: &layout,
            dims: &[6, 5],
            element_size: 1,
            filters: &pipeline,
            fill: &fill,
        };
        let nodes = Counting {
            inner: FileNodes {
                data: &file,
                offset_size: 8,
                length_size: 8,
            },
            loads: Cell::new(0),
        };
        let sel = Hyperslab::new(&[6, 5], &[0, 0], &[1, 2], None).unwrap();
        let chunks = overlapping_chunks(&nodes, &storage, &sel).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].offsets, vec![0, 0]);
        // 9 chunks, K=2: root plus three leaves; the selection touches one leaf
        assert_eq!(nodes.loads.get(), 2);
    }

    #[test]
    fn chunk_of_wrong_size_is_rejected() {
        let pipeline = FilterPipeline::default();
        let mut file = vec![0u8; 8];
        file.extend_from_slice(&[1, 2, 3]);
        let layout = DataLayout::Chunked {
            chunk_dims: vec![4],
            element_size: 1,
            index: ChunkIndex::SingleChunk {
                address: 8,
                filtered: Some((3, 0)),
            },
        };
        let fill = FillValue::default();
        let storage = DatasetStorage {
            layout: &layout,
            dims: &[4],
            element_size: 1,
            filters: &pipeline,
            fill: &fill,
        };
        let nodes = FileNodes {
            data: &file,
            offset_size: 8,
            length_size: 8,
        };
        assert_eq!(
            read_selection(&file, &nodes, &storage, &Hyperslab::all(&[4])).unwrap_err(),
            FormatError::ChunkSizeMismatch {
                expected: 4,
                actual: 3
            }
        );
    }

    #[test]
    fn implicit_index_and_contiguous() {
        let pipeline = FilterPipeline::default();
        let fill = FillValue::default();
        let mut file = vec![0u8; 8];
        // 4x4 in 2x2 chunks, chunk order (0,0) (0,2) (2,0) (2,2)
        for (r0, c0) in [(0u8, 0u8), (0, 2), (2, 0), (2, 2)] {
            for dr in 0..2 {
                for dc in 0..2 {
                    file.push(10 * (r0 + dr) + c0 + dc);
                }
            }
        }
        let layout = DataLayout::Chunked {
            chunk_dims: vec![2, 2],
            element_size: 1,
            index: ChunkIndex::Implicit { address: 8 },
        };
        let storage = DatasetStorage {
            layout: &layout,
            dims: &[4, 4],
            element_size: 1,
            filters: &pipeline,
            fill: &fill,
        };
        let nodes = FileNodes {
            data: &file,
            offset_size: 8,
            length_size: 8,
        };
        let sel = Hyperslab::new(&[4, 4], &[1, 1], &[3, 3], None).unwrap();
        assert_eq!(read_selection(&file, &nodes, &storage, &sel).unwrap(), vec![11, 12, 21, 22]);

        let contiguous = DataLayout::Contiguous {
            address: UNDEFINED_ADDRESS,
            size: 0,
        };
        let storage = DatasetStorage {
            layout: &contiguous,
            ..storage
        };
        assert_eq!(read_selection(&file, &nodes, &storage, &sel).unwrap(), vec![0; 4]);
    }
}
