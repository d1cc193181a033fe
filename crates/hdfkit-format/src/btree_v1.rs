//! HDF5 version 1 B-trees: type 0 (group names) and type 1 (raw data chunks).

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::trace;

use crate::error::FormatError;
use crate::util::{checked_address, ensure_len, read_address, read_u16, read_u32, read_u64, read_uint, write_uint};

const TREE_SIGNATURE: [u8; 4] = *b"TREE";

pub const NODE_TYPE_GROUP: u8 = 0;
pub const NODE_TYPE_CHUNK: u8 = 1;

/// Key of a raw data chunk node: stored size, filter mask and the chunk's
/// element offset in every dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkKey {
    pub size: u32,
    pub filter_mask: u32,
    /// One offset per dataset dimension plus a trailing element-size offset (always 0).
    pub offsets: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKeys {
    /// Local heap offsets of names.
    Group(Vec<u64>),
    Chunk(Vec<ChunkKey>),
}

impl NodeKeys {
    fn len(&self) -> usize {
        match self {
            NodeKeys::Group(k) => k.len(),
            NodeKeys::Chunk(k) => k.len(),
        }
    }
}

/// A parsed B-tree v1 node. Holds `children.len() + 1` keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BTreeNode {
    pub address: u64,
    pub level: u8,
    pub left_sibling: Option<u64>,
    pub right_sibling: Option<u64>,
    pub keys: NodeKeys,
    pub children: Vec<u64>,
}

impl BTreeNode {
    pub fn node_type(&self) -> u8 {
        match self.keys {
            NodeKeys::Group(_) => NODE_TYPE_GROUP,
            NodeKeys::Chunk(_) => NODE_TYPE_CHUNK,
        }
    }

    /// Parse the node at `address`.
    ///
    /// `chunk_ndims` is the number of offsets in a chunk key (dataset rank + 1)
    /// and is ignored for group nodes.
    pub fn parse(
        data: &[u8],
        address: u64,
        offset_size: u8,
        length_size: u8,
        chunk_ndims: usize,
    ) -> Result<BTreeNode, FormatError> {
        let start = checked_address(data, address)?;
        let os = offset_size as usize;
        ensure_len(data, start, 8 + 2 * os)?;

        if data[start..start + 4] != TREE_SIGNATURE {
            return Err(FormatError::InvalidBTreeSignature { address });
        }
        let node_type = data[start + 4];
        let level = data[start + 5];
        let entries = read_u16(data, start + 6)? as usize;
        let left_sibling = Some(read_address(data, start + 8, offset_size)?)
            .filter(|&a| a != crate::util::UNDEFINED_ADDRESS);
        let right_sibling = Some(read_address(data, start + 8 + os, offset_size)?)
            .filter(|&a| a != crate::util::UNDEFINED_ADDRESS);
        let mut pos = start + 8 + 2 * os;

        trace!(address, node_type, level, entries, "b-tree node");

        let bad = |reason: String| FormatError::InvalidBTreeNode { address, reason };
        let mut children = Vec::with_capacity(entries);
        let keys = match node_type {
            NODE_TYPE_GROUP => {
                let ls = length_size as usize;
                ensure_len(data, pos, entries * (ls + os) + ls)?;
                let mut keys = Vec::with_capacity(entries + 1);
                for i in 0..=entries {
                    keys.push(read_uint(data, pos, length_size)?);
                    pos += ls;
                    if i < entries {
                        children.push(read_address(data, pos, offset_size)?);
                        pos += os;
                    }
                }
                NodeKeys::Group(keys)
            }
            NODE_TYPE_CHUNK => {
                if chunk_ndims == 0 {
                    return Err(bad("chunk node read without a dimensionality".into()));
                }
                let key_size = 8 + 8 * chunk_ndims;
                ensure_len(data, pos, entries * (key_size + os) + key_size)?;
                let mut keys = Vec::with_capacity(entries + 1);
                for i in 0..=entries {
                    let size = read_u32(data, pos)?;
                    let filter_mask = read_u32(data, pos + 4)?;
                    let mut offsets = Vec::with_capacity(chunk_ndims);
                    for d in 0..chunk_ndims {
                        offsets.push(read_u64(data, pos + 8 + 8 * d)?);
                    }
                    pos += key_size;
                    keys.push(ChunkKey {
                        size,
                        filter_mask,
                        offsets,
                    });
                    if i < entries {
                        children.push(read_address(data, pos, offset_size)?);
                        pos += os;
                    }
                }
                // child keys strictly increase; the closing key may equal the last one
                for (i, w) in keys.windows(2).enumerate() {
                    let ord = w[0].offsets.cmp(&w[1].offsets);
                    if ord == Ordering::Greater || (ord == Ordering::Equal && i + 1 < entries) {
                        return Err(bad(format!(
                            "chunk keys out of order: {:?} then {:?}",
                            w[0].offsets, w[1].offsets
                        )));
                    }
                }
                NodeKeys::Chunk(keys)
            }
            t => return Err(bad(format!("node type {t}"))),
        };

        Ok(BTreeNode {
            address,
            level,
            left_sibling,
            right_sibling,
            keys,
            children,
        })
    }

    /// Serialize padded to `2 * k` entries so readers that size nodes from K
    /// never run past the end of the structure.
    pub fn serialize(&self, offset_size: u8, length_size: u8, k: u16) -> Vec<u8> {
        let capacity = (2 * k as usize).max(self.children.len());
        let mut buf = Vec::new();
        buf.extend_from_slice(&TREE_SIGNATURE);
        buf.push(self.node_type());
        buf.push(self.level);
        buf.extend_from_slice(&(self.children.len() as u16).to_le_bytes());
        write_uint(&mut buf, self.left_sibling.unwrap_or(u64::MAX), offset_size);
        write_uint(&mut buf, self.right_sibling.unwrap_or(u64::MAX), offset_size);

        let (key_size, chunk_ndims) = match &self.keys {
            NodeKeys::Group(_) => (length_size as usize, 0),
            NodeKeys::Chunk(k) => {
                let n = k.first().map_or(0, |k| k.offsets.len());
                (8 + 8 * n, n)
            }
        };
        for i in 0..self.keys.len() {
            match &self.keys {
                NodeKeys::Group(k) => write_uint(&mut buf, k[i], length_size),
                NodeKeys::Chunk(k) => {
                    buf.extend_from_slice(&k[i].size.to_le_bytes());
                    buf.extend_from_slice(&k[i].filter_mask.to_le_bytes());
                    for d in 0..chunk_ndims {
                        let o = k[i].offsets.get(d).copied().unwrap_or(0);
                        buf.extend_from_slice(&o.to_le_bytes());
                    }
                }
            }
            if let Some(c) = self.children.get(i) {
                write_uint(&mut buf, *c, offset_size);
            }
        }
        let unused = capacity - self.children.len();
        buf.resize(buf.len() + unused * (key_size + offset_size as usize), 0);
        buf
    }
}

/// Source of parsed B-tree nodes. The high-level crate puts a cache here.
pub trait NodeLoader {
    fn load_node(&self, address: u64, chunk_ndims: usize) -> Result<Arc<BTreeNode>, FormatError>;
}

/// Parses nodes straight from file bytes on every call.
pub struct FileNodes<'a> {
    pub data: &'a [u8],
    pub offset_size: u8,
    pub length_size: u8,
}

impl NodeLoader for FileNodes<'_> {
    fn load_node(&self, address: u64, chunk_ndims: usize) -> Result<Arc<BTreeNode>, FormatError> {
        BTreeNode::parse(self.data, address, self.offset_size, self.length_size, chunk_ndims)
            .map(Arc::new)
    }
}

fn check_child(parent: &BTreeNode, child: &BTreeNode, node_type: u8) -> Result<(), FormatError> {
    if child.node_type() != node_type || child.level + 1 != parent.level {
        return Err(FormatError::InvalidBTreeNode {
            address: child.address,
            reason: format!(
                "child of level {} node at {} has type {} level {}",
                parent.level,
                parent.address,
                child.node_type(),
                child.level
            ),
        });
    }
    Ok(())
}

fn load_root(
    loader: &dyn NodeLoader,
    address: u64,
    chunk_ndims: usize,
    node_type: u8,
) -> Result<Arc<BTreeNode>, FormatError> {
    let node = loader.load_node(address, chunk_ndims)?;
    if node.node_type() != node_type {
        return Err(FormatError::InvalidBTreeNode {
            address,
            reason: format!("expected node type {node_type}, found {}", node.node_type()),
        });
    }
    Ok(node)
}

/// Addresses of all symbol table nodes (SNODs) under a group B-tree, left to right.
pub fn group_leaves(loader: &dyn NodeLoader, root: u64) -> Result<Vec<u64>, FormatError> {
    let mut out = Vec::new();
    let mut stack = vec![load_root(loader, root, 0, NODE_TYPE_GROUP)?];
    while let Some(node) = stack.pop() {
        if node.level == 0 {
            out.extend_from_slice(&node.children);
            continue;
        }
        for &c in node.children.iter().rev() {
            let child = loader.load_node(c, 0)?;
            check_child(&node, &child, NODE_TYPE_GROUP)?;
            stack.push(child);
        }
    }
    Ok(out)
}

/// Find the SNOD that would hold `name` by descending the group B-tree.
///
/// Child `i` holds names in `(key[i], key[i+1]]`. `name_at` reads a key's
/// name from the group's local heap.
pub fn find_group_leaf(
    loader: &dyn NodeLoader,
    root: u64,
    name: &str,
    name_at: &dyn Fn(u64) -> Result<String, FormatError>,
) -> Result<Option<u64>, FormatError> {
    let mut node = load_root(loader, root, 0, NODE_TYPE_GROUP)?;
    loop {
        let NodeKeys::Group(keys) = &node.keys else {
            return Ok(None);
        };
        let mut names = Vec::with_capacity(keys.len());
        for &k in keys {
            names.push(name_at(k)?);
        }
        for w in names.windows(2).skip(1) {
            if w[0] >= w[1] {
                return Err(FormatError::InvalidBTreeNode {
                    address: node.address,
                    reason: format!("group keys out of order: {:?} then {:?}", w[0], w[1]),
                });
            }
        }

        // first child whose right key is >= name
        let idx = names[1..].partition_point(|k| k.as_str() < name);
        let Some(&child) = node.children.get(idx) else {
            return Ok(None);
        };
        trace!(address = node.address, level = node.level, child, "group b-tree descend");
        if node.level == 0 {
            return Ok(Some(child));
        }
        let next = loader.load_node(child, 0)?;
        check_child(&node, &next, NODE_TYPE_GROUP)?;
        node = next;
    }
}

/// One chunk found in a chunk B-tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkEntry {
    /// Element offset of the chunk, one per dataset dimension.
    pub offsets: Vec<u64>,
    pub size: u32,
    pub filter_mask: u32,
    pub address: u64,
}

/// Chunks whose extent intersects the box `[lo, hi)`.
///
/// Subtrees whose first-dimension key range cannot reach the box are skipped.
pub fn chunks_overlapping(
    loader: &dyn NodeLoader,
    root: u64,
    chunk_dims: &[u64],
    lo: &[u64],
    hi: &[u64],
) -> Result<Vec<ChunkEntry>, FormatError> {
    let rank = chunk_dims.len();
    let ndims = rank + 1;
    let overlaps = |offsets: &[u64]| {
        (0..rank).all(|d| offsets[d] < hi[d] && offsets[d] + chunk_dims[d] > lo[d])
    };

    let mut out = Vec::new();
    let mut stack = vec![load_root(loader, root, ndims, NODE_TYPE_CHUNK)?];
    while let Some(node) = stack.pop() {
        let NodeKeys::Chunk(keys) = &node.keys else {
            continue;
        };
        if keys.iter().any(|k| k.offsets.len() != ndims) {
            return Err(FormatError::InvalidBTreeNode {
                address: node.address,
                reason: format!("chunk key dimensionality differs from {ndims}"),
            });
        }
        if node.level == 0 {
            for (key, &address) in keys.iter().zip(&node.children) {
                if overlaps(&key.offsets) {
                    out.push(ChunkEntry {
                        offsets: key.offsets[..rank].to_vec(),
                        size: key.size,
                        filter_mask: key.filter_mask,
                        address,
                    });
                }
            }
            continue;
        }
        for (i, &c) in node.children.iter().enumerate().rev() {
            if rank > 0 {
                let first = keys[i].offsets[0];
                let last = keys[i + 1].offsets[0];
                if first >= hi[0] || last.saturating_add(chunk_dims[0]) <= lo[0] {
                    continue;
                }
            }
            let child = loader.load_node(c, ndims)?;
            check_child(&node, &child, NODE_TYPE_CHUNK)?;
            stack.push(child);
        }
    }
    out.sort_by(|a, b| a.offsets.cmp(&b.offsets));
    Ok(out)
}

/// Build a chunk B-tree over `entries` (sorted by offsets), appending nodes
/// to `out` starting at file address `base`. Returns the root address.
///
/// `chunk_dims` supplies the closing key of each node: the last chunk's
/// offsets advanced by one chunk.
pub fn build_chunk_tree(
    entries: &[ChunkEntry],
    chunk_dims: &[u64],
    k: u16,
    offset_size: u8,
    length_size: u8,
    base: u64,
    out: &mut Vec<u8>,
) -> u64 {
    let fanout = 2 * k as usize;
    let key_of = |e: &ChunkEntry| {
        let mut offsets = e.offsets.clone();
        offsets.push(0);
        ChunkKey {
            size: e.size,
            filter_mask: e.filter_mask,
            offsets,
        }
    };
    let closing = |e: &ChunkEntry| {
        let mut offsets: Vec<u64> = e.offsets.iter().zip(chunk_dims).map(|(o, c)| o + c).collect();
        offsets.push(0);
        ChunkKey {
            size: 0,
            filter_mask: 0,
            offsets,
        }
    };

    // (first key, closing key, address) for each node of the current level
    let mut level_nodes: Vec<(ChunkKey, ChunkKey, u64)> = Vec::new();
    let mut level = 0u8;

    let emit = |node: BTreeNode, out: &mut Vec<u8>| -> u64 {
        let address = base + out.len() as u64;
        out.extend_from_slice(&node.serialize(offset_size, length_size, k));
        address
    };

    if entries.is_empty() {
        let node = BTreeNode {
            address: 0,
            level: 0,
            left_sibling: None,
            right_sibling: None,
            keys: NodeKeys::Chunk(vec![ChunkKey {
                size: 0,
                filter_mask: 0,
                offsets: vec![0; chunk_dims.len() + 1],
            }]),
            children: Vec::new(),
        };
        return emit(node, out);
    }

    for group in entries.chunks(fanout) {
        let mut keys: Vec<ChunkKey> = group.iter().map(key_of).collect();
        let last = closing(&group[group.len() - 1]);
        keys.push(last.clone());
        let node = BTreeNode {
            address: 0,
            level,
            left_sibling: None,
            right_sibling: None,
            keys: NodeKeys::Chunk(keys),
            children: group.iter().map(|e| e.address).collect(),
        };
        let address = emit(node, out);
        level_nodes.push((key_of(&group[0]), last, address));
    }

    while level_nodes.len() > 1 {
        level += 1;
        let mut next = Vec::new();
        for group in level_nodes.chunks(fanout) {
            let mut keys: Vec<ChunkKey> = group.iter().map(|n| n.0.clone()).collect();
            let last = group[group.len() - 1].1.clone();
            keys.push(last.clone());
            let node = BTreeNode {
                address: 0,
                level,
                left_sibling: None,
                right_sibling: None,
                keys: NodeKeys::Chunk(keys),
                children: group.iter().map(|n| n.2).collect(),
            };
            let address = emit(node, out);
            next.push((group[0].0.clone(), last, address));
        }
        level_nodes = next;
    }
    level_nodes[0].2
}
