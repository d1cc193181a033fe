//! Group membership and path resolution.
//!
//! Two storage styles are handled: symbol table groups (a v1 B-tree over
//! SNOD leaves, names in a local heap) and compact groups whose links are
//! messages in the group's own header. Soft links are followed relative to
//! the group holding them, up to [`MAX_SOFT_LINK_HOPS`] per lookup.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::Arc;

use tracing::trace;

use crate::btree_v1::{find_group_leaf, group_leaves, BTreeNode, FileNodes, NodeLoader};
use crate::error::{Feature, FormatError};
use crate::link::{Link, LinkTarget};
use crate::local_heap::LocalHeap;
use crate::messages::{FileHeaders, HeaderLoader, ObjectMessages};
use crate::symbol_table::{SymbolTableEntry, SymbolTableMessage, SymbolTableNode};

pub const MAX_SOFT_LINK_HOPS: usize = 16;

/// Where a group member points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryTarget {
    Object(u64),
    SoftLink(String),
    ExternalLink { file: String, path: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupEntry {
    pub name: String,
    pub target: EntryTarget,
}

/// How a group stores its members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupStorage {
    SymbolTable(SymbolTableMessage),
    Links(Vec<Link>),
}

impl GroupStorage {
    /// Storage of the object, or `None` when it is not a group.
    pub fn from_messages(m: &ObjectMessages) -> Result<Option<GroupStorage>, FormatError> {
        if let Some(stab) = m.symbol_table {
            return Ok(Some(GroupStorage::SymbolTable(stab)));
        }
        if let Some(info) = &m.link_info {
            info.require_compact()?;
            return Ok(Some(GroupStorage::Links(m.links.clone())));
        }
        if !m.links.is_empty() {
            return Ok(Some(GroupStorage::Links(m.links.clone())));
        }
        Ok(None)
    }
}

/// Everything group traversal needs to read from a file.
pub trait GroupSource {
    fn nodes(&self) -> &dyn NodeLoader;
    fn local_heap(&self, address: u64) -> Result<Arc<LocalHeap>, FormatError>;
    fn symbol_node(&self, address: u64) -> Result<Arc<SymbolTableNode>, FormatError>;
    /// Group storage of the object at `address`, `None` if it is not a group.
    fn group_storage(&self, address: u64) -> Result<Option<GroupStorage>, FormatError>;
}

/// Uncached traversal straight over file bytes.
pub struct FileGroups<'a> {
    nodes: FileNodes<'a>,
}

impl<'a> FileGroups<'a> {
    pub fn new(data: &'a [u8], offset_size: u8, length_size: u8) -> Self {
        FileGroups {
            nodes: FileNodes {
                data,
                offset_size,
                length_size,
            },
        }
    }
}

impl GroupSource for FileGroups<'_> {
    fn nodes(&self) -> &dyn NodeLoader {
        &self.nodes
    }

    fn local_heap(&self, address: u64) -> Result<Arc<LocalHeap>, FormatError> {
        let n = &self.nodes;
        LocalHeap::parse(n.data, address, n.offset_size, n.length_size).map(Arc::new)
    }

    fn symbol_node(&self, address: u64) -> Result<Arc<SymbolTableNode>, FormatError> {
        SymbolTableNode::parse(self.nodes.data, address, self.nodes.offset_size).map(Arc::new)
    }

    fn group_storage(&self, address: u64) -> Result<Option<GroupStorage>, FormatError> {
        let n = &self.nodes;
        let headers = FileHeaders {
            data: n.data,
            offset_size: n.offset_size,
            length_size: n.length_size,
        };
        let header = headers.load_header(address)?;
        let messages = ObjectMessages::decode(&header, &headers, n.offset_size, n.length_size)?;
        GroupStorage::from_messages(&messages)
    }
}

fn symbol_entry(heap: &LocalHeap, e: &SymbolTableEntry) -> Result<GroupEntry, FormatError> {
    let target = match e.soft_link_offset() {
        Some(off) => EntryTarget::SoftLink(heap.name_at(off)?),
        None => EntryTarget::Object(e.object_header_address),
    };
    Ok(GroupEntry {
        name: heap.name_at(e.name_offset)?,
        target,
    })
}

fn link_entry(l: &Link) -> GroupEntry {
    let target = match &l.target {
        LinkTarget::Hard { address } => EntryTarget::Object(*address),
        LinkTarget::Soft { path } => EntryTarget::SoftLink(path.clone()),
        LinkTarget::External { file, path } => EntryTarget::ExternalLink {
            file: file.clone(),
            path: path.clone(),
        },
    };
    GroupEntry {
        name: l.name.clone(),
        target,
    }
}

/// All members of a group, sorted by name.
pub fn entries(src: &dyn GroupSource, storage: &GroupStorage) -> Result<Vec<GroupEntry>, FormatError> {
    let mut out = match storage {
        GroupStorage::SymbolTable(stab) => {
            let heap = src.local_heap(stab.heap_address)?;
            let mut out = Vec::new();
            for leaf in group_leaves(src.nodes(), stab.btree_address)? {
                for e in &src.symbol_node(leaf)?.entries {
                    out.push(symbol_entry(&heap, e)?);
                }
            }
            out
        }
        GroupStorage::Links(links) => links.iter().map(link_entry).collect(),
    };
    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}

/// Look up one member by name.
pub fn lookup(
    src: &dyn GroupSource,
    storage: &GroupStorage,
    name: &str,
) -> Result<Option<GroupEntry>, FormatError> {
    match storage {
        GroupStorage::SymbolTable(stab) => {
            let heap = src.local_heap(stab.heap_address)?;
            let name_at = |off: u64| heap.name_at(off);
            let Some(leaf) = find_group_leaf(src.nodes(), stab.btree_address, name, &name_at)?
            else {
                return Ok(None);
            };
            let node = src.symbol_node(leaf)?;

            // leaf entries are sorted by name
            let (mut lo, mut hi) = (0, node.entries.len());
            while lo < hi {
                let mid = (lo + hi) / 2;
                let e = &node.entries[mid];
                match heap.name_at(e.name_offset)?.as_str().cmp(name) {
                    Ordering::Less => lo = mid + 1,
                    Ordering::Greater => hi = mid,
                    Ordering::Equal => return symbol_entry(&heap, e).map(Some),
                }
            }
            Ok(None)
        }
        GroupStorage::Links(links) => Ok(links.iter().find(|l| l.name == name).map(link_entry)),
    }
}

fn components(path: &str) -> impl Iterator<Item = String> + '_ {
    path.split('/').filter(|s| !s.is_empty()).map(str::to_string)
}

fn joined(parts: &[(String, u64)], last: &str) -> String {
    let mut p = String::new();
    for (name, _) in parts {
        p.push('/');
        p.push_str(name);
    }
    p.push('/');
    p.push_str(last);
    p
}

/// Resolve `path` from the root group to an object header address.
pub fn resolve_path(src: &dyn GroupSource, root: u64, path: &str) -> Result<u64, FormatError> {
    let mut queue: VecDeque<String> = components(path).collect();
    // groups walked so far, for relative soft links and ".."
    let mut trail: Vec<(String, u64)> = Vec::new();
    let mut current = root;
    let mut hops = 0;

    while let Some(name) = queue.pop_front() {
        match name.as_str() {
            "." => continue,
            ".." => {
                trail.pop();
                current = trail.last().map_or(root, |t| t.1);
                continue;
            }
            _ => {}
        }
        let here = joined(&trail, &name);
        let storage = src.group_storage(current)?.ok_or_else(|| {
            let parent = here.rsplit_once('/').map_or("/", |(p, _)| if p.is_empty() { "/" } else { p });
            FormatError::NotAGroup(parent.to_string())
        })?;

        let Some(entry) = lookup(src, &storage, &name)? else {
            let siblings = entries(src, &storage)?.into_iter().map(|e| e.name).collect();
            return Err(FormatError::NotFound {
                name: here,
                siblings,
            });
        };
        trace!(path = %here, entry = ?entry.target, "resolved path segment");

        match entry.target {
            EntryTarget::Object(address) => {
                trail.push((name, address));
                current = address;
            }
            EntryTarget::SoftLink(target) => {
                hops += 1;
                if hops > MAX_SOFT_LINK_HOPS {
                    return Err(FormatError::SoftLinkLimit {
                        path: path.to_string(),
                        limit: MAX_SOFT_LINK_HOPS,
                    });
                }
                if target.starts_with('/') {
                    trail.clear();
                    current = root;
                }
                let rest: Vec<String> = components(&target).collect();
                for c in rest.into_iter().rev() {
                    queue.push_front(c);
                }
            }
            EntryTarget::ExternalLink { .. } => {
                return Err(FormatError::UnsupportedFeature(Feature::ExternalLink));
            }
        }
    }
    Ok(current)
}

/// Write a symbol table group's SNOD leaves and the B-tree above them.
///
/// `entries` must already be sorted by name. Separator keys are the heap
/// offsets of each node's last name. Nodes are appended to `out` at `base`.
/// Returns the root B-tree address.
pub fn build_group_tree(
    entries: &[SymbolTableEntry],
    leaf_k: u16,
    internal_k: u16,
    offset_size: u8,
    length_size: u8,
    base: u64,
    out: &mut Vec<u8>,
) -> u64 {
    use crate::btree_v1::NodeKeys;

    let per_leaf = 2 * leaf_k as usize;
    let fanout = 2 * internal_k as usize;
    let addr = |out: &Vec<u8>| base + out.len() as u64;

    // (last name offset, address) for each SNOD
    let mut level: Vec<(u64, u64)> = Vec::new();
    for group in entries.chunks(per_leaf) {
        let a = addr(out);
        out.extend_from_slice(
            &SymbolTableNode {
                entries: group.to_vec(),
            }
            .serialize(offset_size, leaf_k),
        );
        level.push((group[group.len() - 1].name_offset, a));
    }

    let mut node_level = 0u8;
    loop {
        let mut next = Vec::new();
        for group in level.chunks(fanout.max(1)) {
            let mut keys = vec![0u64];
            keys.extend(group.iter().map(|g| g.0));
            let node = BTreeNode {
                address: 0,
                level: node_level,
                left_sibling: None,
                right_sibling: None,
                keys: NodeKeys::Group(keys),
                children: group.iter().map(|g| g.1).collect(),
            };
            let a = addr(out);
            out.extend_from_slice(&node.serialize(offset_size, length_size, internal_k));
            next.push((group[group.len() - 1].0, a));
        }
        if next.is_empty() {
            // empty group: a leaf with no children
            let node = BTreeNode {
                address: 0,
                level: 0,
                left_sibling: None,
                right_sibling: None,
                keys: NodeKeys::Group(vec![0]),
                children: Vec::new(),
            };
            let a = addr(out);
            out.extend_from_slice(&node.serialize(offset_size, length_size, internal_k));
            return a;
        }
        if next.len() == 1 {
            return next[0].1;
        }
        level = next;
        node_level += 1;
    }
}
