//! HDF5 file creation (write pipeline).
//!
//! An in-memory tree of groups, datasets and soft links is laid out bottom
//! up: every object is written after everything it points to, so each
//! address is known by the time a parent records it. The v0 superblock at
//! offset 0 is filled in last.
//!
//! Output uses the oldest widely readable structures: superblock v0, v1
//! object headers, symbol table groups and v1 chunk B-trees.

use std::collections::BTreeMap;

use tracing::debug;

use crate::attribute::AttributeMessage;
use crate::chunked_write::{auto_chunk_dims, validate_chunk_dims, write_chunks};
use crate::data_layout::{ChunkIndex, DataLayout};
use crate::dataspace::Dataspace;
use crate::datatype::Datatype;
use crate::error::FormatError;
use crate::fill_value::{AllocTime, FillValue};
use crate::filter_pipeline::FilterPipeline;
use crate::filters::check_supported;
use crate::global_heap::GlobalHeapWriter;
use crate::group::build_group_tree;
use crate::local_heap::LocalHeapWriter;
use crate::message_type::MessageType;
use crate::object_header_writer::{ObjectHeaderWriter, MSG_FLAG_CONSTANT};
use crate::superblock::Superblock;
use crate::symbol_table::{SymbolTableEntry, SymbolTableMessage};
use crate::util::UNDEFINED_ADDRESS;
use crate::value::{encode_all, HeapWriter, Value};

pub const OFFSET_SIZE: u8 = 8;
pub const LENGTH_SIZE: u8 = 8;
pub const GROUP_LEAF_K: u16 = 4;
pub const GROUP_INTERNAL_K: u16 = 16;

/// Largest raw payload stored in a compact layout.
pub const MAX_COMPACT_BYTES: usize = 63 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct AttributeSpec {
    pub name: String,
    pub datatype: Datatype,
    pub dataspace: Dataspace,
    pub values: Vec<Value>,
}

impl AttributeSpec {
    fn encode(&self, heap: &mut dyn HeapWriter) -> Result<AttributeMessage, FormatError> {
        check_count(&self.dataspace, self.values.len())?;
        Ok(AttributeMessage {
            name: self.name.clone(),
            datatype: self.datatype.clone(),
            dataspace: self.dataspace.clone(),
            raw_data: encode_all(&self.values, &self.datatype, heap)?,
        })
    }
}

/// Where a dataset's raw data goes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LayoutChoice {
    #[default]
    Contiguous,
    /// Inside the object header; payload must stay under [`MAX_COMPACT_BYTES`].
    Compact,
    /// Chunked; `None` picks a chunk shape automatically.
    Chunked { chunk_dims: Option<Vec<u64>> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatasetSpec {
    pub datatype: Datatype,
    pub dataspace: Dataspace,
    /// Elements in row-major order.
    pub values: Vec<Value>,
    pub layout: LayoutChoice,
    /// Applied to chunked layouts only.
    pub filters: FilterPipeline,
    /// Fill value as one element's raw bytes.
    pub fill_value: Option<Vec<u8>>,
    pub attributes: Vec<AttributeSpec>,
}

impl DatasetSpec {
    pub fn new(datatype: Datatype, dataspace: Dataspace, values: Vec<Value>) -> Self {
        DatasetSpec {
            datatype,
            dataspace,
            values,
            layout: LayoutChoice::default(),
            filters: FilterPipeline::default(),
            fill_value: None,
            attributes: Vec::new(),
        }
    }

    /// Check everything that can be checked before layout.
    pub fn validate(&self) -> Result<(), FormatError> {
        check_count(&self.dataspace, self.values.len())?;
        let es = self.datatype.size() as usize;
        if let Some(fill) = &self.fill_value {
            if fill.len() != es {
                return Err(FormatError::InvalidOptions(format!(
                    "fill value has {} bytes, element size is {es}",
                    fill.len()
                )));
            }
        }
        match &self.layout {
            LayoutChoice::Chunked { chunk_dims } => {
                check_supported(&self.filters)?;
                let dims = &self.dataspace.dims;
                match chunk_dims {
                    Some(c) => validate_chunk_dims(dims, c),
                    None => validate_chunk_dims(dims, &auto_chunk_dims(dims, es)),
                }
            }
            _ if !self.filters.is_empty() => Err(FormatError::InvalidOptions(
                "filters require a chunked layout".into(),
            )),
            LayoutChoice::Compact => {
                let bytes = self.values.len() * es;
                if bytes > MAX_COMPACT_BYTES {
                    return Err(FormatError::InvalidOptions(format!(
                        "compact layout holds at most {MAX_COMPACT_BYTES} bytes, dataset needs {bytes}"
                    )));
                }
                Ok(())
            }
            LayoutChoice::Contiguous => Ok(()),
        }
    }
}

fn check_count(dataspace: &Dataspace, count: usize) -> Result<(), FormatError> {
    let expected = dataspace.num_elements();
    if expected != count as u64 {
        return Err(FormatError::ShapeMismatch {
            expected,
            actual: count as u64,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeSpec {
    Group(GroupSpec),
    Dataset(DatasetSpec),
    SoftLink(String),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct GroupSpec {
    /// Members by name; iteration order is the on-disk name order.
    pub children: BTreeMap<String, NodeSpec>,
    pub attributes: Vec<AttributeSpec>,
}

fn split_path(path: &str) -> Result<Vec<&str>, FormatError> {
    let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if parts.iter().any(|p| *p == "." || *p == "..") {
        return Err(FormatError::InvalidOptions(format!("path {path:?} contains . or ..")));
    }
    Ok(parts)
}

impl GroupSpec {
    /// The group at `parts`, creating missing groups along the way.
    fn group_mut(&mut self, parts: &[&str], path: &str) -> Result<&mut GroupSpec, FormatError> {
        let mut g = self;
        for p in parts {
            let node = g
                .children
                .entry((*p).to_string())
                .or_insert_with(|| NodeSpec::Group(GroupSpec::default()));
            match node {
                NodeSpec::Group(inner) => g = inner,
                _ => {
                    return Err(FormatError::InvalidOptions(format!(
                        "{path:?}: {p:?} exists and is not a group"
                    )))
                }
            }
        }
        Ok(g)
    }

    fn insert(&mut self, path: &str, node: NodeSpec) -> Result<(), FormatError> {
        let parts = split_path(path)?;
        let Some((name, parents)) = parts.split_last() else {
            return Err(FormatError::InvalidOptions("the root group already exists".into()));
        };
        let parent = self.group_mut(parents, path)?;
        if parent.children.contains_key(*name) {
            return Err(FormatError::InvalidOptions(format!("{path:?} already exists")));
        }
        parent.children.insert((*name).to_string(), node);
        Ok(())
    }

    fn attributes_mut(&mut self, path: &str) -> Result<&mut Vec<AttributeSpec>, FormatError> {
        let parts = split_path(path)?;
        let Some((name, parents)) = parts.split_last() else {
            return Ok(&mut self.attributes);
        };
        let mut g = &mut *self;
        for p in parents {
            g = match g.children.get_mut(*p) {
                Some(NodeSpec::Group(inner)) => inner,
                _ => return Err(not_found(path)),
            };
        }
        match g.children.get_mut(*name) {
            Some(NodeSpec::Group(inner)) => Ok(&mut inner.attributes),
            Some(NodeSpec::Dataset(d)) => Ok(&mut d.attributes),
            Some(NodeSpec::SoftLink(_)) => Err(FormatError::InvalidOptions(format!(
                "{path:?} is a soft link and cannot carry attributes"
            ))),
            None => Err(not_found(path)),
        }
    }
}

fn not_found(path: &str) -> FormatError {
    FormatError::NotFound {
        name: path.to_string(),
        siblings: Vec::new(),
    }
}

/// The main file creation API.
#[derive(Debug, Default)]
pub struct FileWriter {
    root: GroupSpec,
}

impl FileWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root(&self) -> &GroupSpec {
        &self.root
    }

    /// Add a dataset, creating any missing intermediate groups.
    pub fn add_dataset(&mut self, path: &str, dataset: DatasetSpec) -> Result<(), FormatError> {
        dataset.validate()?;
        for a in &dataset.attributes {
            check_count(&a.dataspace, a.values.len())?;
        }
        self.root.insert(path, NodeSpec::Dataset(dataset))
    }

    /// Create a group and its parents. Existing groups are left alone.
    pub fn create_group(&mut self, path: &str) -> Result<(), FormatError> {
        let parts = split_path(path)?;
        self.root.group_mut(&parts, path).map(|_| ())
    }

    pub fn add_soft_link(&mut self, path: &str, target: &str) -> Result<(), FormatError> {
        if target.is_empty() {
            return Err(FormatError::InvalidOptions("soft link target is empty".into()));
        }
        self.root.insert(path, NodeSpec::SoftLink(target.to_string()))
    }

    /// Set an attribute on the group or dataset at `path`, replacing one of
    /// the same name.
    pub fn set_attr(&mut self, path: &str, attr: AttributeSpec) -> Result<(), FormatError> {
        check_count(&attr.dataspace, attr.values.len())?;
        let attrs = self.root.attributes_mut(path)?;
        match attrs.iter_mut().find(|a| a.name == attr.name) {
            Some(existing) => *existing = attr,
            None => attrs.push(attr),
        }
        Ok(())
    }

    /// Lay out the whole file and return its bytes.
    pub fn finish(&self) -> Result<Vec<u8>, FormatError> {
        let mut out = vec![0u8; Superblock::v0_size(OFFSET_SIZE)];
        let (root_address, stab) = write_group(&self.root, &mut out)?;

        let superblock = Superblock {
            version: 0,
            offset_size: OFFSET_SIZE,
            length_size: LENGTH_SIZE,
            base_address: 0,
            signature_offset: 0,
            eof_address: out.len() as u64,
            root_group_address: root_address,
            group_leaf_node_k: Some(GROUP_LEAF_K),
            group_internal_node_k: Some(GROUP_INTERNAL_K),
            indexed_storage_internal_node_k: None,
            consistency_flags: 0,
            superblock_extension_address: None,
        };
        let sb = superblock.serialize_v0(stab.btree_address, stab.heap_address);
        out[..sb.len()].copy_from_slice(&sb);
        debug!(bytes = out.len(), root_address, "file laid out");
        Ok(out)
    }
}

/// Encode attributes, storing any variable-length payloads in `heap`.
fn encode_attributes(
    attrs: &[AttributeSpec],
    heap: &mut GlobalHeapWriter,
) -> Result<Vec<AttributeMessage>, FormatError> {
    attrs.iter().map(|a| a.encode(heap)).collect()
}

fn flush_heap(heap: GlobalHeapWriter, out: &mut Vec<u8>) {
    if !heap.is_empty() {
        out.extend_from_slice(&heap.finish());
    }
}

fn write_group(g: &GroupSpec, out: &mut Vec<u8>) -> Result<(u64, SymbolTableMessage), FormatError> {
    let mut names = LocalHeapWriter::new();
    let mut entries = Vec::with_capacity(g.children.len());
    for (name, child) in &g.children {
        let name_offset = names.add(name);
        let entry = match child {
            NodeSpec::Group(sub) => {
                let (address, stab) = write_group(sub, out)?;
                SymbolTableEntry::group(name_offset, address, stab, OFFSET_SIZE)
            }
            NodeSpec::Dataset(d) => SymbolTableEntry::hard(name_offset, write_dataset(d, out)?),
            NodeSpec::SoftLink(target) => {
                let value = u32::try_from(names.add(target)).map_err(|_| {
                    FormatError::InvalidOptions("group name heap exceeds 4 GiB".into())
                })?;
                SymbolTableEntry::soft_link(name_offset, value)
            }
        };
        entries.push(entry);
    }

    let heap_address = out.len() as u64;
    out.extend_from_slice(&names.finish(heap_address, OFFSET_SIZE, LENGTH_SIZE));
    let mut tree = Vec::new();
    let btree_address = build_group_tree(
        &entries,
        GROUP_LEAF_K,
        GROUP_INTERNAL_K,
        OFFSET_SIZE,
        LENGTH_SIZE,
        out.len() as u64,
        &mut tree,
    );
    out.extend_from_slice(&tree);
    let stab = SymbolTableMessage {
        btree_address,
        heap_address,
    };

    let mut heap = GlobalHeapWriter::new(out.len() as u64, LENGTH_SIZE);
    let attrs = encode_attributes(&g.attributes, &mut heap)?;
    flush_heap(heap, out);

    let mut w = ObjectHeaderWriter::new();
    w.add_message(MessageType::SymbolTable, stab.serialize(OFFSET_SIZE));
    for a in &attrs {
        w.add_message(MessageType::Attribute, a.serialize(LENGTH_SIZE));
    }
    let address = out.len() as u64;
    out.extend_from_slice(&w.serialize()?);
    Ok((address, stab))
}

fn write_dataset(d: &DatasetSpec, out: &mut Vec<u8>) -> Result<u64, FormatError> {
    d.validate()?;
    let es = d.datatype.size() as usize;
    let dims = &d.dataspace.dims;

    let mut heap = GlobalHeapWriter::new(out.len() as u64, LENGTH_SIZE);
    let raw = encode_all(&d.values, &d.datatype, &mut heap)?;
    let attrs = encode_attributes(&d.attributes, &mut heap)?;
    flush_heap(heap, out);

    let (layout, alloc_time) = match &d.layout {
        LayoutChoice::Compact => (DataLayout::Compact { data: raw }, AllocTime::Early),
        LayoutChoice::Contiguous if raw.is_empty() => (
            DataLayout::Contiguous {
                address: UNDEFINED_ADDRESS,
                size: 0,
            },
            AllocTime::Late,
        ),
        LayoutChoice::Contiguous => {
            let address = out.len() as u64;
            out.extend_from_slice(&raw);
            (
                DataLayout::Contiguous {
                    address,
                    size: raw.len() as u64,
                },
                AllocTime::Late,
            )
        }
        LayoutChoice::Chunked { chunk_dims } => {
            let chunk_dims = chunk_dims.clone().unwrap_or_else(|| auto_chunk_dims(dims, es));
            let fill = FillValue {
                alloc_time: AllocTime::Incremental,
                value: d.fill_value.clone(),
            };
            let mut buf = Vec::new();
            let root = write_chunks(
                &raw,
                dims,
                &chunk_dims,
                &fill.element_bytes(es),
                &d.filters,
                OFFSET_SIZE,
                LENGTH_SIZE,
                out.len() as u64,
                &mut buf,
            )?;
            out.extend_from_slice(&buf);
            (
                DataLayout::Chunked {
                    chunk_dims,
                    element_size: es as u32,
                    index: ChunkIndex::BTreeV1 { address: root },
                },
                AllocTime::Incremental,
            )
        }
    };

    let fill = FillValue {
        alloc_time,
        value: d.fill_value.clone(),
    };
    let mut w = ObjectHeaderWriter::new();
    w.add_message_with_flags(MessageType::Datatype, d.datatype.encode(), MSG_FLAG_CONSTANT);
    w.add_message(MessageType::Dataspace, d.dataspace.serialize(LENGTH_SIZE));
    w.add_message_with_flags(MessageType::FillValue, fill.serialize(), MSG_FLAG_CONSTANT);
    w.add_message(MessageType::DataLayout, layout.serialize(OFFSET_SIZE, LENGTH_SIZE)?);
    if matches!(layout, DataLayout::Chunked { .. }) && !d.filters.is_empty() {
        w.add_message(MessageType::FilterPipeline, d.filters.serialize());
    }
    for a in &attrs {
        w.add_message(MessageType::Attribute, a.serialize(LENGTH_SIZE));
    }
    let address = out.len() as u64;
    out.extend_from_slice(&w.serialize()?);
    Ok(address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree_v1::FileNodes;
    use crate::chunked_read::{read_selection, DatasetStorage};
    use crate::filter_pipeline::{FilterDescription, FILTER_FLETCHER32, FILTER_LZF, FILTER_SHUFFLE};
    use crate::global_heap::FileHeap;
    use crate::group::{entries, resolve_path, FileGroups, GroupSource};
    use crate::messages::{FileHeaders, HeaderLoader, ObjectMessages};
    use crate::selection::Hyperslab;
    use crate::signature::{find_signature, DEFAULT_SEARCH_LIMIT};
    use crate::value::decode_all;

    fn open(file: &[u8]) -> Superblock {
        let at = find_signature(file, DEFAULT_SEARCH_LIMIT).unwrap();
        Superblock::parse(file, at).unwrap()
    }

    fn messages(file: &[u8], path: &str) -> ObjectMessages {
        let sb = open(file);
        let groups = FileGroups::new(file, 8, 8);
        let address = resolve_path(&groups, sb.root_group_address, path).unwrap();
        let headers = FileHeaders {
            data: file,
            offset_size: 8,
            length_size: 8,
        };
        ObjectMessages::decode(&headers.load_header(address).unwrap(), &headers, 8, 8).unwrap()
    }

    fn read_all(file: &[u8], path: &str) -> Vec<Value> {
        let m = messages(file, path);
        let (dt, ds, layout) = m.dataset_parts().unwrap();
        let storage = DatasetStorage {
            layout,
            dims: &ds.dims,
            element_size: dt.size() as usize,
            filters: &m.filters,
            fill: &m.fill_value,
        };
        let nodes = FileNodes {
            data: file,
            offset_size: 8,
            length_size: 8,
        };
        let raw = read_selection(file, &nodes, &storage, &Hyperslab::all(&ds.dims)).unwrap();
        decode_all(
            &raw,
            dt,
            &FileHeap {
                data: file,
                length_size: 8,
            },
        )
        .unwrap()
    }

    fn ints(n: i64) -> Vec<Value> {
        (0..n).map(Value::Int).collect()
    }

    #[test]
    fn every_layout_reads_back() {
        let mut w = FileWriter::new();
        for (name, layout) in [
            ("contiguous", LayoutChoice::Contiguous),
            ("compact", LayoutChoice::Compact),
            (
                "chunked",
                LayoutChoice::Chunked {
                    chunk_dims: Some(vec![3, 2]),
                },
            ),
            ("auto", LayoutChoice::Chunked { chunk_dims: None }),
        ] {
            let mut d = DatasetSpec::new(Datatype::i32(), Dataspace::simple(&[5, 4]), ints(20));
            d.layout = layout;
            w.add_dataset(&format!("/data/{name}"), d).unwrap();
        }
        let file = w.finish().unwrap();
        for name in ["contiguous", "compact", "chunked", "auto"] {
            assert_eq!(read_all(&file, &format!("/data/{name}")), ints(20), "{name}");
        }
    }

    #[test]
    fn vlen_strings_and_attributes() {
        let strings: Vec<Value> = ["a", "bb", "ccc"].iter().map(|s| Value::String(s.to_string())).collect();
        let mut d = DatasetSpec::new(Datatype::vlen_string(), Dataspace::simple(&[3]), strings.clone());
        d.attributes.push(AttributeSpec {
            name: "units".into(),
            datatype: Datatype::vlen_string(),
            dataspace: Dataspace::scalar(),
            values: vec![Value::String("m/s".into())],
        });
        let mut w = FileWriter::new();
        w.add_dataset("names", d).unwrap();
        w.set_attr(
            "/",
            AttributeSpec {
                name: "version".into(),
                datatype: Datatype::i64(),
                dataspace: Dataspace::scalar(),
                values: vec![Value::Int(3)],
            },
        )
        .unwrap();
        let file = w.finish().unwrap();

        assert_eq!(read_all(&file, "/names"), strings);
        let heap = FileHeap {
            data: &file,
            length_size: 8,
        };
        let attr = &messages(&file, "/names").attributes[0];
        assert_eq!(attr.values(&heap).unwrap(), vec![Value::String("m/s".into())]);
        let root = messages(&file, "/");
        assert_eq!(root.attributes[0].values(&heap).unwrap(), vec![Value::Int(3)]);
    }

    #[test]
    fn groups_links_and_many_children() {
        let mut w = FileWriter::new();
        for i in 0..100 {
            w.add_dataset(
                &format!("/big/d{i:03}"),
                DatasetSpec::new(Datatype::u8(), Dataspace::scalar(), vec![Value::UInt(i)]),
            )
            .unwrap();
        }
        w.create_group("/empty/nested").unwrap();
        w.add_soft_link("/alias", "/big/d042").unwrap();
        let file = w.finish().unwrap();

        assert_eq!(read_all(&file, "/alias"), vec![Value::UInt(42)]);
        assert_eq!(read_all(&file, "/big/d099"), vec![Value::UInt(99)]);

        let sb = open(&file);
        let groups = FileGroups::new(&file, 8, 8);
        let big = resolve_path(&groups, sb.root_group_address, "/big").unwrap();
        let storage = groups.group_storage(big).unwrap().unwrap();
        assert_eq!(entries(&groups, &storage).unwrap().len(), 100);
        let nested = resolve_path(&groups, sb.root_group_address, "/empty/nested").unwrap();
        let storage = groups.group_storage(nested).unwrap().unwrap();
        assert!(entries(&groups, &storage).unwrap().is_empty());
    }

    #[test]
    fn compressed_chunks_with_fill_value() {
        let mut d = DatasetSpec::new(Datatype::f64(), Dataspace::simple(&[10, 10]), {
            (0..100).map(|v| Value::Float(v as f64 / 4.0)).collect()
        });
        d.layout = LayoutChoice::Chunked {
            chunk_dims: Some(vec![4, 4]),
        };
        d.filters = FilterPipeline {
            filters: vec![
                FilterDescription::new(FILTER_SHUFFLE, vec![8]),
                FilterDescription::new(FILTER_LZF, vec![]),
                FilterDescription::new(FILTER_FLETCHER32, vec![]),
            ],
        };
        d.fill_value = Some((-1.0f64).to_le_bytes().to_vec());
        let expected = d.values.clone();
        let mut w = FileWriter::new();
        w.add_dataset("x", d).unwrap();
        let file = w.finish().unwrap();
        assert_eq!(read_all(&file, "x"), expected);
        assert_eq!(
            messages(&file, "x").fill_value.value,
            Some((-1.0f64).to_le_bytes().to_vec())
        );
    }

    #[test]
    fn invalid_specs_are_rejected() {
        let mut w = FileWriter::new();
        assert!(matches!(
            w.add_dataset("a", DatasetSpec::new(Datatype::i32(), Dataspace::simple(&[3]), ints(2))),
            Err(FormatError::ShapeMismatch { expected: 3, actual: 2 })
        ));

        let mut d = DatasetSpec::new(Datatype::i32(), Dataspace::simple(&[3]), ints(3));
        d.filters = FilterPipeline {
            filters: vec![FilterDescription::new(FILTER_SHUFFLE, vec![])],
        };
        assert!(matches!(w.add_dataset("b", d), Err(FormatError::InvalidOptions(_))));

        let mut d = DatasetSpec::new(Datatype::f64(), Dataspace::simple(&[10_000]), {
            (0..10_000).map(|v| Value::Float(v as f64)).collect()
        });
        d.layout = LayoutChoice::Compact;
        assert!(matches!(w.add_dataset("c", d), Err(FormatError::InvalidOptions(_))));

        w.add_dataset("d", DatasetSpec::new(Datatype::i32(), Dataspace::scalar(), ints(1))).unwrap();
        assert!(w.add_dataset("d", DatasetSpec::new(Datatype::i32(), Dataspace::scalar(), ints(1))).is_err());
        assert!(w.add_dataset("d/e", DatasetSpec::new(Datatype::i32(), Dataspace::scalar(), ints(1))).is_err());
        assert!(matches!(
            w.set_attr(
                "/missing",
                AttributeSpec {
                    name: "x".into(),
                    datatype: Datatype::i32(),
                    dataspace: Dataspace::scalar(),
                    values: ints(1),
                }
            ),
            Err(FormatError::NotFound { .. })
        ));
    }
}
