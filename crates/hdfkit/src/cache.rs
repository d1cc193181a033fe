//! Per-handle metadata cache.
//!
//! One bounded LRU per structure class: object headers, B-tree nodes,
//! local heaps, symbol table nodes and global heap collections. Files are
//! read-only for the life of a handle, so entries are never invalidated;
//! [`MetadataCache::clear`] drops everything and resets the counters.
//!
//! [`CachedSource`] plugs the cache into the format crate's loader traits,
//! so path resolution, chunk lookup and variable-length decoding all go
//! through it.

use std::cell::{Cell, RefCell};
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use tracing::debug;

use hdfkit_format::btree_v1::{BTreeNode, NodeLoader};
use hdfkit_format::error::FormatError;
use hdfkit_format::global_heap::GlobalHeapCollection;
use hdfkit_format::group::{GroupSource, GroupStorage};
use hdfkit_format::local_heap::LocalHeap;
use hdfkit_format::messages::{HeaderLoader, ObjectMessages};
use hdfkit_format::object_header::ObjectHeader;
use hdfkit_format::symbol_table::SymbolTableNode;
use hdfkit_format::value::HeapReader;

use crate::property_list::FileAccessProps;

/// Cache counters since open or the last clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Entries currently held across all classes.
    pub size: usize,
}

type Lru<T> = RefCell<LruCache<u64, Arc<T>>>;

fn lru<T>(capacity: usize) -> Lru<T> {
    RefCell::new(LruCache::new(NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)))
}

pub(crate) struct MetadataCache {
    headers: Lru<ObjectHeader>,
    nodes: Lru<BTreeNode>,
    local_heaps: Lru<LocalHeap>,
    symbol_nodes: Lru<SymbolTableNode>,
    global_heaps: Lru<GlobalHeapCollection>,
    hits: Cell<u64>,
    misses: Cell<u64>,
    debug: bool,
}

impl MetadataCache {
    pub(crate) fn new(props: &FileAccessProps) -> Self {
        MetadataCache {
            headers: lru(props.header_cache_capacity),
            nodes: lru(props.node_cache_capacity),
            local_heaps: lru(props.group_cache_capacity),
            symbol_nodes: lru(props.group_cache_capacity),
            global_heaps: lru(props.heap_cache_capacity),
            hits: Cell::new(0),
            misses: Cell::new(0),
            debug: props.debug,
        }
    }

    fn fetch<T>(
        &self,
        class: &'static str,
        cache: &Lru<T>,
        address: u64,
        load: impl FnOnce() -> Result<T, FormatError>,
    ) -> Result<Arc<T>, FormatError> {
        let cached = cache.borrow_mut().get(&address).cloned();
        if let Some(v) = cached {
            self.hits.set(self.hits.get() + 1);
            if self.debug {
                debug!(class, address, "metadata cache hit");
            }
            return Ok(v);
        }
        self.misses.set(self.misses.get() + 1);
        if self.debug {
            debug!(class, address, "metadata cache miss");
        }
        let v = Arc::new(load()?);
        cache.borrow_mut().put(address, Arc::clone(&v));
        Ok(v)
    }

    pub(crate) fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.get(),
            misses: self.misses.get(),
            size: self.headers.borrow().len()
                + self.nodes.borrow().len()
                + self.local_heaps.borrow().len()
                + self.symbol_nodes.borrow().len()
                + self.global_heaps.borrow().len(),
        }
    }

    pub(crate) fn clear(&self) {
        self.headers.borrow_mut().clear();
        self.nodes.borrow_mut().clear();
        self.local_heaps.borrow_mut().clear();
        self.symbol_nodes.borrow_mut().clear();
        self.global_heaps.borrow_mut().clear();
        self.hits.set(0);
        self.misses.set(0);
    }
}

/// File bytes plus the cache in front of them.
#[derive(Clone, Copy)]
pub(crate) struct CachedSource<'a> {
    pub data: &'a [u8],
    pub offset_size: u8,
    pub length_size: u8,
    pub cache: &'a MetadataCache,
}

impl CachedSource<'_> {
    pub(crate) fn messages(&self, address: u64) -> Result<ObjectMessages, FormatError> {
        let header = self.load_header(address)?;
        ObjectMessages::decode(&header, self, self.offset_size, self.length_size)
    }
}

impl HeaderLoader for CachedSource<'_> {
    fn load_header(&self, address: u64) -> Result<Arc<ObjectHeader>, FormatError> {
        self.cache.fetch("object header", &self.cache.headers, address, || {
            ObjectHeader::parse(self.data, address, self.offset_size, self.length_size)
        })
    }
}

impl NodeLoader for CachedSource<'_> {
    fn load_node(&self, address: u64, chunk_ndims: usize) -> Result<Arc<BTreeNode>, FormatError> {
        self.cache.fetch("b-tree node", &self.cache.nodes, address, || {
            BTreeNode::parse(self.data, address, self.offset_size, self.length_size, chunk_ndims)
        })
    }
}

impl GroupSource for CachedSource<'_> {
    fn nodes(&self) -> &dyn NodeLoader {
        self
    }

    fn local_heap(&self, address: u64) -> Result<Arc<LocalHeap>, FormatError> {
        self.cache.fetch("local heap", &self.cache.local_heaps, address, || {
            LocalHeap::parse(self.data, address, self.offset_size, self.length_size)
        })
    }

    fn symbol_node(&self, address: u64) -> Result<Arc<SymbolTableNode>, FormatError> {
        self.cache.fetch("symbol table node", &self.cache.symbol_nodes, address, || {
            SymbolTableNode::parse(self.data, address, self.offset_size)
        })
    }

    fn group_storage(&self, address: u64) -> Result<Option<GroupStorage>, FormatError> {
        GroupStorage::from_messages(&self.messages(address)?)
    }
}

impl HeapReader for CachedSource<'_> {
    fn read_object(&self, collection: u64, index: u32) -> Result<Vec<u8>, FormatError> {
        let coll = self.cache.fetch("global heap", &self.cache.global_heaps, collection, || {
            GlobalHeapCollection::parse(self.data, collection, self.length_size)
        })?;
        Ok(coll.object(index)?.data.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hdfkit_format::dataspace::Dataspace;
    use hdfkit_format::datatype::Datatype;
    use hdfkit_format::file_writer::{DatasetSpec, FileWriter};
    use hdfkit_format::group::resolve_path;
    use hdfkit_format::superblock::Superblock;
    use hdfkit_format::value::Value;

    fn sample() -> Vec<u8> {
        let mut w = FileWriter::new();
        for name in ["/a/x", "/a/y", "/b"] {
            w.add_dataset(
                name,
                DatasetSpec::new(Datatype::i32(), Dataspace::simple(&[2]), vec![Value::Int(1), Value::Int(2)]),
            )
            .unwrap();
        }
        w.finish().unwrap()
    }

    #[test]
    fn repeated_lookups_hit() {
        let file = sample();
        let sb = Superblock::parse(&file, 0).unwrap();
        let cache = MetadataCache::new(&FileAccessProps::default());
        let src = CachedSource {
            data: &file,
            offset_size: 8,
            length_size: 8,
            cache: &cache,
        };

        let first = resolve_path(&src, sb.root_group_address, "/a/y").unwrap();
        let after_first = cache.stats();
        assert!(after_first.misses > 0);

        let second = resolve_path(&src, sb.root_group_address, "/a/y").unwrap();
        assert_eq!(first, second);
        let after_second = cache.stats();
        assert!(after_second.hits > 0);
        assert_eq!(after_second.misses, after_first.misses);
        assert_eq!(after_second.size, after_first.size);

        cache.clear();
        assert_eq!(cache.stats(), CacheStats::default());
    }

    #[test]
    fn capacity_bounds_each_class() {
        let file = sample();
        let sb = Superblock::parse(&file, 0).unwrap();
        let props = FileAccessProps::new()
            .header_cache_capacity(1)
            .node_cache_capacity(1)
            .group_cache_capacity(1);
        let cache = MetadataCache::new(&props);
        let src = CachedSource {
            data: &file,
            offset_size: 8,
            length_size: 8,
            cache: &cache,
        };
        for path in ["/a/x", "/a/y", "/b"] {
            resolve_path(&src, sb.root_group_address, path).unwrap();
        }
        assert!(cache.stats().size <= 4);
    }
}
