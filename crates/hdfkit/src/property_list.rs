//! Property lists for opening files and creating datasets.
//!
//! Each list is a plain struct with public fields, a `Default`, and
//! builder-style setters so options can be chained:
//!
//! ```
//! use hdfkit::{Compression, DatasetCreateProps, FileAccessProps};
//!
//! let fapl = FileAccessProps::new().debug(true).node_cache_capacity(4096);
//! let dcpl = DatasetCreateProps::new()
//!     .chunk(&[100, 100])
//!     .compression(Compression::Gzip(6))
//!     .shuffle();
//! assert!(fapl.debug);
//! assert_eq!(dcpl.chunk_dims, Some(vec![100, 100]));
//! ```

use hdfkit_format::error::FormatError;
use hdfkit_format::filter_pipeline::{
    FilterDescription, FilterPipeline, FILTER_DEFLATE, FILTER_FLETCHER32, FILTER_LZF,
    FILTER_SHUFFLE,
};
use hdfkit_format::signature::DEFAULT_SEARCH_LIMIT;
use hdfkit_format::value::Value;

use crate::types::NdArray;

pub const DEFAULT_HEADER_CACHE: usize = 512;
pub const DEFAULT_GROUP_CACHE: usize = 256;
pub const DEFAULT_NODE_CACHE: usize = 1024;
pub const DEFAULT_HEAP_CACHE: usize = 64;

/// File access properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAccessProps {
    /// Parsed object headers kept per handle.
    pub header_cache_capacity: usize,
    /// Local heaps and symbol table nodes kept per handle.
    pub group_cache_capacity: usize,
    /// B-tree nodes kept per handle.
    pub node_cache_capacity: usize,
    /// Global heap collections kept per handle.
    pub heap_cache_capacity: usize,
    /// Emit `debug!` events for path resolution, cache traffic and reads.
    pub debug: bool,
    /// How far into the file to look for the signature.
    pub signature_search_limit: usize,
    /// Memory-map files instead of reading them into memory.
    pub use_mmap: bool,
}

impl Default for FileAccessProps {
    fn default() -> Self {
        FileAccessProps {
            header_cache_capacity: DEFAULT_HEADER_CACHE,
            group_cache_capacity: DEFAULT_GROUP_CACHE,
            node_cache_capacity: DEFAULT_NODE_CACHE,
            heap_cache_capacity: DEFAULT_HEAP_CACHE,
            debug: false,
            signature_search_limit: DEFAULT_SEARCH_LIMIT,
            use_mmap: cfg!(feature = "mmap"),
        }
    }
}

impl FileAccessProps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header_cache_capacity(mut self, n: usize) -> Self {
        self.header_cache_capacity = n;
        self
    }

    pub fn group_cache_capacity(mut self, n: usize) -> Self {
        self.group_cache_capacity = n;
        self
    }

    pub fn node_cache_capacity(mut self, n: usize) -> Self {
        self.node_cache_capacity = n;
        self
    }

    pub fn heap_cache_capacity(mut self, n: usize) -> Self {
        self.heap_cache_capacity = n;
        self
    }

    pub fn debug(mut self, on: bool) -> Self {
        self.debug = on;
        self
    }

    pub fn signature_search_limit(mut self, bytes: usize) -> Self {
        self.signature_search_limit = bytes;
        self
    }

    /// Ignored when the `mmap` feature is off.
    pub fn use_mmap(mut self, on: bool) -> Self {
        self.use_mmap = on;
        self
    }
}

/// Storage layout requested for a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    Contiguous,
    /// Stored inside the object header; small datasets only.
    Compact,
    Chunked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    /// Deflate at level 0 to 9.
    Gzip(u32),
    Lzf,
}

/// Dataset creation properties.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DatasetCreateProps {
    /// `None` picks chunked storage when chunk dims or filters are set,
    /// contiguous otherwise.
    pub layout: Option<Layout>,
    /// Chunk shape; computed from the dataset shape when unset.
    pub chunk_dims: Option<Vec<u64>>,
    pub compression: Option<Compression>,
    pub shuffle: bool,
    pub fletcher32: bool,
    /// Value of elements never written.
    pub fill_value: Option<Value>,
    pub attributes: Vec<(String, NdArray)>,
}

impl DatasetCreateProps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn layout(mut self, layout: Layout) -> Self {
        self.layout = Some(layout);
        self
    }

    /// Chunked storage with the given chunk shape.
    pub fn chunk(mut self, dims: &[u64]) -> Self {
        self.chunk_dims = Some(dims.to_vec());
        self
    }

    pub fn compression(mut self, c: Compression) -> Self {
        self.compression = Some(c);
        self
    }

    /// Shorthand for `compression(Compression::Gzip(level))`.
    pub fn deflate(self, level: u32) -> Self {
        self.compression(Compression::Gzip(level))
    }

    pub fn shuffle(mut self) -> Self {
        self.shuffle = true;
        self
    }

    pub fn fletcher32(mut self) -> Self {
        self.fletcher32 = true;
        self
    }

    pub fn fill_value(mut self, v: Value) -> Self {
        self.fill_value = Some(v);
        self
    }

    pub fn attribute(mut self, name: &str, value: NdArray) -> Self {
        self.attributes.push((name.to_string(), value));
        self
    }

    pub(crate) fn has_filters(&self) -> bool {
        self.compression.is_some() || self.shuffle || self.fletcher32
    }

    pub(crate) fn resolved_layout(&self) -> Layout {
        match self.layout {
            Some(l) => l,
            None if self.chunk_dims.is_some() || self.has_filters() => Layout::Chunked,
            None => Layout::Contiguous,
        }
    }

    /// Filter pipeline in write order: shuffle, compression, checksum.
    pub(crate) fn pipeline(&self, element_size: u32) -> Result<FilterPipeline, FormatError> {
        let mut filters = Vec::new();
        if self.shuffle {
            filters.push(FilterDescription::new(FILTER_SHUFFLE, vec![element_size]));
        }
        match self.compression {
            Some(Compression::Gzip(level)) if level > 9 => {
                return Err(FormatError::InvalidOptions(format!(
                    "gzip level {level} is outside 0..=9"
                )))
            }
            Some(Compression::Gzip(level)) => {
                filters.push(FilterDescription::new(FILTER_DEFLATE, vec![level]))
            }
            Some(Compression::Lzf) => {
                filters.push(FilterDescription::new(FILTER_LZF, Vec::new()).optional())
            }
            None => {}
        }
        if self.fletcher32 {
            filters.push(FilterDescription::new(FILTER_FLETCHER32, Vec::new()));
        }
        Ok(FilterPipeline { filters })
    }
}
