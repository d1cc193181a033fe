//! Reading API: File, Group, Dataset and BatchIter handles.
//!
//! [`File::open`] memory-maps the file when the `mmap` feature is enabled
//! (the default) and [`FileAccessProps::use_mmap`] allows it; otherwise the
//! file is read into memory. [`File::from_bytes`] opens an in-memory image.
//!
//! Every handle owns its metadata cache. Handles are `Send` but not `Sync`:
//! one handle serves one reader at a time, and separate handles on the same
//! path share nothing.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::debug;

use hdfkit_format::chunked_read::{read_selection, DatasetStorage};
use hdfkit_format::data_layout::DataLayout;
use hdfkit_format::dataspace::{Dataspace, DataspaceType};
use hdfkit_format::datatype::Datatype;
use hdfkit_format::error::FormatError;
use hdfkit_format::fill_value::FillValue;
use hdfkit_format::filter_pipeline::FilterPipeline;
use hdfkit_format::group::{entries, resolve_path, EntryTarget, GroupEntry, GroupSource};
use hdfkit_format::messages::{ObjectKind, ObjectMessages};
use hdfkit_format::selection::Hyperslab;
use hdfkit_format::signature::find_signature;
use hdfkit_format::superblock::Superblock;
use hdfkit_format::value::{decode, decode_all, Value};

use crate::cache::{CacheStats, CachedSource, MetadataCache};
use crate::error::{ErrorKind, Result, ResultExt};
use crate::property_list::FileAccessProps;
use crate::types::{shape_of, Attribute};

enum FileData {
    Owned(Vec<u8>),
    #[cfg(feature = "mmap")]
    Mapped(memmap2::Mmap),
}

impl FileData {
    fn as_bytes(&self) -> &[u8] {
        match self {
            FileData::Owned(v) => v.as_slice(),
            #[cfg(feature = "mmap")]
            FileData::Mapped(m) => &m[..],
        }
    }
}

#[cfg(feature = "mmap")]
fn load(path: &Path, use_mmap: bool) -> std::io::Result<FileData> {
    if use_mmap {
        let file = std::fs::File::open(path)?;
        // SAFETY: the mapping is read-only; a concurrent writer on the same
        // path is unsupported.
        let map = unsafe { memmap2::Mmap::map(&file)? };
        return Ok(FileData::Mapped(map));
    }
    std::fs::read(path).map(FileData::Owned)
}

#[cfg(not(feature = "mmap"))]
fn load(path: &Path, _use_mmap: bool) -> std::io::Result<FileData> {
    std::fs::read(path).map(FileData::Owned)
}

fn join(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{parent}{name}")
    } else {
        format!("{parent}/{name}")
    }
}

fn normalize(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", parts.join("/"))
}

/// An open HDF5 file.
pub struct File {
    data: FileData,
    path: Option<PathBuf>,
    superblock: Superblock,
    props: FileAccessProps,
    cache: MetadataCache,
}

impl File {
    /// Open a file with default access properties.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with(path, FileAccessProps::default())
    }

    pub fn open_with<P: AsRef<Path>>(path: P, props: FileAccessProps) -> Result<Self> {
        let path = path.as_ref();
        let data = load(path, props.use_mmap).during("open").in_file(Some(path))?;
        Self::from_data(data, Some(path.to_path_buf()), props)
    }

    /// Open an in-memory file image.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        Self::from_bytes_with(bytes, FileAccessProps::default())
    }

    pub fn from_bytes_with(bytes: Vec<u8>, props: FileAccessProps) -> Result<Self> {
        Self::from_data(FileData::Owned(bytes), None, props)
    }

    fn from_data(data: FileData, path: Option<PathBuf>, props: FileAccessProps) -> Result<Self> {
        let superblock = {
            let bytes = data.as_bytes();
            find_signature(bytes, props.signature_search_limit)
                .and_then(|at| Superblock::parse(bytes, at))
                .during("open")
                .in_file(path.as_deref())?
        };
        if props.debug {
            debug!(
                file = ?path,
                version = superblock.version,
                signature_offset = superblock.signature_offset,
                root = superblock.root_group_address,
                "superblock parsed"
            );
        }
        Ok(File {
            cache: MetadataCache::new(&props),
            data,
            path,
            superblock,
            props,
        })
    }

    /// Close the file, releasing the mapping and the cache.
    pub fn close(self) {
        if self.props.debug {
            debug!(file = ?self.path, "closing file");
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    pub fn is_mmap(&self) -> bool {
        match &self.data {
            FileData::Owned(_) => false,
            #[cfg(feature = "mmap")]
            FileData::Mapped(_) => true,
        }
    }

    /// File bytes from the signature on; all stored addresses are relative to it.
    fn bytes(&self) -> &[u8] {
        let all = self.data.as_bytes();
        all.get(self.superblock.signature_offset as usize..).unwrap_or(&[])
    }

    fn source(&self) -> CachedSource<'_> {
        CachedSource {
            data: self.bytes(),
            offset_size: self.superblock.offset_size,
            length_size: self.superblock.length_size,
            cache: &self.cache,
        }
    }

    fn resolve(&self, path: &str) -> Result<u64, FormatError> {
        let address = resolve_path(&self.source(), self.superblock.root_group_address, path)?;
        if self.props.debug {
            debug!(path, address, "path resolved");
        }
        Ok(address)
    }

    pub fn root(&self) -> Group<'_> {
        Group {
            file: self,
            path: "/".to_string(),
            address: self.superblock.root_group_address,
        }
    }

    fn open_group(&self, path: String) -> Result<Group<'_>> {
        let address = self.resolve(&path)?;
        if self.source().group_storage(address)?.is_none() {
            return Err(ErrorKind::NotAGroup(path).into());
        }
        Ok(Group {
            file: self,
            path,
            address,
        })
    }

    /// Resolve `path` (absolute, `/`-separated) to a group.
    pub fn group(&self, path: &str) -> Result<Group<'_>> {
        let path = normalize(path);
        self.open_group(path.clone())
            .during("open group")
            .at_object(&path)
            .in_file(self.path())
    }

    /// Resolve `path` to a dataset.
    pub fn dataset(&self, path: &str) -> Result<Dataset<'_>> {
        let path = normalize(path);
        self.resolve(&path)
            .map_err(crate::Error::from)
            .and_then(|address| Dataset::load(self, path.clone(), address))
            .during("open dataset")
            .at_object(&path)
            .in_file(self.path())
    }

    /// Absolute paths of every dataset reachable through hard links.
    pub fn list_datasets(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = vec![("/".to_string(), self.superblock.root_group_address)];
        let src = self.source();
        while let Some((path, address)) = stack.pop() {
            if !seen.insert(address) {
                continue;
            }
            let storage = src
                .group_storage(address)
                .and_then(|s| s.ok_or_else(|| FormatError::NotAGroup(path.clone())))
                .during("list datasets")
                .at_object(&path)
                .in_file(self.path())?;
            let members = entries(&src, &storage)
                .during("list datasets")
                .at_object(&path)
                .in_file(self.path())?;
            for e in members {
                let EntryTarget::Object(child) = e.target else {
                    continue;
                };
                let child_path = join(&path, &e.name);
                match src.messages(child).map(|m| m.kind()) {
                    Ok(ObjectKind::Group) => stack.push((child_path, child)),
                    Ok(ObjectKind::Dataset) => out.push(child_path),
                    Ok(_) => {}
                    Err(err) => return Err(err).during("list datasets").at_object(&child_path).in_file(self.path()),
                }
            }
        }
        out.sort();
        Ok(out)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Drop every cached structure and reset the counters.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("File")
            .field("path", &self.path)
            .field("size", &self.data.as_bytes().len())
            .field("superblock_version", &self.superblock.version)
            .field("mmap", &self.is_mmap())
            .finish()
    }
}

fn decode_attributes(src: &CachedSource<'_>, m: &ObjectMessages) -> Result<Vec<Attribute>, FormatError> {
    m.attributes
        .iter()
        .map(|a| {
            Ok(Attribute {
                name: a.name.clone(),
                datatype: a.datatype.clone(),
                shape: shape_of(&a.dataspace),
                values: a.values(src)?,
            })
        })
        .collect()
}

/// A handle to a group.
pub struct Group<'f> {
    file: &'f File,
    path: String,
    address: u64,
}

impl<'f> Group<'f> {
    pub fn path(&self) -> &str {
        &self.path
    }

    fn members(&self) -> Result<Vec<GroupEntry>, FormatError> {
        let src = self.file.source();
        let storage = src
            .group_storage(self.address)?
            .ok_or_else(|| FormatError::NotAGroup(self.path.clone()))?;
        entries(&src, &storage)
    }

    fn context<T>(&self, r: Result<T, FormatError>, operation: &'static str) -> Result<T> {
        r.during(operation).at_object(&self.path).in_file(self.file.path())
    }

    /// Member names in sorted order, links included.
    pub fn children(&self) -> Result<Vec<String>> {
        let members = self.context(self.members(), "list group")?;
        Ok(members.into_iter().map(|e| e.name).collect())
    }

    /// Kind of the object a member leads to. External links lead nowhere local.
    fn member_kind(&self, e: &GroupEntry) -> Result<Option<ObjectKind>, FormatError> {
        let src = self.file.source();
        let address = match &e.target {
            EntryTarget::Object(a) => *a,
            EntryTarget::SoftLink(_) => self.file.resolve(&join(&self.path, &e.name))?,
            EntryTarget::ExternalLink { .. } => return Ok(None),
        };
        Ok(Some(src.messages(address)?.kind()))
    }

    fn names_of(&self, kind: ObjectKind, operation: &'static str) -> Result<Vec<String>> {
        let members = self.context(self.members(), operation)?;
        let mut out = Vec::new();
        for e in members {
            if self.context(self.member_kind(&e), operation)? == Some(kind) {
                out.push(e.name);
            }
        }
        Ok(out)
    }

    /// Names of member groups, following soft links.
    pub fn groups(&self) -> Result<Vec<String>> {
        self.names_of(ObjectKind::Group, "list groups")
    }

    /// Names of member datasets, following soft links.
    pub fn datasets(&self) -> Result<Vec<String>> {
        self.names_of(ObjectKind::Dataset, "list datasets")
    }

    pub fn group(&self, name: &str) -> Result<Group<'f>> {
        self.file.group(&join(&self.path, name))
    }

    pub fn dataset(&self, name: &str) -> Result<Dataset<'f>> {
        self.file.dataset(&join(&self.path, name))
    }

    pub fn attributes(&self) -> Result<Vec<Attribute>> {
        let src = self.file.source();
        let r = src.messages(self.address).and_then(|m| decode_attributes(&src, &m));
        self.context(r, "read attributes")
    }
}

impl std::fmt::Debug for Group<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("path", &self.path)
            .field("address", &self.address)
            .finish()
    }
}

/// A handle to a dataset. Its header is parsed once, when the handle is made.
#[derive(Clone)]
pub struct Dataset<'f> {
    file: &'f File,
    path: String,
    datatype: Datatype,
    dataspace: Dataspace,
    layout: DataLayout,
    filters: FilterPipeline,
    fill: FillValue,
    messages: ObjectMessages,
}

impl<'f> Dataset<'f> {
    fn load(file: &'f File, path: String, address: u64) -> Result<Self> {
        let m = file.source().messages(address)?;
        if m.kind() != ObjectKind::Dataset {
            return Err(ErrorKind::NotADataset(path).into());
        }
        let (datatype, dataspace, layout) = m.dataset_parts()?;
        let (datatype, dataspace, layout) = (datatype.clone(), dataspace.clone(), layout.clone());
        Ok(Dataset {
            file,
            path,
            datatype,
            dataspace,
            layout,
            filters: m.filters.clone(),
            fill: m.fill_value.clone(),
            messages: m,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Dimensions; empty for scalar and null dataspaces.
    pub fn shape(&self) -> &[u64] {
        match self.dataspace.space_type {
            DataspaceType::Simple => &self.dataspace.dims,
            DataspaceType::Scalar | DataspaceType::Null => &[],
        }
    }

    pub fn datatype(&self) -> &Datatype {
        &self.datatype
    }

    pub fn dataspace(&self) -> &Dataspace {
        &self.dataspace
    }

    pub fn layout(&self) -> &DataLayout {
        &self.layout
    }

    pub fn filters(&self) -> &FilterPipeline {
        &self.filters
    }

    pub fn len(&self) -> u64 {
        self.dataspace.num_elements()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Chunk shape of a chunked dataset.
    pub fn chunk_dims(&self) -> Option<&[u64]> {
        match &self.layout {
            DataLayout::Chunked { chunk_dims, .. } => Some(chunk_dims),
            _ => None,
        }
    }

    fn context<T>(&self, r: Result<T, impl Into<crate::Error>>, operation: &'static str) -> Result<T> {
        r.during(operation).at_object(&self.path).in_file(self.file.path())
    }

    /// The declared fill value, if one is stored.
    pub fn fill_value(&self) -> Result<Option<Value>> {
        let es = self.datatype.size() as usize;
        let r = match &self.fill.value {
            Some(bytes) if bytes.len() == es => decode(bytes, &self.datatype, &self.file.source()).map(Some),
            _ => Ok(None),
        };
        self.context(r, "read fill value")
    }

    pub fn attributes(&self) -> Result<Vec<Attribute>> {
        self.context(decode_attributes(&self.file.source(), &self.messages), "read attributes")
    }

    fn read_raw(&self, sel: &Hyperslab) -> Result<Vec<u8>, FormatError> {
        let src = self.file.source();
        let storage = DatasetStorage {
            layout: &self.layout,
            dims: &self.dataspace.dims,
            element_size: self.datatype.size() as usize,
            filters: &self.filters,
            fill: &self.fill,
        };
        let raw = read_selection(src.data, &src, &storage, sel)?;
        if self.file.props.debug {
            debug!(
                path = %self.path,
                start = ?sel.start,
                end = ?sel.end,
                step = ?sel.step,
                bytes = raw.len(),
                "selection read"
            );
        }
        Ok(raw)
    }

    fn read_values(&self, sel: &Hyperslab) -> Result<Vec<Value>, FormatError> {
        let raw = self.read_raw(sel)?;
        decode_all(&raw, &self.datatype, &self.file.source())
    }

    /// Read every element in row-major order.
    pub fn read(&self) -> Result<Vec<Value>> {
        if self.dataspace.space_type == DataspaceType::Null {
            return Ok(Vec::new());
        }
        let r = self.read_values(&Hyperslab::all(&self.dataspace.dims));
        self.context(r, "read")
    }

    /// Read the elements `start[d], start[d] + step[d], ...` below `end[d]`
    /// in each dimension. `step` defaults to 1.
    pub fn read_slice(&self, start: &[u64], end: &[u64], step: Option<&[u64]>) -> Result<Vec<Value>> {
        let r = Hyperslab::new(self.shape(), start, end, step).and_then(|sel| self.read_values(&sel));
        self.context(r, "read slice")
    }

    /// Row-major elements `[first, last)`, reading only the rows of the
    /// first dimension that hold them.
    fn read_flat(&self, first: u64, last: u64) -> Result<Vec<Value>, FormatError> {
        let dims = self.shape();
        if dims.is_empty() {
            return self.read_values(&Hyperslab::all(&[]));
        }
        let row: u64 = dims[1..].iter().product();
        let (r0, r1) = (first / row, last.div_ceil(row));
        let mut start = vec![0; dims.len()];
        let mut end = dims.to_vec();
        start[0] = r0;
        end[0] = r1;
        let sel = Hyperslab::new(dims, &start, &end, None)?;
        let skip = (first - r0 * row) as usize;
        let mut values = self.read_values(&sel)?;
        values.truncate(skip + (last - first) as usize);
        values.drain(..skip);
        Ok(values)
    }

    /// Iterate over the elements in row-major batches of `batch_size`.
    ///
    /// Only the data behind each batch is read. The iterator is finite and
    /// stops after the first error.
    pub fn read_chunked(&self, batch_size: u64) -> Result<BatchIter<'f>> {
        if batch_size == 0 {
            return self.context(
                Err(FormatError::InvalidSelection("batch size must be at least 1".into())),
                "read chunked",
            );
        }
        Ok(BatchIter {
            total: self.len(),
            dataset: self.clone(),
            batch: batch_size,
            next: 0,
            failed: false,
        })
    }

    fn typed<T>(&self, requested: &'static str, f: impl Fn(&Value) -> Option<T>) -> Result<Vec<T>> {
        self.read()?
            .iter()
            .map(|v| {
                f(v).ok_or_else(|| {
                    ErrorKind::Type {
                        what: self.datatype.describe(),
                        requested,
                    }
                    .into()
                })
            })
            .collect::<Result<Vec<T>>>()
            .during("read")
            .at_object(&self.path)
            .in_file(self.file.path())
    }

    pub fn read_f64(&self) -> Result<Vec<f64>> {
        self.typed("f64", Value::as_f64)
    }

    pub fn read_i64(&self) -> Result<Vec<i64>> {
        self.typed("i64", Value::as_i64)
    }

    pub fn read_strings(&self) -> Result<Vec<String>> {
        self.typed("string", |v| v.as_str().map(str::to_string))
    }
}

impl std::fmt::Debug for Dataset<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dataset")
            .field("path", &self.path)
            .field("shape", &self.shape())
            .field("datatype", &self.datatype.describe())
            .finish()
    }
}

/// Batches of a dataset's elements, produced by [`Dataset::read_chunked`].
pub struct BatchIter<'f> {
    dataset: Dataset<'f>,
    batch: u64,
    next: u64,
    total: u64,
    failed: bool,
}

impl Iterator for BatchIter<'_> {
    type Item = Result<Vec<Value>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.next >= self.total {
            return None;
        }
        let first = self.next;
        let last = (first + self.batch).min(self.total);
        self.next = last;
        let r = self.dataset.read_flat(first, last);
        if r.is_err() {
            self.failed = true;
        }
        Some(self.dataset.context(r, "read chunked"))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.failed {
            return (0, Some(0));
        }
        let left = (self.total - self.next).div_ceil(self.batch) as usize;
        (left, Some(left))
    }
}

impl std::iter::FusedIterator for BatchIter<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NdArray;
    use crate::writer::FileBuilder;
    use crate::DatasetCreateProps;

    fn grouped_file() -> Vec<u8> {
        let mut b = FileBuilder::new();
        b.add_dataset("/sensors/temp", NdArray::from_f64(&[3], &[22.5, 23.1, 21.8]).unwrap(), DatasetCreateProps::new())
            .unwrap();
        b.add_dataset("/sensors/count", NdArray::from_i32(&[3], &[1, 2, 3]).unwrap(), DatasetCreateProps::new())
            .unwrap();
        b.create_group("/sensors/empty").unwrap();
        b.add_soft_link("/latest", "/sensors/temp").unwrap();
        b.finalize().unwrap()
    }

    #[test]
    fn group_listing() {
        let file = File::from_bytes(grouped_file()).unwrap();
        assert!(!file.is_mmap());
        let g = file.group("sensors").unwrap();
        assert_eq!(g.path(), "/sensors");
        assert_eq!(g.children().unwrap(), vec!["count", "empty", "temp"]);
        assert_eq!(g.groups().unwrap(), vec!["empty"]);
        assert_eq!(g.datasets().unwrap(), vec!["count", "temp"]);
        assert_eq!(file.root().datasets().unwrap(), vec!["latest"]);
        assert_eq!(file.list_datasets().unwrap(), vec!["/sensors/count", "/sensors/temp"]);
    }

    #[test]
    fn soft_link_reads_target() {
        let file = File::from_bytes(grouped_file()).unwrap();
        assert_eq!(file.dataset("/latest").unwrap().read_f64().unwrap(), vec![22.5, 23.1, 21.8]);
    }

    #[test]
    fn wrong_kind_errors() {
        let file = File::from_bytes(grouped_file()).unwrap();
        let err = file.dataset("/sensors").unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::NotADataset(_)));
        assert_eq!(err.object(), Some("/sensors"));
        let err = file.group("/sensors/temp").unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::NotAGroup(_)));

        let err = file.dataset("/sensors/tmp").unwrap_err();
        match err.kind() {
            ErrorKind::NotFound { siblings, .. } => assert_eq!(siblings, &["count", "empty", "temp"]),
            other => panic!("unexpected {other:?}"),
        }

        let err = file.dataset("/sensors/temp").unwrap().read_strings().unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Type { requested: "string", .. }));
    }

    #[test]
    fn flat_batches_span_rows() {
        let mut b = FileBuilder::new();
        let data: Vec<i64> = (0..35).collect();
        b.add_dataset("m", NdArray::from_i64(&[5, 7], &data).unwrap(), DatasetCreateProps::new().chunk(&[2, 3]))
            .unwrap();
        let file = File::from_bytes(b.finalize().unwrap()).unwrap();
        let ds = file.dataset("m").unwrap();

        let it = ds.read_chunked(8).unwrap();
        assert_eq!(it.size_hint(), (5, Some(5)));
        let batches: Vec<Vec<Value>> = it.collect::<Result<_>>().unwrap();
        assert_eq!(batches.len(), 5);
        assert_eq!(batches[4].len(), 3);
        let flat: Vec<i64> = batches.concat().iter().filter_map(Value::as_i64).collect();
        assert_eq!(flat, data);

        assert!(ds.read_chunked(0).is_err());
    }
}
