//! Writing API: [`FileBuilder`] collects groups, datasets, links and
//! attributes in memory and serializes them in one pass.

use std::path::Path;

use tracing::debug;

use hdfkit_format::error::FormatError;
use hdfkit_format::file_writer::{AttributeSpec, DatasetSpec, FileWriter, LayoutChoice};
use hdfkit_format::value::{encode_all, HeapWriter, Value};

use crate::error::{Result, ResultExt};
use crate::property_list::{DatasetCreateProps, Layout};
use crate::types::NdArray;

/// Builder for a new HDF5 file.
///
/// # Example
///
/// ```no_run
/// use hdfkit::{DatasetCreateProps, FileBuilder, NdArray};
///
/// let mut builder = FileBuilder::new();
/// let data = NdArray::from_f64(&[3], &[1.0, 2.0, 3.0]).unwrap();
/// builder.add_dataset("/run/data", data, DatasetCreateProps::new()).unwrap();
/// builder.set_attr("/run", "version", NdArray::from_i64(&[], &[1]).unwrap()).unwrap();
/// builder.write("output.h5").unwrap();
/// ```
#[derive(Debug, Default)]
pub struct FileBuilder {
    writer: FileWriter,
    datasets: usize,
}

/// Heap sink for fill values, which never have variable-length parts.
struct NoVarLen;

impl HeapWriter for NoVarLen {
    fn write_object(&mut self, _data: &[u8]) -> (u64, u32) {
        (0, 0)
    }
}

fn attribute(name: &str, array: NdArray) -> AttributeSpec {
    AttributeSpec {
        name: name.to_string(),
        dataspace: array.dataspace(),
        datatype: array.datatype,
        values: array.values,
    }
}

fn dataset_spec(array: NdArray, props: DatasetCreateProps) -> Result<DatasetSpec, FormatError> {
    let mut spec = DatasetSpec::new(array.datatype.clone(), array.dataspace(), array.values);
    spec.layout = match props.resolved_layout() {
        Layout::Contiguous => LayoutChoice::Contiguous,
        Layout::Compact => LayoutChoice::Compact,
        Layout::Chunked => LayoutChoice::Chunked {
            chunk_dims: props.chunk_dims.clone(),
        },
    };
    spec.filters = props.pipeline(array.datatype.size())?;
    if let Some(fill) = &props.fill_value {
        spec.fill_value = Some(encode_fill(fill, &spec)?);
    }
    spec.attributes = props
        .attributes
        .into_iter()
        .map(|(name, value)| attribute(&name, value))
        .collect();
    Ok(spec)
}

fn encode_fill(fill: &Value, spec: &DatasetSpec) -> Result<Vec<u8>, FormatError> {
    if spec.datatype.is_variable_length() {
        return Err(FormatError::InvalidOptions(
            "fill values are not supported for variable-length types".into(),
        ));
    }
    encode_all(std::slice::from_ref(fill), &spec.datatype, &mut NoVarLen)
}

impl FileBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a dataset at `path`, creating missing parent groups.
    pub fn add_dataset(&mut self, path: &str, data: NdArray, props: DatasetCreateProps) -> Result<()> {
        dataset_spec(data, props)
            .and_then(|spec| self.writer.add_dataset(path, spec))
            .during("add dataset")
            .at_object(path)?;
        self.datasets += 1;
        Ok(())
    }

    /// Create a group and any missing parents. Existing groups are kept.
    pub fn create_group(&mut self, path: &str) -> Result<()> {
        self.writer
            .create_group(path)
            .during("create group")
            .at_object(path)
    }

    /// Add a soft link at `path` pointing to `target`. The target is
    /// resolved when the link is read, so it may be added later or not at all.
    pub fn add_soft_link(&mut self, path: &str, target: &str) -> Result<()> {
        self.writer
            .add_soft_link(path, target)
            .during("add soft link")
            .at_object(path)
    }

    /// Set an attribute on the group or dataset at `path`, replacing one of
    /// the same name.
    pub fn set_attr(&mut self, path: &str, name: &str, value: NdArray) -> Result<()> {
        self.writer
            .set_attr(path, attribute(name, value))
            .during("set attribute")
            .at_object(path)
    }

    /// Serialize the file to bytes.
    pub fn finalize(&self) -> Result<Vec<u8>> {
        let bytes = self.writer.finish().during("finalize")?;
        debug!(datasets = self.datasets, bytes = bytes.len(), "file serialized");
        Ok(bytes)
    }

    /// Serialize the file and write it to `path`.
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let bytes = self.finalize().in_file(Some(path))?;
        std::fs::write(path, bytes).during("write").in_file(Some(path))
    }
}
