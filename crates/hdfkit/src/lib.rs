//! Read and write HDF5 files.
//!
//! This crate is the high-level interface over `hdfkit-format`: handles for
//! files, groups and datasets, a per-handle metadata cache, property lists
//! and contextual errors.
//!
//! # Reading
//!
//! ```no_run
//! use hdfkit::File;
//!
//! let file = File::open("data.h5").unwrap();
//! let ds = file.dataset("/sensors/temperature").unwrap();
//! println!("shape {:?}: {:?}", ds.shape(), ds.read_f64().unwrap());
//! for batch in ds.read_chunked(4096).unwrap() {
//!     let values = batch.unwrap();
//!     println!("{} values", values.len());
//! }
//! ```
//!
//! # Writing
//!
//! ```no_run
//! use hdfkit::{Compression, DatasetCreateProps, FileBuilder, NdArray};
//!
//! let data: Vec<f64> = (0..10_000).map(|i| i as f64).collect();
//! let mut builder = FileBuilder::new();
//! builder
//!     .add_dataset(
//!         "/sensors/temperature",
//!         NdArray::from_f64(&[100, 100], &data).unwrap(),
//!         DatasetCreateProps::new().chunk(&[10, 100]).compression(Compression::Gzip(6)),
//!     )
//!     .unwrap();
//! builder.write("data.h5").unwrap();
//! ```

mod cache;
pub mod error;
pub mod property_list;
pub mod reader;
pub mod types;
pub mod writer;

pub use cache::CacheStats;
pub use error::{Error, ErrorKind, Result, ResultExt};
pub use property_list::{Compression, DatasetCreateProps, FileAccessProps, Layout};
pub use reader::{BatchIter, Dataset, File, Group};
pub use types::{Attribute, NdArray};
pub use writer::FileBuilder;

pub use hdfkit_format::datatype::Datatype;
pub use hdfkit_format::error::ErrorCategory;
pub use hdfkit_format::value::Value;

#[cfg(test)]
mod tests {
    use super::*;

    fn make_simple_file() -> Vec<u8> {
        let mut b = FileBuilder::new();
        b.add_dataset(
            "temperatures",
            NdArray::from_f64(&[3], &[22.5, 23.1, 21.8]).unwrap(),
            DatasetCreateProps::new(),
        )
        .unwrap();
        b.add_dataset("counts", NdArray::from_i32(&[3], &[10, 20, 30]).unwrap(), DatasetCreateProps::new())
            .unwrap();
        b.set_attr("/", "version", NdArray::from_i64(&[], &[2]).unwrap()).unwrap();
        b.set_attr("/", "description", NdArray::from_strings(&[], &["test file"]).unwrap())
            .unwrap();
        b.finalize().unwrap()
    }

    #[test]
    fn simple_file_roundtrip() {
        let file = File::from_bytes(make_simple_file()).unwrap();
        let root = file.root();
        assert_eq!(root.datasets().unwrap(), vec!["counts", "temperatures"]);
        assert_eq!(file.dataset("temperatures").unwrap().read_f64().unwrap(), vec![22.5, 23.1, 21.8]);
        assert_eq!(file.dataset("counts").unwrap().read_i64().unwrap(), vec![10, 20, 30]);

        let attrs = root.attributes().unwrap();
        let names: Vec<&str> = attrs.iter().map(|a| a.name.as_str()).collect();
        assert!(names.contains(&"version") && names.contains(&"description"));
        let desc = attrs.iter().find(|a| a.name == "description").unwrap();
        assert_eq!(desc.value().and_then(Value::as_str), Some("test file"));
    }

    #[test]
    fn scalar_and_compact_datasets() {
        let mut b = FileBuilder::new();
        b.add_dataset("pi", NdArray::scalar(Datatype::f64(), Value::Float(3.25)), DatasetCreateProps::new())
            .unwrap();
        b.add_dataset(
            "small",
            NdArray::from_u8(&[4], &[1, 2, 3, 4]).unwrap(),
            DatasetCreateProps::new().layout(Layout::Compact),
        )
        .unwrap();
        let file = File::from_bytes(b.finalize().unwrap()).unwrap();
        let pi = file.dataset("pi").unwrap();
        assert!(pi.shape().is_empty());
        assert_eq!(pi.read_f64().unwrap(), vec![3.25]);
        assert_eq!(file.dataset("small").unwrap().read_i64().unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn cache_counts_reuse() {
        let file = File::from_bytes(make_simple_file()).unwrap();
        file.dataset("counts").unwrap();
        let first = file.cache_stats();
        file.dataset("counts").unwrap();
        let second = file.cache_stats();
        assert!(second.hits > first.hits);
        assert_eq!(second.misses, first.misses);
        file.clear_cache();
        assert_eq!(file.cache_stats(), CacheStats::default());
    }
}
