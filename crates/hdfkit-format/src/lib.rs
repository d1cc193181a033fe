//! Byte-level HDF5 format structures.
//!
//! Parsing works on a borrowed byte slice of the whole file; writing builds
//! a complete file image in memory. Caching, file handles and the typed API
//! live in the `hdfkit` crate on top of this one.

pub mod attribute;
pub mod btree_v1;
pub mod checksum;
pub mod chunked_read;
pub mod chunked_write;
pub mod data_layout;
pub mod dataspace;
pub mod datatype;
pub mod error;
pub mod file_writer;
pub mod fill_value;
pub mod filter_pipeline;
pub mod filters;
pub mod global_heap;
pub mod group;
pub mod link;
pub mod local_heap;
pub mod message_type;
pub mod messages;
pub mod object_header;
pub mod object_header_writer;
pub mod selection;
pub mod signature;
pub mod superblock;
pub mod symbol_table;
pub mod util;
pub mod value;

pub use error::{ErrorCategory, Feature, FormatError};
