//! In-memory arrays and attributes exchanged with the API.

use hdfkit_format::dataspace::{Dataspace, DataspaceType};
use hdfkit_format::datatype::Datatype;
use hdfkit_format::value::Value;

use crate::error::{ErrorKind, Result};

/// A dense row-major array of values with one datatype.
#[derive(Debug, Clone, PartialEq)]
pub struct NdArray {
    pub datatype: Datatype,
    /// Empty for a scalar.
    pub shape: Vec<u64>,
    pub values: Vec<Value>,
}

fn check_len(shape: &[u64], len: usize) -> Result<()> {
    let expected: u64 = shape.iter().product();
    if expected != len as u64 {
        return Err(ErrorKind::Shape {
            expected,
            actual: len as u64,
        }
        .into());
    }
    Ok(())
}

impl NdArray {
    /// Checks that `values` fills `shape` exactly.
    pub fn new(datatype: Datatype, shape: &[u64], values: Vec<Value>) -> Result<Self> {
        check_len(shape, values.len())?;
        Ok(NdArray {
            datatype,
            shape: shape.to_vec(),
            values,
        })
    }

    pub fn scalar(datatype: Datatype, value: Value) -> Self {
        NdArray {
            datatype,
            shape: Vec::new(),
            values: vec![value],
        }
    }

    pub fn from_f64(shape: &[u64], data: &[f64]) -> Result<Self> {
        Self::new(Datatype::f64(), shape, data.iter().map(|&v| Value::Float(v)).collect())
    }

    pub fn from_f32(shape: &[u64], data: &[f32]) -> Result<Self> {
        Self::new(Datatype::f32(), shape, data.iter().map(|&v| Value::Float(v as f64)).collect())
    }

    pub fn from_i32(shape: &[u64], data: &[i32]) -> Result<Self> {
        Self::new(Datatype::i32(), shape, data.iter().map(|&v| Value::Int(v as i64)).collect())
    }

    pub fn from_i64(shape: &[u64], data: &[i64]) -> Result<Self> {
        Self::new(Datatype::i64(), shape, data.iter().map(|&v| Value::Int(v)).collect())
    }

    pub fn from_u8(shape: &[u64], data: &[u8]) -> Result<Self> {
        Self::new(Datatype::u8(), shape, data.iter().map(|&v| Value::UInt(v as u64)).collect())
    }

    /// Variable-length UTF-8 strings.
    pub fn from_strings<S: AsRef<str>>(shape: &[u64], data: &[S]) -> Result<Self> {
        Self::new(
            Datatype::vlen_string(),
            shape,
            data.iter().map(|s| Value::String(s.as_ref().to_string())).collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub(crate) fn dataspace(&self) -> Dataspace {
        if self.shape.is_empty() {
            Dataspace::scalar()
        } else {
            Dataspace::simple(&self.shape)
        }
    }
}

/// A decoded attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub datatype: Datatype,
    pub shape: Vec<u64>,
    pub values: Vec<Value>,
}

impl Attribute {
    /// The value of a scalar or single-element attribute.
    pub fn value(&self) -> Option<&Value> {
        match self.values.as_slice() {
            [v] => Some(v),
            _ => None,
        }
    }
}

/// Dimensions of a dataspace as a shape; scalar and null spaces have none.
pub(crate) fn shape_of(space: &Dataspace) -> Vec<u64> {
    match space.space_type {
        DataspaceType::Simple => space.dims.clone(),
        DataspaceType::Scalar | DataspaceType::Null => Vec::new(),
    }
}
