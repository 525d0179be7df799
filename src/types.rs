use std::fmt;

use crate::tensor_proto::DataType as ProtoType;

/// Tensor element type, as far as this crate tells them apart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Float32,
    Float16,
    BFloat16,
    Float64,
    Int8,
    Int32,
    Int64,
    Uint8,
    Bool,
    /// Any other ONNX element type, kept by its code
    Other(i32),
}

impl DataType {
    pub fn from_onnx_type(code: i32) -> Self {
        match ProtoType::try_from(code) {
            Ok(ProtoType::Float) => DataType::Float32,
            Ok(ProtoType::Float16) => DataType::Float16,
            Ok(ProtoType::Bfloat16) => DataType::BFloat16,
            Ok(ProtoType::Double) => DataType::Float64,
            Ok(ProtoType::Int8) => DataType::Int8,
            Ok(ProtoType::Int32) => DataType::Int32,
            Ok(ProtoType::Int64) => DataType::Int64,
            Ok(ProtoType::Uint8) => DataType::Uint8,
            Ok(ProtoType::Bool) => DataType::Bool,
            _ => DataType::Other(code),
        }
    }

    /// Code stored in `TensorProto.data_type` and `TypeProto.Tensor.elem_type`
    pub fn to_onnx_type(self) -> i32 {
        let proto = match self {
            DataType::Float32 => ProtoType::Float,
            DataType::Float16 => ProtoType::Float16,
            DataType::BFloat16 => ProtoType::Bfloat16,
            DataType::Float64 => ProtoType::Double,
            DataType::Int8 => ProtoType::Int8,
            DataType::Int32 => ProtoType::Int32,
            DataType::Int64 => ProtoType::Int64,
            DataType::Uint8 => ProtoType::Uint8,
            DataType::Bool => ProtoType::Bool,
            DataType::Other(code) => return code,
        };
        proto as i32
    }

    pub fn size_in_bytes(self) -> Option<usize> {
        match self {
            DataType::Float64 | DataType::Int64 => Some(8),
            DataType::Float32 | DataType::Int32 => Some(4),
            DataType::Float16 | DataType::BFloat16 => Some(2),
            DataType::Int8 | DataType::Uint8 | DataType::Bool => Some(1),
            DataType::Other(_) => None,
        }
    }
}

/// One axis of a declared tensor shape
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dimension {
    /// Size fixed at export time
    Fixed(usize),
    /// Variable size, identified by a symbolic name such as `batch_size`
    Symbolic(String),
    /// Neither a size nor a name was recorded
    Unknown,
}

impl Dimension {
    /// Fixed size, if any
    pub fn as_fixed(&self) -> Option<usize> {
        match self {
            Dimension::Fixed(n) => Some(*n),
            _ => None,
        }
    }

    /// True if the axis accepts any size
    pub fn is_dynamic(&self) -> bool {
        !matches!(self, Dimension::Fixed(_))
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimension::Fixed(n) => write!(f, "{}", n),
            Dimension::Symbolic(name) => f.write_str(name),
            Dimension::Unknown => f.write_str("?"),
        }
    }
}

/// Attribute payload of a graph node
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Int(i64),
    Float(f32),
    String(String),
    Ints(Vec<i64>),
    Floats(Vec<f32>),
    Strings(Vec<String>),
}

impl AttributeValue {
    pub fn as_int(&self) -> Option<i64> {
        if let AttributeValue::Int(v) = self { Some(*v) } else { None }
    }

    pub fn as_float(&self) -> Option<f32> {
        if let AttributeValue::Float(v) = self { Some(*v) } else { None }
    }

    pub fn as_string(&self) -> Option<&str> {
        if let AttributeValue::String(v) = self { Some(v) } else { None }
    }

    pub fn as_ints(&self) -> Option<&[i64]> {
        if let AttributeValue::Ints(v) = self { Some(v) } else { None }
    }
}
