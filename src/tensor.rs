use ndarray::{ArrayD, IxDyn};
use prost::bytes::Bytes;
use std::borrow::Cow;

use crate::{DataType, Dimension, Error, Result};

/// Information about a tensor declared in an ONNX graph
///
/// Initialisers carry data; graph inputs and outputs carry only a declared
/// shape, which may contain symbolic axes.
#[derive(Debug, Clone)]
pub struct TensorInfo {
    pub name: String,
    pub shape: Vec<Dimension>,
    pub data_type: DataType,
    data: Option<TensorData>,
}

/// Tensor payload as stored in the protobuf
#[derive(Debug, Clone)]
enum TensorData {
    /// Contiguous little-endian buffer from `raw_data`
    Raw(Bytes),
    /// Values from the typed `float_data` field
    Floats(Vec<f32>),
}

impl TensorInfo {
    pub(crate) fn declared(name: String, shape: Vec<Dimension>, data_type: DataType) -> Self {
        TensorInfo {
            name,
            shape,
            data_type,
            data: None,
        }
    }

    pub(crate) fn with_raw(name: String, shape: Vec<Dimension>, data_type: DataType, raw: Bytes) -> Self {
        TensorInfo {
            name,
            shape,
            data_type,
            data: Some(TensorData::Raw(raw)),
        }
    }

    pub(crate) fn with_floats(name: String, shape: Vec<Dimension>, floats: Vec<f32>) -> Self {
        TensorInfo {
            name,
            shape,
            data_type: DataType::Float32,
            data: Some(TensorData::Floats(floats)),
        }
    }

    /// Check if tensor has embedded data
    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    /// Shape with every axis fixed, or `None` if any axis is dynamic
    pub fn fixed_shape(&self) -> Option<Vec<usize>> {
        self.shape.iter().map(Dimension::as_fixed).collect()
    }

    /// Number of elements, when the shape is fully fixed
    pub fn element_count(&self) -> Option<usize> {
        self.fixed_shape().map(|s| s.iter().product())
    }

    /// Storage size implied by shape and element type
    pub fn byte_size(&self) -> Option<usize> {
        Some(self.element_count()? * self.data_type.size_in_bytes()?)
    }

    /// Borrow the embedded bytes
    pub fn raw_bytes(&self) -> Result<Cow<'_, [u8]>> {
        match &self.data {
            Some(TensorData::Raw(b)) => Ok(Cow::Borrowed(b.as_ref())),
            Some(TensorData::Floats(v)) => Ok(Cow::Borrowed(bytemuck::cast_slice(v))),
            None => Err(Error::MissingField(format!("tensor data for '{}'", self.name))),
        }
    }

    /// Materialise the embedded data as an f32 array of the declared shape
    pub fn to_array(&self) -> Result<ArrayD<f32>> {
        if self.data_type != DataType::Float32 {
            return Err(Error::Unsupported(format!(
                "tensor '{}' has element type {:?}, only Float32 is supported",
                self.name, self.data_type
            )));
        }
        let shape = self.fixed_shape().ok_or_else(|| {
            Error::InvalidModel(format!("initialiser '{}' has a dynamic shape", self.name))
        })?;

        let values: Vec<f32> = match &self.data {
            Some(TensorData::Floats(v)) => v.clone(),
            Some(TensorData::Raw(b)) => {
                if !b.len().is_multiple_of(4) {
                    return Err(Error::InvalidModel(format!(
                        "tensor '{}' has {} raw bytes, not a multiple of 4",
                        self.name,
                        b.len()
                    )));
                }
                bytemuck::pod_collect_to_vec::<u8, f32>(b)
            }
            None => {
                return Err(Error::MissingField(format!(
                    "tensor data for '{}'",
                    self.name
                )));
            }
        };

        let expected: usize = shape.iter().product();
        if values.len() != expected {
            return Err(Error::InvalidModel(format!(
                "tensor '{}' holds {} values but its shape {:?} needs {}",
                self.name,
                values.len(),
                shape,
                expected
            )));
        }

        Ok(ArrayD::from_shape_vec(IxDyn(&shape), values)?)
    }
}
