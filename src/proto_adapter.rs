//! Centralised adapter functions between generated protobuf types and
//! crate-native types, in both directions. Keep all direct proto-field usage
//! here so future changes to `onnx.proto` need only update this file.

use crate::{
    AttributeProto, AttributeValue, DataType, Dimension, Error, NodeProto, OperationInfo,
    TensorInfo, TensorProto, TensorShapeProto, TypeProto, ValueInfoProto, attribute_proto,
    tensor_shape_proto, type_proto,
};
use prost::bytes::Bytes;
use std::collections::HashMap;

/// Create TensorInfo from an initialiser TensorProto
pub(crate) fn tensor_from_proto(tensor: &TensorProto) -> Result<TensorInfo, Error> {
    let name = tensor.name.clone().unwrap_or_default();
    let shape = tensor
        .dims
        .iter()
        .map(|&d| usize::try_from(d).map(Dimension::Fixed))
        .collect::<Result<Vec<_>, _>>()?;
    let data_type = DataType::from_onnx_type(tensor.data_type.unwrap_or(0));

    if let Some(raw) = &tensor.raw_data
        && !raw.is_empty()
    {
        return Ok(TensorInfo::with_raw(name, shape, data_type, raw.clone()));
    }

    if data_type == DataType::Float32 && !tensor.float_data.is_empty() {
        return Ok(TensorInfo::with_floats(name, shape, tensor.float_data.clone()));
    }

    if !tensor.external_data.is_empty() {
        return Err(Error::Unsupported(format!(
            "external data for tensor '{}'",
            name
        )));
    }

    // an empty tensor is still valid as long as its shape has no elements
    if shape.iter().any(|d| d.as_fixed() == Some(0)) {
        return Ok(TensorInfo::with_raw(name, shape, data_type, Bytes::new()));
    }

    Err(Error::MissingField(format!("data for tensor '{}'", name)))
}

/// Create TensorInfo from a graph input/output/value_info declaration
pub(crate) fn tensor_from_value_info(value: &ValueInfoProto) -> Result<Option<TensorInfo>, Error> {
    let name = value.name.clone().unwrap_or_default();
    if name.is_empty() {
        return Ok(None);
    }

    let Some(type_proto::Value::TensorType(tensor_type)) =
        value.r#type.as_ref().and_then(|t| t.value.as_ref())
    else {
        return Ok(None);
    };

    let elem_type = tensor_type
        .elem_type
        .ok_or_else(|| Error::MissingField(format!("elem_type of '{}'", name)))?;
    if elem_type == 0 {
        return Err(Error::InvalidModel(format!(
            "tensor '{}' elem_type must not be UNDEFINED (0)",
            name
        )));
    }

    let shape = match &tensor_type.shape {
        Some(shape) => shape
            .dim
            .iter()
            .map(|d| match &d.value {
                Some(tensor_shape_proto::dimension::Value::DimValue(v)) if *v >= 0 => {
                    Dimension::Fixed(*v as usize)
                }
                Some(tensor_shape_proto::dimension::Value::DimParam(p)) if !p.is_empty() => {
                    Dimension::Symbolic(p.clone())
                }
                _ => Dimension::Unknown,
            })
            .collect(),
        None => Vec::new(),
    };

    Ok(Some(TensorInfo::declared(
        name,
        shape,
        DataType::from_onnx_type(elem_type),
    )))
}

/// Create OperationInfo from ONNX NodeProto
pub(crate) fn operation_from_node_proto(node: &NodeProto) -> Result<OperationInfo, Error> {
    let mut attributes = HashMap::with_capacity(node.attribute.len());

    for attr in &node.attribute {
        let value = parse_attribute_proto(attr)?;
        let attr_name = attr.name.clone().unwrap_or_default();
        if !attr_name.is_empty() {
            attributes.insert(attr_name, value);
        }
    }

    Ok(OperationInfo {
        name: node.name.clone().unwrap_or_default(),
        op_type: node.op_type.clone().unwrap_or_default(),
        inputs: node.input.clone(),
        outputs: node.output.clone(),
        attributes,
    })
}

/// Parse ONNX attribute into AttributeValue
pub(crate) fn parse_attribute_proto(attr: &AttributeProto) -> Result<AttributeValue, Error> {
    use attribute_proto::AttributeType;

    let attr_type = attr.r#type.unwrap_or(0);
    match AttributeType::try_from(attr_type) {
        Ok(AttributeType::Float) => Ok(AttributeValue::Float(attr.f.unwrap_or(0.0))),
        Ok(AttributeType::Int) => Ok(AttributeValue::Int(attr.i.unwrap_or(0))),
        Ok(AttributeType::String) => {
            let s = attr.s.clone().unwrap_or_default();
            Ok(AttributeValue::String(String::from_utf8(s.to_vec())?))
        }
        Ok(AttributeType::Floats) => Ok(AttributeValue::Floats(attr.floats.clone())),
        Ok(AttributeType::Ints) => Ok(AttributeValue::Ints(attr.ints.clone())),
        Ok(AttributeType::Strings) => {
            let strings: Result<Vec<String>, Error> = attr
                .strings
                .iter()
                .map(|s| String::from_utf8(s.to_vec()).map_err(Error::from))
                .collect();
            Ok(AttributeValue::Strings(strings?))
        }
        _ => Err(Error::Unsupported(format!(
            "attribute '{}' of type {}",
            attr.name.as_deref().unwrap_or(""),
            attr_type
        ))),
    }
}

/// Build an AttributeProto from a name and AttributeValue
pub(crate) fn attribute_to_proto(name: &str, value: &AttributeValue) -> AttributeProto {
    use attribute_proto::AttributeType;

    let mut attr = AttributeProto {
        name: Some(name.to_string()),
        ..Default::default()
    };

    match value {
        AttributeValue::Float(f) => {
            attr.r#type = Some(AttributeType::Float as i32);
            attr.f = Some(*f);
        }
        AttributeValue::Int(i) => {
            attr.r#type = Some(AttributeType::Int as i32);
            attr.i = Some(*i);
        }
        AttributeValue::String(s) => {
            attr.r#type = Some(AttributeType::String as i32);
            attr.s = Some(Bytes::copy_from_slice(s.as_bytes()));
        }
        AttributeValue::Floats(v) => {
            attr.r#type = Some(AttributeType::Floats as i32);
            attr.floats = v.clone();
        }
        AttributeValue::Ints(v) => {
            attr.r#type = Some(AttributeType::Ints as i32);
            attr.ints = v.clone();
        }
        AttributeValue::Strings(v) => {
            attr.r#type = Some(AttributeType::Strings as i32);
            attr.strings = v
                .iter()
                .map(|s| Bytes::copy_from_slice(s.as_bytes()))
                .collect();
        }
    }

    attr
}

/// Build a NodeProto in the default domain
pub(crate) fn node_to_proto(
    name: &str,
    op_type: &str,
    inputs: &[String],
    outputs: &[String],
    attributes: &[(String, AttributeValue)],
) -> NodeProto {
    NodeProto {
        input: inputs.to_vec(),
        output: outputs.to_vec(),
        name: Some(name.to_string()),
        op_type: Some(op_type.to_string()),
        attribute: attributes
            .iter()
            .map(|(n, v)| attribute_to_proto(n, v))
            .collect(),
        ..Default::default()
    }
}

/// Build an f32 initialiser with little-endian `raw_data`
pub(crate) fn f32_initializer(name: &str, shape: &[usize], values: &[f32]) -> TensorProto {
    let raw: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    TensorProto {
        dims: shape.iter().map(|&d| d as i64).collect(),
        data_type: Some(DataType::Float32.to_onnx_type()),
        name: Some(name.to_string()),
        raw_data: Some(Bytes::from(raw)),
        ..Default::default()
    }
}

/// Build a tensor ValueInfoProto, emitting `dim_param` for symbolic axes
pub(crate) fn value_info_to_proto(
    name: &str,
    data_type: DataType,
    shape: &[Dimension],
) -> ValueInfoProto {
    use tensor_shape_proto::{Dimension as DimProto, dimension::Value};

    let dim = shape
        .iter()
        .map(|d| DimProto {
            value: match d {
                Dimension::Fixed(n) => Some(Value::DimValue(*n as i64)),
                Dimension::Symbolic(p) => Some(Value::DimParam(p.clone())),
                Dimension::Unknown => None,
            },
            denotation: None,
        })
        .collect();

    ValueInfoProto {
        name: Some(name.to_string()),
        r#type: Some(TypeProto {
            value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                elem_type: Some(data_type.to_onnx_type()),
                shape: Some(TensorShapeProto { dim }),
            })),
            denotation: None,
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attributes_convert_both_ways() {
        let cases = [
            AttributeValue::Int(3),
            AttributeValue::Float(1e-5),
            AttributeValue::String("NOTSET".into()),
            AttributeValue::Ints(vec![1, 1, 1, 1]),
            AttributeValue::Floats(vec![0.5, 2.0]),
            AttributeValue::Strings(vec!["a".into(), "b".into()]),
        ];
        for value in cases {
            let proto = attribute_to_proto("attr", &value);
            assert_eq!(parse_attribute_proto(&proto).unwrap(), value);
        }
    }

    #[test]
    fn value_info_keeps_symbolic_axes() {
        let proto = value_info_to_proto(
            "input",
            DataType::Float32,
            &[
                Dimension::Symbolic("batch_size".into()),
                Dimension::Fixed(3),
                Dimension::Fixed(256),
                Dimension::Fixed(256),
            ],
        );
        let info = tensor_from_value_info(&proto).unwrap().unwrap();
        assert_eq!(info.name, "input");
        assert_eq!(info.data_type, DataType::Float32);
        assert_eq!(info.shape[0], Dimension::Symbolic("batch_size".into()));
        assert_eq!(info.shape[3], Dimension::Fixed(256));
    }

    #[test]
    fn initializer_reads_back_raw_data() {
        let proto = f32_initializer("fc.bias", &[3], &[0.1, 0.2, 0.3]);
        let info = tensor_from_proto(&proto).unwrap();
        assert!(info.has_data());
        let array = info.to_array().unwrap();
        assert_eq!(array.as_slice().unwrap(), &[0.1, 0.2, 0.3]);
    }

    #[test]
    fn graph_attributes_are_unsupported() {
        let attr = AttributeProto {
            name: Some("body".into()),
            r#type: Some(attribute_proto::AttributeType::Graph as i32),
            ..Default::default()
        };
        assert!(matches!(
            parse_attribute_proto(&attr),
            Err(Error::Unsupported(_))
        ));
    }
}
