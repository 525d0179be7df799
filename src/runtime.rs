//! Minimal interpreter for the operator subset produced by the exporter.
//!
//! Used to load an exported file back and check that it computes what the
//! traced model computed.

use std::collections::HashMap;

use ndarray::ArrayD;

use crate::{Dimension, Error, OnnxModel, OperationInfo, Result, ops};

/// A loaded graph ready to run
pub struct Session {
    initializers: HashMap<String, ArrayD<f32>>,
    nodes: Vec<OperationInfo>,
    inputs: Vec<(String, Vec<Dimension>)>,
    outputs: Vec<String>,
}

fn square(values: &[i64], what: &str, op: &OperationInfo) -> Result<usize> {
    match values {
        [a, b] if a == b => Ok(usize::try_from(*a)?),
        _ => Err(Error::Unsupported(format!(
            "{} {} = {:?} (only square 2-D values)",
            op.name, what, values
        ))),
    }
}

fn symmetric_pads(op: &OperationInfo) -> Result<usize> {
    match op.get_ints_attribute("pads") {
        None => Ok(0),
        Some(pads) if pads.len() == 4 && pads.iter().all(|p| *p == pads[0]) => {
            Ok(usize::try_from(pads[0])?)
        }
        Some(pads) => Err(Error::Unsupported(format!(
            "{} pads {:?} (only symmetric padding)",
            op.name, pads
        ))),
    }
}

fn require_unit(op: &OperationInfo, attribute: &str) -> Result<()> {
    match op.get_ints_attribute(attribute) {
        Some(values) if values.iter().any(|v| *v != 1) => Err(Error::Unsupported(format!(
            "{} {} {:?}",
            op.name, attribute, values
        ))),
        _ => Ok(()),
    }
}

fn auto_pad_unset(op: &OperationInfo) -> Result<()> {
    match op.get_attribute("auto_pad").and_then(|v| v.as_string()) {
        None | Some("NOTSET") => Ok(()),
        Some(mode) => Err(Error::Unsupported(format!("{} auto_pad {}", op.name, mode))),
    }
}

impl Session {
    /// Materialise the initialisers and order the nodes for execution
    pub fn new(model: &OnnxModel) -> Result<Self> {
        let mut initializers = HashMap::new();
        for tensor in model.get_weight_tensors() {
            initializers.insert(tensor.name.clone(), tensor.to_array()?);
        }

        let nodes: Vec<OperationInfo> = model.topological_order()?.into_iter().cloned().collect();
        let inputs = model
            .inputs
            .iter()
            .map(|name| {
                let tensor = model
                    .get_tensor(name)
                    .ok_or_else(|| Error::MissingField(format!("type of graph input '{}'", name)))?;
                Ok((name.clone(), tensor.shape.clone()))
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(
            nodes = nodes.len(),
            initializers = initializers.len(),
            "session ready"
        );
        Ok(Session {
            initializers,
            nodes,
            inputs,
            outputs: model.outputs.clone(),
        })
    }

    pub fn input_names(&self) -> Vec<&str> {
        self.inputs.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn output_names(&self) -> Vec<&str> {
        self.outputs.iter().map(String::as_str).collect()
    }

    /// Run the graph on `inputs`, returning every graph output by name
    pub fn run(&self, inputs: HashMap<String, ArrayD<f32>>) -> Result<HashMap<String, ArrayD<f32>>> {
        for (name, dims) in &self.inputs {
            let value = inputs
                .get(name)
                .ok_or_else(|| Error::InvalidModel(format!("missing graph input '{}'", name)))?;
            let matches = value.ndim() == dims.len()
                && dims
                    .iter()
                    .zip(value.shape())
                    .all(|(d, &n)| d.as_fixed().is_none_or(|fixed| fixed == n));
            if !matches {
                return Err(Error::Shape(format!(
                    "input '{}' has shape {:?}, declared [{}]",
                    name,
                    value.shape(),
                    dims.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(", ")
                )));
            }
        }

        let mut values = inputs;
        for node in &self.nodes {
            let output = self.execute(node, &values)?;
            let name = node
                .outputs
                .first()
                .ok_or_else(|| Error::InvalidModel(format!("{} has no output", node.name)))?;
            values.insert(name.clone(), output);
        }

        self.outputs
            .iter()
            .map(|name| {
                values
                    .remove(name)
                    .map(|v| (name.clone(), v))
                    .ok_or_else(|| Error::InvalidModel(format!("graph output '{}' never computed", name)))
            })
            .collect()
    }

    fn value<'a>(&'a self, values: &'a HashMap<String, ArrayD<f32>>, name: &str) -> Result<&'a ArrayD<f32>> {
        values
            .get(name)
            .or_else(|| self.initializers.get(name))
            .ok_or_else(|| Error::InvalidModel(format!("value '{}' is not defined", name)))
    }

    fn input<'a>(
        &'a self,
        node: &OperationInfo,
        values: &'a HashMap<String, ArrayD<f32>>,
        index: usize,
    ) -> Result<&'a ArrayD<f32>> {
        match node.inputs.get(index).filter(|n| !n.is_empty()) {
            Some(name) => self.value(values, name),
            None => Err(Error::InvalidModel(format!(
                "{} is missing input {}",
                node.name, index
            ))),
        }
    }

    fn optional_input<'a>(
        &'a self,
        node: &OperationInfo,
        values: &'a HashMap<String, ArrayD<f32>>,
        index: usize,
    ) -> Result<Option<&'a ArrayD<f32>>> {
        match node.inputs.get(index).filter(|n| !n.is_empty()) {
            Some(name) => self.value(values, name).map(Some),
            None => Ok(None),
        }
    }

    fn execute(&self, node: &OperationInfo, values: &HashMap<String, ArrayD<f32>>) -> Result<ArrayD<f32>> {
        let x = self.input(node, values, 0)?;
        match node.op_type.as_str() {
            "Conv" => {
                if node.get_int_attribute("group").unwrap_or(1) != 1 {
                    return Err(Error::Unsupported(format!("{}: grouped convolution", node.name)));
                }
                require_unit(node, "dilations")?;
                auto_pad_unset(node)?;
                let stride = square(node.get_ints_attribute("strides").unwrap_or(&[1, 1]), "strides", node)?;
                let weight = self.input(node, values, 1)?;
                let bias = self.optional_input(node, values, 2)?;
                ops::conv2d(x, weight, bias, stride, symmetric_pads(node)?)
            }
            "BatchNormalization" => {
                let epsilon = node.get_float_attribute("epsilon").unwrap_or(1e-5);
                let scale = self.input(node, values, 1)?;
                let bias = self.input(node, values, 2)?;
                let (mean, var) = if node.get_int_attribute("training_mode").unwrap_or(0) != 0 {
                    ops::batch_statistics(x)?
                } else {
                    (
                        self.input(node, values, 3)?.iter().copied().collect(),
                        self.input(node, values, 4)?.iter().copied().collect(),
                    )
                };
                ops::batch_norm(x, scale, bias, &mean, &var, epsilon)
            }
            "Relu" => Ok(ops::relu(x)),
            "MaxPool" => {
                if node.get_int_attribute("ceil_mode").unwrap_or(0) != 0 {
                    return Err(Error::Unsupported(format!("{}: ceil_mode", node.name)));
                }
                require_unit(node, "dilations")?;
                auto_pad_unset(node)?;
                let kernel_shape = node
                    .get_ints_attribute("kernel_shape")
                    .ok_or_else(|| Error::MissingField(format!("{} kernel_shape", node.name)))?;
                let kernel = square(kernel_shape, "kernel_shape", node)?;
                let stride = square(node.get_ints_attribute("strides").unwrap_or(&[1, 1]), "strides", node)?;
                ops::max_pool2d(x, kernel, stride, symmetric_pads(node)?)
            }
            "Add" => ops::add(x, self.input(node, values, 1)?),
            "GlobalAveragePool" => ops::global_avg_pool(x),
            "Flatten" => {
                let axis = node.get_int_attribute("axis").unwrap_or(1);
                let axis = if axis < 0 { axis + x.ndim() as i64 } else { axis };
                ops::flatten(x, usize::try_from(axis)?)
            }
            "Gemm" => {
                let b = self.input(node, values, 1)?;
                let c = self.optional_input(node, values, 2)?;
                ops::gemm(
                    x,
                    b,
                    c,
                    node.get_float_attribute("alpha").unwrap_or(1.0),
                    node.get_float_attribute("beta").unwrap_or(1.0),
                    node.get_int_attribute("transA").unwrap_or(0) != 0,
                    node.get_int_attribute("transB").unwrap_or(0) != 0,
                )
            }
            other => Err(Error::Unsupported(format!("operator {} ({})", other, node.name))),
        }
    }
}
