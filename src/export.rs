//! Serialisation of a traced forward pass into an ONNX `ModelProto`.
//!
//! The graph keeps the execution order of the trace. Parameters become
//! little-endian `raw_data` initialisers under their dotted names, graph
//! boundary values are renamed to the requested names and selected axes are
//! turned into symbolic dimensions.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use ndarray::{ArrayD, Axis};
use prost::Message;
use serde::{Deserialize, Serialize};

use crate::nn::{Module, state_dict};
use crate::proto_adapter::{f32_initializer, node_to_proto, value_info_to_proto};
use crate::runner::TracedRun;
use crate::trace::{TracedNode, ValueRecord};
use crate::{
    AttributeValue, DataType, Dimension, Error, GraphProto, ModelProto, OperatorSetIdProto, Result,
};

pub const DEFAULT_OPSET: i64 = 17;
pub const MIN_OPSET: i64 = 9;
pub const MAX_OPSET: i64 = 21;

/// A graph input or output axis exported as a named symbolic dimension
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DynamicAxis {
    /// Declared input or output name
    pub tensor: String,
    pub axis: usize,
    pub name: String,
}

impl DynamicAxis {
    pub fn new(tensor: impl Into<String>, axis: usize, name: impl Into<String>) -> Self {
        DynamicAxis {
            tensor: tensor.into(),
            axis,
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportOptions {
    pub input_names: Vec<String>,
    pub output_names: Vec<String>,
    pub dynamic_axes: Vec<DynamicAxis>,
    pub opset_version: i64,
    /// Merge inference batch norms into the convolution they follow
    pub fold_batch_norm: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        ExportOptions {
            input_names: vec!["input".to_string()],
            output_names: vec!["output".to_string()],
            dynamic_axes: vec![
                DynamicAxis::new("input", 0, "batch_size"),
                DynamicAxis::new("output", 0, "batch_size"),
            ],
            opset_version: DEFAULT_OPSET,
            fold_batch_norm: true,
        }
    }
}

/// What was written by [`Exporter::export`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSummary {
    pub path: PathBuf,
    pub node_count: usize,
    pub initializer_count: usize,
    pub folded_batch_norms: usize,
    pub bytes_written: usize,
}

/// Oldest default-domain opset providing `node` with the attributes it carries
fn minimum_opset(node: &TracedNode) -> Option<i64> {
    match node.op_type.as_str() {
        "Conv" | "MaxPool" | "GlobalAveragePool" | "Flatten" => Some(1),
        "Relu" => Some(6),
        "Add" => Some(7),
        "Gemm" => Some(9),
        "BatchNormalization" if node.attribute("training_mode").is_some() => Some(14),
        "BatchNormalization" => Some(9),
        _ => None,
    }
}

/// IR version that ships with `opset`
fn ir_version_for(opset: i64) -> i64 {
    match opset {
        ..=9 => 4,
        10 => 5,
        11 => 6,
        12..=14 => 7,
        15..=18 => 8,
        19..=20 => 9,
        _ => 10,
    }
}

/// Graph under construction: nodes plus the tensors not owned by the model
struct GraphBuilder<'a> {
    nodes: Vec<TracedNode>,
    params: HashMap<String, &'a ArrayD<f32>>,
    /// Tensors computed during export, e.g. folded convolution weights
    generated: HashMap<String, ArrayD<f32>>,
    /// Values removed by folding, mapped to the value replacing them
    aliases: HashMap<String, String>,
}

impl GraphBuilder<'_> {
    fn tensor(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.generated.get(name).or_else(|| self.params.get(name).copied())
    }

    fn resolve(&self, value: &str) -> String {
        self.aliases
            .get(value)
            .cloned()
            .unwrap_or_else(|| value.to_string())
    }

    fn tensor_or_err(&self, name: &str) -> Result<&ArrayD<f32>> {
        self.tensor(name)
            .ok_or_else(|| Error::InvalidExport(format!("'{}' is not a model parameter", name)))
    }

    /// Fold every inference `Conv -> BatchNormalization` pair whose conv output
    /// feeds only the batch norm. Returns the number of folded pairs.
    fn fold_batch_norms(&mut self, graph_outputs: &[ValueRecord]) -> Result<usize> {
        let mut uses: HashMap<&str, usize> = HashMap::new();
        for node in &self.nodes {
            for input in &node.inputs {
                *uses.entry(input.as_str()).or_default() += 1;
            }
        }
        for output in graph_outputs {
            *uses.entry(output.name.as_str()).or_default() += 1;
        }
        let producers: HashMap<&str, usize> = self
            .nodes
            .iter()
            .enumerate()
            .flat_map(|(i, n)| n.outputs.iter().map(move |o| (o.as_str(), i)))
            .collect();

        let mut pairs = Vec::new();
        for (i, node) in self.nodes.iter().enumerate() {
            if node.op_type != "BatchNormalization"
                || node.attribute("training_mode").is_some()
                || node.inputs.len() != 5
            {
                continue;
            }
            let Some(&conv) = producers.get(node.inputs[0].as_str()) else {
                continue;
            };
            if self.nodes[conv].op_type == "Conv" && uses.get(node.inputs[0].as_str()) == Some(&1) {
                pairs.push((conv, i));
            }
        }

        let mut removed = HashSet::new();
        for &(conv_idx, bn_idx) in &pairs {
            let conv = &self.nodes[conv_idx];
            let bn = &self.nodes[bn_idx];
            let epsilon = bn
                .attribute("epsilon")
                .and_then(AttributeValue::as_float)
                .unwrap_or(1e-5);
            let (weight, bias) = self.folded_parameters(conv, bn, epsilon)?;

            let weight_name = conv.inputs[1].clone();
            let bias_name = match conv.inputs.get(2) {
                Some(name) => name.clone(),
                None => match weight_name.strip_suffix("weight") {
                    Some(stem) => format!("{}bias", stem),
                    None => format!("{}.bias", weight_name),
                },
            };
            let conv_input = conv.inputs[0].clone();
            let conv_output = conv.outputs[0].clone();
            self.aliases.insert(bn.outputs[0].clone(), conv_output);

            tracing::debug!(conv = %conv.name, batch_norm = %bn.name, "folding batch norm");
            self.generated.insert(weight_name.clone(), weight);
            self.generated.insert(bias_name.clone(), bias);
            self.nodes[conv_idx].inputs = vec![conv_input, weight_name, bias_name];
            removed.insert(bn_idx);
        }

        let nodes = std::mem::take(&mut self.nodes);
        self.nodes = nodes
            .into_iter()
            .enumerate()
            .filter(|(i, _)| !removed.contains(i))
            .map(|(_, mut node)| {
                for input in &mut node.inputs {
                    if let Some(renamed) = self.aliases.get(input.as_str()) {
                        *input = renamed.clone();
                    }
                }
                node
            })
            .collect();
        Ok(pairs.len())
    }

    /// `W' = W * s`, `b' = (b - mean) * s + beta` with `s = gamma / sqrt(var + eps)`
    fn folded_parameters(
        &self,
        conv: &TracedNode,
        bn: &TracedNode,
        epsilon: f32,
    ) -> Result<(ArrayD<f32>, ArrayD<f32>)> {
        let weight = self.tensor_or_err(&conv.inputs[1])?;
        let gamma = self.tensor_or_err(&bn.inputs[1])?;
        let beta = self.tensor_or_err(&bn.inputs[2])?;
        let mean = self.tensor_or_err(&bn.inputs[3])?;
        let var = self.tensor_or_err(&bn.inputs[4])?;
        let out_channels = weight.shape()[0];
        if [gamma, beta, mean, var].iter().any(|t| t.len() != out_channels) {
            return Err(Error::Shape(format!(
                "batch norm '{}' does not match {} conv channels",
                bn.name, out_channels
            )));
        }

        let scale: Vec<f32> = gamma
            .iter()
            .zip(var.iter())
            .map(|(g, v)| g / (v + epsilon).sqrt())
            .collect();
        let mut folded = weight.clone();
        for (o, mut filter) in folded.axis_iter_mut(Axis(0)).enumerate() {
            filter.mapv_inplace(|w| w * scale[o]);
        }

        let conv_bias = match conv.inputs.get(2) {
            Some(name) => Some(self.tensor_or_err(name)?),
            None => None,
        };
        let bias = ArrayD::from_shape_fn(ndarray::IxDyn(&[out_channels]), |idx| {
            let o = idx[0];
            let b = conv_bias.map_or(0.0, |b| b[[o]]);
            (b - mean[[o]]) * scale[o] + beta[[o]]
        });
        Ok((folded, bias))
    }
}

/// Converts traced runs into ONNX files
#[derive(Debug, Clone, Default)]
pub struct Exporter {
    options: ExportOptions,
}

impl Exporter {
    pub fn new(options: ExportOptions) -> Self {
        Exporter { options }
    }

    pub fn options(&self) -> &ExportOptions {
        &self.options
    }

    /// Build the ONNX model for `run`, which must come from `model`
    pub fn to_model_proto<M: Module + ?Sized>(&self, model: &M, run: &TracedRun) -> Result<ModelProto> {
        self.build(model, run).map(|(proto, _)| proto)
    }

    /// Model proto plus the number of folded batch norms
    fn build<M: Module + ?Sized>(&self, model: &M, run: &TracedRun) -> Result<(ModelProto, usize)> {
        let opset = self.options.opset_version;
        if !(MIN_OPSET..=MAX_OPSET).contains(&opset) {
            return Err(Error::Unsupported(format!(
                "opset {} (supported {}..={})",
                opset, MIN_OPSET, MAX_OPSET
            )));
        }
        let trace = &run.trace;
        for node in &trace.nodes {
            match minimum_opset(node) {
                Some(min) if min <= opset => {}
                Some(min) => {
                    return Err(Error::Unsupported(format!(
                        "{} ({}) requires opset {}, exporting with {}",
                        node.name, node.op_type, min, opset
                    )));
                }
                None => {
                    return Err(Error::Unsupported(format!(
                        "operator {} has no ONNX export",
                        node.op_type
                    )));
                }
            }
        }

        let params: HashMap<String, &ArrayD<f32>> = state_dict(model).into_iter().collect();
        if let Some(missing) = trace.parameters.iter().find(|p| !params.contains_key(*p)) {
            return Err(Error::InvalidExport(format!(
                "traced parameter '{}' is not part of the model",
                missing
            )));
        }

        let mut graph = GraphBuilder {
            nodes: trace.nodes.clone(),
            params,
            generated: HashMap::new(),
            aliases: HashMap::new(),
        };
        let folded = if self.options.fold_batch_norm {
            graph.fold_batch_norms(&trace.outputs)?
        } else {
            0
        };

        // boundary renames
        let mut renames = HashMap::new();
        let inputs = self.rename_boundary(&trace.inputs, &self.options.input_names, "input", &mut renames)?;
        let traced_outputs: Vec<ValueRecord> = trace
            .outputs
            .iter()
            .map(|v| ValueRecord {
                name: graph.resolve(&v.name),
                shape: v.shape.clone(),
            })
            .collect();
        let outputs =
            self.rename_boundary(&traced_outputs, &self.options.output_names, "output", &mut renames)?;
        let rename = |name: &String| renames.get(name).cloned().unwrap_or_else(|| name.clone());

        let mut input_shapes = fixed_dims(&inputs);
        let mut output_shapes = fixed_dims(&outputs);
        for dynamic in &self.options.dynamic_axes {
            let shape = if let Some(i) = inputs.iter().position(|v| v.name == dynamic.tensor) {
                &mut input_shapes[i]
            } else if let Some(i) = outputs.iter().position(|v| v.name == dynamic.tensor) {
                &mut output_shapes[i]
            } else {
                tracing::warn!(
                    tensor = %dynamic.tensor,
                    "dynamic axis refers to no graph input or output, ignoring"
                );
                continue;
            };
            let rank = shape.len();
            let dim = shape.get_mut(dynamic.axis).ok_or_else(|| {
                Error::InvalidExport(format!(
                    "dynamic axis {} of '{}' is out of range for rank {}",
                    dynamic.axis, dynamic.tensor, rank
                ))
            })?;
            *dim = Dimension::Symbolic(dynamic.name.clone());
        }

        let mut initializer = Vec::new();
        let mut seen = HashSet::new();
        let mut node = Vec::with_capacity(graph.nodes.len());
        for traced in &graph.nodes {
            for input in &traced.inputs {
                if let Some(tensor) = graph.tensor(input) {
                    if seen.insert(input.clone()) {
                        let values: Vec<f32> = tensor.iter().copied().collect();
                        initializer.push(f32_initializer(input, tensor.shape(), &values));
                    }
                }
            }
            let node_inputs: Vec<String> = traced.inputs.iter().map(rename).collect();
            let node_outputs: Vec<String> = traced.outputs.iter().map(rename).collect();
            node.push(node_to_proto(
                &traced.name,
                &traced.op_type,
                &node_inputs,
                &node_outputs,
                &traced.attributes,
            ));
        }

        let graph_proto = GraphProto {
            node,
            name: Some("main_graph".to_string()),
            initializer,
            input: inputs
                .iter()
                .zip(&input_shapes)
                .map(|(v, shape)| value_info_to_proto(&v.name, DataType::Float32, shape))
                .collect(),
            output: outputs
                .iter()
                .zip(&output_shapes)
                .map(|(v, shape)| value_info_to_proto(&v.name, DataType::Float32, shape))
                .collect(),
            ..Default::default()
        };

        tracing::debug!(
            nodes = graph_proto.node.len(),
            initializers = graph_proto.initializer.len(),
            folded,
            "graph assembled"
        );

        let proto = ModelProto {
            ir_version: Some(ir_version_for(opset)),
            opset_import: vec![OperatorSetIdProto {
                domain: Some(String::new()),
                version: Some(opset),
            }],
            producer_name: Some(env!("CARGO_PKG_NAME").to_string()),
            producer_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            graph: Some(graph_proto),
            ..Default::default()
        };
        Ok((proto, folded))
    }

    /// Export `run` to `path`, replacing any existing file only once the new
    /// one is completely written
    pub fn export<M: Module + ?Sized>(
        &self,
        model: &M,
        run: &TracedRun,
        path: impl AsRef<Path>,
    ) -> Result<ExportSummary> {
        let path = path.as_ref();
        let (proto, folded_batch_norms) = self.build(model, run)?;
        let (node_count, initializer_count) = proto
            .graph
            .as_ref()
            .map_or((0, 0), |g| (g.node.len(), g.initializer.len()));

        let bytes = proto.encode_to_vec();
        write_atomically(path, &bytes)?;
        tracing::info!(
            path = %path.display(),
            nodes = node_count,
            initializers = initializer_count,
            bytes = bytes.len(),
            "ONNX model written"
        );

        Ok(ExportSummary {
            path: path.to_path_buf(),
            node_count,
            initializer_count,
            folded_batch_norms,
            bytes_written: bytes.len(),
        })
    }

    /// Assign declared names to boundary values, recording the renames
    fn rename_boundary(
        &self,
        values: &[ValueRecord],
        names: &[String],
        kind: &str,
        renames: &mut HashMap<String, String>,
    ) -> Result<Vec<ValueRecord>> {
        if names.len() > values.len() {
            return Err(Error::InvalidExport(format!(
                "{} {} names given for {} graph {}s",
                names.len(),
                kind,
                values.len(),
                kind
            )));
        }
        Ok(values
            .iter()
            .enumerate()
            .map(|(i, value)| match names.get(i) {
                Some(name) => {
                    renames.insert(value.name.clone(), name.clone());
                    ValueRecord {
                        name: name.clone(),
                        shape: value.shape.clone(),
                    }
                }
                None => value.clone(),
            })
            .collect())
    }
}

fn fixed_dims(values: &[ValueRecord]) -> Vec<Vec<Dimension>> {
    values
        .iter()
        .map(|v| v.shape.iter().map(|&d| Dimension::Fixed(d)).collect())
        .collect()
}

/// Write to a sibling temporary file, sync it and rename it over `path`
fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| Error::InvalidExport(format!("'{}' is not a file path", path.display())))?;
    let mut tmp_name = file_name.to_os_string();
    tmp_name.push(format!(".{}.tmp", std::process::id()));
    let tmp_path = path.with_file_name(tmp_name);

    let result = (|| -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)
    })();
    if let Err(err) = result {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::{ResNet, ResNetConfig};
    use crate::runner::InferenceRunner;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn traced_resnet(shape: [usize; 4], training: bool) -> (ResNet, TracedRun) {
        let mut model = ResNet::new(ResNetConfig::resnet18(10), &mut StdRng::seed_from_u64(1));
        model.set_training(training);
        let run = InferenceRunner::new(shape)
            .unwrap()
            .run(&model, &mut StdRng::seed_from_u64(2))
            .unwrap();
        (model, run)
    }

    fn op_count(proto: &ModelProto, op: &str) -> usize {
        proto
            .graph
            .as_ref()
            .unwrap()
            .node
            .iter()
            .filter(|n| n.op_type.as_deref() == Some(op))
            .count()
    }

    #[test]
    fn eval_export_folds_every_batch_norm() {
        let (model, run) = traced_resnet([1, 3, 32, 32], false);
        let proto = Exporter::default().to_model_proto(&model, &run).unwrap();
        let graph = proto.graph.as_ref().unwrap();
        assert_eq!(graph.node.len(), 49);
        assert_eq!(op_count(&proto, "BatchNormalization"), 0);
        assert_eq!(op_count(&proto, "Conv"), 20);
        // 20 folded conv weights and biases, fc weight and bias
        assert_eq!(graph.initializer.len(), 42);
        assert_eq!(proto.ir_version, Some(8));
        assert_eq!(proto.opset_import[0].version, Some(17));
        assert_eq!(graph.name.as_deref(), Some("main_graph"));

        let stem = &graph.node[0];
        assert_eq!(stem.input, ["input", "conv1.weight", "conv1.bias"]);
        assert_eq!(graph.node[1].input, ["/conv1/Conv_output_0"]);
        assert_eq!(graph.node.last().unwrap().output, ["output"]);
    }

    #[test]
    fn unfolded_export_keeps_batch_norm_buffers() {
        let (model, run) = traced_resnet([1, 3, 32, 32], false);
        let options = ExportOptions {
            fold_batch_norm: false,
            ..Default::default()
        };
        let proto = Exporter::new(options).to_model_proto(&model, &run).unwrap();
        let graph = proto.graph.as_ref().unwrap();
        assert_eq!(graph.node.len(), 69);
        assert_eq!(graph.initializer.len(), 102);
        assert!(graph
            .initializer
            .iter()
            .any(|t| t.name.as_deref() == Some("layer1.0.bn1.running_var")));
    }

    #[test]
    fn folding_preserves_conv_bn_output() {
        use crate::ops;

        let (model, _) = traced_resnet([1, 3, 8, 8], false);
        let dict = state_dict(&model);
        let x = ArrayD::from_shape_fn(ndarray::IxDyn(&[1, 3, 8, 8]), |i| (i[2] * 8 + i[3]) as f32 / 64.0);

        let mut gamma = dict["bn1.weight"].clone();
        gamma.mapv_inplace(|_| 0.5f32);
        let mut var = dict["bn1.running_var"].clone();
        var.mapv_inplace(|_| 4.0f32);
        let mean = dict["bn1.running_mean"].mapv(|_| 0.25f32);
        let beta = dict["bn1.bias"].mapv(|_| 0.1f32);

        let reference = ops::batch_norm(
            &ops::conv2d(&x, dict["conv1.weight"], None, 2, 3).unwrap(),
            &gamma,
            &beta,
            &mean.iter().copied().collect::<Vec<_>>(),
            &var.iter().copied().collect::<Vec<_>>(),
            1e-5,
        )
        .unwrap();

        let conv = TracedNode {
            name: "/conv1/Conv".into(),
            op_type: "Conv".into(),
            inputs: vec!["x".into(), "w".into()],
            outputs: vec!["c".into()],
            attributes: vec![],
        };
        let bn = TracedNode {
            name: "/bn1/BatchNormalization".into(),
            op_type: "BatchNormalization".into(),
            inputs: ["c", "g", "b", "m", "v"].map(String::from).to_vec(),
            outputs: vec!["y".into()],
            attributes: vec![],
        };
        let builder = GraphBuilder {
            nodes: vec![],
            params: HashMap::from([
                ("w".to_string(), dict["conv1.weight"]),
                ("g".to_string(), &gamma),
                ("b".to_string(), &beta),
                ("m".to_string(), &mean),
                ("v".to_string(), &var),
            ]),
            generated: HashMap::new(),
            aliases: HashMap::new(),
        };
        let (w, b) = builder.folded_parameters(&conv, &bn, 1e-5).unwrap();
        let folded = ops::conv2d(&x, &w, Some(&b), 2, 3).unwrap();
        let max_diff = folded
            .iter()
            .zip(reference.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f32, f32::max);
        assert!(max_diff < 1e-4, "max diff {}", max_diff);
    }

    #[test]
    fn dynamic_axes_become_symbolic() {
        let (model, run) = traced_resnet([1, 3, 32, 32], false);
        let proto = Exporter::default().to_model_proto(&model, &run).unwrap();
        let model = crate::OnnxModel::load_from_bytes(&proto.encode_to_vec()).unwrap();
        let input = model.get_tensor("input").unwrap();
        assert_eq!(
            input.shape,
            [
                Dimension::Symbolic("batch_size".into()),
                Dimension::Fixed(3),
                Dimension::Fixed(32),
                Dimension::Fixed(32)
            ]
        );
        let output = model.get_tensor("output").unwrap();
        assert_eq!(output.shape[0], Dimension::Symbolic("batch_size".into()));
        assert_eq!(output.shape[1], Dimension::Fixed(10));
    }

    #[test]
    fn bad_options_are_rejected() {
        let (model, run) = traced_resnet([1, 3, 32, 32], false);

        let out_of_range = ExportOptions {
            dynamic_axes: vec![DynamicAxis::new("output", 2, "n")],
            ..Default::default()
        };
        assert!(matches!(
            Exporter::new(out_of_range).to_model_proto(&model, &run),
            Err(Error::InvalidExport(_))
        ));

        let too_many_names = ExportOptions {
            input_names: vec!["a".into(), "b".into()],
            ..Default::default()
        };
        assert!(matches!(
            Exporter::new(too_many_names).to_model_proto(&model, &run),
            Err(Error::InvalidExport(_))
        ));

        let unknown_key = ExportOptions {
            dynamic_axes: vec![DynamicAxis::new("logits", 0, "batch_size")],
            ..Default::default()
        };
        assert!(Exporter::new(unknown_key).to_model_proto(&model, &run).is_ok());

        for opset in [6, 22] {
            let options = ExportOptions {
                opset_version: opset,
                ..Default::default()
            };
            assert!(matches!(
                Exporter::new(options).to_model_proto(&model, &run),
                Err(Error::Unsupported(_))
            ));
        }
    }

    #[test]
    fn training_mode_batch_norm_needs_opset_14() {
        let (model, run) = traced_resnet([2, 3, 32, 32], true);
        let old = ExportOptions {
            opset_version: 13,
            ..Default::default()
        };
        assert!(matches!(
            Exporter::new(old).to_model_proto(&model, &run),
            Err(Error::Unsupported(_))
        ));
        let proto = Exporter::default().to_model_proto(&model, &run).unwrap();
        // training batch norms are never folded
        assert_eq!(op_count(&proto, "BatchNormalization"), 20);
    }

    #[test]
    fn ir_version_tracks_opset() {
        assert_eq!(ir_version_for(9), 4);
        assert_eq!(ir_version_for(13), 7);
        assert_eq!(ir_version_for(17), 8);
        assert_eq!(ir_version_for(21), 10);
    }
}
