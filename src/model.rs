use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;

use prost::Message;

use crate::{Error, GraphProto, ModelProto, OperationInfo, Result, TensorInfo, proto_adapter};

/// ONNX model read back from disk
///
/// Keeps the graph as declared: operations in file order, graph inputs
/// without the initialisers some exporters also list there, and every
/// declared or embedded tensor keyed by name.
pub struct OnnxModel {
    pub tensors: HashMap<String, TensorInfo>,
    pub operations: Vec<OperationInfo>,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub ir_version: i64,
    /// Version of the default-domain operator set
    pub opset_version: Option<i64>,
    pub graph_name: String,
    pub producer_name: String,
    pub producer_version: String,
}

impl OnnxModel {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::load_from_bytes(&std::fs::read(path)?)
    }

    /// Decode a serialized `ModelProto`
    pub fn load_from_bytes(data: &[u8]) -> Result<Self> {
        let proto = ModelProto::decode(data)?;
        let Some(graph) = proto.graph.as_ref() else {
            return Err(Error::InvalidModel("model carries no graph".to_string()));
        };
        let opset_version = proto
            .opset_import
            .iter()
            .find(|o| o.domain.as_deref().is_none_or(str::is_empty))
            .and_then(|o| o.version);

        Ok(OnnxModel {
            tensors: collect_tensors(graph)?,
            operations: graph
                .node
                .iter()
                .map(proto_adapter::operation_from_node_proto)
                .collect::<Result<_>>()?,
            inputs: graph_inputs(graph),
            outputs: graph
                .output
                .iter()
                .map(|o| o.name.clone().unwrap_or_default())
                .collect(),
            ir_version: proto.ir_version.unwrap_or(0),
            opset_version,
            graph_name: graph.name.clone().unwrap_or_default(),
            producer_name: proto.producer_name.clone().unwrap_or_default(),
            producer_version: proto.producer_version.clone().unwrap_or_default(),
        })
    }

    pub fn get_tensor(&self, name: &str) -> Option<&TensorInfo> {
        self.tensors.get(name)
    }

    pub fn get_operation(&self, name: &str) -> Option<&OperationInfo> {
        self.operations.iter().find(|op| op.name == name)
    }

    pub fn get_operations_by_type(&self, op_type: &str) -> Vec<&OperationInfo> {
        self.operations.iter().filter(|op| op.op_type == op_type).collect()
    }

    /// Distinct operator types, sorted
    pub fn operation_types(&self) -> Vec<String> {
        self.count_operations_by_type().into_keys().collect()
    }

    pub fn count_operations_by_type(&self) -> BTreeMap<String, usize> {
        self.operations.iter().fold(BTreeMap::new(), |mut counts, op| {
            *counts.entry(op.op_type.clone()).or_default() += 1;
            counts
        })
    }

    pub fn get_input_tensors(&self) -> Vec<&TensorInfo> {
        self.inputs.iter().filter_map(|n| self.tensors.get(n)).collect()
    }

    pub fn get_output_tensors(&self) -> Vec<&TensorInfo> {
        self.outputs.iter().filter_map(|n| self.tensors.get(n)).collect()
    }

    /// Tensors with embedded data
    pub fn get_weight_tensors(&self) -> Vec<&TensorInfo> {
        self.tensors.values().filter(|t| t.has_data()).collect()
    }

    /// Total number of scalar values embedded as initialisers
    pub fn parameter_count(&self) -> usize {
        self.get_weight_tensors()
            .iter()
            .filter_map(|t| t.element_count())
            .sum()
    }

    /// Operations ordered so every producer precedes its consumers.
    ///
    /// Among operations that are ready at the same time, file order wins.
    /// Fails with `Error::InvalidModel` when the graph has a cycle.
    pub fn topological_order(&self) -> Result<Vec<&OperationInfo>> {
        let produced: HashSet<&str> = self
            .operations
            .iter()
            .flat_map(|op| op.outputs.iter().map(String::as_str))
            .filter(|name| !name.is_empty())
            .collect();

        let mut waiting_on = Vec::with_capacity(self.operations.len());
        let mut readers: HashMap<&str, Vec<usize>> = HashMap::new();
        for (idx, op) in self.operations.iter().enumerate() {
            let pending: Vec<&str> = op
                .inputs
                .iter()
                .map(String::as_str)
                .filter(|name| produced.contains(name))
                .collect();
            for &name in &pending {
                readers.entry(name).or_default().push(idx);
            }
            waiting_on.push(pending.len());
        }

        let mut ready: VecDeque<usize> = (0..self.operations.len())
            .filter(|&idx| waiting_on[idx] == 0)
            .collect();
        let mut ordered = Vec::with_capacity(self.operations.len());
        while let Some(idx) = ready.pop_front() {
            let op = &self.operations[idx];
            ordered.push(op);
            let unblocked = op
                .outputs
                .iter()
                .filter_map(|out| readers.get(out.as_str()))
                .flatten();
            for &reader in unblocked {
                waiting_on[reader] -= 1;
                if waiting_on[reader] == 0 {
                    ready.push_back(reader);
                }
            }
        }

        if ordered.len() == self.operations.len() {
            Ok(ordered)
        } else {
            Err(Error::InvalidModel(format!(
                "graph has a cycle: only {} of {} operations can be ordered",
                ordered.len(),
                self.operations.len()
            )))
        }
    }

    /// Print a summary of the model
    pub fn print_summary(&self) {
        println!("=== ONNX Model Summary ===");
        println!(
            "Graph '{}' from {} v{} | IR {} | opset {}",
            self.graph_name,
            self.producer_name,
            self.producer_version,
            self.ir_version,
            self.opset_version.map_or_else(|| "-".to_string(), |v| v.to_string())
        );
        for tensor in self.get_input_tensors().into_iter().chain(self.get_output_tensors()) {
            let dims: Vec<String> = tensor.shape.iter().map(ToString::to_string).collect();
            println!("  {}: [{}] {:?}", tensor.name, dims.join(", "), tensor.data_type);
        }
        let weights = self.get_weight_tensors();
        let weight_bytes: usize = weights.iter().filter_map(|t| t.byte_size()).sum();
        println!(
            "{} operations, {} initialisers, {} parameters ({} bytes)",
            self.operations.len(),
            weights.len(),
            self.parameter_count(),
            weight_bytes
        );
        for (op_type, count) in self.count_operations_by_type() {
            println!("  {:<20} {}", op_type, count);
        }
    }
}

/// Graph inputs, minus names that are really initialisers
fn graph_inputs(graph: &GraphProto) -> Vec<String> {
    let initializers: HashSet<&str> = graph
        .initializer
        .iter()
        .filter_map(|t| t.name.as_deref())
        .collect();
    graph
        .input
        .iter()
        .filter_map(|i| i.name.as_deref())
        .filter(|name| !name.is_empty() && !initializers.contains(name))
        .map(str::to_string)
        .collect()
}

fn collect_tensors(graph: &GraphProto) -> Result<HashMap<String, TensorInfo>> {
    let mut tensors = HashMap::new();
    for value in graph.value_info.iter().chain(&graph.input).chain(&graph.output) {
        if let Some(info) = proto_adapter::tensor_from_value_info(value)? {
            tensors.insert(info.name.clone(), info);
        }
    }
    // embedded data replaces a bare declaration of the same name
    for initializer in &graph.initializer {
        let info = proto_adapter::tensor_from_proto(initializer)?;
        if !info.name.is_empty() {
            tensors.insert(info.name.clone(), info);
        }
    }
    Ok(tensors)
}
