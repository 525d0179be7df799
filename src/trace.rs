//! Recording of executed operations during a forward pass.
//!
//! Modules compute with the kernels in [`crate::ops`] and report each call
//! to a [`Tracer`]. The tracer names the node after the module scope it ran
//! in, matching the names PyTorch gives exported nodes:
//! `/layer1/layer1.0/conv1/Conv` producing `/layer1/layer1.0/conv1/Conv_output_0`.

use ndarray::ArrayD;
use std::collections::HashMap;

use crate::AttributeValue;

/// Tensor flowing through a traced forward pass
#[derive(Debug, Clone)]
pub struct TracedTensor {
    name: String,
    data: ArrayD<f32>,
}

impl TracedTensor {
    /// Graph value name this tensor was recorded under
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data(&self) -> &ArrayD<f32> {
        &self.data
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn into_data(self) -> ArrayD<f32> {
        self.data
    }
}

/// One recorded operation
#[derive(Debug, Clone, PartialEq)]
pub struct TracedNode {
    pub name: String,
    pub op_type: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub attributes: Vec<(String, AttributeValue)>,
}

impl TracedNode {
    /// Look up an attribute by name
    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attributes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }
}

/// Graph boundary value with the concrete shape seen while tracing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueRecord {
    pub name: String,
    pub shape: Vec<usize>,
}

/// Everything recorded during one forward pass
#[derive(Debug, Clone, Default)]
pub struct Trace {
    pub inputs: Vec<ValueRecord>,
    pub outputs: Vec<ValueRecord>,
    pub nodes: Vec<TracedNode>,
    /// Dotted parameter names referenced by nodes, in first-use order
    pub parameters: Vec<String>,
}

impl Trace {
    /// Node that produces `value`, if any
    pub fn producer(&self, value: &str) -> Option<usize> {
        self.nodes
            .iter()
            .position(|n| n.outputs.iter().any(|o| o == value))
    }

    /// Indices of the nodes consuming `value`
    pub fn consumers(&self, value: &str) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.inputs.iter().any(|i| i == value))
            .map(|(i, _)| i)
            .collect()
    }

    /// Op types in execution order
    pub fn op_types(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.op_type.as_str()).collect()
    }
}

/// Collects a [`Trace`] while modules execute
#[derive(Debug, Default)]
pub struct Tracer {
    /// Module path components, e.g. `["layer1", "0", "conv1"]`
    scope: Vec<String>,
    trace: Trace,
    used_node_names: HashMap<String, usize>,
}

impl Tracer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a graph input and wrap its data for the forward pass
    pub fn input(&mut self, data: ArrayD<f32>) -> TracedTensor {
        let name = format!("input_{}", self.trace.inputs.len());
        self.trace.inputs.push(ValueRecord {
            name: name.clone(),
            shape: data.shape().to_vec(),
        });
        TracedTensor { name, data }
    }

    /// Run `f` inside the scope of a child module called `name`
    pub fn scoped<T>(&mut self, name: &str, f: impl FnOnce(&mut Self) -> T) -> T {
        self.scope.push(name.to_string());
        let out = f(self);
        self.scope.pop();
        out
    }

    /// Full dotted name of parameter `local` in the current scope, recorded as used
    pub fn parameter(&mut self, local: &str) -> String {
        let mut name = self.scope.join(".");
        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(local);
        if !self.trace.parameters.contains(&name) {
            self.trace.parameters.push(name.clone());
        }
        name
    }

    /// Record one executed operation and return its output
    pub fn record(
        &mut self,
        op_type: &str,
        inputs: Vec<String>,
        attributes: Vec<(String, AttributeValue)>,
        data: ArrayD<f32>,
    ) -> TracedTensor {
        let name = self.node_name(op_type);
        let output = format!("{}_output_0", name);
        tracing::debug!(node = %name, shape = ?data.shape(), "traced");
        self.trace.nodes.push(TracedNode {
            name,
            op_type: op_type.to_string(),
            inputs,
            outputs: vec![output.clone()],
            attributes,
        });
        TracedTensor { name: output, data }
    }

    /// Close the trace, marking `outputs` as graph outputs
    pub fn finish(mut self, outputs: &[&TracedTensor]) -> Trace {
        self.trace.outputs = outputs
            .iter()
            .map(|t| ValueRecord {
                name: t.name.clone(),
                shape: t.shape().to_vec(),
            })
            .collect();
        self.trace
    }

    /// `/a/a.0/conv1/Conv`, with `_N` appended when a scope runs the same op twice
    fn node_name(&mut self, op_type: &str) -> String {
        let mut name = String::new();
        for (depth, _) in self.scope.iter().enumerate() {
            name.push('/');
            // sequence children are qualified by their parent, e.g. layer1.0
            let component = &self.scope[depth];
            if depth > 0 && component.chars().all(|c| c.is_ascii_digit()) {
                name.push_str(&self.scope[depth - 1]);
                name.push('.');
            }
            name.push_str(component);
        }
        name.push('/');
        name.push_str(op_type);

        let seen = self.used_node_names.entry(name.clone()).or_insert(0);
        let unique = if *seen == 0 {
            name
        } else {
            format!("{}_{}", name, seen)
        };
        *seen += 1;
        unique
    }
}
