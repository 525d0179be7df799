//! Modules that compute with [`crate::ops`] and report to a [`Tracer`].

mod layers;
mod resnet;
mod state_dict;

use ndarray::ArrayD;

use crate::Result;
use crate::trace::{TracedTensor, Tracer};

pub use layers::{BatchNorm2d, Conv2d, Linear, MaxPool2d};
pub use resnet::{BasicBlock, ResNet, ResNetConfig};
pub use state_dict::{load_safetensors, parameter_count, save_safetensors, state_dict};

/// Whether a state-dict entry is learned or a running statistic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Parameter,
    Buffer,
}

/// A network component with named tensors and a traced forward pass
pub trait Module {
    fn forward(&self, x: &TracedTensor, tracer: &mut Tracer) -> Result<TracedTensor>;

    /// Visit every state-dict entry under `prefix`
    fn visit_parameters<'a>(
        &'a self,
        prefix: &str,
        f: &mut dyn FnMut(String, ParamKind, &'a ArrayD<f32>),
    );

    /// Visit every state-dict entry mutably; stops at the first error
    fn visit_parameters_mut(
        &mut self,
        prefix: &str,
        f: &mut dyn FnMut(String, &mut ArrayD<f32>) -> Result<()>,
    ) -> Result<()>;

    /// Switch between training and evaluation behaviour
    fn set_training(&mut self, _training: bool) {}
}

/// `prefix.name`, or `name` at the root
pub(crate) fn child_name(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

/// Trace a ReLU in the current scope
pub fn relu(x: &TracedTensor, tracer: &mut Tracer) -> TracedTensor {
    let y = crate::ops::relu(x.data());
    tracer.record("Relu", vec![x.name().to_string()], Vec::new(), y)
}
