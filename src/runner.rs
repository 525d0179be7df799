//! One traced forward pass over a synthetic input.

use ndarray::{ArrayD, IxDyn};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::nn::Module;
use crate::trace::{Trace, Tracer};
use crate::{Error, Result};

/// Input, output and recorded graph of a single forward pass
#[derive(Debug, Clone)]
pub struct TracedRun {
    pub input: ArrayD<f32>,
    pub output: ArrayD<f32>,
    pub trace: Trace,
}

/// Runs a model once on standard-normal data of a fixed shape
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceRunner {
    shape: Vec<usize>,
}

impl InferenceRunner {
    /// `shape` must be `[N, 3, H, W]`
    pub fn new(shape: impl Into<Vec<usize>>) -> Result<Self> {
        let shape = shape.into();
        if shape.len() != 4 || shape[1] != 3 || shape.contains(&0) {
            return Err(Error::Shape(format!(
                "input shape must be [N, 3, H, W] with non-zero extents, got {:?}",
                shape
            )));
        }
        Ok(InferenceRunner { shape })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Draw a random input and execute `model` exactly once under a fresh tracer
    pub fn run<M, R>(&self, model: &M, rng: &mut R) -> Result<TracedRun>
    where
        M: Module + ?Sized,
        R: Rng + ?Sized,
    {
        let input = ArrayD::from_shape_simple_fn(IxDyn(&self.shape), || {
            rng.sample::<f32, _>(StandardNormal)
        });
        self.run_with_input(model, input)
    }

    /// Execute `model` once on a caller-supplied input
    pub fn run_with_input<M>(&self, model: &M, input: ArrayD<f32>) -> Result<TracedRun>
    where
        M: Module + ?Sized,
    {
        if input.shape() != self.shape.as_slice() {
            return Err(Error::Shape(format!(
                "input has shape {:?}, runner expects {:?}",
                input.shape(),
                self.shape
            )));
        }

        let mut tracer = Tracer::new();
        let x = tracer.input(input.clone());
        let y = model.forward(&x, &mut tracer)?;
        let trace = tracer.finish(&[&y]);
        tracing::info!(
            nodes = trace.nodes.len(),
            output = ?y.shape(),
            "forward pass traced"
        );
        Ok(TracedRun {
            input,
            output: y.into_data(),
            trace,
        })
    }
}
