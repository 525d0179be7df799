use ndarray::{ArrayD, IxDyn};
use rand::Rng;
use rand_distr::StandardNormal;

use super::{Module, ParamKind, child_name};
use crate::trace::{TracedTensor, Tracer};
use crate::{AttributeValue, Result, ops};

fn ints(values: &[usize]) -> AttributeValue {
    AttributeValue::Ints(values.iter().map(|&v| v as i64).collect())
}

/// Square-kernel 2-D convolution
#[derive(Debug, Clone)]
pub struct Conv2d {
    pub weight: ArrayD<f32>,
    pub bias: Option<ArrayD<f32>>,
    pub kernel: usize,
    pub stride: usize,
    pub padding: usize,
}

impl Conv2d {
    /// Kaiming-normal (fan-out, ReLU gain) initialised convolution
    pub fn new<R: Rng + ?Sized>(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        padding: usize,
        bias: bool,
        rng: &mut R,
    ) -> Self {
        let fan_out = (out_channels * kernel * kernel) as f32;
        let std = (2.0 / fan_out).sqrt();
        let weight = ArrayD::from_shape_simple_fn(
            IxDyn(&[out_channels, in_channels, kernel, kernel]),
            || rng.sample::<f32, _>(StandardNormal) * std,
        );
        Conv2d {
            weight,
            bias: bias.then(|| ArrayD::zeros(IxDyn(&[out_channels]))),
            kernel,
            stride,
            padding,
        }
    }
}

impl Module for Conv2d {
    fn forward(&self, x: &TracedTensor, tracer: &mut Tracer) -> Result<TracedTensor> {
        let mut inputs = vec![x.name().to_string(), tracer.parameter("weight")];
        if self.bias.is_some() {
            inputs.push(tracer.parameter("bias"));
        }
        let y = ops::conv2d(
            x.data(),
            &self.weight,
            self.bias.as_ref(),
            self.stride,
            self.padding,
        )?;
        let attributes = vec![
            ("dilations".to_string(), ints(&[1, 1])),
            ("group".to_string(), AttributeValue::Int(1)),
            ("kernel_shape".to_string(), ints(&[self.kernel, self.kernel])),
            ("pads".to_string(), ints(&[self.padding; 4])),
            ("strides".to_string(), ints(&[self.stride, self.stride])),
        ];
        Ok(tracer.record("Conv", inputs, attributes, y))
    }

    fn visit_parameters<'a>(
        &'a self,
        prefix: &str,
        f: &mut dyn FnMut(String, ParamKind, &'a ArrayD<f32>),
    ) {
        f(child_name(prefix, "weight"), ParamKind::Parameter, &self.weight);
        if let Some(bias) = &self.bias {
            f(child_name(prefix, "bias"), ParamKind::Parameter, bias);
        }
    }

    fn visit_parameters_mut(
        &mut self,
        prefix: &str,
        f: &mut dyn FnMut(String, &mut ArrayD<f32>) -> Result<()>,
    ) -> Result<()> {
        f(child_name(prefix, "weight"), &mut self.weight)?;
        if let Some(bias) = &mut self.bias {
            f(child_name(prefix, "bias"), bias)?;
        }
        Ok(())
    }
}

/// Batch normalisation over the channel axis of NCHW input
#[derive(Debug, Clone)]
pub struct BatchNorm2d {
    pub weight: ArrayD<f32>,
    pub bias: ArrayD<f32>,
    pub running_mean: ArrayD<f32>,
    pub running_var: ArrayD<f32>,
    pub epsilon: f32,
    /// Update factor for running statistics, in PyTorch's convention
    pub momentum: f32,
    training: bool,
}

impl BatchNorm2d {
    pub fn new(channels: usize) -> Self {
        BatchNorm2d {
            weight: ArrayD::ones(IxDyn(&[channels])),
            bias: ArrayD::zeros(IxDyn(&[channels])),
            running_mean: ArrayD::zeros(IxDyn(&[channels])),
            running_var: ArrayD::ones(IxDyn(&[channels])),
            epsilon: 1e-5,
            momentum: 0.1,
            training: false,
        }
    }

    pub fn is_training(&self) -> bool {
        self.training
    }
}

impl Module for BatchNorm2d {
    /// Evaluation mode normalises with the running statistics; training mode
    /// uses the statistics of the batch and leaves the running ones untouched.
    fn forward(&self, x: &TracedTensor, tracer: &mut Tracer) -> Result<TracedTensor> {
        let inputs = vec![
            x.name().to_string(),
            tracer.parameter("weight"),
            tracer.parameter("bias"),
            tracer.parameter("running_mean"),
            tracer.parameter("running_var"),
        ];
        let mut attributes = vec![
            ("epsilon".to_string(), AttributeValue::Float(self.epsilon)),
            ("momentum".to_string(), AttributeValue::Float(1.0 - self.momentum)),
        ];

        let (mean, var) = if self.training {
            attributes.push(("training_mode".to_string(), AttributeValue::Int(1)));
            ops::batch_statistics(x.data())?
        } else {
            (
                self.running_mean.iter().copied().collect(),
                self.running_var.iter().copied().collect(),
            )
        };
        let y = ops::batch_norm(x.data(), &self.weight, &self.bias, &mean, &var, self.epsilon)?;
        Ok(tracer.record("BatchNormalization", inputs, attributes, y))
    }

    fn visit_parameters<'a>(
        &'a self,
        prefix: &str,
        f: &mut dyn FnMut(String, ParamKind, &'a ArrayD<f32>),
    ) {
        f(child_name(prefix, "weight"), ParamKind::Parameter, &self.weight);
        f(child_name(prefix, "bias"), ParamKind::Parameter, &self.bias);
        f(child_name(prefix, "running_mean"), ParamKind::Buffer, &self.running_mean);
        f(child_name(prefix, "running_var"), ParamKind::Buffer, &self.running_var);
    }

    fn visit_parameters_mut(
        &mut self,
        prefix: &str,
        f: &mut dyn FnMut(String, &mut ArrayD<f32>) -> Result<()>,
    ) -> Result<()> {
        f(child_name(prefix, "weight"), &mut self.weight)?;
        f(child_name(prefix, "bias"), &mut self.bias)?;
        f(child_name(prefix, "running_mean"), &mut self.running_mean)?;
        f(child_name(prefix, "running_var"), &mut self.running_var)
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }
}

/// Fully connected layer, `y = x Wᵀ + b`
#[derive(Debug, Clone)]
pub struct Linear {
    pub weight: ArrayD<f32>,
    pub bias: ArrayD<f32>,
}

impl Linear {
    /// Uniform initialisation in `±1/sqrt(in_features)`
    pub fn new<R: Rng + ?Sized>(in_features: usize, out_features: usize, rng: &mut R) -> Self {
        let bound = 1.0 / (in_features as f32).sqrt();
        let weight = ArrayD::from_shape_simple_fn(IxDyn(&[out_features, in_features]), || {
            rng.gen_range(-bound..bound)
        });
        let bias = ArrayD::from_shape_simple_fn(IxDyn(&[out_features]), || {
            rng.gen_range(-bound..bound)
        });
        Linear { weight, bias }
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape()[0]
    }
}

impl Module for Linear {
    fn forward(&self, x: &TracedTensor, tracer: &mut Tracer) -> Result<TracedTensor> {
        let inputs = vec![
            x.name().to_string(),
            tracer.parameter("weight"),
            tracer.parameter("bias"),
        ];
        let y = ops::gemm(x.data(), &self.weight, Some(&self.bias), 1.0, 1.0, false, true)?;
        let attributes = vec![
            ("alpha".to_string(), AttributeValue::Float(1.0)),
            ("beta".to_string(), AttributeValue::Float(1.0)),
            ("transB".to_string(), AttributeValue::Int(1)),
        ];
        Ok(tracer.record("Gemm", inputs, attributes, y))
    }

    fn visit_parameters<'a>(
        &'a self,
        prefix: &str,
        f: &mut dyn FnMut(String, ParamKind, &'a ArrayD<f32>),
    ) {
        f(child_name(prefix, "weight"), ParamKind::Parameter, &self.weight);
        f(child_name(prefix, "bias"), ParamKind::Parameter, &self.bias);
    }

    fn visit_parameters_mut(
        &mut self,
        prefix: &str,
        f: &mut dyn FnMut(String, &mut ArrayD<f32>) -> Result<()>,
    ) -> Result<()> {
        f(child_name(prefix, "weight"), &mut self.weight)?;
        f(child_name(prefix, "bias"), &mut self.bias)
    }
}

/// Square max pooling
#[derive(Debug, Clone, Copy)]
pub struct MaxPool2d {
    pub kernel: usize,
    pub stride: usize,
    pub padding: usize,
}

impl Module for MaxPool2d {
    fn forward(&self, x: &TracedTensor, tracer: &mut Tracer) -> Result<TracedTensor> {
        let y = ops::max_pool2d(x.data(), self.kernel, self.stride, self.padding)?;
        let attributes = vec![
            ("kernel_shape".to_string(), ints(&[self.kernel, self.kernel])),
            ("pads".to_string(), ints(&[self.padding; 4])),
            ("strides".to_string(), ints(&[self.stride, self.stride])),
        ];
        Ok(tracer.record("MaxPool", vec![x.name().to_string()], attributes, y))
    }

    fn visit_parameters<'a>(
        &'a self,
        _prefix: &str,
        _f: &mut dyn FnMut(String, ParamKind, &'a ArrayD<f32>),
    ) {
    }

    fn visit_parameters_mut(
        &mut self,
        _prefix: &str,
        _f: &mut dyn FnMut(String, &mut ArrayD<f32>) -> Result<()>,
    ) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn conv_records_onnx_attributes() {
        let mut rng = StdRng::seed_from_u64(7);
        let conv = Conv2d::new(3, 4, 3, 2, 1, false, &mut rng);
        let mut tracer = Tracer::new();
        let x = tracer.input(ArrayD::zeros(IxDyn(&[1, 3, 8, 8])));
        let y = tracer.scoped("conv1", |t| conv.forward(&x, t)).unwrap();
        assert_eq!(y.shape(), &[1, 4, 4, 4]);

        let trace = tracer.finish(&[&y]);
        let node = &trace.nodes[0];
        assert_eq!(node.op_type, "Conv");
        assert_eq!(node.inputs, ["input_0", "conv1.weight"]);
        assert_eq!(node.attribute("strides"), Some(&AttributeValue::Ints(vec![2, 2])));
        assert_eq!(node.attribute("pads"), Some(&AttributeValue::Ints(vec![1, 1, 1, 1])));
    }

    #[test]
    fn batch_norm_marks_training_mode() {
        let mut bn = BatchNorm2d::new(2);
        bn.set_training(true);
        let mut tracer = Tracer::new();
        let x = tracer.input(ArrayD::from_shape_vec(IxDyn(&[2, 2, 1, 1]), vec![1.0, 5.0, 3.0, 7.0]).unwrap());
        let y = bn.forward(&x, &mut tracer).unwrap();
        // batch statistics centre each channel on zero
        assert!((y.data()[[0, 0, 0, 0]] + y.data()[[1, 0, 0, 0]]).abs() < 1e-6);

        let trace = tracer.finish(&[&y]);
        assert_eq!(
            trace.nodes[0].attribute("training_mode"),
            Some(&AttributeValue::Int(1))
        );
        assert_eq!(trace.parameters.len(), 4);
    }

    #[test]
    fn linear_initialisation_stays_in_bound() {
        let mut rng = StdRng::seed_from_u64(1);
        let fc = Linear::new(16, 4, &mut rng);
        let bound = 0.25;
        assert!(fc.weight.iter().all(|v| v.abs() <= bound));
        assert_eq!(fc.out_features(), 4);
    }
}
