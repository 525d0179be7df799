//! Residual networks built from basic blocks (resnet18, resnet34).
//!
//! Layout and parameter names follow the torchvision implementation so its
//! state dicts load without remapping.

use ndarray::ArrayD;
use rand::Rng;

use super::layers::{BatchNorm2d, Conv2d, Linear, MaxPool2d};
use super::{Module, ParamKind, child_name, relu};
use crate::trace::{TracedTensor, Tracer};
use crate::{AttributeValue, Error, Result, ops};

/// Shape hyper-parameters of a basic-block ResNet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResNetConfig {
    pub name: String,
    /// Blocks per stage
    pub layers: [usize; 4],
    pub num_classes: usize,
}

impl ResNetConfig {
    pub fn resnet18(num_classes: usize) -> Self {
        ResNetConfig {
            name: "resnet18".to_string(),
            layers: [2, 2, 2, 2],
            num_classes,
        }
    }

    pub fn resnet34(num_classes: usize) -> Self {
        ResNetConfig {
            name: "resnet34".to_string(),
            layers: [3, 4, 6, 3],
            num_classes,
        }
    }
}

/// Two 3x3 convolutions with an identity (or projected) shortcut
#[derive(Debug, Clone)]
pub struct BasicBlock {
    conv1: Conv2d,
    bn1: BatchNorm2d,
    conv2: Conv2d,
    bn2: BatchNorm2d,
    downsample: Option<(Conv2d, BatchNorm2d)>,
}

impl BasicBlock {
    fn new<R: Rng + ?Sized>(in_planes: usize, planes: usize, stride: usize, rng: &mut R) -> Self {
        let downsample = (stride != 1 || in_planes != planes).then(|| {
            (
                Conv2d::new(in_planes, planes, 1, stride, 0, false, rng),
                BatchNorm2d::new(planes),
            )
        });
        BasicBlock {
            conv1: Conv2d::new(in_planes, planes, 3, stride, 1, false, rng),
            bn1: BatchNorm2d::new(planes),
            conv2: Conv2d::new(planes, planes, 3, 1, 1, false, rng),
            bn2: BatchNorm2d::new(planes),
            downsample,
        }
    }
}

impl Module for BasicBlock {
    fn forward(&self, x: &TracedTensor, tracer: &mut Tracer) -> Result<TracedTensor> {
        let out = tracer.scoped("conv1", |t| self.conv1.forward(x, t))?;
        let out = tracer.scoped("bn1", |t| self.bn1.forward(&out, t))?;
        let out = tracer.scoped("relu", |t| relu(&out, t));
        let out = tracer.scoped("conv2", |t| self.conv2.forward(&out, t))?;
        let out = tracer.scoped("bn2", |t| self.bn2.forward(&out, t))?;

        let identity = match &self.downsample {
            Some((conv, bn)) => tracer.scoped("downsample", |t| {
                let projected = t.scoped("0", |t| conv.forward(x, t))?;
                t.scoped("1", |t| bn.forward(&projected, t))
            })?,
            None => x.clone(),
        };

        let sum = ops::add(out.data(), identity.data())?;
        let sum = tracer.record(
            "Add",
            vec![out.name().to_string(), identity.name().to_string()],
            Vec::new(),
            sum,
        );
        // a module reused in one block is exported under a numbered scope
        Ok(tracer.scoped("relu_1", |t| relu(&sum, t)))
    }

    fn visit_parameters<'a>(
        &'a self,
        prefix: &str,
        f: &mut dyn FnMut(String, ParamKind, &'a ArrayD<f32>),
    ) {
        self.conv1.visit_parameters(&child_name(prefix, "conv1"), f);
        self.bn1.visit_parameters(&child_name(prefix, "bn1"), f);
        self.conv2.visit_parameters(&child_name(prefix, "conv2"), f);
        self.bn2.visit_parameters(&child_name(prefix, "bn2"), f);
        if let Some((conv, bn)) = &self.downsample {
            conv.visit_parameters(&child_name(prefix, "downsample.0"), f);
            bn.visit_parameters(&child_name(prefix, "downsample.1"), f);
        }
    }

    fn visit_parameters_mut(
        &mut self,
        prefix: &str,
        f: &mut dyn FnMut(String, &mut ArrayD<f32>) -> Result<()>,
    ) -> Result<()> {
        self.conv1.visit_parameters_mut(&child_name(prefix, "conv1"), f)?;
        self.bn1.visit_parameters_mut(&child_name(prefix, "bn1"), f)?;
        self.conv2.visit_parameters_mut(&child_name(prefix, "conv2"), f)?;
        self.bn2.visit_parameters_mut(&child_name(prefix, "bn2"), f)?;
        if let Some((conv, bn)) = &mut self.downsample {
            conv.visit_parameters_mut(&child_name(prefix, "downsample.0"), f)?;
            bn.visit_parameters_mut(&child_name(prefix, "downsample.1"), f)?;
        }
        Ok(())
    }

    fn set_training(&mut self, training: bool) {
        self.bn1.set_training(training);
        self.bn2.set_training(training);
        if let Some((_, bn)) = &mut self.downsample {
            bn.set_training(training);
        }
    }
}

/// Image classifier: stem, four residual stages, global pooling, linear head
#[derive(Debug, Clone)]
pub struct ResNet {
    config: ResNetConfig,
    conv1: Conv2d,
    bn1: BatchNorm2d,
    maxpool: MaxPool2d,
    stages: Vec<Vec<BasicBlock>>,
    fc: Linear,
    training: bool,
}

impl ResNet {
    /// Randomly initialised network, in training mode like a fresh module
    pub fn new<R: Rng + ?Sized>(config: ResNetConfig, rng: &mut R) -> Self {
        let conv1 = Conv2d::new(3, 64, 7, 2, 3, false, rng);
        let mut in_planes = 64;
        let mut stages = Vec::with_capacity(4);
        for (i, &blocks) in config.layers.iter().enumerate() {
            let planes = 64 << i;
            let stride = if i == 0 { 1 } else { 2 };
            let mut stage = Vec::with_capacity(blocks);
            for b in 0..blocks {
                stage.push(BasicBlock::new(
                    in_planes,
                    planes,
                    if b == 0 { stride } else { 1 },
                    rng,
                ));
                in_planes = planes;
            }
            stages.push(stage);
        }
        let fc = Linear::new(in_planes, config.num_classes, rng);

        let mut model = ResNet {
            config,
            conv1,
            bn1: BatchNorm2d::new(64),
            maxpool: MaxPool2d {
                kernel: 3,
                stride: 2,
                padding: 1,
            },
            stages,
            fc,
            training: false,
        };
        model.set_training(true);
        model
    }

    pub fn config(&self) -> &ResNetConfig {
        &self.config
    }

    pub fn num_classes(&self) -> usize {
        self.fc.out_features()
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Switch every layer to inference behaviour
    pub fn eval(&mut self) -> &mut Self {
        self.set_training(false);
        self
    }

    pub fn train(&mut self) -> &mut Self {
        self.set_training(true);
        self
    }
}

impl Module for ResNet {
    fn forward(&self, x: &TracedTensor, tracer: &mut Tracer) -> Result<TracedTensor> {
        if x.shape().len() != 4 || x.shape()[1] != 3 {
            return Err(Error::Shape(format!(
                "{} expects [N, 3, H, W] input, got {:?}",
                self.config.name,
                x.shape()
            )));
        }

        let x = tracer.scoped("conv1", |t| self.conv1.forward(x, t))?;
        let x = tracer.scoped("bn1", |t| self.bn1.forward(&x, t))?;
        let x = tracer.scoped("relu", |t| relu(&x, t));
        let mut x = tracer.scoped("maxpool", |t| self.maxpool.forward(&x, t))?;

        for (i, stage) in self.stages.iter().enumerate() {
            x = tracer.scoped(&format!("layer{}", i + 1), |t| {
                let mut h = x;
                for (b, block) in stage.iter().enumerate() {
                    h = t.scoped(&b.to_string(), |t| block.forward(&h, t))?;
                }
                Ok::<_, Error>(h)
            })?;
        }

        let pooled = ops::global_avg_pool(x.data())?;
        let x = tracer.scoped("avgpool", |t| {
            t.record("GlobalAveragePool", vec![x.name().to_string()], Vec::new(), pooled)
        });
        let flat = ops::flatten(x.data(), 1)?;
        let x = tracer.record(
            "Flatten",
            vec![x.name().to_string()],
            vec![("axis".to_string(), AttributeValue::Int(1))],
            flat,
        );
        tracer.scoped("fc", |t| self.fc.forward(&x, t))
    }

    fn visit_parameters<'a>(
        &'a self,
        prefix: &str,
        f: &mut dyn FnMut(String, ParamKind, &'a ArrayD<f32>),
    ) {
        self.conv1.visit_parameters(&child_name(prefix, "conv1"), f);
        self.bn1.visit_parameters(&child_name(prefix, "bn1"), f);
        for (i, stage) in self.stages.iter().enumerate() {
            for (b, block) in stage.iter().enumerate() {
                block.visit_parameters(&child_name(prefix, &format!("layer{}.{}", i + 1, b)), f);
            }
        }
        self.fc.visit_parameters(&child_name(prefix, "fc"), f);
    }

    fn visit_parameters_mut(
        &mut self,
        prefix: &str,
        f: &mut dyn FnMut(String, &mut ArrayD<f32>) -> Result<()>,
    ) -> Result<()> {
        self.conv1.visit_parameters_mut(&child_name(prefix, "conv1"), f)?;
        self.bn1.visit_parameters_mut(&child_name(prefix, "bn1"), f)?;
        for (i, stage) in self.stages.iter_mut().enumerate() {
            for (b, block) in stage.iter_mut().enumerate() {
                block.visit_parameters_mut(&child_name(prefix, &format!("layer{}.{}", i + 1, b)), f)?;
            }
        }
        self.fc.visit_parameters_mut(&child_name(prefix, "fc"), f)
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
        self.bn1.set_training(training);
        for block in self.stages.iter_mut().flatten() {
            block.set_training(training);
        }
    }
}
