//! Known pretrained checkpoints and weight identifier parsing.

use std::fmt;

use crate::nn::ResNetConfig;
use crate::{Error, Result};

/// Published metadata of one pretrained checkpoint
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightsEntry {
    pub architecture: &'static str,
    /// Enum-style qualifier, e.g. `ResNet18_Weights`
    pub family: &'static str,
    pub name: &'static str,
    /// File stem under the weights directory
    pub file_stem: &'static str,
    pub url: &'static str,
    pub num_params: usize,
    pub num_classes: usize,
    /// ImageNet-1K top-1 and top-5 accuracy
    pub acc_at_1: f32,
    pub acc_at_5: f32,
}

impl WeightsEntry {
    pub fn file_name(&self) -> String {
        format!("{}.safetensors", self.file_stem)
    }
}

impl fmt::Display for WeightsEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.family, self.name)
    }
}

pub const RESNET18_IMAGENET1K_V1: WeightsEntry = WeightsEntry {
    architecture: "resnet18",
    family: "ResNet18_Weights",
    name: "IMAGENET1K_V1",
    file_stem: "resnet18-f37072fd",
    url: "https://download.pytorch.org/models/resnet18-f37072fd.pth",
    num_params: 11_689_512,
    num_classes: 1000,
    acc_at_1: 69.758,
    acc_at_5: 89.078,
};

pub const RESNET34_IMAGENET1K_V1: WeightsEntry = WeightsEntry {
    architecture: "resnet34",
    family: "ResNet34_Weights",
    name: "IMAGENET1K_V1",
    file_stem: "resnet34-b627a593",
    url: "https://download.pytorch.org/models/resnet34-b627a593.pth",
    num_params: 21_797_672,
    num_classes: 1000,
    acc_at_1: 73.314,
    acc_at_5: 91.42,
};

const CATALOG: &[WeightsEntry] = &[RESNET18_IMAGENET1K_V1, RESNET34_IMAGENET1K_V1];

/// Resolved weights selection
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Weights {
    Pretrained(&'static WeightsEntry),
    /// Seeded random initialisation
    Random,
}

impl Weights {
    /// Resolve `id` for `architecture`.
    ///
    /// Accepts `DEFAULT`, a checkpoint name such as `IMAGENET1K_V1`, the
    /// qualified `ResNet18_Weights.IMAGENET1K_V1` form, and `NONE`.
    pub fn resolve(architecture: &str, id: &str) -> Result<Self> {
        let entries: Vec<&'static WeightsEntry> = CATALOG
            .iter()
            .filter(|e| e.architecture == architecture)
            .collect();
        if entries.is_empty() {
            return Err(Error::UnknownArchitecture(architecture.to_string()));
        }
        let unknown = || Error::UnknownWeights {
            architecture: architecture.to_string(),
            weights: id.to_string(),
        };

        let name = match id.split_once('.') {
            Some((family, name)) if family == entries[0].family => name,
            Some(_) => return Err(unknown()),
            None => id,
        };
        match name {
            "NONE" => Ok(Weights::Random),
            // first catalog entry per architecture is the default
            "DEFAULT" => Ok(Weights::Pretrained(entries[0])),
            _ => entries
                .into_iter()
                .find(|e| e.name == name)
                .map(Weights::Pretrained)
                .ok_or_else(unknown),
        }
    }

    pub fn entry(&self) -> Option<&'static WeightsEntry> {
        match self {
            Weights::Pretrained(entry) => Some(entry),
            Weights::Random => None,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.entry().map_or(1000, |e| e.num_classes)
    }
}

/// Architecture hyper-parameters by name
pub fn architecture(name: &str, num_classes: usize) -> Result<ResNetConfig> {
    match name {
        "resnet18" => Ok(ResNetConfig::resnet18(num_classes)),
        "resnet34" => Ok(ResNetConfig::resnet34(num_classes)),
        _ => Err(Error::UnknownArchitecture(name.to_string())),
    }
}
