//! Pipeline settings, with TOML loading for library callers.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::export::ExportOptions;
use crate::zoo::LoadOptions;
use crate::{Error, Result};

/// Everything the export pipeline needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Model zoo architecture name, e.g. `resnet18`
    pub architecture: String,
    /// Weights identifier: `DEFAULT`, `IMAGENET1K_V1`, `NONE`, ...
    pub weights: String,
    pub weights_dir: PathBuf,
    /// Synthetic input shape `[N, 3, H, W]`
    pub input_shape: Vec<usize>,
    pub output_path: PathBuf,
    /// Seed for the synthetic input; drawn from entropy when absent
    pub seed: Option<u64>,
    /// Seed for random weight initialisation
    pub init_seed: u64,
    pub export: ExportOptions,
}

impl Default for ExportConfig {
    fn default() -> Self {
        ExportConfig {
            architecture: "resnet18".to_string(),
            weights: "DEFAULT".to_string(),
            weights_dir: PathBuf::from("weights"),
            input_shape: vec![1, 3, 256, 256],
            output_path: PathBuf::from("resnet_18.onnx"),
            seed: None,
            init_seed: 0,
            export: ExportOptions::default(),
        }
    }
}

impl ExportConfig {
    /// Loads configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read config '{}': {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).map_err(|e| Error::Config(format!("TOML parse error: {e}")))
    }

    /// Serialises configuration to TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(format!("TOML serialise error: {e}")))
    }

    /// Model loading options; the pipeline always traces in evaluation mode
    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            eval: true,
            seed: self.init_seed,
        }
    }
}
