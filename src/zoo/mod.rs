//! Pretrained model loading from a local weights directory.

mod preprocess;
mod weights;

use std::path::{Path, PathBuf};

use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::nn::{Module, ResNet, load_safetensors, parameter_count};
use crate::{Error, Result};

pub use preprocess::{ImageClassification, InterpolationMode};
pub use weights::{RESNET18_IMAGENET1K_V1, RESNET34_IMAGENET1K_V1, Weights, WeightsEntry, architecture};

/// How a model is prepared after construction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOptions {
    /// Put every layer in evaluation mode
    pub eval: bool,
    /// Seed for random initialisation; also used before pretrained weights overwrite it
    pub seed: u64,
}

impl Default for LoadOptions {
    fn default() -> Self {
        LoadOptions { eval: true, seed: 0 }
    }
}

/// Source of models and their matching preprocessing
pub trait ModelProvider {
    fn load_model(&self, architecture: &str, weights: &str, options: LoadOptions) -> Result<ResNet>;

    fn transforms(&self, architecture: &str, weights: &str) -> Result<ImageClassification>;
}

/// Models backed by SafeTensors checkpoints in one directory
#[derive(Debug, Clone)]
pub struct ModelZoo {
    weights_dir: PathBuf,
}

impl ModelZoo {
    pub fn new(weights_dir: impl Into<PathBuf>) -> Self {
        ModelZoo {
            weights_dir: weights_dir.into(),
        }
    }

    pub fn weights_dir(&self) -> &Path {
        &self.weights_dir
    }

    /// Where the checkpoint for `entry` is expected
    pub fn weights_path(&self, entry: &WeightsEntry) -> PathBuf {
        self.weights_dir.join(entry.file_name())
    }
}

impl Default for ModelZoo {
    fn default() -> Self {
        ModelZoo::new("weights")
    }
}

impl ModelProvider for ModelZoo {
    fn load_model(&self, architecture: &str, weights: &str, options: LoadOptions) -> Result<ResNet> {
        let selected = Weights::resolve(architecture, weights)?;
        let config = weights::architecture(architecture, selected.num_classes())?;
        let mut model = ResNet::new(config, &mut StdRng::seed_from_u64(options.seed));

        if let Some(entry) = selected.entry() {
            let path = self.weights_path(entry);
            if !path.is_file() {
                return Err(Error::WeightsUnavailable {
                    weights: entry.to_string(),
                    path: path.display().to_string(),
                });
            }
            load_safetensors(&mut model, &path)?;
            tracing::info!(
                weights = %entry,
                acc_at_1 = entry.acc_at_1,
                "pretrained weights loaded"
            );
        }

        model.set_training(!options.eval);
        tracing::info!(
            architecture,
            parameters = parameter_count(&model),
            eval = options.eval,
            "model ready"
        );
        Ok(model)
    }

    fn transforms(&self, architecture: &str, weights: &str) -> Result<ImageClassification> {
        // every known checkpoint was evaluated with the same transform
        Weights::resolve(architecture, weights)?;
        Ok(ImageClassification::imagenet(224, 256))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::{save_safetensors, state_dict};

    fn scratch_dir(tag: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("resnet_onnx_{}_{}", tag, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn random_weights_are_seeded() {
        let zoo = ModelZoo::default();
        let options = LoadOptions { eval: true, seed: 3 };
        let a = zoo.load_model("resnet18", "NONE", options).unwrap();
        let b = zoo.load_model("resnet18", "NONE", options).unwrap();
        assert_eq!(state_dict(&a)["conv1.weight"], state_dict(&b)["conv1.weight"]);
        assert!(!a.is_training());
    }

    #[test]
    fn pretrained_weights_load_from_directory() {
        let dir = scratch_dir("zoo_1");
        let zoo = ModelZoo::new(&dir);
        let source = zoo
            .load_model("resnet18", "NONE", LoadOptions { eval: true, seed: 11 })
            .unwrap();
        save_safetensors(&source, zoo.weights_path(&RESNET18_IMAGENET1K_V1)).unwrap();

        let options = LoadOptions { eval: false, seed: 0 };
        let loaded = zoo.load_model("resnet18", "DEFAULT", options).unwrap();
        assert!(loaded.is_training());
        assert_eq!(state_dict(&loaded)["fc.bias"], state_dict(&source)["fc.bias"]);
    }

    #[test]
    fn missing_checkpoint_is_reported() {
        let dir = scratch_dir("zoo_2");
        let zoo = ModelZoo::new(&dir);
        assert_eq!(zoo.weights_dir(), dir.as_path());
        let err = zoo
            .load_model("resnet18", "IMAGENET1K_V1", LoadOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::WeightsUnavailable { .. }));
        assert!(zoo.load_model("resnet101", "DEFAULT", LoadOptions::default()).is_err());
    }

    #[test]
    fn transforms_follow_weights() {
        let zoo = ModelZoo::default();
        let t = zoo.transforms("resnet18", "DEFAULT").unwrap();
        assert_eq!(t.crop_size, [224]);
        assert_eq!(t.resize_size, [256]);
        assert!(zoo.transforms("resnet18", "bogus").is_err());
    }
}
