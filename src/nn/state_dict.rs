//! Named parameter access and SafeTensors persistence.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use ndarray::{ArrayD, IxDyn};
use safetensors::tensor::{Dtype, SafeTensors, View};

use super::{Module, ParamKind};
use crate::{Error, Result};

/// Training-only counter PyTorch checkpoints carry; never loaded
const IGNORED_SUFFIX: &str = "num_batches_tracked";

/// All parameters and buffers keyed by their dotted names
pub fn state_dict<M: Module + ?Sized>(model: &M) -> BTreeMap<String, &ArrayD<f32>> {
    let mut entries = BTreeMap::new();
    model.visit_parameters("", &mut |name, _, value| {
        entries.insert(name, value);
    });
    entries
}

/// Number of learned scalars, excluding running statistics
pub fn parameter_count<M: Module + ?Sized>(model: &M) -> usize {
    let mut total = 0;
    model.visit_parameters("", &mut |_, kind, value| {
        if kind == ParamKind::Parameter {
            total += value.len();
        }
    });
    total
}

struct ParameterView<'a> {
    shape: Vec<usize>,
    data: &'a ArrayD<f32>,
}

impl View for ParameterView<'_> {
    fn dtype(&self) -> Dtype {
        Dtype::F32
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn data(&self) -> Cow<'_, [u8]> {
        Cow::Owned(self.data.iter().flat_map(|v| v.to_le_bytes()).collect())
    }

    fn data_len(&self) -> usize {
        self.data.len() * std::mem::size_of::<f32>()
    }
}

/// Write the model's state dict to a SafeTensors file
pub fn save_safetensors<M: Module + ?Sized>(model: &M, path: impl AsRef<Path>) -> Result<()> {
    let views: Vec<(String, ParameterView<'_>)> = state_dict(model)
        .into_iter()
        .map(|(name, data)| {
            let shape = data.shape().to_vec();
            (name, ParameterView { shape, data })
        })
        .collect();
    safetensors::serialize_to_file(views, &None, path.as_ref())?;
    tracing::debug!(path = %path.as_ref().display(), "state dict saved");
    Ok(())
}

/// Overwrite every parameter of `model` from a SafeTensors file.
///
/// Every parameter must be present with dtype F32 and the exact shape. Extra
/// keys are rejected, except the batch-norm step counters.
pub fn load_safetensors<M: Module + ?Sized>(model: &mut M, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let file = std::fs::File::open(path)?;
    // SAFETY: the mapping is read-only and dropped before this function returns
    let mmap = unsafe { memmap2::Mmap::map(&file)? };
    let tensors = SafeTensors::deserialize(&mmap)?;

    // decode everything before touching the model so a bad file changes nothing
    let mut expected: Vec<(String, Vec<usize>)> = Vec::new();
    model.visit_parameters("", &mut |name, _, param| {
        expected.push((name, param.shape().to_vec()));
    });
    let mut staged: HashMap<String, ArrayD<f32>> = HashMap::with_capacity(expected.len());
    for (name, shape) in &expected {
        let view = tensors
            .tensor(name)
            .map_err(|_| Error::StateDict(format!("missing key '{}'", name)))?;
        if view.dtype() != Dtype::F32 {
            return Err(Error::StateDict(format!(
                "'{}' has dtype {:?}, expected F32",
                name,
                view.dtype()
            )));
        }
        if view.shape() != shape.as_slice() {
            return Err(Error::StateDict(format!(
                "'{}' has shape {:?}, expected {:?}",
                name,
                view.shape(),
                shape
            )));
        }
        let values: Vec<f32> = bytemuck::pod_collect_to_vec(view.data());
        staged.insert(name.clone(), ArrayD::from_shape_vec(IxDyn(shape), values)?);
    }

    for name in tensors.names() {
        if staged.contains_key(name.as_str()) {
            continue;
        }
        if name.ends_with(IGNORED_SUFFIX) {
            tracing::debug!(key = %name, "skipping training counter");
            continue;
        }
        return Err(Error::StateDict(format!("unexpected key '{}'", name)));
    }

    let loaded = staged.len();
    model.visit_parameters_mut("", &mut |name, param| {
        let value = staged
            .remove(&name)
            .ok_or_else(|| Error::StateDict(format!("'{}' appeared while loading", name)))?;
        *param = value;
        Ok(())
    })?;

    tracing::info!(
        path = %path.display(),
        tensors = loaded,
        "loaded state dict"
    );
    Ok(())
}
