//! # resnet-onnx-export
//!
//! Trace a ResNet image classifier and write it out as an ONNX model.
//!
//! The pipeline has three stages:
//! - [`zoo`] builds the network and loads pretrained weights from a local
//!   SafeTensors checkpoint
//! - [`runner`] executes one forward pass on a synthetic input while a
//!   [`trace::Tracer`] records every operation
//! - [`export`] turns the recorded graph into an ONNX `ModelProto`, folding
//!   batch norms and marking dynamic axes
//!
//! Exported files can be read back with [`OnnxModel`] and executed with
//! [`runtime::Session`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rand::SeedableRng;
//! use resnet_onnx_export::export::Exporter;
//! use resnet_onnx_export::runner::InferenceRunner;
//! use resnet_onnx_export::zoo::{LoadOptions, ModelProvider, ModelZoo};
//!
//! let zoo = ModelZoo::new("weights");
//! let model = zoo.load_model("resnet18", "DEFAULT", LoadOptions::default())?;
//! let run = InferenceRunner::new([1, 3, 256, 256])?
//!     .run(&model, &mut rand::rngs::StdRng::seed_from_u64(0))?;
//! let summary = Exporter::default().export(&model, &run, "resnet_18.onnx")?;
//! println!("{} nodes", summary.node_count);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

// include generated protobuf code inside a small module so we can silence
// lints and doc warnings originating from the generated file only.
#[allow(clippy::all)]
#[allow(rustdoc::all)]
mod onnx_generated {
    include!(concat!(env!("OUT_DIR"), "/onnx.rs"));
}

pub use onnx_generated::*;

pub mod config;
pub mod error;
pub mod export;
pub mod model;
pub mod nn;
pub mod operation;
pub mod ops;
pub mod proto_adapter;
pub mod runner;
pub mod runtime;
pub mod tensor;
pub mod trace;
pub mod types;
pub mod zoo;

pub use error::{Error, Result};
pub use model::OnnxModel;
pub use operation::OperationInfo;
pub use tensor::TensorInfo;
pub use types::{AttributeValue, DataType, Dimension};
