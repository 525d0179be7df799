use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::OnceLock;

use image::{Rgb, RgbImage};
use ndarray::{ArrayD, Axis, IxDyn, concatenate};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, StandardNormal};

use resnet_onnx_export::export::{ExportOptions, ExportSummary, Exporter};
use resnet_onnx_export::nn::ResNet;
use resnet_onnx_export::runner::{InferenceRunner, TracedRun};
use resnet_onnx_export::runtime::Session;
use resnet_onnx_export::zoo::{ImageClassification, LoadOptions, ModelProvider, ModelZoo};
use resnet_onnx_export::{Dimension, Error, OnnxModel};

const INPUT_SHAPE: [usize; 4] = [1, 3, 256, 256];

struct Exported {
    model: ResNet,
    run: TracedRun,
    summary: ExportSummary,
}

fn scratch_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("resnet_onnx_it_{}_{}", tag, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).expect("Failed to create scratch directory");
    dir
}

fn random_resnet18(seed: u64) -> ResNet {
    ModelZoo::default()
        .load_model("resnet18", "NONE", LoadOptions { eval: true, seed })
        .expect("Failed to build resnet18")
}

fn export_to(model: &ResNet, input_seed: u64, path: &std::path::Path) -> (TracedRun, ExportSummary) {
    let run = InferenceRunner::new(INPUT_SHAPE)
        .expect("valid input shape")
        .run(model, &mut StdRng::seed_from_u64(input_seed))
        .expect("Forward pass failed");
    let summary = Exporter::default()
        .export(model, &run, path)
        .expect("Export failed");
    (run, summary)
}

/// One full-size export shared by the tests that only inspect it
fn exported() -> &'static Exported {
    static EXPORTED: OnceLock<Exported> = OnceLock::new();
    EXPORTED.get_or_init(|| {
        let model = random_resnet18(0);
        let path = scratch_dir("shared").join("resnet_18.onnx");
        let (run, summary) = export_to(&model, 1, &path);
        Exported { model, run, summary }
    })
}

fn load_exported() -> OnnxModel {
    OnnxModel::load_from_file(&exported().summary.path).expect("Failed to load exported model")
}

fn max_abs_diff(a: &ArrayD<f32>, b: &ArrayD<f32>) -> f32 {
    assert_eq!(a.shape(), b.shape(), "shapes differ");
    a.iter().zip(b.iter()).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max)
}

#[test]
fn export_writes_the_expected_graph() {
    let summary = &exported().summary;
    assert_eq!(summary.node_count, 49);
    assert_eq!(summary.initializer_count, 42);
    assert_eq!(summary.folded_batch_norms, 20);
    assert!(summary.path.is_file(), "exported file should exist");

    let model = load_exported();
    let counts = model.count_operations_by_type();
    assert_eq!(counts["Conv"], 20);
    assert_eq!(counts["Relu"], 17);
    assert_eq!(counts["MaxPool"], 1);
    assert_eq!(counts["Add"], 8);
    assert_eq!(counts["GlobalAveragePool"], 1);
    assert_eq!(counts["Flatten"], 1);
    assert_eq!(counts["Gemm"], 1);
    assert_eq!(model.get_weight_tensors().len(), 42);
    assert_eq!(model.ir_version, 8);
    assert_eq!(model.opset_version, Some(17));
    assert_eq!(model.graph_name, "main_graph");
    assert_eq!(model.producer_name, "resnet-onnx-export");
    assert!(model.topological_order().is_ok(), "graph should be acyclic");

    // folded biases add one scalar per conv output channel
    let conv_channels: usize = model
        .get_operations_by_type("Conv")
        .iter()
        .filter_map(|op| model.get_tensor(&op.inputs[1]))
        .filter_map(|w| w.fixed_shape())
        .map(|shape| shape[0])
        .sum();
    assert_eq!(model.parameter_count(), 11_689_512 - conv_channels);
    assert_eq!(model.operation_types().len(), 7);
    model.print_summary();
}

#[test]
fn naming_contract() {
    let model = load_exported();
    // initialisers are not graph inputs
    assert_eq!(model.inputs, ["input"]);
    assert_eq!(model.outputs, ["output"]);
    assert!(model.get_tensor("fc.weight").is_some_and(|t| t.has_data()));
    assert!(model.get_tensor("layer2.0.downsample.0.weight").is_some());
    assert!(model.get_operation("/layer1/layer1.0/Add").is_some());
}

#[test]
fn shape_contract() {
    let model = load_exported();
    let batch = Dimension::Symbolic("batch_size".to_string());
    let input = model.get_tensor("input").expect("input declared");
    assert_eq!(
        input.shape,
        [batch.clone(), Dimension::Fixed(3), Dimension::Fixed(256), Dimension::Fixed(256)]
    );
    let output = model.get_tensor("output").expect("output declared");
    assert_eq!(output.shape, [batch, Dimension::Fixed(1000)]);
}

#[test]
fn round_trip_matches_traced_output() {
    let exported = exported();
    let session = Session::new(&load_exported()).expect("Failed to create session");

    let out = session
        .run(HashMap::from([("input".to_string(), exported.run.input.clone())]))
        .expect("Exported model failed to run");
    let reference = &exported.run.output;
    let scale = reference.iter().fold(1.0f32, |m, v| m.max(v.abs()));
    let diff = max_abs_diff(&out["output"], reference);
    assert!(diff <= 1e-3 * scale, "max diff {} (scale {})", diff, scale);

    // a second sample through the symbolic batch axis
    let mut rng = StdRng::seed_from_u64(5);
    let extra = ArrayD::from_shape_simple_fn(IxDyn(&INPUT_SHAPE), || {
        StandardNormal.sample(&mut rng)
    });
    let batch = concatenate(Axis(0), &[exported.run.input.view(), extra.view()])
        .expect("inputs share a shape");
    let out = session
        .run(HashMap::from([("input".to_string(), batch)]))
        .expect("Batch of two failed to run");
    let logits = &out["output"];
    assert_eq!(logits.shape(), &[2, 1000]);
    let first = logits.index_axis(Axis(0), 0).insert_axis(Axis(0)).to_owned();
    let diff = max_abs_diff(&first, reference);
    assert!(diff <= 1e-3 * scale, "batched max diff {}", diff);
}

#[test]
fn structure_is_deterministic() {
    let first = load_exported();
    let path = scratch_dir("determinism").join("resnet_18.onnx");
    export_to(&exported().model, 99, &path);
    let second = OnnxModel::load_from_file(&path).expect("Failed to load second export");

    let structure = |m: &OnnxModel| {
        m.operations
            .iter()
            .map(|op| {
                let mut attributes: Vec<_> = op
                    .attribute_names()
                    .into_iter()
                    .map(|name| format!("{}={:?}", name, op.attributes[name]))
                    .collect();
                attributes.sort();
                (op.name.clone(), op.op_type.clone(), op.inputs.clone(), op.outputs.clone(), attributes)
            })
            .collect::<Vec<_>>()
    };
    assert_eq!(structure(&first), structure(&second));

    let mut first_weights: Vec<_> = first
        .get_weight_tensors()
        .iter()
        .map(|t| (t.name.clone(), t.shape.clone()))
        .collect();
    let mut second_weights: Vec<_> = second
        .get_weight_tensors()
        .iter()
        .map(|t| (t.name.clone(), t.shape.clone()))
        .collect();
    first_weights.sort_by(|a, b| a.0.cmp(&b.0));
    second_weights.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(first_weights, second_weights);
}

#[test]
fn unwritable_destination_leaves_no_file() {
    let exported = exported();
    let path = scratch_dir("unwritable")
        .join("missing")
        .join("resnet_18.onnx");
    let result = Exporter::default().export(&exported.model, &exported.run, &path);
    assert!(matches!(result, Err(Error::Io(_))), "expected an I/O error");
    assert!(!path.exists(), "no file should be left behind");
}

#[test]
fn failed_export_keeps_the_previous_file() {
    let exported = exported();
    let dir = scratch_dir("overwrite");
    let path = dir.join("resnet_18.onnx");
    std::fs::write(&path, b"previous export").expect("Failed to seed destination");

    // occupy the temporary file name so the write itself fails
    let blocker = dir.join(format!("resnet_18.onnx.{}.tmp", std::process::id()));
    std::fs::create_dir(&blocker).expect("Failed to create blocker");
    let result = Exporter::default().export(&exported.model, &exported.run, &path);
    assert!(matches!(result, Err(Error::Io(_))), "expected an I/O error");
    assert_eq!(std::fs::read(&path).expect("destination readable"), b"previous export");

    // once the write can proceed the old file is replaced whole
    std::fs::remove_dir(&blocker).expect("Failed to remove blocker");
    let summary = Exporter::default()
        .export(&exported.model, &exported.run, &path)
        .expect("Export over an existing file failed");
    let written = std::fs::metadata(&path).expect("destination exists").len();
    assert_eq!(written as usize, summary.bytes_written);
    assert!(OnnxModel::load_from_file(&path).is_ok());
    assert!(!blocker.exists(), "temporary file should be renamed away");
}

#[test]
fn unsupported_opset_fails_before_writing() {
    let exported = exported();
    let path = scratch_dir("opset").join("resnet_18.onnx");
    let options = ExportOptions {
        opset_version: 6,
        ..Default::default()
    };
    let result = Exporter::new(options).export(&exported.model, &exported.run, &path);
    assert!(matches!(result, Err(Error::Unsupported(_))));
    assert!(!path.exists());
}

#[test]
fn preprocessed_image_classifies_through_the_exported_file() {
    let session = Session::new(&load_exported()).expect("Failed to create session");
    let image = RgbImage::from_fn(320, 256, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, ((x + y) % 256) as u8])
    });
    let pixels = ImageClassification::imagenet(256, 256)
        .apply(&image)
        .expect("Failed to preprocess image");
    assert_eq!(pixels.shape(), &[3, 256, 256]);

    let batch = pixels.insert_axis(Axis(0)).into_dyn();
    let out = session
        .run(HashMap::from([("input".to_string(), batch)]))
        .expect("Exported model failed on a real image");
    let scores = &out["output"];
    assert_eq!(scores.shape(), &[1, 1000]);
    assert!(scores.iter().all(|v| v.is_finite()));
}

#[test]
fn pretrained_checkpoint_round_trips_through_the_zoo() {
    let dir = scratch_dir("zoo");
    let source = &exported().model;
    resnet_onnx_export::nn::save_safetensors(source, dir.join("resnet18-f37072fd.safetensors"))
        .expect("Failed to save checkpoint");

    let loaded = ModelZoo::new(&dir)
        .load_model("resnet18", "ResNet18_Weights.IMAGENET1K_V1", LoadOptions::default())
        .expect("Failed to load checkpoint");
    let before = resnet_onnx_export::nn::state_dict(source);
    let after = resnet_onnx_export::nn::state_dict(&loaded);
    assert_eq!(before.len(), after.len());
    assert!(before.iter().all(|(name, value)| after[name] == *value));
}
