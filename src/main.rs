use anyhow::Context;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::Level;

use resnet_onnx_export::config::ExportConfig;
use resnet_onnx_export::export::Exporter;
use resnet_onnx_export::runner::InferenceRunner;
use resnet_onnx_export::zoo::{ModelProvider, ModelZoo};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    let config = ExportConfig::default();
    let zoo = ModelZoo::new(&config.weights_dir);

    let model = zoo
        .load_model(&config.architecture, &config.weights, config.load_options())
        .with_context(|| format!("failed to load {} ({})", config.architecture, config.weights))?;
    let transforms = zoo.transforms(&config.architecture, &config.weights)?;
    println!("{}", transforms);

    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    // the traced output itself is not needed past this point
    let run = InferenceRunner::new(config.input_shape.clone())?.run(&model, &mut rng)?;

    let summary = Exporter::new(config.export.clone())
        .export(&model, &run, &config.output_path)
        .with_context(|| format!("failed to export to '{}'", config.output_path.display()))?;
    tracing::info!(
        path = %summary.path.display(),
        nodes = summary.node_count,
        bytes = summary.bytes_written,
        "export complete"
    );
    Ok(())
}
