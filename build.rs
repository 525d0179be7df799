use std::{env, path::PathBuf};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR")?);
    let proto = manifest_dir.join("proto").join("onnx.proto");

    println!("cargo:rerun-if-changed={}", proto.display());

    prost_build::Config::new()
        .bytes(["."])
        .compile_protos(&[&proto], &[manifest_dir.join("proto")])?;

    Ok(())
}
