//! Persist MobileNetV2 to disk as safetensors weights plus a TorchScript
//! module the server can load directly

use anyhow::Result;
use imgclass::torch;
use imgclass::util::init_tracing;
use std::path::PathBuf;
use std::{env, process};
use tracing::info;

const USAGE: &str = "usage: ./export-model <weights (.ot or .safetensors)> <output stem>";

fn get_args() -> (PathBuf, PathBuf) {
    let args: Vec<String> = env::args().collect();
    if args.len() != 3 {
        println!("{USAGE}");
        process::exit(1);
    }

    (PathBuf::from(&args[1]), PathBuf::from(&args[2]))
}

fn main() -> Result<()> {
    init_tracing();

    let (weights, stem) = get_args();
    info!("exporting MobileNetV2 from {}", weights.display());

    let exported = torch::export(&weights, &stem, tch::Device::Cpu)?;
    info!(
        "wrote {} and {}",
        exported.weights.display(),
        exported.torchscript.display()
    );
    info!("Model saved successfully!");
    Ok(())
}
