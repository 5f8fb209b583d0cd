use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use yolonnx::config::{self, ExportConfig};

#[derive(Parser)]
#[command(name = "yolonnx")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Export a YOLOv8 detection checkpoint to ONNX", long_about = None)]
struct Cli {
    /// Checkpoint path or release asset name
    #[arg(short, long, default_value = config::DEFAULT_WEIGHTS)]
    weights: String,

    /// Export format
    #[arg(short, long, default_value = config::DEFAULT_FORMAT)]
    format: String,

    /// ONNX opset version
    #[arg(long, default_value_t = config::DEFAULT_OPSET, allow_negative_numbers = true)]
    opset: i64,

    /// Square input size; rounded up to a multiple of the model stride
    /// [default: the checkpoint's training size, else 640]
    #[arg(long)]
    imgsz: Option<usize>,

    #[arg(short, long, default_value_t = config::DEFAULT_BATCH)]
    batch: usize,

    /// Output file [default: checkpoint path with .onnx extension]
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Directory searched for checkpoints by file name
    #[arg(long, env = config::WEIGHTS_DIR_ENV)]
    weights_dir: Option<PathBuf>,

    /// Never download missing release assets
    #[arg(long)]
    offline: bool,
}

fn main() -> anyhow::Result<()> {
    yolonnx::init_tracing();

    let cli = Cli::parse();

    let mut export_config = ExportConfig::new(cli.weights)
        .with_format(cli.format)
        .with_opset(cli.opset)
        .with_batch(cli.batch)
        .with_download(!cli.offline);
    if let Some(imgsz) = cli.imgsz {
        export_config = export_config.with_imgsz(imgsz);
    }
    if let Some(output) = cli.output {
        export_config = export_config.with_output(output);
    }
    if let Some(dir) = cli.weights_dir {
        export_config = export_config.with_weights_dir(dir);
    }

    let report = yolonnx::export(&export_config)
        .with_context(|| format!("failed to export {}", export_config.weights))?;

    println!("{}", report.path.display());
    Ok(())
}
