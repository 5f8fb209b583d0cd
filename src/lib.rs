//! Converts pretrained YOLOv8 detection checkpoints (`torch.save` archives)
//! into ONNX graphs.
//!
//! ```no_run
//! use yolonnx::{export, ExportConfig};
//!
//! let report = export(&ExportConfig::new("yolov8n.pt").with_opset(12))?;
//! println!("wrote {}", report.path.display());
//! # Ok::<(), yolonnx::ExportError>(())
//! ```

pub mod config;
pub mod convert;
pub mod exporter;
pub mod ir;
pub mod loader;
pub mod lowering;
pub mod model;
pub mod optimizer;
pub mod verifier;

pub use config::{ConfigError, ExportConfig};
pub use convert::{export, ErrorKind, ExportError, ExportReport};

/// Installs a `tracing` subscriber filtered by `RUST_LOG`, falling back to
/// `yolonnx=info`.
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "yolonnx=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
