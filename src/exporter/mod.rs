pub mod onnx {
    include!("onnx.rs");
}

pub mod onnx_exporter;

use crate::ir::ModelIR;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExporterError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub trait ModelExporter {
    fn export(ir: &ModelIR, path: &std::path::Path) -> Result<(), ExporterError>;
}
