//! The export pipeline: resolve, load, lower, optimize, write.

use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, ExportConfig, DEFAULT_IMGSZ};
use crate::exporter::onnx_exporter::OnnxExporter;
use crate::exporter::{ExporterError, ModelExporter};
use crate::ir::shape_inference::ShapeInference;
use crate::ir::ModelIR;
use crate::loader::pytorch::PytorchLoader;
use crate::loader::resolve::CheckpointResolver;
use crate::loader::{CheckpointInfo, LoaderError, ModelLoader};
use crate::lowering::{lower, LoweringOptions};
use crate::model::DetectionModel;
use crate::optimizer::Optimizer;

const AUTHOR: &str = "Ultralytics";
const DEFAULT_LICENSE: &str = "AGPL-3.0 License (https://ultralytics.com/license)";
const DEFAULT_DOCS: &str = "https://docs.ultralytics.com";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ResourceNotFound,
    UnsupportedConfiguration,
    Conversion,
    Io,
}

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Checkpoint not available: {0}")]
    ResourceNotFound(LoaderError),
    #[error("Unsupported configuration: {0}")]
    UnsupportedConfiguration(#[from] ConfigError),
    #[error("Conversion failed: {0}")]
    Conversion(String),
    #[error(transparent)]
    Io(ExporterError),
}

impl ExportError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExportError::ResourceNotFound(_) => ErrorKind::ResourceNotFound,
            ExportError::UnsupportedConfiguration(_) => ErrorKind::UnsupportedConfiguration,
            ExportError::Conversion(_) => ErrorKind::Conversion,
            ExportError::Io(_) => ErrorKind::Io,
        }
    }
}

impl From<LoaderError> for ExportError {
    fn from(e: LoaderError) -> Self {
        match e {
            LoaderError::NotFound(_) | LoaderError::Download(_) | LoaderError::Io(_) => {
                ExportError::ResourceNotFound(e)
            }
            other => ExportError::Conversion(other.to_string()),
        }
    }
}

impl From<ExporterError> for ExportError {
    fn from(e: ExporterError) -> Self {
        match e {
            ExporterError::Write { .. } => ExportError::Io(e),
            other => ExportError::Conversion(other.to_string()),
        }
    }
}

fn conversion(e: impl std::fmt::Display) -> ExportError {
    ExportError::Conversion(e.to_string())
}

/// What was written, for callers that want to report it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportReport {
    pub path: PathBuf,
    pub input_shape: Vec<usize>,
    pub output_shape: Vec<usize>,
    pub opset: i64,
    pub node_count: usize,
    pub initializer_count: usize,
}

/// The explicit size, else the size the checkpoint was trained at.
fn requested_imgsz(config: &ExportConfig, info: &CheckpointInfo) -> usize {
    config.imgsz.or(info.train_imgsz).unwrap_or(DEFAULT_IMGSZ)
}

/// Smallest multiple of `stride` not below `imgsz`.
fn round_imgsz(imgsz: usize, stride: usize) -> usize {
    let stride = stride.max(1);
    imgsz.div_ceil(stride) * stride
}

/// Class names in Python dict notation, the form ultralytics readers parse.
fn names_repr(names: &[String]) -> String {
    let entries: Vec<String> = names
        .iter()
        .enumerate()
        .map(|(i, name)| format!("{}: '{}'", i, name.replace('\'', "\\'")))
        .collect();
    format!("{{{}}}", entries.join(", "))
}

fn metadata(model: &DetectionModel, batch: usize, imgsz: usize) -> Vec<(String, String)> {
    let info = &model.info;
    vec![
        ("description".to_string(), model.description()),
        ("author".to_string(), AUTHOR.to_string()),
        (
            "version".to_string(),
            info.version.clone().unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
        ),
        (
            "license".to_string(),
            info.license.clone().unwrap_or_else(|| DEFAULT_LICENSE.to_string()),
        ),
        (
            "docs".to_string(),
            info.docs.clone().unwrap_or_else(|| DEFAULT_DOCS.to_string()),
        ),
        ("stride".to_string(), model.max_stride().to_string()),
        ("task".to_string(), "detect".to_string()),
        ("batch".to_string(), batch.to_string()),
        ("imgsz".to_string(), format!("[{}, {}]", imgsz, imgsz)),
        ("names".to_string(), names_repr(&model.names)),
    ]
}

fn expected_output_shape(model: &DetectionModel, batch: usize, imgsz: usize) -> Result<Vec<usize>, ExportError> {
    let detect = model.detect().map_err(conversion)?;
    let anchors: usize = detect
        .stride
        .iter()
        .map(|&s| {
            let side = imgsz / (s.round() as usize).max(1);
            side * side
        })
        .sum();
    Ok(vec![batch, 4 + detect.nc, anchors])
}

/// Builds the optimized, shape-annotated graph for an already loaded model.
pub fn build_graph(model: &DetectionModel, options: &LoweringOptions) -> Result<ModelIR, ExportError> {
    let mut ir = lower(model, options).map_err(conversion)?;
    debug!(nodes = ir.nodes.len(), weights = ir.weights.len(), "lowered model");

    Optimizer::standard().optimize(&mut ir).map_err(conversion)?;
    ShapeInference::infer(&mut ir).map_err(conversion)?;

    let expected = expected_output_shape(model, options.batch, options.imgsz)?;
    let actual = ir.outputs.first().map(|o| o.shape.clone()).unwrap_or_default();
    if actual != expected {
        return Err(ExportError::Conversion(format!(
            "output shape {:?} does not match the expected {:?}",
            actual, expected
        )));
    }
    ir.metadata = metadata(model, options.batch, options.imgsz);
    Ok(ir)
}

/// Converts the checkpoint named by `config.weights` to ONNX.
pub fn export(config: &ExportConfig) -> Result<ExportReport, ExportError> {
    config.validate()?;

    let resolver = CheckpointResolver::new(&config.weights_dir, config.download);
    let checkpoint_path = resolver.resolve(&config.weights)?;
    info!(checkpoint = %checkpoint_path.display(), "loading checkpoint");

    let checkpoint = PytorchLoader::load(&checkpoint_path)?;
    let model = DetectionModel::from_checkpoint(&checkpoint).map_err(conversion)?;
    drop(checkpoint);
    info!(
        layers = model.layers.len(),
        classes = model.nc(),
        description = %model.description(),
        "parsed detection model"
    );

    let requested = requested_imgsz(config, &model.info);
    let imgsz = round_imgsz(requested, model.max_stride());
    if imgsz != requested {
        warn!(
            requested,
            used = imgsz,
            stride = model.max_stride(),
            "image size must be a multiple of the max stride, rounding up"
        );
    }

    let options = LoweringOptions {
        opset: config.opset,
        imgsz,
        batch: config.batch,
    };
    let ir = build_graph(&model, &options)?;

    let path = config.output_path(&checkpoint_path);
    OnnxExporter::export(&ir, &path)?;

    let report = ExportReport {
        path,
        input_shape: ir.inputs.first().map(|t| t.shape.clone()).unwrap_or_default(),
        output_shape: ir.outputs.first().map(|t| t.shape.clone()).unwrap_or_default(),
        opset: ir.opset,
        node_count: ir.nodes.len(),
        initializer_count: ir.weights.len(),
    };
    info!(
        path = %report.path.display(),
        opset = report.opset,
        nodes = report.node_count,
        output = ?report.output_shape,
        "export complete"
    );
    Ok(report)
}
