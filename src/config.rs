//! Export settings and the limits they are validated against.

use std::path::{Path, PathBuf};

use thiserror::Error;

pub const DEFAULT_WEIGHTS: &str = "yolov8n.pt";
pub const DEFAULT_FORMAT: &str = "onnx";
pub const DEFAULT_OPSET: i64 = 12;
pub const DEFAULT_IMGSZ: usize = 640;
pub const DEFAULT_BATCH: usize = 1;

pub const MIN_OPSET: i64 = 11;
pub const MAX_OPSET: i64 = 17;

/// Overrides the directory searched for checkpoints by file name.
pub const WEIGHTS_DIR_ENV: &str = "YOLONNX_WEIGHTS_DIR";

const SUPPORTED_FORMATS: &[&str] = &["onnx"];

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Unsupported export format '{0}', expected one of: onnx")]
    UnsupportedFormat(String),
    #[error("Unsupported opset {opset}, supported range is {min}..={max}")]
    UnsupportedOpset { opset: i64, min: i64, max: i64 },
    #[error("Image size must be positive, got {0}")]
    InvalidImageSize(usize),
    #[error("Batch size must be positive, got {0}")]
    InvalidBatch(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportConfig {
    pub weights: String,
    pub format: String,
    pub opset: i64,
    /// Square input size. `None` takes the checkpoint's training size, or
    /// [`DEFAULT_IMGSZ`] when the checkpoint does not record one.
    pub imgsz: Option<usize>,
    pub batch: usize,
    pub output: Option<PathBuf>,
    pub weights_dir: PathBuf,
    pub download: bool,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            weights: DEFAULT_WEIGHTS.to_string(),
            format: DEFAULT_FORMAT.to_string(),
            opset: DEFAULT_OPSET,
            imgsz: None,
            batch: DEFAULT_BATCH,
            output: None,
            weights_dir: default_weights_dir(),
            download: true,
        }
    }
}

impl ExportConfig {
    pub fn new(weights: impl Into<String>) -> Self {
        Self {
            weights: weights.into(),
            ..Self::default()
        }
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = format.into();
        self
    }

    pub fn with_opset(mut self, opset: i64) -> Self {
        self.opset = opset;
        self
    }

    pub fn with_imgsz(mut self, imgsz: usize) -> Self {
        self.imgsz = Some(imgsz);
        self
    }

    pub fn with_batch(mut self, batch: usize) -> Self {
        self.batch = batch;
        self
    }

    pub fn with_output(mut self, output: impl Into<PathBuf>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn with_weights_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.weights_dir = dir.into();
        self
    }

    pub fn with_download(mut self, download: bool) -> Self {
        self.download = download;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let format = self.format.to_ascii_lowercase();
        if !SUPPORTED_FORMATS.contains(&format.as_str()) {
            return Err(ConfigError::UnsupportedFormat(self.format.clone()));
        }
        if !(MIN_OPSET..=MAX_OPSET).contains(&self.opset) {
            return Err(ConfigError::UnsupportedOpset {
                opset: self.opset,
                min: MIN_OPSET,
                max: MAX_OPSET,
            });
        }
        if self.imgsz == Some(0) {
            return Err(ConfigError::InvalidImageSize(0));
        }
        if self.batch == 0 {
            return Err(ConfigError::InvalidBatch(self.batch));
        }
        Ok(())
    }

    /// Where the artifact goes: `output` if set, else the checkpoint path
    /// with an `.onnx` extension.
    pub fn output_path(&self, checkpoint: &Path) -> PathBuf {
        match &self.output {
            Some(path) => path.clone(),
            None => checkpoint.with_extension("onnx"),
        }
    }
}

/// `$YOLONNX_WEIGHTS_DIR`, else `<cache dir>/yolonnx`, else `./weights`.
pub fn default_weights_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(WEIGHTS_DIR_ENV).filter(|d| !d.is_empty()) {
        return PathBuf::from(dir);
    }
    dirs::cache_dir()
        .map(|d| d.join("yolonnx"))
        .unwrap_or_else(|| PathBuf::from("weights"))
}

/// ONNX IR version paired with an opset by the reference runtime releases.
pub fn ir_version(opset: i64) -> i64 {
    match opset {
        ..=11 => 6,
        12..=14 => 7,
        _ => 8,
    }
}
