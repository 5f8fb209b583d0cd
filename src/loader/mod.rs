use std::path::Path;
use thiserror::Error;

pub mod pickle;
pub mod pytorch;
pub mod resolve;

pub use pickle::Value;

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Checkpoint not found: {0}")]
    NotFound(String),
    #[error("Download failed: {0}")]
    Download(String),
    #[error("Invalid format: {0}")]
    InvalidFormat(String),
    #[error("Unsupported version: {0}")]
    UnsupportedVersion(String),
    #[error("Pickle error: {0}")]
    Pickle(#[from] pickle::PickleError),
}

pub trait ModelLoader {
    fn load<P: AsRef<Path>>(path: P) -> Result<Checkpoint, LoaderError>;
}

/// The unpickled checkpoint with every tensor materialized.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub root: Value,
}

/// Provenance fields stored next to the model in an ultralytics checkpoint.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckpointInfo {
    pub version: Option<String>,
    pub license: Option<String>,
    pub docs: Option<String>,
    pub train_imgsz: Option<usize>,
}

impl Checkpoint {
    /// The model object: `ema` when it is set, otherwise `model`. A checkpoint
    /// that is itself a pickled module is returned as is.
    pub fn model(&self) -> Result<&Value, LoaderError> {
        match &self.root {
            Value::Dict(_) => {
                if let Some(ema) = self.root.get("ema").filter(|v| !v.is_none()) {
                    return Ok(ema);
                }
                self.root
                    .get("model")
                    .filter(|v| !v.is_none())
                    .ok_or_else(|| LoaderError::InvalidFormat("checkpoint has no 'model' entry".to_string()))
            }
            Value::Object { .. } => Ok(&self.root),
            _ => Err(LoaderError::InvalidFormat(
                "checkpoint root is neither a dict nor a module".to_string(),
            )),
        }
    }

    pub fn info(&self) -> CheckpointInfo {
        let text = |key: &str| self.root.get(key).and_then(Value::as_str).map(str::to_string);
        let train_imgsz = self.root.get("train_args").and_then(|args| {
            let imgsz = args.get("imgsz")?;
            match imgsz {
                Value::Int(i) if *i > 0 => Some(*i as usize),
                other => other
                    .as_seq()
                    .and_then(|dims| dims.first())
                    .and_then(Value::as_int)
                    .filter(|&i| i > 0)
                    .map(|i| i as usize),
            }
        });
        CheckpointInfo {
            version: text("version"),
            license: text("license"),
            docs: text("docs"),
            train_imgsz,
        }
    }
}
