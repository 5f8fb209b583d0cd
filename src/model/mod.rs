//! Typed view of an ultralytics detection model.
//!
//! The pickled `nn.Module` tree is parsed once into these structs; lowering
//! never looks at pickle values.

mod parse;

use thiserror::Error;

use crate::ir::Tensor;
use crate::loader::{Checkpoint, CheckpointInfo};

pub use parse::ModuleView;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Unsupported module {class} at {path}")]
    UnsupportedModule { path: String, class: String },
    #[error("Missing {field} in {path}")]
    MissingField { path: String, field: String },
    #[error("Invalid {field} in {path}: {reason}")]
    InvalidField {
        path: String,
        field: String,
        reason: String,
    },
    #[error("Invalid model: {0}")]
    InvalidModel(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Silu,
    Relu,
    Identity,
}

/// `nn.Conv2d`. `path` is the state-dict prefix, e.g. `model.0.conv`.
#[derive(Debug, Clone)]
pub struct Conv2d {
    pub path: String,
    pub weight: Tensor,
    pub bias: Option<Tensor>,
    pub stride: [usize; 2],
    pub padding: [usize; 2],
    pub dilation: [usize; 2],
    pub groups: usize,
}

impl Conv2d {
    pub fn out_channels(&self) -> usize {
        self.weight.shape[0]
    }

    pub fn in_channels(&self) -> usize {
        self.weight.shape[1] * self.groups
    }

    pub fn kernel(&self) -> [usize; 2] {
        [self.weight.shape[2], self.weight.shape[3]]
    }
}

#[derive(Debug, Clone)]
pub struct BatchNorm2d {
    pub path: String,
    pub weight: Tensor,
    pub bias: Tensor,
    pub running_mean: Tensor,
    pub running_var: Tensor,
    pub eps: f64,
    pub momentum: f64,
}

/// Ultralytics `Conv`: convolution, optional batch norm, activation.
#[derive(Debug, Clone)]
pub struct ConvBlock {
    pub path: String,
    pub conv: Conv2d,
    pub bn: Option<BatchNorm2d>,
    pub act: Activation,
}

impl ConvBlock {
    pub fn out_channels(&self) -> usize {
        self.conv.out_channels()
    }
}

#[derive(Debug, Clone)]
pub struct Bottleneck {
    pub path: String,
    pub cv1: ConvBlock,
    pub cv2: ConvBlock,
    pub add: bool,
}

#[derive(Debug, Clone)]
pub struct C2f {
    pub path: String,
    pub hidden: usize,
    pub cv1: ConvBlock,
    pub cv2: ConvBlock,
    pub m: Vec<Bottleneck>,
}

#[derive(Debug, Clone)]
pub struct Sppf {
    pub path: String,
    pub cv1: ConvBlock,
    pub cv2: ConvBlock,
    pub kernel: usize,
}

/// One stage of a detection head branch.
#[derive(Debug, Clone)]
pub enum HeadStage {
    Block(ConvBlock),
    Conv(Conv2d),
}

#[derive(Debug, Clone)]
pub struct Detect {
    pub path: String,
    pub nc: usize,
    pub reg_max: usize,
    pub stride: Vec<f32>,
    /// Box regression branch per level.
    pub cv2: Vec<Vec<HeadStage>>,
    /// Classification branch per level.
    pub cv3: Vec<Vec<HeadStage>>,
    /// Projection of the DFL bins; `None` when `reg_max == 1`.
    pub dfl: Option<Conv2d>,
}

impl Detect {
    pub fn nl(&self) -> usize {
        self.cv2.len()
    }

    /// Outputs per anchor before decoding.
    pub fn no(&self) -> usize {
        self.nc + self.reg_max * 4
    }
}

#[derive(Debug, Clone)]
pub enum Module {
    Conv(ConvBlock),
    C2f(C2f),
    Sppf(Sppf),
    Upsample { scale: usize },
    Concat { dim: i64 },
    Detect(Detect),
}

impl Module {
    pub fn kind(&self) -> &'static str {
        match self {
            Module::Conv(_) => "Conv",
            Module::C2f(_) => "C2f",
            Module::Sppf(_) => "SPPF",
            Module::Upsample { .. } => "Upsample",
            Module::Concat { .. } => "Concat",
            Module::Detect(_) => "Detect",
        }
    }
}

/// A top-level layer. `from` uses ultralytics indexing: `-1` is the previous
/// layer, non-negative values are absolute layer indices.
#[derive(Debug, Clone)]
pub struct Layer {
    pub index: usize,
    pub from: Vec<i64>,
    pub module: Module,
}

#[derive(Debug, Clone)]
pub struct DetectionModel {
    pub layers: Vec<Layer>,
    pub names: Vec<String>,
    pub yaml_file: Option<String>,
    pub info: CheckpointInfo,
}

impl DetectionModel {
    pub fn from_checkpoint(checkpoint: &Checkpoint) -> Result<Self, ModelError> {
        let root = checkpoint
            .model()
            .map_err(|e| ModelError::InvalidModel(e.to_string()))?;
        let mut model = parse::parse_detection_model(root)?;
        model.info = checkpoint.info();
        Ok(model)
    }

    pub fn detect(&self) -> Result<&Detect, ModelError> {
        match self.layers.last().map(|l| &l.module) {
            Some(Module::Detect(detect)) => Ok(detect),
            _ => Err(ModelError::InvalidModel(
                "last layer is not a Detect head".to_string(),
            )),
        }
    }

    pub fn nc(&self) -> usize {
        self.detect().map(|d| d.nc).unwrap_or(0)
    }

    pub fn max_stride(&self) -> usize {
        let max = self
            .detect()
            .map(|d| d.stride.iter().cloned().fold(0.0f32, f32::max))
            .unwrap_or(0.0);
        if max >= 1.0 {
            max.round() as usize
        } else {
            32
        }
    }

    /// `description` metadata: the yaml stem, e.g. `Ultralytics YOLOv8n model`.
    pub fn description(&self) -> String {
        let stem = self
            .yaml_file
            .as_deref()
            .and_then(|f| std::path::Path::new(f).file_stem())
            .and_then(|s| s.to_str())
            .map(|s| s.replace("yolo", "YOLO"))
            .unwrap_or_else(|| "YOLO".to_string());
        format!("Ultralytics {} model", stem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(yaml: Option<&str>, stride: Vec<f32>) -> DetectionModel {
        DetectionModel {
            layers: vec![Layer {
                index: 0,
                from: vec![-1],
                module: Module::Detect(Detect {
                    path: "model.0".to_string(),
                    nc: 80,
                    reg_max: 16,
                    stride,
                    cv2: Vec::new(),
                    cv3: Vec::new(),
                    dfl: None,
                }),
            }],
            names: Vec::new(),
            yaml_file: yaml.map(str::to_string),
            info: CheckpointInfo::default(),
        }
    }

    #[test]
    fn test_description_from_yaml() {
        assert_eq!(
            model(Some("yolov8n.yaml"), vec![8.0]).description(),
            "Ultralytics YOLOv8n model"
        );
        assert_eq!(model(None, vec![8.0]).description(), "Ultralytics YOLO model");
    }

    #[test]
    fn test_max_stride() {
        assert_eq!(model(None, vec![8.0, 16.0, 32.0]).max_stride(), 32);
        assert_eq!(model(None, Vec::new()).max_stride(), 32);
        assert_eq!(model(None, vec![8.0, 64.0]).nc(), 80);
        assert_eq!(model(None, vec![8.0, 64.0]).max_stride(), 64);
    }
}
