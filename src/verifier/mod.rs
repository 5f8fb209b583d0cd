//! Reads an exported file back and checks that it is a well-formed graph for
//! the opset it declares, and that it computes what the lowering computed.

pub mod parity;
pub mod reference;

use std::collections::{HashMap, HashSet};
use std::path::Path;

use prost::Message;
use thiserror::Error;

use crate::config::{MAX_OPSET, MIN_OPSET};
use crate::exporter::onnx;

#[derive(Error, Debug)]
pub enum VerifierError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Decode error: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("Invalid model: {0}")]
    Invalid(String),
    #[error("Inference error: {0}")]
    InferenceError(String),
    #[error("Parity error: {0}")]
    ParityError(String),
}

/// Operators the lowering emits.
pub const SUPPORTED_OPS: &[&str] = &[
    "Add",
    "BatchNormalization",
    "Concat",
    "Conv",
    "Div",
    "MaxPool",
    "Mul",
    "Relu",
    "Reshape",
    "Resize",
    "Sigmoid",
    "Softmax",
    "Split",
    "Sub",
    "Transpose",
];

pub trait ModelChecker {
    fn check(model: &onnx::ModelProto) -> Result<(), VerifierError>;

    fn check_file<P: AsRef<Path>>(path: P) -> Result<onnx::ModelProto, VerifierError> {
        let bytes = std::fs::read(path)?;
        let model = onnx::ModelProto::decode(bytes.as_slice())?;
        Self::check(&model)?;
        Ok(model)
    }
}

pub struct OnnxChecker;

fn invalid(msg: impl Into<String>) -> VerifierError {
    VerifierError::Invalid(msg.into())
}

fn element_size(data_type: i32) -> Option<usize> {
    use onnx::tensor_proto::DataType;
    match DataType::try_from(data_type).ok()? {
        DataType::Float | DataType::Int32 | DataType::Uint32 => Some(4),
        DataType::Double | DataType::Int64 | DataType::Uint64 => Some(8),
        DataType::Uint8 | DataType::Int8 | DataType::Bool => Some(1),
        DataType::Float16 | DataType::Bfloat16 | DataType::Int16 | DataType::Uint16 => Some(2),
        _ => None,
    }
}

fn value_rank(info: &onnx::ValueInfoProto) -> Option<usize> {
    match info.r#type.as_ref()?.value.as_ref()? {
        onnx::type_proto::Value::TensorType(t) => t.shape.as_ref().map(|s| s.dim.len()),
    }
}

fn check_initializer(tensor: &onnx::TensorProto) -> Result<(), VerifierError> {
    let name = tensor.name.as_deref().unwrap_or("<unnamed>");
    let size = tensor
        .data_type
        .and_then(element_size)
        .ok_or_else(|| invalid(format!("initializer {} has an unsupported data type", name)))?;
    if tensor.dims.iter().any(|&d| d < 0) {
        return Err(invalid(format!("initializer {} has negative dims", name)));
    }
    let numel: i64 = tensor.dims.iter().product();
    let expected = numel as usize * size;
    let actual = tensor.raw_data.as_ref().map(Vec::len).unwrap_or(0);
    if actual != expected {
        return Err(invalid(format!(
            "initializer {} holds {} bytes, dims {:?} need {}",
            name, actual, tensor.dims, expected
        )));
    }
    Ok(())
}

fn attr<'a>(node: &'a onnx::NodeProto, name: &str) -> Option<&'a onnx::AttributeProto> {
    node.attribute.iter().find(|a| a.name.as_deref() == Some(name))
}

/// Operator forms that changed at opset 13.
fn check_opset_form(
    node: &onnx::NodeProto,
    opset: i64,
    ranks: &HashMap<&str, usize>,
) -> Result<(), VerifierError> {
    let name = node.name.as_deref().unwrap_or("");
    let present = |i: usize| node.input.get(i).map_or(false, |s| !s.is_empty());
    match node.op_type.as_deref() {
        Some("Split") if opset < 13 && present(1) => Err(invalid(format!(
            "{}: Split takes sizes as an attribute before opset 13",
            name
        ))),
        Some("Split") if opset >= 13 && attr(node, "split").is_some() => Err(invalid(format!(
            "{}: Split has no split attribute from opset 13",
            name
        ))),
        Some("Resize") if opset < 13 && !present(1) => Err(invalid(format!(
            "{}: Resize requires roi before opset 13",
            name
        ))),
        Some("Softmax") if opset < 13 => {
            let axis = attr(node, "axis").and_then(|a| a.i).unwrap_or(1);
            match node.input.first().and_then(|i| ranks.get(i.as_str())) {
                Some(&rank) if axis != -1 && axis != rank as i64 - 1 => Err(invalid(format!(
                    "{}: Softmax before opset 13 must reduce the last axis",
                    name
                ))),
                _ => Ok(()),
            }
        }
        _ => Ok(()),
    }
}

impl ModelChecker for OnnxChecker {
    fn check(model: &onnx::ModelProto) -> Result<(), VerifierError> {
        let opset = model
            .opset_import
            .iter()
            .find(|o| o.domain.as_deref().unwrap_or("").is_empty())
            .and_then(|o| o.version)
            .ok_or_else(|| invalid("missing default-domain opset import"))?;
        if !(MIN_OPSET..=MAX_OPSET).contains(&opset) {
            return Err(invalid(format!("opset {} is outside the supported range", opset)));
        }
        let graph = model.graph.as_ref().ok_or_else(|| invalid("model has no graph"))?;

        let mut available: HashSet<&str> = HashSet::new();
        for input in &graph.input {
            available.insert(input.name.as_deref().unwrap_or(""));
        }
        for tensor in &graph.initializer {
            check_initializer(tensor)?;
            available.insert(tensor.name.as_deref().unwrap_or(""));
        }

        let mut ranks: HashMap<&str, usize> = HashMap::new();
        for info in graph.input.iter().chain(&graph.value_info).chain(&graph.output) {
            if let (Some(name), Some(rank)) = (info.name.as_deref(), value_rank(info)) {
                ranks.insert(name, rank);
            }
        }

        let mut names = HashSet::new();
        for node in &graph.node {
            let name = node.name.as_deref().unwrap_or("");
            if name.is_empty() || !names.insert(name) {
                return Err(invalid(format!("node name '{}' is empty or repeated", name)));
            }
            let op = node.op_type.as_deref().unwrap_or("");
            if !SUPPORTED_OPS.contains(&op) {
                return Err(invalid(format!("{}: unexpected operator {}", name, op)));
            }
            for input in node.input.iter().filter(|i| !i.is_empty()) {
                if !available.contains(input.as_str()) {
                    return Err(invalid(format!("{}: input {} is not produced before use", name, input)));
                }
            }
            check_opset_form(node, opset, &ranks)?;
            for output in &node.output {
                available.insert(output.as_str());
            }
        }

        for output in &graph.output {
            let name = output.name.as_deref().unwrap_or("");
            if !available.contains(name) {
                return Err(invalid(format!("graph output {} is never produced", name)));
            }
        }
        Ok(())
    }
}
