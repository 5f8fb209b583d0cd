//! Numeric comparison between an in-memory graph and an exported file.

use std::path::Path;

use ndarray::ArrayD;
use prost::Message;
use tracing::debug;

use crate::exporter::onnx;
use crate::ir::{Attribute, DataType, ModelIR, Node, Tensor};

use super::reference::{sample_input, ReferenceEvaluator};
use super::VerifierError;

/// Relative tolerance used by the exporter when asked to verify its output.
pub const DEFAULT_EPSILON: f32 = 1e-3;

pub trait ParityChecker {
    fn check_parity(ir: &ModelIR, onnx_path: &Path, epsilon: f32) -> Result<(), VerifierError>;
}

/// Runs both graphs with [`ReferenceEvaluator`] on the same inputs.
pub struct ReferenceParity;

fn invalid(msg: impl Into<String>) -> VerifierError {
    VerifierError::Invalid(msg.into())
}

fn data_type(value: i32) -> Result<DataType, VerifierError> {
    use onnx::tensor_proto::DataType as Onnx;
    match Onnx::try_from(value) {
        Ok(Onnx::Float) => Ok(DataType::F32),
        Ok(Onnx::Double) => Ok(DataType::F64),
        Ok(Onnx::Int32) => Ok(DataType::I32),
        Ok(Onnx::Int64) => Ok(DataType::I64),
        Ok(Onnx::Uint8) => Ok(DataType::U8),
        Ok(Onnx::Bool) => Ok(DataType::Bool),
        _ => Err(invalid(format!("unsupported element type {}", value))),
    }
}

fn dims(values: &[i64], what: &str) -> Result<Vec<usize>, VerifierError> {
    values
        .iter()
        .map(|&d| usize::try_from(d).map_err(|_| invalid(format!("{} has dim {}", what, d))))
        .collect()
}

fn import_initializer(tensor: &onnx::TensorProto) -> Result<Tensor, VerifierError> {
    let name = tensor.name.clone().unwrap_or_default();
    let data_type = data_type(tensor.data_type.unwrap_or_default())?;
    let data = match &tensor.raw_data {
        Some(raw) => raw.clone(),
        None if !tensor.float_data.is_empty() => bytemuck::cast_slice::<f32, u8>(&tensor.float_data).to_vec(),
        None if !tensor.int64_data.is_empty() => bytemuck::cast_slice::<i64, u8>(&tensor.int64_data).to_vec(),
        None => Vec::new(),
    };
    Ok(Tensor {
        shape: dims(&tensor.dims, &name)?,
        name,
        data_type,
        data: Some(data),
    })
}

fn import_value(info: &onnx::ValueInfoProto) -> Result<Tensor, VerifierError> {
    use onnx::tensor_shape_proto::dimension;
    let name = info.name.clone().unwrap_or_default();
    let onnx::type_proto::Value::TensorType(tensor) = info
        .r#type
        .as_ref()
        .and_then(|t| t.value.as_ref())
        .ok_or_else(|| invalid(format!("{} has no tensor type", name)))?;
    let shape = tensor
        .shape
        .as_ref()
        .map(|s| {
            s.dim
                .iter()
                .map(|d| match d.value {
                    Some(dimension::Value::DimValue(v)) if v >= 0 => Ok(v as usize),
                    _ => Err(invalid(format!("{} has a symbolic or negative dim", name))),
                })
                .collect::<Result<Vec<_>, _>>()
        })
        .transpose()?
        .unwrap_or_default();
    Ok(Tensor::value(name, shape, data_type(tensor.elem_type.unwrap_or_default())?))
}

fn import_attribute(attr: &onnx::AttributeProto) -> Result<(String, Attribute), VerifierError> {
    use onnx::attribute_proto::AttributeType;
    let name = attr.name.clone().unwrap_or_default();
    let value = match attr.r#type.map(AttributeType::try_from) {
        Some(Ok(AttributeType::Float)) => Attribute::Float(attr.f.unwrap_or_default()),
        Some(Ok(AttributeType::Int)) => Attribute::Int(attr.i.unwrap_or_default()),
        Some(Ok(AttributeType::String)) => {
            Attribute::String(String::from_utf8_lossy(attr.s.as_deref().unwrap_or_default()).into_owned())
        }
        Some(Ok(AttributeType::Floats)) => Attribute::Floats(attr.floats.clone()),
        Some(Ok(AttributeType::Ints)) => Attribute::Ints(attr.ints.clone()),
        _ => return Err(invalid(format!("attribute {} has an unsupported type", name))),
    };
    Ok((name, value))
}

/// Rebuilds a [`ModelIR`] from a decoded model so it can be evaluated.
pub fn import(model: &onnx::ModelProto) -> Result<ModelIR, VerifierError> {
    let graph = model.graph.as_ref().ok_or_else(|| invalid("model has no graph"))?;
    let mut ir = ModelIR::new();
    ir.name = graph.name.clone().unwrap_or_default();
    ir.opset = model
        .opset_import
        .iter()
        .find(|o| o.domain.as_deref().unwrap_or("").is_empty())
        .and_then(|o| o.version)
        .ok_or_else(|| invalid("missing default-domain opset import"))?;

    for tensor in &graph.initializer {
        ir.add_weight(import_initializer(tensor)?);
    }
    for node in &graph.node {
        let mut imported = Node::new(
            node.name.clone().unwrap_or_default(),
            node.op_type.clone().unwrap_or_default(),
            node.input.clone(),
            node.output.clone(),
        );
        for attr in &node.attribute {
            let (name, value) = import_attribute(attr)?;
            imported.attributes.insert(name, value);
        }
        ir.nodes.push(imported);
    }
    ir.inputs = graph.input.iter().map(import_value).collect::<Result<_, _>>()?;
    ir.outputs = graph.output.iter().map(import_value).collect::<Result<_, _>>()?;
    ir.metadata = model
        .metadata_props
        .iter()
        .map(|p| (p.key.clone().unwrap_or_default(), p.value.clone().unwrap_or_default()))
        .collect();
    Ok(ir)
}

/// Largest `|a - b| / max(1, |b|)` over two arrays of the same shape.
pub fn max_relative_error(actual: &ArrayD<f32>, expected: &ArrayD<f32>) -> Option<f32> {
    if actual.shape() != expected.shape() {
        return None;
    }
    Some(
        actual
            .iter()
            .zip(expected.iter())
            .map(|(a, e)| (a - e).abs() / e.abs().max(1.0))
            .fold(0.0, f32::max),
    )
}

impl ParityChecker for ReferenceParity {
    fn check_parity(ir: &ModelIR, onnx_path: &Path, epsilon: f32) -> Result<(), VerifierError> {
        let bytes = std::fs::read(onnx_path)?;
        let exported = import(&onnx::ModelProto::decode(bytes.as_slice())?)?;

        let inputs: Vec<(String, ArrayD<f32>)> = ir
            .inputs
            .iter()
            .map(|t| (t.name.clone(), sample_input(&t.shape)))
            .collect();
        let expected = ReferenceEvaluator::run(ir, inputs.clone())?;
        let actual = ReferenceEvaluator::run(&exported, inputs)?;
        if expected.len() != actual.len() {
            return Err(VerifierError::ParityError(format!(
                "{} outputs in the file, {} expected",
                actual.len(),
                expected.len()
            )));
        }

        for ((output, e), a) in ir.outputs.iter().zip(&expected).zip(&actual) {
            let error = max_relative_error(a, e).ok_or_else(|| {
                VerifierError::ParityError(format!(
                    "{} has shape {:?}, expected {:?}",
                    output.name,
                    a.shape(),
                    e.shape()
                ))
            })?;
            debug!(output = %output.name, error, "parity");
            if !(error <= epsilon) {
                return Err(VerifierError::ParityError(format!(
                    "{} differs by {} (tolerance {})",
                    output.name, error, epsilon
                )));
            }
        }
        Ok(())
    }
}
