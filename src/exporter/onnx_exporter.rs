use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use prost::Message;
use tracing::debug;

use crate::config::ir_version;
use crate::exporter::{onnx, ExporterError, ModelExporter};
use crate::ir::{Attribute, DataType, ModelIR, Node, Tensor};

pub const PRODUCER_NAME: &str = "yolonnx";

pub struct OnnxExporter;

fn data_type(dt: DataType) -> i32 {
    use onnx::tensor_proto::DataType as Onnx;
    let mapped = match dt {
        DataType::F32 => Onnx::Float,
        DataType::F64 => Onnx::Double,
        DataType::I32 => Onnx::Int32,
        DataType::I64 => Onnx::Int64,
        DataType::U8 => Onnx::Uint8,
        DataType::Bool => Onnx::Bool,
    };
    mapped as i32
}

fn value_info(tensor: &Tensor) -> onnx::ValueInfoProto {
    use onnx::tensor_shape_proto::{dimension, Dimension};
    let shape = onnx::TensorShapeProto {
        dim: tensor
            .shape
            .iter()
            .map(|&d| Dimension {
                denotation: None,
                value: Some(dimension::Value::DimValue(d as i64)),
            })
            .collect(),
    };
    onnx::ValueInfoProto {
        name: Some(tensor.name.clone()),
        r#type: Some(onnx::TypeProto {
            denotation: None,
            value: Some(onnx::type_proto::Value::TensorType(onnx::type_proto::Tensor {
                elem_type: Some(data_type(tensor.data_type)),
                shape: Some(shape),
            })),
        }),
        doc_string: None,
    }
}

fn initializer(tensor: &Tensor) -> onnx::TensorProto {
    onnx::TensorProto {
        name: Some(tensor.name.clone()),
        dims: tensor.shape.iter().map(|&d| d as i64).collect(),
        data_type: Some(data_type(tensor.data_type)),
        raw_data: Some(tensor.data.clone().unwrap_or_default()),
        ..Default::default()
    }
}

fn attribute(name: &str, value: &Attribute) -> onnx::AttributeProto {
    use onnx::attribute_proto::AttributeType;
    let mut a = onnx::AttributeProto {
        name: Some(name.to_string()),
        ..Default::default()
    };
    let kind = match value {
        Attribute::Float(f) => {
            a.f = Some(*f);
            AttributeType::Float
        }
        Attribute::Int(i) => {
            a.i = Some(*i);
            AttributeType::Int
        }
        Attribute::String(s) => {
            a.s = Some(s.as_bytes().to_vec());
            AttributeType::String
        }
        Attribute::Floats(fs) => {
            a.floats = fs.clone();
            AttributeType::Floats
        }
        Attribute::Ints(is) => {
            a.ints = is.clone();
            AttributeType::Ints
        }
    };
    a.r#type = Some(kind as i32);
    a
}

fn node(node: &Node) -> onnx::NodeProto {
    onnx::NodeProto {
        name: Some(node.name.clone()),
        op_type: Some(node.op_type.clone()),
        input: node.inputs.clone(),
        output: node.outputs.clone(),
        // BTreeMap iteration keeps attributes sorted by name
        attribute: node
            .attributes
            .iter()
            .map(|(name, value)| attribute(name, value))
            .collect(),
        ..Default::default()
    }
}

impl OnnxExporter {
    pub fn to_proto(ir: &ModelIR) -> onnx::ModelProto {
        let graph = onnx::GraphProto {
            name: Some(ir.name.clone()),
            node: ir.nodes.iter().map(node).collect(),
            initializer: ir.weights.values().map(initializer).collect(),
            input: ir.inputs.iter().map(value_info).collect(),
            output: ir.outputs.iter().map(value_info).collect(),
            value_info: ir.value_info.iter().map(value_info).collect(),
            doc_string: None,
        };

        onnx::ModelProto {
            ir_version: Some(ir_version(ir.opset)),
            producer_name: Some(PRODUCER_NAME.to_string()),
            producer_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            opset_import: vec![onnx::OperatorSetIdProto {
                domain: Some(String::new()),
                version: Some(ir.opset),
            }],
            metadata_props: ir
                .metadata
                .iter()
                .map(|(key, value)| onnx::StringStringEntryProto {
                    key: Some(key.clone()),
                    value: Some(value.clone()),
                })
                .collect(),
            graph: Some(graph),
            ..Default::default()
        }
    }

    pub fn encode(ir: &ModelIR) -> Result<Vec<u8>, ExporterError> {
        let model = Self::to_proto(ir);
        let mut buf = Vec::with_capacity(model.encoded_len());
        model
            .encode(&mut buf)
            .map_err(|e| ExporterError::SerializationError(e.to_string()))?;
        Ok(buf)
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

impl ModelExporter for OnnxExporter {
    /// Serializes the whole model first, then writes a temporary sibling and
    /// renames it over `path`, so a failed export leaves nothing behind.
    fn export(ir: &ModelIR, path: &Path) -> Result<(), ExporterError> {
        let buf = Self::encode(ir)?;
        let write_err = |source| ExporterError::Write {
            path: path.display().to_string(),
            source,
        };

        let tmp = temp_sibling(path);
        let written = File::create(&tmp)
            .and_then(|mut file| {
                file.write_all(&buf)?;
                file.sync_all()
            })
            .and_then(|_| fs::rename(&tmp, path));
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(write_err(e));
        }

        debug!(path = %path.display(), bytes = buf.len(), "wrote ONNX model");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{ModelIR, Node, Tensor, DataType};
    use tempfile::tempdir;

    fn relu_model() -> ModelIR {
        let mut ir = ModelIR::new();
        ir.inputs.push(Tensor::value("X", vec![1, 4], DataType::F32));
        ir.nodes.push(Node::new("relu1", "Relu", vec!["X".to_string()], vec!["Y".to_string()]));
        ir.outputs.push(Tensor::value("Y", vec![1, 4], DataType::F32));
        ir
    }

    #[test]
    fn test_export_basic_model() {
        let mut ir = ModelIR::new();
        ir.weights.insert("w1".to_string(), Tensor {
            name: "w1".to_string(),
            shape: vec![1, 1],
            data_type: DataType::F32,
            data: Some(vec![0, 0, 128, 63]),
        });
        ir.nodes.push(Node::new(
            "add1",
            "Add",
            vec!["X".to_string(), "w1".to_string()],
            vec!["Y".to_string()],
        ));

        let dir = tempdir().unwrap();
        let file_path = dir.path().join("model.onnx");

        let result = OnnxExporter::export(&ir, &file_path);
        assert!(result.is_ok());
        assert!(file_path.exists());
        assert!(!temp_sibling(&file_path).exists());

        let bytes = fs::read(&file_path).unwrap();
        let model = onnx::ModelProto::decode(bytes.as_slice()).unwrap();
        let graph = model.graph.unwrap();
        assert_eq!(graph.initializer[0].raw_data.as_deref(), Some(&[0u8, 0, 128, 63][..]));
        assert_eq!(graph.initializer[0].dims, vec![1, 1]);
    }

    #[test]
    fn test_export_sets_opset_and_ir_version() {
        let mut ir = relu_model();
        ir.opset = 13;
        ir.metadata.push(("task".to_string(), "detect".to_string()));

        let model = onnx::ModelProto::decode(OnnxExporter::encode(&ir).unwrap().as_slice()).unwrap();
        assert_eq!(model.ir_version, Some(7));
        assert_eq!(model.opset_import.len(), 1);
        assert_eq!(model.opset_import[0].version, Some(13));
        assert_eq!(model.opset_import[0].domain.as_deref(), Some(""));
        assert_eq!(model.producer_name.as_deref(), Some("yolonnx"));
        assert_eq!(model.metadata_props[0].key.as_deref(), Some("task"));

        let graph = model.graph.unwrap();
        assert_eq!(graph.input[0].name.as_deref(), Some("X"));
        match graph.output[0].r#type.as_ref().and_then(|t| t.value.as_ref()) {
            Some(onnx::type_proto::Value::TensorType(t)) => {
                assert_eq!(t.elem_type, Some(onnx::tensor_proto::DataType::Float as i32));
                assert_eq!(t.shape.as_ref().unwrap().dim.len(), 2);
            }
            other => panic!("unexpected output type {:?}", other),
        }
    }

    #[test]
    fn test_export_transpose_attributes() {
        let mut ir = ModelIR::new();
        ir.nodes.push(
            Node::new("transpose1", "Transpose", vec!["X".to_string()], vec!["Y".to_string()])
                .with_attr("perm", Attribute::Ints(vec![0, 2, 1])),
        );

        let model = OnnxExporter::to_proto(&ir);
        let attr = &model.graph.unwrap().node[0].attribute[0];
        assert_eq!(attr.name.as_deref(), Some("perm"));
        assert_eq!(attr.ints, vec![0, 2, 1]);
        assert_eq!(
            attr.r#type,
            Some(onnx::attribute_proto::AttributeType::Ints as i32)
        );
    }

    #[test]
    fn test_export_conv_attributes_are_sorted() {
        let mut ir = ModelIR::new();
        ir.nodes.push(
            Node::new("conv1", "Conv", vec!["X".to_string(), "W".to_string()], vec!["Y".to_string()])
                .with_attr("strides", Attribute::Ints(vec![1, 1]))
                .with_attr("pads", Attribute::Ints(vec![0, 0, 0, 0]))
                .with_attr("group", Attribute::Int(1)),
        );

        let model = OnnxExporter::to_proto(&ir);
        let names: Vec<_> = model.graph.unwrap().node[0]
            .attribute
            .iter()
            .map(|a| a.name.clone().unwrap())
            .collect();
        assert_eq!(names, vec!["group", "pads", "strides"]);
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let mut ir = relu_model();
        ir.add_weight(Tensor::from_f32("b", vec![2], &[1.0, 2.0]));
        ir.add_weight(Tensor::from_f32("a", vec![1], &[3.0]));
        assert_eq!(OnnxExporter::encode(&ir).unwrap(), OnnxExporter::encode(&ir).unwrap());
    }

    #[test]
    fn test_failed_write_leaves_nothing() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("missing").join("model.onnx");

        let result = OnnxExporter::export(&relu_model(), &file_path);
        assert!(matches!(result, Err(ExporterError::Write { .. })));
        assert!(!file_path.exists());
        assert!(!temp_sibling(&file_path).exists());
    }
}
