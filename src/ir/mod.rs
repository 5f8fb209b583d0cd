pub mod shape_inference;

use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    F32,
    F64,
    I32,
    I64,
    U8,
    Bool,
}

impl DataType {
    /// Size of one element in bytes.
    pub fn size_of(&self) -> usize {
        match self {
            DataType::F32 | DataType::I32 => 4,
            DataType::F64 | DataType::I64 => 8,
            DataType::U8 | DataType::Bool => 1,
        }
    }
}

/// A named value in the graph. `data` holds little-endian element bytes for
/// initializers and is `None` for activations.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub data_type: DataType,
    pub data: Option<Vec<u8>>,
}

impl Tensor {
    pub fn value(name: impl Into<String>, shape: Vec<usize>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            shape,
            data_type,
            data: None,
        }
    }

    pub fn from_f32(name: impl Into<String>, shape: Vec<usize>, values: &[f32]) -> Self {
        Self {
            name: name.into(),
            shape,
            data_type: DataType::F32,
            data: Some(bytemuck::cast_slice::<f32, u8>(values).to_vec()),
        }
    }

    pub fn from_i64(name: impl Into<String>, shape: Vec<usize>, values: &[i64]) -> Self {
        Self {
            name: name.into(),
            shape,
            data_type: DataType::I64,
            data: Some(bytemuck::cast_slice::<i64, u8>(values).to_vec()),
        }
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Element values of an `F32` initializer.
    pub fn to_f32_vec(&self) -> Option<Vec<f32>> {
        match (&self.data, self.data_type) {
            (Some(bytes), DataType::F32) if bytes.len() % 4 == 0 => {
                Some(bytemuck::pod_collect_to_vec::<u8, f32>(bytes))
            }
            _ => None,
        }
    }

    /// Element values of an `I64` or `I32` initializer.
    pub fn to_i64_vec(&self) -> Option<Vec<i64>> {
        match (&self.data, self.data_type) {
            (Some(bytes), DataType::I64) if bytes.len() % 8 == 0 => {
                Some(bytemuck::pod_collect_to_vec::<u8, i64>(bytes))
            }
            (Some(bytes), DataType::I32) if bytes.len() % 4 == 0 => Some(
                bytemuck::pod_collect_to_vec::<u8, i32>(bytes)
                    .into_iter()
                    .map(i64::from)
                    .collect(),
            ),
            _ => None,
        }
    }

    pub fn renamed(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub name: String,
    pub op_type: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub attributes: BTreeMap<String, Attribute>,
}

impl Node {
    pub fn new(
        name: impl Into<String>,
        op_type: impl Into<String>,
        inputs: Vec<String>,
        outputs: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            op_type: op_type.into(),
            inputs,
            outputs,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attr(mut self, name: &str, value: Attribute) -> Self {
        self.attributes.insert(name.to_string(), value);
        self
    }

    pub fn int_attr(&self, name: &str) -> Option<i64> {
        match self.attributes.get(name) {
            Some(Attribute::Int(i)) => Some(*i),
            _ => None,
        }
    }

    pub fn float_attr(&self, name: &str) -> Option<f32> {
        match self.attributes.get(name) {
            Some(Attribute::Float(f)) => Some(*f),
            _ => None,
        }
    }

    pub fn ints_attr(&self, name: &str) -> Option<&[i64]> {
        match self.attributes.get(name) {
            Some(Attribute::Ints(v)) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Attribute {
    Float(f32),
    Int(i64),
    String(String),
    Floats(Vec<f32>),
    Ints(Vec<i64>),
}

/// Graph in ONNX terms: nodes are kept in topological order and weights are
/// keyed by name so serialization order never depends on hashing.
#[derive(Debug, Clone)]
pub struct ModelIR {
    pub name: String,
    pub opset: i64,
    pub nodes: Vec<Node>,
    pub weights: BTreeMap<String, Tensor>,
    pub inputs: Vec<Tensor>,
    pub outputs: Vec<Tensor>,
    pub value_info: Vec<Tensor>,
    pub metadata: Vec<(String, String)>,
}

impl ModelIR {
    pub fn new() -> Self {
        Self {
            name: "main_graph".to_string(),
            opset: crate::config::DEFAULT_OPSET,
            nodes: Vec::new(),
            weights: BTreeMap::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            value_info: Vec::new(),
            metadata: Vec::new(),
        }
    }

    pub fn add_weight(&mut self, tensor: Tensor) -> String {
        let name = tensor.name.clone();
        self.weights.insert(name.clone(), tensor);
        name
    }

    /// Nodes that read `value`.
    pub fn consumers<'a>(&'a self, value: &'a str) -> impl Iterator<Item = &'a Node> + 'a {
        self.nodes
            .iter()
            .filter(move |node| node.inputs.iter().any(|input| input == value))
    }

    pub fn is_graph_output(&self, value: &str) -> bool {
        self.outputs.iter().any(|t| t.name == value)
    }
}

impl Default for ModelIR {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_f32_round_trip_through_bytes() {
        let t = Tensor::from_f32("w", vec![3], &[1.0, -2.5, 0.25]);
        assert_eq!(t.data.as_ref().unwrap().len(), 12);
        assert_eq!(t.to_f32_vec().unwrap(), vec![1.0, -2.5, 0.25]);
        assert!(t.to_i64_vec().is_none());
    }

    #[test]
    fn test_consumers_lists_readers_only() {
        let mut ir = ModelIR::new();
        ir.nodes.push(Node::new("a", "Relu", vec!["X".into()], vec!["Y".into()]));
        ir.nodes.push(Node::new("b", "Relu", vec!["Y".into()], vec!["Z".into()]));
        let names: Vec<_> = ir.consumers("Y").map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["b"]);
    }
}
