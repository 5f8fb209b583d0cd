use crate::ir::{Attribute, DataType, ModelIR, Node, Tensor};
use crate::optimizer::OptimizerError;
use std::collections::HashMap;

pub struct ShapeInference;

impl ShapeInference {
    /// Propagates static shapes through the graph. Graph outputs get their
    /// shape filled in and every intermediate value is recorded in
    /// `ir.value_info`.
    pub fn infer(ir: &mut ModelIR) -> Result<(), OptimizerError> {
        let mut value_shapes: HashMap<String, Vec<usize>> = HashMap::new();

        for input in &ir.inputs {
            value_shapes.insert(input.name.clone(), input.shape.clone());
        }

        for (name, weight) in &ir.weights {
            value_shapes.insert(name.clone(), weight.shape.clone());
        }

        let mut inferred_tensors = Vec::new();

        for node in &ir.nodes {
            let shapes = infer_node(node, &value_shapes, ir)?;
            if shapes.len() != node.outputs.len() {
                return Err(OptimizerError::Error(format!(
                    "{} produced {} shapes for {} outputs",
                    node.name,
                    shapes.len(),
                    node.outputs.len()
                )));
            }
            for (output, shape) in node.outputs.iter().zip(shapes) {
                value_shapes.insert(output.clone(), shape.clone());
                inferred_tensors.push(Tensor::value(output.clone(), shape, DataType::F32));
            }
        }

        for output in ir.outputs.iter_mut() {
            let shape = value_shapes
                .get(&output.name)
                .ok_or_else(|| OptimizerError::Error(format!("Output {} is never produced", output.name)))?;
            output.shape = shape.clone();
        }

        let graph_outputs: Vec<String> = ir.outputs.iter().map(|t| t.name.clone()).collect();
        ir.value_info = inferred_tensors
            .into_iter()
            .filter(|t| !graph_outputs.contains(&t.name))
            .collect();

        Ok(())
    }
}

fn input_shape<'a>(
    node: &Node,
    index: usize,
    value_shapes: &'a HashMap<String, Vec<usize>>,
) -> Result<&'a Vec<usize>, OptimizerError> {
    let name = node
        .inputs
        .get(index)
        .ok_or_else(|| OptimizerError::Error(format!("{} is missing input {}", node.name, index)))?;
    value_shapes
        .get(name)
        .ok_or_else(|| OptimizerError::Error(format!("Input {} not found", name)))
}

fn constant_input(node: &Node, index: usize, ir: &ModelIR) -> Result<Tensor, OptimizerError> {
    let name = node
        .inputs
        .get(index)
        .ok_or_else(|| OptimizerError::Error(format!("{} is missing input {}", node.name, index)))?;
    ir.weights
        .get(name)
        .cloned()
        .ok_or_else(|| OptimizerError::Error(format!("{} expects constant input {}", node.name, name)))
}

fn normalize_axis(axis: i64, rank: usize) -> Result<usize, OptimizerError> {
    let resolved = if axis < 0 { axis + rank as i64 } else { axis };
    if resolved < 0 || resolved >= rank as i64 {
        return Err(OptimizerError::Error(format!("Axis {} out of range for rank {}", axis, rank)));
    }
    Ok(resolved as usize)
}

fn broadcast(a: &[usize], b: &[usize]) -> Result<Vec<usize>, OptimizerError> {
    let rank = a.len().max(b.len());
    let mut out = vec![0; rank];
    for i in 0..rank {
        let da = if i + a.len() >= rank { a[i + a.len() - rank] } else { 1 };
        let db = if i + b.len() >= rank { b[i + b.len() - rank] } else { 1 };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => {
                return Err(OptimizerError::Error(format!(
                    "Shapes {:?} and {:?} do not broadcast",
                    a, b
                )))
            }
        };
    }
    Ok(out)
}

/// Spatial output size shared by Conv and MaxPool.
fn window_output(
    input: &[usize],
    kernel: &[usize],
    node: &Node,
) -> Result<Vec<usize>, OptimizerError> {
    let spatial = kernel.len();
    let strides = node.ints_attr("strides").map(|s| s.to_vec()).unwrap_or_else(|| vec![1; spatial]);
    let pads = node.ints_attr("pads").map(|p| p.to_vec()).unwrap_or_else(|| vec![0; spatial * 2]);
    let dilations = node.ints_attr("dilations").map(|d| d.to_vec()).unwrap_or_else(|| vec![1; spatial]);
    if input.len() != spatial + 2
        || strides.len() != spatial
        || dilations.len() != spatial
        || pads.len() != spatial * 2
    {
        return Err(OptimizerError::Error(format!("{} has inconsistent window attributes", node.name)));
    }

    let mut out = Vec::with_capacity(spatial);
    for i in 0..spatial {
        let padded = input[i + 2] as i64 + pads[i] + pads[i + spatial];
        let effective = dilations[i] * (kernel[i] as i64 - 1) + 1;
        if padded < effective || strides[i] <= 0 {
            return Err(OptimizerError::Error(format!("{} window does not fit its input", node.name)));
        }
        out.push(((padded - effective) / strides[i] + 1) as usize);
    }
    Ok(out)
}

fn infer_node(
    node: &Node,
    value_shapes: &HashMap<String, Vec<usize>>,
    ir: &ModelIR,
) -> Result<Vec<Vec<usize>>, OptimizerError> {
    match node.op_type.as_str() {
        "Relu" | "Sigmoid" | "Softmax" | "BatchNormalization" | "Identity" => {
            Ok(vec![input_shape(node, 0, value_shapes)?.clone()])
        }
        "Add" | "Sub" | "Mul" | "Div" => {
            let a = input_shape(node, 0, value_shapes)?;
            let b = input_shape(node, 1, value_shapes)?;
            Ok(vec![broadcast(a, b)?])
        }
        "Conv" => {
            let x = input_shape(node, 0, value_shapes)?;
            let w = input_shape(node, 1, value_shapes)?;
            if w.len() < 3 || x.len() != w.len() {
                return Err(OptimizerError::Error(format!("{} has mismatched input ranks", node.name)));
            }
            let group = node.int_attr("group").unwrap_or(1) as usize;
            if x[1] != w[1] * group {
                return Err(OptimizerError::Error(format!(
                    "{} expects {} input channels, got {}",
                    node.name,
                    w[1] * group,
                    x[1]
                )));
            }
            let mut out = vec![x[0], w[0]];
            out.extend(window_output(x, &w[2..], node)?);
            Ok(vec![out])
        }
        "MaxPool" => {
            let x = input_shape(node, 0, value_shapes)?;
            let kernel: Vec<usize> = node
                .ints_attr("kernel_shape")
                .ok_or_else(|| OptimizerError::Error(format!("{} is missing kernel_shape", node.name)))?
                .iter()
                .map(|&k| k as usize)
                .collect();
            let mut out = vec![x[0], x[1]];
            out.extend(window_output(x, &kernel, node)?);
            Ok(vec![out])
        }
        "Resize" => {
            let x = input_shape(node, 0, value_shapes)?;
            let scales = constant_input(node, 2, ir)?
                .to_f32_vec()
                .ok_or_else(|| OptimizerError::Error(format!("{} scales must be float", node.name)))?;
            if scales.len() != x.len() {
                return Err(OptimizerError::Error(format!("{} scales rank mismatch", node.name)));
            }
            Ok(vec![x
                .iter()
                .zip(&scales)
                .map(|(&d, &s)| (d as f32 * s).floor() as usize)
                .collect()])
        }
        "Concat" => {
            let axis = node
                .int_attr("axis")
                .ok_or_else(|| OptimizerError::Error(format!("{} is missing axis", node.name)))?;
            let first = input_shape(node, 0, value_shapes)?.clone();
            let axis = normalize_axis(axis, first.len())?;
            let mut out = first.clone();
            out[axis] = 0;
            for i in 0..node.inputs.len() {
                let shape = input_shape(node, i, value_shapes)?;
                let compatible = shape.len() == first.len()
                    && shape.iter().zip(&first).enumerate().all(|(d, (a, b))| d == axis || a == b);
                if !compatible {
                    return Err(OptimizerError::Error(format!(
                        "{} cannot concatenate {:?} with {:?}",
                        node.name, first, shape
                    )));
                }
                out[axis] += shape[axis];
            }
            Ok(vec![out])
        }
        "Split" => {
            let x = input_shape(node, 0, value_shapes)?;
            let axis = normalize_axis(node.int_attr("axis").unwrap_or(0), x.len())?;
            let sizes: Vec<usize> = match node.ints_attr("split") {
                Some(split) => split.iter().map(|&s| s as usize).collect(),
                None if node.inputs.len() > 1 => constant_input(node, 1, ir)?
                    .to_i64_vec()
                    .ok_or_else(|| OptimizerError::Error(format!("{} split must be int64", node.name)))?
                    .into_iter()
                    .map(|s| s as usize)
                    .collect(),
                None => {
                    let parts = node.outputs.len();
                    vec![x[axis] / parts; parts]
                }
            };
            if sizes.iter().sum::<usize>() != x[axis] {
                return Err(OptimizerError::Error(format!(
                    "{} split sizes {:?} do not cover dimension {}",
                    node.name, sizes, x[axis]
                )));
            }
            Ok(sizes
                .into_iter()
                .map(|size| {
                    let mut shape = x.clone();
                    shape[axis] = size;
                    shape
                })
                .collect())
        }
        "Reshape" => {
            let x = input_shape(node, 0, value_shapes)?;
            let target = constant_input(node, 1, ir)?
                .to_i64_vec()
                .ok_or_else(|| OptimizerError::Error(format!("{} shape must be int64", node.name)))?;
            let total: usize = x.iter().product();
            let mut out = Vec::with_capacity(target.len());
            let mut unknown = None;
            for (i, &d) in target.iter().enumerate() {
                match d {
                    -1 if unknown.is_none() => {
                        unknown = Some(i);
                        out.push(1);
                    }
                    0 => out.push(*x.get(i).ok_or_else(|| {
                        OptimizerError::Error(format!("{} copies a missing dimension", node.name))
                    })?),
                    d if d > 0 => out.push(d as usize),
                    _ => return Err(OptimizerError::Error(format!("{} has invalid target {:?}", node.name, target))),
                }
            }
            let known: usize = out.iter().product();
            if let Some(i) = unknown {
                if known == 0 || total % known != 0 {
                    return Err(OptimizerError::Error(format!("{} cannot infer -1 in {:?}", node.name, target)));
                }
                out[i] = total / known;
            } else if known != total {
                return Err(OptimizerError::Error(format!(
                    "{} cannot reshape {:?} into {:?}",
                    node.name, x, target
                )));
            }
            Ok(vec![out])
        }
        "Transpose" => {
            let shape = input_shape(node, 0, value_shapes)?;

            let perm = match node.attributes.get("perm") {
                Some(Attribute::Ints(p)) => p.clone(),
                _ => {
                    let mut p: Vec<i64> = (0..shape.len() as i64).collect();
                    p.reverse();
                    p
                }
            };

            let mut output_shape = Vec::with_capacity(shape.len());
            for &p in &perm {
                let dim = shape
                    .get(p as usize)
                    .ok_or_else(|| OptimizerError::Error(format!("{} has invalid perm {:?}", node.name, perm)))?;
                output_shape.push(*dim);
            }
            Ok(vec![output_shape])
        }
        other => Err(OptimizerError::Error(format!(
            "No shape rule for operator {} ({})",
            other, node.name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Node, Tensor, DataType};

    fn input(ir: &mut ModelIR, name: &str, shape: Vec<usize>) {
        ir.inputs.push(Tensor::value(name, shape, DataType::F32));
    }

    #[test]
    fn test_infer_add_shape() {
        let mut ir = ModelIR::new();
        input(&mut ir, "A", vec![1, 3, 224, 224]);
        input(&mut ir, "B", vec![1, 3, 224, 224]);

        ir.nodes.push(Node::new("add", "Add", vec!["A".into(), "B".into()], vec!["C".into()]));
        ir.outputs.push(Tensor::value("C", vec![], DataType::F32));

        ShapeInference::infer(&mut ir).unwrap();

        assert_eq!(ir.outputs.len(), 1);
        assert_eq!(ir.outputs[0].shape, vec![1, 3, 224, 224]);
        assert!(ir.value_info.is_empty());
    }

    #[test]
    fn test_infer_broadcast_mul() {
        let mut ir = ModelIR::new();
        input(&mut ir, "X", vec![1, 4, 84]);
        ir.add_weight(Tensor::from_f32("s", vec![1, 84], &[1.0; 84]));
        ir.nodes.push(Node::new("mul", "Mul", vec!["X".into(), "s".into()], vec!["Y".into()]));
        ir.outputs.push(Tensor::value("Y", vec![], DataType::F32));

        ShapeInference::infer(&mut ir).unwrap();
        assert_eq!(ir.outputs[0].shape, vec![1, 4, 84]);
    }

    #[test]
    fn test_infer_conv_stride_two() {
        let mut ir = ModelIR::new();
        input(&mut ir, "images", vec![1, 3, 640, 640]);
        ir.add_weight(Tensor::from_f32("w", vec![16, 3, 3, 3], &vec![0.0; 16 * 27]));
        ir.nodes.push(
            Node::new("conv", "Conv", vec!["images".into(), "w".into()], vec!["Y".into()])
                .with_attr("strides", Attribute::Ints(vec![2, 2]))
                .with_attr("pads", Attribute::Ints(vec![1, 1, 1, 1]))
                .with_attr("kernel_shape", Attribute::Ints(vec![3, 3])),
        );
        ir.outputs.push(Tensor::value("Y", vec![], DataType::F32));

        ShapeInference::infer(&mut ir).unwrap();
        assert_eq!(ir.outputs[0].shape, vec![1, 16, 320, 320]);
    }

    #[test]
    fn test_infer_split_reshape_and_concat() {
        let mut ir = ModelIR::new();
        input(&mut ir, "X", vec![1, 8, 4, 4]);
        ir.add_weight(Tensor::from_i64("shape", vec![3], &[1, 8, -1]));
        ir.nodes.push(
            Node::new("split", "Split", vec!["X".into()], vec!["a".into(), "b".into()])
                .with_attr("axis", Attribute::Int(1))
                .with_attr("split", Attribute::Ints(vec![6, 2])),
        );
        ir.nodes.push(
            Node::new("cat", "Concat", vec!["b".into(), "a".into()], vec!["c".into()])
                .with_attr("axis", Attribute::Int(1)),
        );
        ir.nodes.push(Node::new("reshape", "Reshape", vec!["c".into(), "shape".into()], vec!["Y".into()]));
        ir.outputs.push(Tensor::value("Y", vec![], DataType::F32));

        ShapeInference::infer(&mut ir).unwrap();
        assert_eq!(ir.outputs[0].shape, vec![1, 8, 16]);
        let a = ir.value_info.iter().find(|t| t.name == "a").unwrap();
        assert_eq!(a.shape, vec![1, 6, 4, 4]);
    }

    #[test]
    fn test_infer_resize_and_maxpool() {
        let mut ir = ModelIR::new();
        input(&mut ir, "X", vec![1, 8, 20, 20]);
        ir.add_weight(Tensor::from_f32("scales", vec![4], &[1.0, 1.0, 2.0, 2.0]));
        ir.nodes.push(Node::new(
            "resize",
            "Resize",
            vec!["X".into(), String::new(), "scales".into()],
            vec!["up".into()],
        ));
        ir.nodes.push(
            Node::new("pool", "MaxPool", vec!["up".into()], vec!["Y".into()])
                .with_attr("kernel_shape", Attribute::Ints(vec![5, 5]))
                .with_attr("pads", Attribute::Ints(vec![2, 2, 2, 2]))
                .with_attr("strides", Attribute::Ints(vec![1, 1])),
        );
        ir.outputs.push(Tensor::value("Y", vec![], DataType::F32));

        ShapeInference::infer(&mut ir).unwrap();
        assert_eq!(ir.outputs[0].shape, vec![1, 8, 40, 40]);
    }

    #[test]
    fn test_infer_transpose_shape() {
        let mut ir = ModelIR::new();
        input(&mut ir, "X", vec![1, 4, 16, 84]);
        ir.nodes.push(
            Node::new("t", "Transpose", vec!["X".into()], vec!["Y".into()])
                .with_attr("perm", Attribute::Ints(vec![0, 2, 1, 3])),
        );
        ir.outputs.push(Tensor::value("Y", vec![], DataType::F32));

        ShapeInference::infer(&mut ir).unwrap();
        assert_eq!(ir.outputs[0].shape, vec![1, 16, 4, 84]);
    }

    #[test]
    fn test_unknown_operator_is_an_error() {
        let mut ir = ModelIR::new();
        input(&mut ir, "X", vec![2, 2]);
        ir.nodes.push(Node::new("e", "Einsum", vec!["X".into()], vec!["Y".into()]));
        assert!(ShapeInference::infer(&mut ir).is_err());
    }
}
