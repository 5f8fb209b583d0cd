//! A direct f32 interpreter for the operators the lowering emits.
//!
//! Every op is computed from its definition with plain loops over `ndarray`
//! arrays. It is slow but has no shortcuts in common with the lowering, so
//! two graphs that should compute the same function can be run side by side.

use std::collections::HashMap;

use ndarray::{concatenate, Array4, ArrayD, ArrayView4, Axis, Ix4, IxDyn, Slice, Zip};
use tracing::debug;

use crate::ir::{Attribute, DataType, ModelIR, Node, Tensor};

use super::VerifierError;

pub struct ReferenceEvaluator;

fn inference(msg: impl Into<String>) -> VerifierError {
    VerifierError::InferenceError(msg.into())
}

fn to_array(tensor: &Tensor) -> Result<ArrayD<f32>, VerifierError> {
    let values = tensor
        .to_f32_vec()
        .ok_or_else(|| inference(format!("{} has no f32 data", tensor.name)))?;
    ArrayD::from_shape_vec(IxDyn(&tensor.shape), values)
        .map_err(|e| inference(format!("{}: {}", tensor.name, e)))
}

/// A deterministic image-like input in `[0, 1)`.
pub fn sample_input(shape: &[usize]) -> ArrayD<f32> {
    let numel: usize = shape.iter().product();
    let values = (0..numel).map(|i| ((i * 7919) % 1000) as f32 / 1000.0).collect();
    ArrayD::from_shape_vec(IxDyn(shape), values).unwrap_or_else(|_| ArrayD::zeros(IxDyn(shape)))
}

fn axis(value: i64, rank: usize) -> Result<usize, VerifierError> {
    let resolved = if value < 0 { value + rank as i64 } else { value };
    if resolved < 0 || resolved as usize >= rank {
        return Err(inference(format!("axis {} out of range for rank {}", value, rank)));
    }
    Ok(resolved as usize)
}

fn pair(node: &Node, name: &str, default: usize) -> Result<[usize; 2], VerifierError> {
    match node.ints_attr(name) {
        None => Ok([default, default]),
        Some([a, b]) if *a >= 0 && *b >= 0 => Ok([*a as usize, *b as usize]),
        Some(other) => Err(inference(format!("{}: bad {} {:?}", node.name, name, other))),
    }
}

/// `[top, left, bottom, right]`.
fn pads(node: &Node) -> Result<[usize; 4], VerifierError> {
    match node.ints_attr("pads") {
        None => Ok([0; 4]),
        Some(p) if p.len() == 4 && p.iter().all(|&v| v >= 0) => {
            Ok([p[0] as usize, p[1] as usize, p[2] as usize, p[3] as usize])
        }
        Some(other) => Err(inference(format!("{}: bad pads {:?}", node.name, other))),
    }
}

fn string_attr<'a>(node: &'a Node, name: &str) -> Option<&'a str> {
    match node.attributes.get(name) {
        Some(Attribute::String(s)) => Some(s),
        _ => None,
    }
}

fn image<'a>(node: &Node, x: &'a ArrayD<f32>) -> Result<ArrayView4<'a, f32>, VerifierError> {
    x.view()
        .into_dimensionality::<Ix4>()
        .map_err(|_| inference(format!("{}: expected NCHW, got {:?}", node.name, x.shape())))
}

/// Output extent of a sliding window, or an error if it does not fit.
fn window(node: &Node, size: usize, pad: usize, kernel: usize, stride: usize, dilation: usize) -> Result<usize, VerifierError> {
    let span = dilation * (kernel.max(1) - 1) + 1;
    let padded = size + pad;
    if padded < span || stride == 0 {
        return Err(inference(format!("{}: window does not fit the input", node.name)));
    }
    Ok((padded - span) / stride + 1)
}

fn conv(node: &Node, x: &ArrayD<f32>, w: &ArrayD<f32>, bias: Option<&ArrayD<f32>>) -> Result<ArrayD<f32>, VerifierError> {
    let x = image(node, x)?;
    let w = image(node, w)?;
    let (n, c, h, width) = x.dim();
    let (m, cg, kh, kw) = w.dim();
    let group = node.int_attr("group").unwrap_or(1).max(1) as usize;
    let [sh, sw] = pair(node, "strides", 1)?;
    let [dh, dw] = pair(node, "dilations", 1)?;
    let [pt, pl, pb, pr] = pads(node)?;
    if c != cg * group || m % group != 0 {
        return Err(inference(format!(
            "{}: {} input channels do not fit weight {:?} with group {}",
            node.name,
            c,
            w.shape(),
            group
        )));
    }
    let bias: Vec<f32> = match bias {
        Some(b) if b.len() == m => b.iter().copied().collect(),
        Some(b) => return Err(inference(format!("{}: bias of {} for {} channels", node.name, b.len(), m))),
        None => vec![0.0; m],
    };
    let oh = window(node, h, pt + pb, kh, sh, dh)?;
    let ow = window(node, width, pl + pr, kw, sw, dw)?;
    let per_group = m / group;

    let mut out = Array4::<f32>::zeros((n, m, oh, ow));
    for b in 0..n {
        for oc in 0..m {
            let first = (oc / per_group) * cg;
            for oy in 0..oh {
                for ox in 0..ow {
                    let mut acc = bias[oc];
                    for ic in 0..cg {
                        for ky in 0..kh {
                            let iy = (oy * sh + ky * dh) as isize - pt as isize;
                            if iy < 0 || iy as usize >= h {
                                continue;
                            }
                            for kx in 0..kw {
                                let ix = (ox * sw + kx * dw) as isize - pl as isize;
                                if ix < 0 || ix as usize >= width {
                                    continue;
                                }
                                acc += x[[b, first + ic, iy as usize, ix as usize]] * w[[oc, ic, ky, kx]];
                            }
                        }
                    }
                    out[[b, oc, oy, ox]] = acc;
                }
            }
        }
    }
    Ok(out.into_dyn())
}

fn batch_norm(node: &Node, x: &ArrayD<f32>, params: [&ArrayD<f32>; 4]) -> Result<ArrayD<f32>, VerifierError> {
    let eps = node.float_attr("epsilon").unwrap_or(1e-5);
    let mut out = image(node, x)?.to_owned();
    let channels = out.dim().1;
    let [scale, bias, mean, var] = params.map(|p| p.iter().copied().collect::<Vec<f32>>());
    if [&scale, &bias, &mean, &var].iter().any(|p| p.len() != channels) {
        return Err(inference(format!("{}: parameters do not match {} channels", node.name, channels)));
    }
    for (c, mut plane) in out.axis_iter_mut(Axis(1)).enumerate() {
        let k = scale[c] / (var[c] + eps).sqrt();
        let shift = bias[c] - mean[c] * k;
        plane.mapv_inplace(|v| v * k + shift);
    }
    Ok(out.into_dyn())
}

fn broadcast_shape(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let rank = a.len().max(b.len());
    let dim = |s: &[usize], i: usize| {
        if i + s.len() >= rank {
            s[i + s.len() - rank]
        } else {
            1
        }
    };
    (0..rank)
        .map(|i| match (dim(a, i), dim(b, i)) {
            (x, y) if x == y => Some(x),
            (1, y) => Some(y),
            (x, 1) => Some(x),
            _ => None,
        })
        .collect()
}

fn binary(node: &Node, a: &ArrayD<f32>, b: &ArrayD<f32>, f: impl Fn(f32, f32) -> f32) -> Result<ArrayD<f32>, VerifierError> {
    let mismatch = || inference(format!("{}: cannot broadcast {:?} with {:?}", node.name, a.shape(), b.shape()));
    let shape = broadcast_shape(a.shape(), b.shape()).ok_or_else(mismatch)?;
    let a = a.broadcast(IxDyn(&shape)).ok_or_else(mismatch)?;
    let b = b.broadcast(IxDyn(&shape)).ok_or_else(mismatch)?;
    Ok(Zip::from(a).and(b).map_collect(|&x, &y| f(x, y)))
}

fn softmax_lanes(mut x: ArrayD<f32>, axis: usize) -> ArrayD<f32> {
    for mut lane in x.lanes_mut(Axis(axis)) {
        let max = lane.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        lane.mapv_inplace(|v| (v - max).exp());
        let sum = lane.sum();
        lane.mapv_inplace(|v| v / sum);
    }
    x
}

fn reshape(node: &Node, x: &ArrayD<f32>, shape: Vec<usize>) -> Result<ArrayD<f32>, VerifierError> {
    ArrayD::from_shape_vec(IxDyn(&shape), x.iter().copied().collect())
        .map_err(|_| inference(format!("{}: cannot view {:?} as {:?}", node.name, x.shape(), shape)))
}

/// Softmax with the opset's axis semantics: before 13 the input is treated
/// as 2-D, split at `axis`.
fn softmax(node: &Node, x: &ArrayD<f32>, opset: i64) -> Result<ArrayD<f32>, VerifierError> {
    let rank = x.ndim();
    if opset >= 13 {
        let ax = axis(node.int_attr("axis").unwrap_or(-1), rank)?;
        return Ok(softmax_lanes(x.clone(), ax));
    }
    let ax = axis(node.int_attr("axis").unwrap_or(1), rank)?;
    let outer: usize = x.shape()[..ax].iter().product();
    let inner: usize = x.shape()[ax..].iter().product();
    let flat = softmax_lanes(reshape(node, x, vec![outer, inner])?, 1);
    reshape(node, &flat, x.shape().to_vec())
}

fn max_pool(node: &Node, x: &ArrayD<f32>) -> Result<ArrayD<f32>, VerifierError> {
    if node.int_attr("ceil_mode").unwrap_or(0) != 0 {
        return Err(inference(format!("{}: ceil_mode is not supported", node.name)));
    }
    let x = image(node, x)?;
    let (n, c, h, w) = x.dim();
    let [kh, kw] = match node.ints_attr("kernel_shape") {
        Some([a, b]) if *a > 0 && *b > 0 => [*a as usize, *b as usize],
        other => return Err(inference(format!("{}: bad kernel_shape {:?}", node.name, other))),
    };
    let [sh, sw] = pair(node, "strides", 1)?;
    let [pt, pl, pb, pr] = pads(node)?;
    let oh = window(node, h, pt + pb, kh, sh, 1)?;
    let ow = window(node, w, pl + pr, kw, sw, 1)?;

    let mut out = Array4::<f32>::from_elem((n, c, oh, ow), f32::NEG_INFINITY);
    for ((b, ch, oy, ox), slot) in out.indexed_iter_mut() {
        for ky in 0..kh {
            let iy = (oy * sh + ky) as isize - pt as isize;
            if iy < 0 || iy as usize >= h {
                continue;
            }
            for kx in 0..kw {
                let ix = (ox * sw + kx) as isize - pl as isize;
                if ix >= 0 && (ix as usize) < w {
                    *slot = slot.max(x[[b, ch, iy as usize, ix as usize]]);
                }
            }
        }
    }
    Ok(out.into_dyn())
}

fn resize_nearest(node: &Node, x: &ArrayD<f32>, scales: &ArrayD<f32>) -> Result<ArrayD<f32>, VerifierError> {
    let unsupported = |what: &str| inference(format!("{}: unsupported Resize {}", node.name, what));
    if string_attr(node, "mode") != Some("nearest") {
        return Err(unsupported("mode"));
    }
    if string_attr(node, "coordinate_transformation_mode").unwrap_or("half_pixel") != "asymmetric" {
        return Err(unsupported("coordinate transformation"));
    }
    if string_attr(node, "nearest_mode").unwrap_or("round_prefer_floor") != "floor" {
        return Err(unsupported("nearest mode"));
    }
    let scales: Vec<f32> = scales.iter().copied().collect();
    let x = image(node, x)?;
    if scales.len() != 4 || scales[0] != 1.0 || scales[1] != 1.0 || scales[2] <= 0.0 || scales[3] <= 0.0 {
        return Err(unsupported("scales"));
    }
    let (n, c, h, w) = x.dim();
    let oh = (h as f32 * scales[2]).floor() as usize;
    let ow = (w as f32 * scales[3]).floor() as usize;
    let source = |o: usize, scale: f32, size: usize| ((o as f32 / scale).floor() as usize).min(size - 1);

    let mut out = Array4::<f32>::zeros((n, c, oh, ow));
    for ((b, ch, oy, ox), slot) in out.indexed_iter_mut() {
        *slot = x[[b, ch, source(oy, scales[2], h), source(ox, scales[3], w)]];
    }
    Ok(out.into_dyn())
}

struct Frame<'a> {
    ir: &'a ModelIR,
    values: HashMap<String, ArrayD<f32>>,
}

impl<'a> Frame<'a> {
    fn input(&self, node: &Node, i: usize) -> Result<&ArrayD<f32>, VerifierError> {
        let name = node
            .inputs
            .get(i)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| inference(format!("{}: missing input {}", node.name, i)))?;
        self.values
            .get(name)
            .ok_or_else(|| inference(format!("{}: {} has not been computed", node.name, name)))
    }

    fn optional(&self, node: &Node, i: usize) -> Result<Option<&ArrayD<f32>>, VerifierError> {
        match node.inputs.get(i) {
            Some(name) if !name.is_empty() => self.input(node, i).map(Some),
            _ => Ok(None),
        }
    }

    fn ints(&self, node: &Node, i: usize) -> Result<Option<Vec<i64>>, VerifierError> {
        match node.inputs.get(i) {
            Some(name) if !name.is_empty() => self
                .ir
                .weights
                .get(name)
                .and_then(Tensor::to_i64_vec)
                .map(Some)
                .ok_or_else(|| inference(format!("{}: {} is not an integer constant", node.name, name))),
            _ => Ok(None),
        }
    }

    fn eval(&self, node: &Node) -> Result<Vec<ArrayD<f32>>, VerifierError> {
        let x = || self.input(node, 0);
        let single = |out: ArrayD<f32>| -> Result<Vec<ArrayD<f32>>, VerifierError> { Ok(vec![out]) };
        match node.op_type.as_str() {
            "Conv" => single(conv(node, x()?, self.input(node, 1)?, self.optional(node, 2)?)?),
            "BatchNormalization" => single(batch_norm(
                node,
                x()?,
                [
                    self.input(node, 1)?,
                    self.input(node, 2)?,
                    self.input(node, 3)?,
                    self.input(node, 4)?,
                ],
            )?),
            "Relu" => single(x()?.mapv(|v| v.max(0.0))),
            "Sigmoid" => single(x()?.mapv(|v| 1.0 / (1.0 + (-v).exp()))),
            "Add" => single(binary(node, x()?, self.input(node, 1)?, |a, b| a + b)?),
            "Sub" => single(binary(node, x()?, self.input(node, 1)?, |a, b| a - b)?),
            "Mul" => single(binary(node, x()?, self.input(node, 1)?, |a, b| a * b)?),
            "Div" => single(binary(node, x()?, self.input(node, 1)?, |a, b| a / b)?),
            "Concat" => {
                let parts = (0..node.inputs.len())
                    .map(|i| self.input(node, i).map(|a| a.view()))
                    .collect::<Result<Vec<_>, _>>()?;
                let rank = parts.first().map_or(0, |p| p.ndim());
                let ax = axis(node.int_attr("axis").unwrap_or(0), rank)?;
                let out = concatenate(Axis(ax), &parts)
                    .map_err(|e| inference(format!("{}: {}", node.name, e)))?;
                single(out)
            }
            "Split" => {
                let x = x()?;
                let ax = axis(node.int_attr("axis").unwrap_or(0), x.ndim())?;
                let dim = x.shape()[ax];
                let sizes: Vec<i64> = match (node.ints_attr("split"), self.ints(node, 1)?) {
                    (Some(sizes), _) => sizes.to_vec(),
                    (None, Some(sizes)) => sizes,
                    (None, None) => vec![(dim / node.outputs.len().max(1)) as i64; node.outputs.len()],
                };
                if sizes.iter().any(|&s| s < 0) || sizes.iter().sum::<i64>() != dim as i64 {
                    return Err(inference(format!("{}: sizes {:?} do not cover {}", node.name, sizes, dim)));
                }
                let mut start = 0;
                Ok(sizes
                    .iter()
                    .map(|&size| {
                        let end = start + size as usize;
                        let part = x.slice_axis(Axis(ax), Slice::from(start..end)).to_owned();
                        start = end;
                        part
                    })
                    .collect())
            }
            "Reshape" => {
                let x = x()?;
                let target = self
                    .ints(node, 1)?
                    .ok_or_else(|| inference(format!("{}: Reshape without a shape", node.name)))?;
                let mut shape = Vec::with_capacity(target.len());
                let mut inferred = None;
                for (i, &d) in target.iter().enumerate() {
                    match d {
                        -1 if inferred.is_none() => {
                            inferred = Some(i);
                            shape.push(1);
                        }
                        0 => shape.push(
                            *x.shape()
                                .get(i)
                                .ok_or_else(|| inference(format!("{}: no dim {} to copy", node.name, i)))?,
                        ),
                        d if d > 0 => shape.push(d as usize),
                        _ => return Err(inference(format!("{}: bad shape {:?}", node.name, target))),
                    }
                }
                if let Some(i) = inferred {
                    let known: usize = shape.iter().product();
                    if known == 0 || x.len() % known != 0 {
                        return Err(inference(format!("{}: cannot infer a dim of {:?}", node.name, target)));
                    }
                    shape[i] = x.len() / known;
                }
                single(reshape(node, x, shape)?)
            }
            "Transpose" => {
                let x = x()?;
                let rank = x.ndim();
                let perm: Vec<usize> = match node.ints_attr("perm") {
                    Some(p) => p.iter().map(|&d| axis(d, rank)).collect::<Result<_, _>>()?,
                    None => (0..rank).rev().collect(),
                };
                let mut seen = perm.clone();
                seen.sort_unstable();
                if seen != (0..rank).collect::<Vec<_>>() {
                    return Err(inference(format!("{}: {:?} is not a permutation", node.name, perm)));
                }
                single(x.view().permuted_axes(IxDyn(&perm)).to_owned())
            }
            "Softmax" => single(softmax(node, x()?, self.ir.opset)?),
            "MaxPool" => single(max_pool(node, x()?)?),
            "Resize" => single(resize_nearest(node, x()?, self.input(node, 2)?)?),
            other => Err(inference(format!("{}: no reference for {}", node.name, other))),
        }
    }
}

impl ReferenceEvaluator {
    /// Runs `ir` on the named inputs and returns its graph outputs in order.
    pub fn run(ir: &ModelIR, inputs: Vec<(String, ArrayD<f32>)>) -> Result<Vec<ArrayD<f32>>, VerifierError> {
        let mut values = HashMap::new();
        for tensor in ir.weights.values().filter(|t| t.data_type == DataType::F32) {
            values.insert(tensor.name.clone(), to_array(tensor)?);
        }
        values.extend(inputs);
        let mut frame = Frame { ir, values };

        for node in &ir.nodes {
            let outputs = frame.eval(node)?;
            if outputs.len() != node.outputs.len() {
                return Err(inference(format!(
                    "{}: produced {} outputs for {}",
                    node.name,
                    outputs.len(),
                    node.outputs.len()
                )));
            }
            for (name, value) in node.outputs.iter().zip(outputs) {
                frame.values.insert(name.clone(), value);
            }
        }
        debug!(nodes = ir.nodes.len(), "reference run complete");

        ir.outputs
            .iter()
            .map(|o| {
                frame
                    .values
                    .remove(&o.name)
                    .ok_or_else(|| inference(format!("graph output {} was never produced", o.name)))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn graph(opset: i64, input: &[usize], nodes: Vec<Node>) -> ModelIR {
        let mut ir = ModelIR::new();
        ir.opset = opset;
        ir.inputs.push(Tensor::value("X", input.to_vec(), DataType::F32));
        ir.nodes = nodes;
        ir.outputs.push(Tensor::value("Y", Vec::new(), DataType::F32));
        ir
    }

    fn run(ir: &ModelIR, x: ArrayD<f32>) -> ArrayD<f32> {
        ReferenceEvaluator::run(ir, vec![("X".to_string(), x)]).unwrap().remove(0)
    }

    #[test]
    fn test_conv_with_padding_and_bias() {
        let mut ir = graph(
            12,
            &[1, 1, 2, 2],
            vec![Node::new("conv", "Conv", vec!["X".into(), "W".into(), "B".into()], vec!["Y".into()])
                .with_attr("kernel_shape", Attribute::Ints(vec![3, 3]))
                .with_attr("pads", Attribute::Ints(vec![1, 1, 1, 1]))],
        );
        ir.add_weight(Tensor::from_f32("W", vec![1, 1, 3, 3], &[1.0; 9]));
        ir.add_weight(Tensor::from_f32("B", vec![1], &[0.5]));

        let x = array![[[[1.0f32, 2.0], [3.0, 4.0]]]].into_dyn();
        // every 3x3 window over a 2x2 image sees all four pixels
        assert_eq!(run(&ir, x).iter().copied().collect::<Vec<_>>(), vec![10.5; 4]);
    }

    #[test]
    fn test_softmax_forms_agree() {
        let x = sample_input(&[1, 4, 3]);
        let direct = graph(
            13,
            &[1, 4, 3],
            vec![Node::new("s", "Softmax", vec!["X".into()], vec!["Y".into()]).with_attr("axis", Attribute::Int(1))],
        );
        let moved = graph(
            12,
            &[1, 4, 3],
            vec![
                Node::new("t0", "Transpose", vec!["X".into()], vec!["a".into()])
                    .with_attr("perm", Attribute::Ints(vec![0, 2, 1])),
                Node::new("s", "Softmax", vec!["a".into()], vec!["b".into()]).with_attr("axis", Attribute::Int(2)),
                Node::new("t1", "Transpose", vec!["b".into()], vec!["Y".into()])
                    .with_attr("perm", Attribute::Ints(vec![0, 2, 1])),
            ],
        );

        let a = run(&direct, x.clone());
        let b = run(&moved, x);
        assert_eq!(a.shape(), &[1, 4, 3]);
        let column: f32 = a.index_axis(Axis(2), 0).sum();
        assert!((column - 1.0).abs() < 1e-6);
        assert!(a.iter().zip(b.iter()).all(|(p, q)| (p - q).abs() < 1e-6));
    }

    #[test]
    fn test_softmax_before_13_flattens_from_axis() {
        let ir = graph(
            12,
            &[1, 2, 2],
            vec![Node::new("s", "Softmax", vec!["X".into()], vec!["Y".into()]).with_attr("axis", Attribute::Int(1))],
        );
        let y = run(&ir, ArrayD::zeros(IxDyn(&[1, 2, 2])));
        assert!(y.iter().all(|&v| (v - 0.25).abs() < 1e-6));
    }

    #[test]
    fn test_resize_nearest_repeats_pixels() {
        let mut ir = graph(
            13,
            &[1, 1, 1, 2],
            vec![Node::new("r", "Resize", vec!["X".into(), String::new(), "S".into()], vec!["Y".into()])
                .with_attr("coordinate_transformation_mode", Attribute::String("asymmetric".into()))
                .with_attr("mode", Attribute::String("nearest".into()))
                .with_attr("nearest_mode", Attribute::String("floor".into()))],
        );
        ir.add_weight(Tensor::from_f32("S", vec![4], &[1.0, 1.0, 2.0, 2.0]));

        let y = run(&ir, array![[[[1.0f32, 2.0]]]].into_dyn());
        assert_eq!(y.shape(), &[1, 1, 2, 4]);
        assert_eq!(y.iter().copied().collect::<Vec<_>>(), vec![1.0, 1.0, 2.0, 2.0, 1.0, 1.0, 2.0, 2.0]);
    }

    #[test]
    fn test_split_reshape_and_broadcast() {
        let mut ir = graph(
            13,
            &[1, 4, 2],
            vec![
                Node::new("split", "Split", vec!["X".into(), "sizes".into()], vec!["a".into(), "b".into()])
                    .with_attr("axis", Attribute::Int(1)),
                Node::new("sub", "Sub", vec!["b".into(), "a".into()], vec!["c".into()]),
                Node::new("reshape", "Reshape", vec!["c".into(), "shape".into()], vec!["d".into()]),
                Node::new("div", "Div", vec!["d".into(), "two".into()], vec!["Y".into()]),
            ],
        );
        ir.add_weight(Tensor::from_i64("sizes", vec![2], &[2, 2]));
        ir.add_weight(Tensor::from_i64("shape", vec![2], &[0, -1]));
        ir.add_weight(Tensor::from_f32("two", Vec::new(), &[2.0]));

        let x = ArrayD::from_shape_vec(IxDyn(&[1, 4, 2]), (0..8).map(|v| v as f32).collect()).unwrap();
        let y = run(&ir, x);
        assert_eq!(y.shape(), &[1, 4]);
        assert!(y.iter().all(|&v| v == 2.0));
    }

    #[test]
    fn test_max_pool_pads_with_neg_infinity() {
        let ir = graph(
            12,
            &[1, 1, 2, 2],
            vec![Node::new("pool", "MaxPool", vec!["X".into()], vec!["Y".into()])
                .with_attr("kernel_shape", Attribute::Ints(vec![3, 3]))
                .with_attr("pads", Attribute::Ints(vec![1, 1, 1, 1]))],
        );
        let y = run(&ir, array![[[[-4.0f32, -3.0], [-2.0, -1.0]]]].into_dyn());
        assert_eq!(y.iter().copied().collect::<Vec<_>>(), vec![-1.0; 4]);
    }

    #[test]
    fn test_unknown_op_is_inference_error() {
        let ir = graph(12, &[1], vec![Node::new("g", "Gather", vec!["X".into()], vec!["Y".into()])]);
        let err = ReferenceEvaluator::run(&ir, vec![("X".to_string(), ArrayD::zeros(IxDyn(&[1])))]).unwrap_err();
        assert!(matches!(err, VerifierError::InferenceError(_)));
    }
}
