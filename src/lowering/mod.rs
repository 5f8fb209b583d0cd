//! Lowers a [`DetectionModel`] into [`ModelIR`] nodes for one ONNX opset.
//!
//! Node names follow the module path (`/model.2.m.0.cv1/Conv`) and every
//! output is named `<node>_output_<k>`. Operators whose signature changed
//! between opsets are emitted in the form the target opset expects.

mod detect;

use std::collections::HashMap;

use thiserror::Error;
use tracing::debug;

use crate::config::{MAX_OPSET, MIN_OPSET};
use crate::ir::{Attribute, DataType, ModelIR, Node, Tensor};
use crate::model::{Activation, Bottleneck, C2f, Conv2d, ConvBlock, DetectionModel, Module, Sppf};

pub const INPUT_NAME: &str = "images";
pub const OUTPUT_NAME: &str = "output0";

#[derive(Error, Debug)]
pub enum LoweringError {
    #[error("Opset {0} is not supported by the lowering")]
    UnsupportedOpset(i64),
    #[error("Layer {layer}: {reason}")]
    InvalidLayer { layer: usize, reason: String },
    #[error("Image size {imgsz} is not divisible by stride {stride}")]
    ImageSize { imgsz: usize, stride: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoweringOptions {
    pub opset: i64,
    pub imgsz: usize,
    pub batch: usize,
}

pub struct GraphBuilder {
    ir: ModelIR,
    taken: HashMap<String, usize>,
}

impl GraphBuilder {
    pub fn new(opset: i64) -> Self {
        let mut ir = ModelIR::new();
        ir.opset = opset;
        Self {
            ir,
            taken: HashMap::new(),
        }
    }

    pub fn opset(&self) -> i64 {
        self.ir.opset
    }

    fn unique(&mut self, base: String) -> String {
        let count = self.taken.entry(base.clone()).or_insert(0);
        *count += 1;
        if *count == 1 {
            base
        } else {
            format!("{}_{}", base, *count - 1)
        }
    }

    pub fn node(
        &mut self,
        scope: &str,
        op_type: &str,
        inputs: Vec<String>,
        num_outputs: usize,
        attributes: Vec<(&str, Attribute)>,
    ) -> Vec<String> {
        let name = self.unique(format!("{}/{}", scope, op_type));
        let outputs: Vec<String> = (0..num_outputs)
            .map(|k| format!("{}_output_{}", name, k))
            .collect();
        self.push(name, op_type, inputs, outputs.clone(), attributes);
        outputs
    }

    fn push(
        &mut self,
        name: String,
        op_type: &str,
        inputs: Vec<String>,
        outputs: Vec<String>,
        attributes: Vec<(&str, Attribute)>,
    ) {
        let mut node = Node::new(name, op_type, inputs, outputs);
        for (key, value) in attributes {
            node = node.with_attr(key, value);
        }
        self.ir.nodes.push(node);
    }

    pub fn single(
        &mut self,
        scope: &str,
        op_type: &str,
        inputs: Vec<String>,
        attributes: Vec<(&str, Attribute)>,
    ) -> String {
        let mut outputs = self.node(scope, op_type, inputs, 1, attributes);
        outputs.remove(0)
    }

    /// Emits a node whose single output has a fixed name, e.g. the graph output.
    pub fn named(
        &mut self,
        scope: &str,
        op_type: &str,
        inputs: Vec<String>,
        output: &str,
        attributes: Vec<(&str, Attribute)>,
    ) -> String {
        let name = self.unique(format!("{}/{}", scope, op_type));
        self.push(name, op_type, inputs, vec![output.to_string()], attributes);
        output.to_string()
    }

    /// Adds an initializer; a weight already registered under the same
    /// name is reused.
    pub fn weight(&mut self, tensor: &Tensor) -> String {
        if self.ir.weights.contains_key(&tensor.name) {
            return tensor.name.clone();
        }
        self.ir.add_weight(tensor.clone())
    }

    pub fn constant(&mut self, scope: &str, tensor: Tensor) -> String {
        let name = self.unique(format!("{}/{}", scope, tensor.name));
        self.ir.add_weight(tensor.renamed(name))
    }

    pub fn conv2d(&mut self, scope: &str, conv: &Conv2d, input: String) -> String {
        let mut inputs = vec![input, self.weight(&conv.weight)];
        if let Some(bias) = &conv.bias {
            inputs.push(self.weight(bias));
        }
        let [kh, kw] = conv.kernel();
        self.single(
            scope,
            "Conv",
            inputs,
            vec![
                ("dilations", Attribute::Ints(conv.dilation.iter().map(|&d| d as i64).collect())),
                ("group", Attribute::Int(conv.groups as i64)),
                ("kernel_shape", Attribute::Ints(vec![kh as i64, kw as i64])),
                (
                    "pads",
                    Attribute::Ints(vec![
                        conv.padding[0] as i64,
                        conv.padding[1] as i64,
                        conv.padding[0] as i64,
                        conv.padding[1] as i64,
                    ]),
                ),
                ("strides", Attribute::Ints(conv.stride.iter().map(|&s| s as i64).collect())),
            ],
        )
    }

    pub fn activation(&mut self, scope: &str, act: Activation, input: String) -> String {
        match act {
            Activation::Identity => input,
            Activation::Relu => self.single(scope, "Relu", vec![input], vec![]),
            Activation::Silu => {
                // opset < 14 has no SiLU; x * sigmoid(x)
                let gate = self.single(&format!("{}/act", scope), "Sigmoid", vec![input.clone()], vec![]);
                self.single(&format!("{}/act", scope), "Mul", vec![input, gate], vec![])
            }
        }
    }

    pub fn conv_block(&mut self, block: &ConvBlock, input: String) -> String {
        let scope = format!("/{}", block.path);
        let mut x = self.conv2d(&format!("/{}", block.conv.path), &block.conv, input);
        if let Some(bn) = &block.bn {
            let inputs = vec![
                x,
                self.weight(&bn.weight),
                self.weight(&bn.bias),
                self.weight(&bn.running_mean),
                self.weight(&bn.running_var),
            ];
            x = self.single(
                &format!("/{}", bn.path),
                "BatchNormalization",
                inputs,
                vec![
                    ("epsilon", Attribute::Float(bn.eps as f32)),
                    ("momentum", Attribute::Float(1.0 - bn.momentum as f32)),
                ],
            );
        }
        self.activation(&scope, block.act, x)
    }

    pub fn concat(&mut self, scope: &str, inputs: Vec<String>, axis: i64) -> String {
        self.single(scope, "Concat", inputs, vec![("axis", Attribute::Int(axis))])
    }

    /// `Split` carries its sizes as an attribute before opset 13 and as an
    /// int64 input from 13 on.
    pub fn split(&mut self, scope: &str, input: String, sizes: &[usize], axis: i64) -> Vec<String> {
        let sizes: Vec<i64> = sizes.iter().map(|&s| s as i64).collect();
        if self.opset() < 13 {
            self.node(
                scope,
                "Split",
                vec![input],
                sizes.len(),
                vec![("axis", Attribute::Int(axis)), ("split", Attribute::Ints(sizes))],
            )
        } else {
            let split = self.constant(scope, Tensor::from_i64("split", vec![sizes.len()], &sizes));
            self.node(
                scope,
                "Split",
                vec![input, split],
                sizes.len(),
                vec![("axis", Attribute::Int(axis))],
            )
        }
    }

    /// Softmax along `axis`. Before opset 13 Softmax flattens everything
    /// from `axis` on, so a non-last axis is moved to the end and back.
    pub fn softmax(&mut self, scope: &str, input: String, axis: usize, rank: usize) -> String {
        if self.opset() >= 13 || axis + 1 == rank {
            return self.single(scope, "Softmax", vec![input], vec![("axis", Attribute::Int(axis as i64))]);
        }
        let mut perm: Vec<i64> = (0..rank as i64).filter(|&d| d != axis as i64).collect();
        perm.push(axis as i64);
        let mut inverse = vec![0i64; rank];
        for (i, &p) in perm.iter().enumerate() {
            inverse[p as usize] = i as i64;
        }
        let moved = self.single(scope, "Transpose", vec![input], vec![("perm", Attribute::Ints(perm))]);
        let soft = self.single(
            scope,
            "Softmax",
            vec![moved],
            vec![("axis", Attribute::Int(rank as i64 - 1))],
        );
        self.single(scope, "Transpose", vec![soft], vec![("perm", Attribute::Ints(inverse))])
    }

    /// Nearest-neighbour upsampling by an integer factor on H and W.
    pub fn resize_nearest(&mut self, scope: &str, input: String, scale: usize) -> String {
        let scales = self.constant(
            scope,
            Tensor::from_f32("scales", vec![4], &[1.0, 1.0, scale as f32, scale as f32]),
        );
        let roi = if self.opset() < 13 {
            self.constant(scope, Tensor::from_f32("roi", vec![0], &[]))
        } else {
            String::new()
        };
        self.single(
            scope,
            "Resize",
            vec![input, roi, scales],
            vec![
                ("coordinate_transformation_mode", Attribute::String("asymmetric".to_string())),
                ("mode", Attribute::String("nearest".to_string())),
                ("nearest_mode", Attribute::String("floor".to_string())),
            ],
        )
    }

    pub fn reshape(&mut self, scope: &str, input: String, shape: &[i64]) -> String {
        let target = self.constant(scope, Tensor::from_i64("shape", vec![shape.len()], shape));
        self.single(scope, "Reshape", vec![input, target], vec![])
    }

    pub fn max_pool(&mut self, scope: &str, input: String, kernel: usize) -> String {
        let k = kernel as i64;
        let pad = k / 2;
        self.single(
            scope,
            "MaxPool",
            vec![input],
            vec![
                ("ceil_mode", Attribute::Int(0)),
                ("kernel_shape", Attribute::Ints(vec![k, k])),
                ("pads", Attribute::Ints(vec![pad, pad, pad, pad])),
                ("strides", Attribute::Ints(vec![1, 1])),
            ],
        )
    }

    pub fn finish(self) -> ModelIR {
        self.ir
    }
}

fn lower_bottleneck(b: &mut GraphBuilder, m: &Bottleneck, input: String) -> String {
    let hidden = b.conv_block(&m.cv1, input.clone());
    let out = b.conv_block(&m.cv2, hidden);
    if m.add {
        b.single(&format!("/{}", m.path), "Add", vec![input, out], vec![])
    } else {
        out
    }
}

fn lower_c2f(b: &mut GraphBuilder, c2f: &C2f, input: String) -> String {
    let scope = format!("/{}", c2f.path);
    let y = b.conv_block(&c2f.cv1, input);
    let mut ys = b.split(&scope, y, &[c2f.hidden, c2f.hidden], 1);
    for m in &c2f.m {
        let last = ys[ys.len() - 1].clone();
        ys.push(lower_bottleneck(b, m, last));
    }
    let cat = b.concat(&scope, ys, 1);
    b.conv_block(&c2f.cv2, cat)
}

fn lower_sppf(b: &mut GraphBuilder, sppf: &Sppf, input: String) -> String {
    let scope = format!("/{}/m", sppf.path);
    let mut ys = vec![b.conv_block(&sppf.cv1, input)];
    for _ in 0..3 {
        let last = ys[ys.len() - 1].clone();
        ys.push(b.max_pool(&scope, last, sppf.kernel));
    }
    let cat = b.concat(&format!("/{}", sppf.path), ys, 1);
    b.conv_block(&sppf.cv2, cat)
}

/// Ultralytics `from` indexing: -1 is the previous layer (the image for
/// layer 0), other negatives count back, non-negatives are absolute.
fn resolve_from(index: usize, from: i64, outputs: &[String]) -> Result<String, LoweringError> {
    let invalid = || LoweringError::InvalidLayer {
        layer: index,
        reason: format!("cannot read from {}", from),
    };
    if from == -1 {
        return Ok(match index {
            0 => INPUT_NAME.to_string(),
            _ => outputs[index - 1].clone(),
        });
    }
    let source = if from < 0 { index as i64 + from } else { from };
    if source < 0 || source as usize >= index {
        return Err(invalid());
    }
    outputs.get(source as usize).cloned().ok_or_else(invalid)
}

pub fn lower(model: &DetectionModel, options: &LoweringOptions) -> Result<ModelIR, LoweringError> {
    if !(MIN_OPSET..=MAX_OPSET).contains(&options.opset) {
        return Err(LoweringError::UnsupportedOpset(options.opset));
    }

    let mut b = GraphBuilder::new(options.opset);
    b.ir.inputs.push(Tensor::value(
        INPUT_NAME,
        vec![options.batch, 3, options.imgsz, options.imgsz],
        DataType::F32,
    ));

    let mut outputs: Vec<String> = Vec::with_capacity(model.layers.len());
    for layer in &model.layers {
        let inputs = layer
            .from
            .iter()
            .map(|&f| resolve_from(layer.index, f, &outputs))
            .collect::<Result<Vec<_>, _>>()?;

        let single_input = |inputs: &[String]| -> Result<String, LoweringError> {
            match inputs {
                [one] => Ok(one.clone()),
                _ => Err(LoweringError::InvalidLayer {
                    layer: layer.index,
                    reason: format!("{} takes one input, got {}", layer.module.kind(), inputs.len()),
                }),
            }
        };

        let out = match &layer.module {
            Module::Conv(block) => b.conv_block(block, single_input(&inputs)?),
            Module::C2f(c2f) => lower_c2f(&mut b, c2f, single_input(&inputs)?),
            Module::Sppf(sppf) => lower_sppf(&mut b, sppf, single_input(&inputs)?),
            Module::Upsample { scale } => {
                let scope = format!("/model.{}", layer.index);
                b.resize_nearest(&scope, single_input(&inputs)?, *scale)
            }
            Module::Concat { dim } => {
                let scope = format!("/model.{}", layer.index);
                b.concat(&scope, inputs, *dim)
            }
            Module::Detect(head) => detect::lower_detect(&mut b, head, inputs, options)?,
        };
        debug!(layer = layer.index, kind = layer.module.kind(), output = %out, "lowered layer");
        outputs.push(out);
    }

    if outputs.last().map(String::as_str) != Some(OUTPUT_NAME) {
        return Err(LoweringError::InvalidLayer {
            layer: model.layers.len().saturating_sub(1),
            reason: "model does not end in a Detect head".to_string(),
        });
    }

    let mut ir = b.finish();
    ir.outputs.push(Tensor::value(OUTPUT_NAME, Vec::new(), DataType::F32));
    Ok(ir)
}
