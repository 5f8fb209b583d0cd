use crate::ir::{ModelIR, Tensor};
use crate::optimizer::{OptimizationPass, OptimizerError};

/// Folds an inference-mode `BatchNormalization` into the `Conv` feeding it:
/// `w' = w * g / sqrt(v + eps)` and `b' = beta + (b - m) * g / sqrt(v + eps)`.
pub struct ConvBatchNormFusion;

fn weight(ir: &ModelIR, name: &str) -> Result<Vec<f32>, OptimizerError> {
    ir.weights
        .get(name)
        .and_then(Tensor::to_f32_vec)
        .ok_or_else(|| OptimizerError::MissingWeight(name.to_string()))
}

impl ConvBatchNormFusion {
    /// Index of the BatchNormalization that is the only reader of the conv at
    /// `conv_idx`, if the pair can be folded.
    fn fusable_bn(ir: &ModelIR, conv_idx: usize) -> Option<usize> {
        let conv = &ir.nodes[conv_idx];
        let conv_output = conv.outputs.first()?;
        if ir.is_graph_output(conv_output) || ir.consumers(conv_output).count() != 1 {
            return None;
        }
        // weight and bias get rewritten in place, so they must not be shared
        let owned = conv.inputs[1..]
            .iter()
            .all(|w| ir.weights.contains_key(w) && ir.consumers(w).count() == 1);
        if !owned {
            return None;
        }
        ir.nodes.iter().position(|n| {
            n.op_type == "BatchNormalization"
                && n.inputs.len() == 5
                && n.inputs[0] == *conv_output
                && n.inputs[1..].iter().all(|p| ir.weights.contains_key(p))
        })
    }

    fn fold(ir: &mut ModelIR, conv_idx: usize, bn_idx: usize) -> Result<(), OptimizerError> {
        let bn = ir.nodes[bn_idx].clone();
        let conv = ir.nodes[conv_idx].clone();
        let eps = bn.float_attr("epsilon").unwrap_or(1e-5);

        let gamma = weight(ir, &bn.inputs[1])?;
        let beta = weight(ir, &bn.inputs[2])?;
        let mean = weight(ir, &bn.inputs[3])?;
        let var = weight(ir, &bn.inputs[4])?;

        let weight_name = conv.inputs[1].clone();
        let kernel = ir
            .weights
            .get(&weight_name)
            .cloned()
            .ok_or_else(|| OptimizerError::MissingWeight(weight_name.clone()))?;
        let mut values = weight(ir, &weight_name)?;
        let out_channels = kernel.shape.first().copied().unwrap_or(0);
        if out_channels == 0
            || values.len() % out_channels != 0
            || [&gamma, &beta, &mean, &var].iter().any(|p| p.len() != out_channels)
        {
            return Err(OptimizerError::Error(format!(
                "{} and {} disagree on channel count",
                conv.name, bn.name
            )));
        }

        let scale: Vec<f32> = gamma
            .iter()
            .zip(&var)
            .map(|(g, v)| g / (v + eps).sqrt())
            .collect();

        let per_channel = values.len() / out_channels;
        for (c, chunk) in values.chunks_mut(per_channel).enumerate() {
            chunk.iter_mut().for_each(|w| *w *= scale[c]);
        }

        let (bias_name, bias) = match conv.inputs.get(2) {
            Some(name) => (name.clone(), weight(ir, name)?),
            None => {
                let base = weight_name.strip_suffix(".weight").unwrap_or(&weight_name);
                let mut name = format!("{}.bias", base);
                while ir.weights.contains_key(&name) {
                    name.push_str("_fused");
                }
                (name, vec![0.0; out_channels])
            }
        };
        let folded_bias: Vec<f32> = (0..out_channels)
            .map(|c| beta[c] + (bias[c] - mean[c]) * scale[c])
            .collect();

        ir.add_weight(Tensor::from_f32(weight_name, kernel.shape.clone(), &values));
        ir.add_weight(Tensor::from_f32(bias_name.clone(), vec![out_channels], &folded_bias));

        let fused = &mut ir.nodes[conv_idx];
        if fused.inputs.len() < 3 {
            fused.inputs.push(bias_name);
        }
        fused.outputs[0] = bn.outputs[0].clone();
        ir.nodes.remove(bn_idx);
        Ok(())
    }
}

impl OptimizationPass for ConvBatchNormFusion {
    fn name(&self) -> &'static str {
        "conv_bn_fusion"
    }

    fn apply(&self, ir: &mut ModelIR) -> Result<(), OptimizerError> {
        let mut i = 0;
        while i < ir.nodes.len() {
            if ir.nodes[i].op_type == "Conv" && ir.nodes[i].inputs.len() >= 2 {
                if let Some(bn_idx) = Self::fusable_bn(ir, i) {
                    Self::fold(ir, i, bn_idx)?;
                    // the BN always follows its conv, so `i` still points at the conv
                    continue;
                }
            }
            i += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{Attribute, DataType, Node};

    fn conv_bn_graph(with_bias: bool) -> ModelIR {
        let mut ir = ModelIR::new();
        ir.inputs.push(Tensor::value("X", vec![1, 1, 2, 2], DataType::F32));
        ir.add_weight(Tensor::from_f32("conv.weight", vec![2, 1, 1, 1], &[1.0, 2.0]));
        let mut conv_inputs = vec!["X".to_string(), "conv.weight".to_string()];
        if with_bias {
            ir.add_weight(Tensor::from_f32("conv.bias", vec![2], &[1.0, -1.0]));
            conv_inputs.push("conv.bias".to_string());
        }
        ir.add_weight(Tensor::from_f32("bn.weight", vec![2], &[2.0, 0.5]));
        ir.add_weight(Tensor::from_f32("bn.bias", vec![2], &[0.5, 0.0]));
        ir.add_weight(Tensor::from_f32("bn.running_mean", vec![2], &[1.0, 2.0]));
        ir.add_weight(Tensor::from_f32("bn.running_var", vec![2], &[4.0, 1.0]));

        ir.nodes.push(Node::new("conv", "Conv", conv_inputs, vec!["conv_out".to_string()]));
        ir.nodes.push(
            Node::new(
                "bn",
                "BatchNormalization",
                vec![
                    "conv_out".to_string(),
                    "bn.weight".to_string(),
                    "bn.bias".to_string(),
                    "bn.running_mean".to_string(),
                    "bn.running_var".to_string(),
                ],
                vec!["Y".to_string()],
            )
            .with_attr("epsilon", Attribute::Float(0.0)),
        );
        ir.outputs.push(Tensor::value("Y", vec![], DataType::F32));
        ir
    }

    #[test]
    fn test_fuse_conv_bn() {
        let mut ir = conv_bn_graph(false);
        ConvBatchNormFusion.apply(&mut ir).unwrap();

        assert_eq!(ir.nodes.len(), 1);
        assert_eq!(ir.nodes[0].op_type, "Conv");
        assert_eq!(ir.nodes[0].outputs[0], "Y");
        assert_eq!(ir.nodes[0].inputs[2], "conv.bias");

        // scale = g / sqrt(v) = [1.0, 0.5]
        assert_eq!(ir.weights["conv.weight"].to_f32_vec().unwrap(), vec![1.0, 1.0]);
        // beta - m * scale
        assert_eq!(ir.weights["conv.bias"].to_f32_vec().unwrap(), vec![-0.5, -1.0]);
    }

    #[test]
    fn test_fuse_conv_bn_with_existing_bias() {
        let mut ir = conv_bn_graph(true);
        ConvBatchNormFusion.apply(&mut ir).unwrap();

        assert_eq!(ir.nodes.len(), 1);
        assert_eq!(ir.nodes[0].inputs.len(), 3);
        // beta + (b - m) * scale
        assert_eq!(ir.weights["conv.bias"].to_f32_vec().unwrap(), vec![0.5, -1.5]);
    }

    #[test]
    fn test_conv_with_second_reader_is_kept() {
        let mut ir = conv_bn_graph(false);
        ir.nodes.push(Node::new("relu", "Relu", vec!["conv_out".to_string()], vec!["Z".to_string()]));
        ir.outputs.push(Tensor::value("Z", vec![], DataType::F32));

        ConvBatchNormFusion.apply(&mut ir).unwrap();
        assert_eq!(ir.nodes.len(), 3);
        assert_eq!(ir.weights["conv.weight"].to_f32_vec().unwrap(), vec![1.0, 2.0]);
    }
}
