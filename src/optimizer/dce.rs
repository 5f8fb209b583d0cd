use crate::ir::ModelIR;
use crate::optimizer::{OptimizationPass, OptimizerError};
use std::collections::HashSet;

/// Removes nodes whose outputs nobody reads, then initializers no remaining
/// node reads.
pub struct DeadCodeElimination;

impl OptimizationPass for DeadCodeElimination {
    fn name(&self) -> &'static str {
        "dead_code_elimination"
    }

    fn apply(&self, ir: &mut ModelIR) -> Result<(), OptimizerError> {
        let mut changed = true;
        while changed {
            changed = false;
            let mut used_values = HashSet::new();

            for output in &ir.outputs {
                used_values.insert(output.name.clone());
            }

            for node in &ir.nodes {
                for input in &node.inputs {
                    used_values.insert(input.clone());
                }
            }

            let initial_len = ir.nodes.len();
            ir.nodes.retain(|node| {
                node.outputs.iter().any(|output| used_values.contains(output))
            });

            if ir.nodes.len() != initial_len {
                changed = true;
            }
        }

        let read: HashSet<&String> = ir
            .nodes
            .iter()
            .flat_map(|node| node.inputs.iter())
            .chain(ir.outputs.iter().map(|t| &t.name))
            .collect();
        let unused: Vec<String> = ir
            .weights
            .keys()
            .filter(|name| !read.contains(name))
            .cloned()
            .collect();
        for name in unused {
            ir.weights.remove(&name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{DataType, Node, Tensor};

    #[test]
    fn test_dce_removes_unused_node() {
        let mut ir = ModelIR::new();

        ir.nodes.push(Node::new(
            "unused_node",
            "Add",
            vec!["A".to_string(), "B".to_string()],
            vec!["C".to_string()],
        ));
        ir.outputs.push(Tensor::value("Other", vec![1], DataType::F32));

        DeadCodeElimination.apply(&mut ir).unwrap();

        assert_eq!(ir.nodes.len(), 0);
    }

    #[test]
    fn test_dce_removes_dead_chain_and_its_weights() {
        let mut ir = ModelIR::new();
        ir.inputs.push(Tensor::value("X", vec![1, 4], DataType::F32));
        ir.add_weight(Tensor::from_f32("kept", vec![4], &[1.0; 4]));
        ir.add_weight(Tensor::from_f32("dead", vec![4], &[1.0; 4]));
        ir.add_weight(Tensor::from_f32("orphan", vec![1], &[0.0]));

        ir.nodes.push(Node::new("mul", "Mul", vec!["X".into(), "kept".into()], vec!["Y".into()]));
        ir.nodes.push(Node::new("a", "Add", vec!["X".into(), "dead".into()], vec!["t".into()]));
        ir.nodes.push(Node::new("b", "Relu", vec!["t".into()], vec!["u".into()]));
        ir.outputs.push(Tensor::value("Y", vec![], DataType::F32));

        DeadCodeElimination.apply(&mut ir).unwrap();

        assert_eq!(ir.nodes.len(), 1);
        assert_eq!(ir.nodes[0].name, "mul");
        assert_eq!(ir.weights.keys().collect::<Vec<_>>(), vec!["kept"]);
    }
}
