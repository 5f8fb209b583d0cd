use crate::ir::ModelIR;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum OptimizerError {
    #[error("Optimization error: {0}")]
    Error(String),
    #[error("Initializer {0} is missing or not float32")]
    MissingWeight(String),
}

pub trait OptimizationPass {
    fn name(&self) -> &'static str;
    fn apply(&self, ir: &mut ModelIR) -> Result<(), OptimizerError>;
}

pub mod dce;
pub mod fusion;

pub struct Optimizer {
    passes: Vec<Box<dyn OptimizationPass>>,
}

impl Optimizer {
    pub fn new() -> Self {
        Self { passes: Vec::new() }
    }

    /// Conv/BatchNorm folding followed by dead-code elimination, which also
    /// drops the batch norm statistics left without readers.
    pub fn standard() -> Self {
        let mut optimizer = Self::new();
        optimizer.add_pass(Box::new(fusion::ConvBatchNormFusion));
        optimizer.add_pass(Box::new(dce::DeadCodeElimination));
        optimizer
    }

    pub fn add_pass(&mut self, pass: Box<dyn OptimizationPass>) {
        self.passes.push(pass);
    }

    pub fn optimize(&self, ir: &mut ModelIR) -> Result<(), OptimizerError> {
        for pass in &self.passes {
            let (nodes, weights) = (ir.nodes.len(), ir.weights.len());
            pass.apply(ir)?;
            debug!(
                pass = pass.name(),
                nodes_before = nodes,
                nodes_after = ir.nodes.len(),
                weights_before = weights,
                weights_after = ir.weights.len(),
                "applied optimization pass"
            );
        }
        Ok(())
    }
}

impl Default for Optimizer {
    fn default() -> Self {
        Self::new()
    }
}
