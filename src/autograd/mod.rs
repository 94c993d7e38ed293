//! Automatic differentiation system with computation graph
//!
//! This module implements reverse-mode automatic differentiation (backpropagation)
//! over a dynamic computation graph. Every loss is built from the ops in
//! [`ops`], so gradients flow back to both embedding batches.

pub mod graph;
pub mod variable;
pub mod function;
pub mod ops;

pub use graph::{ComputationGraph, GraphHandle, GraphNode, NodeId, TapeRef};
pub use variable::Variable;
pub use function::Function;

use crate::{
    error::{TandemError, TandemResult},
    tensor::Tensor,
};

/// Main autograd engine that owns a computation graph and reads gradients back
#[derive(Debug, Clone, Default)]
pub struct AutogradEngine {
    graph: GraphHandle,
    retain_graph: bool,
}

impl AutogradEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable graph retention for multiple backward passes
    pub fn retain_graph(mut self) -> Self {
        self.retain_graph = true;
        self
    }

    /// Create a variable; a leaf node is recorded only when `requires_grad` is set
    pub fn variable<const DIMS: usize>(&self, tensor: Tensor<DIMS>, requires_grad: bool) -> Variable<DIMS> {
        if !requires_grad {
            return Variable::from_tensor(tensor);
        }
        let mut graph = self.graph.lock();
        let id = graph.create_leaf_node(tensor.numel());
        let generation = graph.generation();
        drop(graph);
        Variable::tracked(tensor, TapeRef {
            graph: self.graph.clone(),
            id,
            generation,
        })
    }

    /// Run backward pass from a scalar loss
    pub fn backward(&self, loss: &Variable<0>) -> TandemResult<()> {
        let tape = self.owned_tape(loss.tape())?.ok_or_else(|| {
            TandemError::InvalidInput("loss does not depend on any variable that requires gradients".to_string())
        })?;

        let mut graph = self.graph.lock();
        graph.backward(tape.id)?;
        if !self.retain_graph {
            graph.release();
        }
        Ok(())
    }

    /// Get accumulated gradients for a variable
    pub fn gradients<const DIMS: usize>(&self, var: &Variable<DIMS>) -> Option<Tensor<DIMS>> {
        let tape = self.owned_tape(var.tape()).ok()??;
        let graph = self.graph.lock();
        let grad = graph.gradient(tape.id)?.to_vec();
        Tensor::from_vec_on(grad, var.shape(), var.device()).ok()
    }

    /// Zero all gradients in the computation graph
    pub fn zero_grad(&self) {
        self.graph.lock().zero_gradients();
    }

    /// Clear the computation graph; existing tracked variables become stale
    pub fn clear_graph(&self) {
        self.graph.lock().clear();
    }

    pub fn num_nodes(&self) -> usize {
        self.graph.lock().num_nodes()
    }

    fn owned_tape<'a>(&self, tape: Option<&'a TapeRef>) -> TandemResult<Option<&'a TapeRef>> {
        let Some(tape) = tape else { return Ok(None) };
        if !tape.graph.same_graph(&self.graph) {
            return Err(TandemError::InvalidInput(
                "variable belongs to a different autograd engine".to_string(),
            ));
        }
        if tape.generation != self.graph.lock().generation() {
            return Err(TandemError::InvalidState(
                "variable was recorded before the graph was cleared".to_string(),
            ));
        }
        Ok(Some(tape))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Shape;
    use crate::verification::GradientVerifier;

    fn vector(data: Vec<f32>) -> Tensor<1> {
        let n = data.len();
        Tensor::from_vec(data, Shape::new([n])).unwrap()
    }

    #[test]
    fn test_engine_creation() {
        let engine = AutogradEngine::new();
        assert_eq!(engine.num_nodes(), 0);
        let constant = engine.variable(vector(vec![1.0]), false);
        assert!(!constant.requires_grad());
        assert_eq!(engine.num_nodes(), 0);
    }

    #[test]
    fn test_simple_backward() {
        // loss = mean(x * x) => dx = 2x / n
        let engine = AutogradEngine::new();
        let x = engine.variable(vector(vec![1.0, 2.0, 3.0, 4.0]), true);
        let loss = x.square().unwrap().mean().unwrap();
        engine.backward(&loss).unwrap();
        let grad = engine.gradients(&x).unwrap();
        assert_eq!(grad.as_slice(), &[0.5, 1.0, 1.5, 2.0]);
        assert_eq!(grad.shape(), x.shape());
    }

    #[test]
    fn test_backward_requires_tracked_loss() {
        let engine = AutogradEngine::new();
        let x = engine.variable(vector(vec![1.0, 2.0]), false);
        let loss = x.sum().unwrap();
        assert!(matches!(engine.backward(&loss), Err(TandemError::InvalidInput(_))));
    }

    #[test]
    fn test_second_backward_needs_retained_graph() {
        let engine = AutogradEngine::new();
        let x = engine.variable(vector(vec![1.0, 2.0]), true);
        let loss = x.sum().unwrap();
        engine.backward(&loss).unwrap();
        assert!(matches!(engine.backward(&loss), Err(TandemError::InvalidState(_))));

        let engine = AutogradEngine::new().retain_graph();
        let x = engine.variable(vector(vec![1.0, 2.0]), true);
        let loss = x.sum().unwrap();
        engine.backward(&loss).unwrap();
        engine.backward(&loss).unwrap();
        assert_eq!(engine.gradients(&x).unwrap().as_slice(), &[2.0, 2.0]);

        engine.zero_grad();
        assert!(engine.gradients(&x).is_none());
    }

    #[test]
    fn test_variables_from_other_engines_are_rejected() {
        let first = AutogradEngine::new();
        let second = AutogradEngine::new();
        let a = first.variable(vector(vec![1.0]), true);
        let b = second.variable(vector(vec![2.0]), true);
        assert!(a.add(&b).is_err());

        let loss = a.sum().unwrap();
        assert!(second.backward(&loss).is_err());
        assert!(second.gradients(&a).is_none());
    }

    #[test]
    fn test_cleared_graph_invalidates_variables() {
        let engine = AutogradEngine::new();
        let x = engine.variable(vector(vec![1.0]), true);
        engine.clear_graph();
        assert!(matches!(x.sum(), Err(TandemError::InvalidState(_))));
    }

    #[test]
    fn test_composite_gradients_match_finite_differences() {
        let verifier = GradientVerifier::default();
        let input = Tensor::from_rows(&[
            vec![0.3, -1.2, 0.8],
            vec![1.1, 0.4, -0.5],
            vec![-0.7, 0.9, 0.2],
        ]).unwrap();

        let report = verifier.verify(&input, |x| {
            let normalized = x.l2_normalize(1e-12)?;
            let sim = normalized.matmul(&normalized.transpose()?)?;
            sim.mul_scalar(2.0)?.log_softmax()?.gather(&[1, 5, 6], Shape::new([3]))?.mean()
        }).unwrap();
        assert!(report.passed(), "{:?}", report);

        let report = verifier.verify(&input, |x| {
            let var = x.variance()?.add_scalar(1e-4)?.sqrt()?;
            let centered = x.center()?;
            let cov = centered.transpose()?.matmul(&centered)?;
            var.sum()?.add(&cov.square()?.sum()?)
        }).unwrap();
        assert!(report.passed(), "{:?}", report);
    }
}
