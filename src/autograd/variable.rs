//! Variable wrapper for tensors in the computation graph

use std::fmt;

use crate::{
    error::{TandemError, TandemResult},
    tensor::{Device, Shape, Tensor},
};
use super::function::Function;
use super::graph::{NodeId, TapeRef};

/// A tensor that may participate in automatic differentiation.
///
/// A variable either carries a [`TapeRef`] into a computation graph (it
/// requires gradients) or is a constant. Ops on constants only are never
/// recorded.
#[derive(Clone)]
pub struct Variable<const DIMS: usize> {
    tensor: Tensor<DIMS>,
    tape: Option<TapeRef>,
}

impl<const DIMS: usize> Variable<DIMS> {
    /// Create a constant variable that never receives gradients
    pub fn from_tensor(tensor: Tensor<DIMS>) -> Self {
        Self { tensor, tape: None }
    }

    pub(crate) fn tracked(tensor: Tensor<DIMS>, tape: TapeRef) -> Self {
        Self { tensor, tape: Some(tape) }
    }

    /// Create a constant variable from raw data
    pub fn from_vec(data: Vec<f32>, shape: Shape<DIMS>) -> TandemResult<Self> {
        Ok(Self::from_tensor(Tensor::from_vec(data, shape)?))
    }

    /// Get reference to underlying tensor
    pub fn tensor(&self) -> &Tensor<DIMS> {
        &self.tensor
    }

    pub(crate) fn tape(&self) -> Option<&TapeRef> {
        self.tape.as_ref()
    }

    /// Get node ID in computation graph
    pub fn node_id(&self) -> Option<NodeId> {
        self.tape.as_ref().map(|t| t.id)
    }

    /// Check if variable requires gradients
    pub fn requires_grad(&self) -> bool {
        self.tape.is_some()
    }

    /// Detach variable from computation graph
    pub fn detach(&self) -> Self {
        Self::from_tensor(self.tensor.clone())
    }

    pub fn shape(&self) -> Shape<DIMS> {
        self.tensor.shape()
    }

    pub fn device(&self) -> Device {
        self.tensor.device()
    }

    pub fn numel(&self) -> usize {
        self.tensor.numel()
    }

    pub fn as_slice(&self) -> &[f32] {
        self.tensor.as_slice()
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.tensor.to_vec()
    }

    pub fn is_finite(&self) -> bool {
        self.tensor.is_finite()
    }
}

impl Variable<0> {
    /// Detached scalar value
    pub fn item(&self) -> f32 {
        self.tensor.item()
    }
}

impl<const DIMS: usize> fmt::Debug for Variable<DIMS> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Variable")
            .field("shape", &self.shape())
            .field("device", &self.device())
            .field("node_id", &self.node_id())
            .field("data", &self.as_slice())
            .finish()
    }
}

/// Wrap `output` as the result of an op over `inputs`.
///
/// The op is recorded only if at least one input is tracked; all tracked
/// inputs must come from the same, still-current graph.
pub(crate) fn record<const OUT: usize, F>(
    output: Tensor<OUT>,
    inputs: &[Option<&TapeRef>],
    grad_fn: F,
) -> TandemResult<Variable<OUT>>
where
    F: Function + 'static,
{
    let first = match inputs.iter().flatten().next() {
        Some(tape) => *tape,
        None => return Ok(Variable::from_tensor(output)),
    };

    if inputs.iter().flatten().any(|tape| !tape.graph.same_graph(&first.graph)) {
        return Err(TandemError::InvalidInput(format!(
            "{} received variables from different computation graphs",
            grad_fn.name()
        )));
    }

    let mut graph = first.graph.lock();
    let generation = graph.generation();
    if inputs.iter().flatten().any(|tape| tape.generation != generation) {
        return Err(TandemError::InvalidState(format!(
            "{} received a variable from a cleared computation graph",
            grad_fn.name()
        )));
    }

    let parents = inputs.iter().map(|tape| tape.as_ref().map(|t| t.id)).collect();
    let id = graph.create_op_node(output.numel(), parents, Box::new(grad_fn));
    drop(graph);

    Ok(Variable::tracked(output, TapeRef {
        graph: first.graph.clone(),
        id,
        generation,
    }))
}
