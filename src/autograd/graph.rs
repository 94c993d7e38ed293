//! Computation graph for automatic differentiation

use std::collections::{hash_map::Entry, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use crate::error::{TandemError, TandemResult};
use super::function::Function;

pub type NodeId = usize;

/// A node in the computation graph
pub struct GraphNode {
    pub id: NodeId,
    pub numel: usize,
    pub is_leaf: bool,
    /// One entry per op input; `None` for inputs that do not require gradients
    pub parents: Vec<Option<NodeId>>,
    pub grad_fn: Option<Box<dyn Function>>,
}

/// Computation graph managing the backward pass.
///
/// Node ids are handed out in creation order and an op node is always created
/// after its parents, so descending id order is a valid reverse topological
/// order.
#[derive(Default)]
pub struct ComputationGraph {
    nodes: Vec<GraphNode>,
    gradients: HashMap<NodeId, Vec<f32>>,
    generation: u64,
}

impl ComputationGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a leaf node (variable)
    pub fn create_leaf_node(&mut self, numel: usize) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(GraphNode {
            id,
            numel,
            is_leaf: true,
            parents: Vec::new(),
            grad_fn: None,
        });
        id
    }

    /// Create an operation node
    pub fn create_op_node(
        &mut self,
        numel: usize,
        parents: Vec<Option<NodeId>>,
        grad_fn: Box<dyn Function>,
    ) -> NodeId {
        let id = self.nodes.len();
        tracing::trace!(id, op = grad_fn.name(), "recording op node");
        self.nodes.push(GraphNode {
            id,
            numel,
            is_leaf: false,
            parents,
            grad_fn: Some(grad_fn),
        });
        id
    }

    /// Backpropagate from a scalar root, accumulating into leaf gradients
    pub fn backward(&mut self, root_id: NodeId) -> TandemResult<()> {
        let root = self.nodes.get(root_id).ok_or_else(|| {
            TandemError::InvalidState(format!("node {} is not part of this graph", root_id))
        })?;
        if root.numel != 1 {
            return Err(TandemError::InvalidInput(format!(
                "backward requires a scalar root, node {} has {} elements",
                root_id, root.numel
            )));
        }

        let mut pending: HashMap<NodeId, Vec<f32>> = HashMap::new();
        pending.insert(root_id, vec![1.0]);

        for id in (0..=root_id).rev() {
            let grad = match pending.remove(&id) {
                Some(grad) => grad,
                None => continue,
            };
            let node = &self.nodes[id];

            if node.is_leaf {
                let slot = self.gradients.entry(id).or_insert_with(|| vec![0.0; node.numel]);
                accumulate(slot, &grad);
                continue;
            }

            let grad_fn = node.grad_fn.as_ref().ok_or_else(|| {
                TandemError::InvalidState(
                    "computation graph was released by a previous backward pass; build the engine with retain_graph() to backpropagate twice".to_string(),
                )
            })?;
            let input_grads = grad_fn.backward(&grad)?;
            if input_grads.len() != node.parents.len() {
                return Err(TandemError::InvalidState(format!(
                    "{} returned {} gradients for {} inputs",
                    grad_fn.name(),
                    input_grads.len(),
                    node.parents.len()
                )));
            }

            for (parent, input_grad) in node.parents.iter().zip(input_grads) {
                let Some(parent) = *parent else { continue };
                match pending.entry(parent) {
                    Entry::Occupied(mut slot) => accumulate(slot.get_mut(), &input_grad),
                    Entry::Vacant(slot) => {
                        slot.insert(input_grad);
                    }
                }
            }
        }

        tracing::trace!(nodes = self.nodes.len(), leaves = self.gradients.len(), "backward pass complete");
        Ok(())
    }

    /// Drop the saved tensors of every op node; leaf gradients survive
    pub fn release(&mut self) {
        for node in self.nodes.iter_mut().filter(|n| !n.is_leaf) {
            node.grad_fn = None;
        }
    }

    /// Get gradient for a leaf node
    pub fn gradient(&self, node_id: NodeId) -> Option<&[f32]> {
        self.gradients.get(&node_id).map(|g| g.as_slice())
    }

    /// Zero all gradients
    pub fn zero_gradients(&mut self) {
        self.gradients.clear();
    }

    /// Clear the computation graph; variables recorded before are invalidated
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.gradients.clear();
        self.generation += 1;
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Get number of nodes in graph
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }
}

impl fmt::Debug for ComputationGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputationGraph")
            .field("nodes", &self.nodes.len())
            .field("gradients", &self.gradients.len())
            .field("generation", &self.generation)
            .finish()
    }
}

fn accumulate(into: &mut [f32], grad: &[f32]) {
    for (acc, g) in into.iter_mut().zip(grad) {
        *acc += g;
    }
}

/// Shared handle to a graph; variables recorded on it keep it alive
#[derive(Clone, Default, Debug)]
pub struct GraphHandle(Arc<Mutex<ComputationGraph>>);

impl GraphHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, ComputationGraph> {
        self.0.lock()
    }

    pub fn same_graph(&self, other: &GraphHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Location of a variable inside a graph
#[derive(Clone, Debug)]
pub struct TapeRef {
    pub graph: GraphHandle,
    pub id: NodeId,
    pub generation: u64,
}
