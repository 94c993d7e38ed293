//! Classification loss functions with automatic differentiation

use crate::{
    autograd::Variable,
    error::{TandemError, TandemResult},
    tensor::Shape,
};
use super::{apply_reduction, Reduction};

/// Cross-entropy over rows of logits with integer class targets
#[derive(Debug, Clone, Copy, Default)]
pub struct CrossEntropyLoss {
    reduction: Reduction,
}

impl CrossEntropyLoss {
    pub fn new(reduction: Reduction) -> Self {
        Self { reduction }
    }

    /// `-log_softmax(logits)[i, targets[i]]` for every row
    pub fn per_sample(&self, logits: &Variable<2>, targets: &[usize]) -> TandemResult<Variable<1>> {
        let [rows, cols] = logits.shape().dims;
        if targets.len() != rows {
            return Err(TandemError::shape_error(
                &format!("{} targets", rows),
                &format!("{} targets", targets.len()),
                Some("provide one class index per row of logits"),
            ));
        }
        if let Some(&bad) = targets.iter().find(|&&t| t >= cols) {
            return Err(TandemError::InvalidInput(format!(
                "target class {} out of range for {} classes",
                bad, cols
            )));
        }

        let picked: Vec<usize> = targets.iter()
            .enumerate()
            .map(|(row, &target)| row * cols + target)
            .collect();
        logits.log_softmax()?
            .gather(&picked, Shape::new([rows]))?
            .neg()
    }

    pub fn forward(&self, logits: &Variable<2>, targets: &[usize]) -> TandemResult<Variable<0>> {
        apply_reduction(&self.per_sample(logits, targets)?, self.reduction)
    }

    pub fn name(&self) -> &'static str {
        "CrossEntropyLoss"
    }

    pub fn reduction(&self) -> Reduction {
        self.reduction
    }
}
