//! Regression loss functions

use crate::{autograd::Variable, error::TandemResult};
use super::{apply_reduction, utils::check_pair, Loss, Reduction};

/// Mean Squared Error Loss
#[derive(Debug, Clone, Copy, Default)]
pub struct MSELoss {
    reduction: Reduction,
}

impl MSELoss {
    pub fn new(reduction: Reduction) -> Self {
        Self { reduction }
    }
}

impl Loss for MSELoss {
    fn forward(&self, predictions: &Variable<2>, targets: &Variable<2>) -> TandemResult<Variable<0>> {
        check_pair(predictions, targets, predictions.device(), self.name())?;
        let diff = predictions.sub(targets)?;
        apply_reduction(&diff.square()?, self.reduction)
    }

    fn name(&self) -> &'static str { "MSELoss" }
    fn reduction(&self) -> Reduction { self.reduction }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TandemError;
    use crate::tensor::{Device, Shape, Tensor};

    #[test]
    fn test_mse_reductions() {
        let a = Variable::from_vec(vec![1.0, 2.0, 3.0, 4.0], Shape::new([2, 2])).unwrap();
        let b = Variable::from_vec(vec![1.0, 0.0, 3.0, 0.0], Shape::new([2, 2])).unwrap();
        assert_eq!(MSELoss::new(Reduction::Mean).forward(&a, &b).unwrap().item(), 5.0);
        assert_eq!(MSELoss::new(Reduction::Sum).forward(&a, &b).unwrap().item(), 20.0);
        assert!(MSELoss::new(Reduction::None).forward(&a, &b).is_err());
    }

    #[test]
    fn test_mse_rejects_mismatch() {
        let a = Variable::from_vec(vec![1.0, 2.0], Shape::new([1, 2])).unwrap();
        let b = Variable::from_vec(vec![1.0, 2.0], Shape::new([2, 1])).unwrap();
        assert!(matches!(MSELoss::default().forward(&a, &b), Err(TandemError::ShapeError(_))));

        let c = Variable::from_tensor(Tensor::from_rows(&[vec![1.0, 2.0]]).unwrap().to_device(Device::Cuda(0)));
        assert!(matches!(MSELoss::default().forward(&a, &c), Err(TandemError::DeviceError(_))));
    }
}
