//! Differentiable operations on variables

use crate::{
    error::{TandemError, TandemResult},
    tensor::{ops as kernels, Shape, Tensor},
};
use super::{
    function::*,
    variable::{record, Variable},
};

impl<const DIMS: usize> Variable<DIMS> {
    fn check_same_shape(&self, other: &Self, operation: &str) -> TandemResult<()> {
        if self.shape() != other.shape() {
            return Err(TandemError::shape_error(
                &self.shape().to_string(),
                &other.shape().to_string(),
                Some(&format!("{} requires operands of identical shape", operation)),
            ));
        }
        self.device().ensure_same(&other.device(), operation)
    }

    fn zip_map(&self, other: &Self, f: impl Fn(f32, f32) -> f32) -> TandemResult<Tensor<DIMS>> {
        let data = self.as_slice().iter().zip(other.as_slice()).map(|(&a, &b)| f(a, b)).collect();
        Tensor::from_vec_on(data, self.shape(), self.device())
    }

    /// Element-wise addition
    pub fn add(&self, other: &Self) -> TandemResult<Self> {
        self.check_same_shape(other, "add")?;
        let output = self.zip_map(other, |a, b| a + b)?;
        record(output, &[self.tape(), other.tape()], AddBackward)
    }

    /// Element-wise subtraction
    pub fn sub(&self, other: &Self) -> TandemResult<Self> {
        self.check_same_shape(other, "sub")?;
        let output = self.zip_map(other, |a, b| a - b)?;
        record(output, &[self.tape(), other.tape()], SubBackward)
    }

    /// Element-wise multiplication
    pub fn mul(&self, other: &Self) -> TandemResult<Self> {
        self.check_same_shape(other, "mul")?;
        let output = self.zip_map(other, |a, b| a * b)?;
        let grad_fn = MulBackward {
            lhs: self.tensor().clone(),
            rhs: other.tensor().clone(),
        };
        record(output, &[self.tape(), other.tape()], grad_fn)
    }

    pub fn square(&self) -> TandemResult<Self> {
        self.mul(self)
    }

    pub fn mul_scalar(&self, factor: f32) -> TandemResult<Self> {
        let output = self.tensor().map(|v| v * factor);
        record(output, &[self.tape()], ScaleBackward { factor })
    }

    pub fn add_scalar(&self, value: f32) -> TandemResult<Self> {
        let output = self.tensor().map(|v| v + value);
        record(output, &[self.tape()], PassThroughBackward)
    }

    pub fn neg(&self) -> TandemResult<Self> {
        self.mul_scalar(-1.0)
    }

    pub fn relu(&self) -> TandemResult<Self> {
        let output = self.tensor().map(|v| v.max(0.0));
        record(output, &[self.tape()], ReluBackward { input: self.tensor().clone() })
    }

    pub fn sqrt(&self) -> TandemResult<Self> {
        let output = self.tensor().map(f32::sqrt);
        let grad_fn = SqrtBackward { output: output.clone() };
        record(output, &[self.tape()], grad_fn)
    }

    /// Sum of all elements
    pub fn sum(&self) -> TandemResult<Variable<0>> {
        let total: f32 = self.as_slice().iter().sum();
        let output = Tensor::from_vec_on(vec![total], Shape::new([]), self.device())?;
        record(output, &[self.tape()], SumBackward { numel: self.numel() })
    }

    /// Mean of all elements
    pub fn mean(&self) -> TandemResult<Variable<0>> {
        let total: f32 = self.as_slice().iter().sum();
        let output = Tensor::from_vec_on(vec![total / self.numel() as f32], Shape::new([]), self.device())?;
        record(output, &[self.tape()], MeanBackward { numel: self.numel() })
    }

    pub fn reshape<const NEW_DIMS: usize>(&self, shape: Shape<NEW_DIMS>) -> TandemResult<Variable<NEW_DIMS>> {
        let output = self.tensor().reshape(shape)?;
        record(output, &[self.tape()], PassThroughBackward)
    }

    /// Pick elements by flat row-major index into a tensor of the given shape
    pub fn gather<const NEW_DIMS: usize>(
        &self,
        indices: &[usize],
        shape: Shape<NEW_DIMS>,
    ) -> TandemResult<Variable<NEW_DIMS>> {
        if indices.len() != shape.total_elements() {
            return Err(TandemError::shape_error(
                &format!("{} indices for shape {}", shape.total_elements(), shape),
                &format!("{} indices", indices.len()),
                None,
            ));
        }
        let numel = self.numel();
        if let Some(&bad) = indices.iter().find(|&&i| i >= numel) {
            return Err(TandemError::InvalidInput(format!(
                "gather index {} out of bounds for {} elements",
                bad, numel
            )));
        }

        let source = self.as_slice();
        let data = indices.iter().map(|&i| source[i]).collect();
        let output = Tensor::from_vec_on(data, shape, self.device())?;
        let grad_fn = GatherBackward {
            indices: indices.to_vec(),
            input_numel: numel,
        };
        record(output, &[self.tape()], grad_fn)
    }
}

impl Variable<2> {
    /// Matrix multiplication
    pub fn matmul(&self, other: &Self) -> TandemResult<Self> {
        let output = self.tensor().matmul(other.tensor())?;
        let grad_fn = MatMulBackward {
            lhs: self.tensor().clone(),
            rhs: other.tensor().clone(),
        };
        record(output, &[self.tape(), other.tape()], grad_fn)
    }

    pub fn transpose(&self) -> TandemResult<Self> {
        let [rows, cols] = self.shape().dims;
        record(self.tensor().transpose(), &[self.tape()], TransposeBackward { rows, cols })
    }

    /// Concatenate matrices along rows (`axis == 0`) or columns (`axis == 1`)
    pub fn cat(parts: &[&Variable<2>], axis: usize) -> TandemResult<Variable<2>> {
        let first = parts.first().ok_or_else(|| {
            TandemError::InvalidInput("cat requires at least one variable".to_string())
        })?;
        if axis > 1 {
            return Err(TandemError::InvalidInput(format!("cat axis {} out of range for a matrix", axis)));
        }

        let kept = 1 - axis;
        for part in parts.iter().skip(1) {
            if part.shape().dims[kept] != first.shape().dims[kept] {
                return Err(TandemError::shape_error(
                    &first.shape().to_string(),
                    &part.shape().to_string(),
                    Some(&format!("cat along axis {} requires matching dimension {}", axis, kept)),
                ));
            }
            first.device().ensure_same(&part.device(), "cat")?;
        }

        let shapes: Vec<[usize; 2]> = parts.iter().map(|p| p.shape().dims).collect();
        let (rows, cols) = if axis == 0 {
            (shapes.iter().map(|s| s[0]).sum(), first.shape().cols())
        } else {
            (first.shape().rows(), shapes.iter().map(|s| s[1]).sum())
        };

        let mut data = Vec::with_capacity(rows * cols);
        if axis == 0 {
            for part in parts {
                data.extend_from_slice(part.as_slice());
            }
        } else {
            for r in 0..rows {
                for part in parts {
                    data.extend_from_slice(part.tensor().row(r));
                }
            }
        }

        let output = Tensor::from_vec_on(data, Shape::new([rows, cols]), first.device())?;
        let tapes: Vec<_> = parts.iter().map(|p| p.tape()).collect();
        record(output, &tapes, ConcatBackward { axis, parts: shapes })
    }

    /// Row-wise log-softmax
    pub fn log_softmax(&self) -> TandemResult<Self> {
        let [rows, cols] = self.shape().dims;
        let data = kernels::log_softmax_rows(self.as_slice(), rows, cols);
        let output = Tensor::from_vec_on(data, self.shape(), self.device())?;
        let grad_fn = LogSoftmaxBackward { output: output.clone() };
        record(output, &[self.tape()], grad_fn)
    }

    /// Row-wise `x / max(‖x‖₂, eps)`
    pub fn l2_normalize(&self, eps: f32) -> TandemResult<Self> {
        let [rows, cols] = self.shape().dims;
        let norms = kernels::row_norms(self.as_slice(), rows, cols);
        let mut data = self.to_vec();
        if cols > 0 {
            for (row, &norm) in data.chunks_mut(cols).zip(&norms) {
                let denom = norm.max(eps);
                for v in row {
                    *v /= denom;
                }
            }
        }
        let output = Tensor::from_vec_on(data, self.shape(), self.device())?;
        let grad_fn = NormalizeBackward {
            input: self.tensor().clone(),
            norms,
            eps,
        };
        record(output, &[self.tape()], grad_fn)
    }

    /// Subtract the per-column mean
    pub fn center(&self) -> TandemResult<Self> {
        let [rows, cols] = self.shape().dims;
        let means = kernels::column_means(self.as_slice(), rows, cols);
        let mut data = self.to_vec();
        if cols > 0 {
            for row in data.chunks_mut(cols) {
                for (v, m) in row.iter_mut().zip(&means) {
                    *v -= m;
                }
            }
        }
        let output = Tensor::from_vec_on(data, self.shape(), self.device())?;
        record(output, &[self.tape()], CenterBackward { rows, cols })
    }

    /// Unbiased (n - 1) variance of every column
    pub fn variance(&self) -> TandemResult<Variable<1>> {
        let [rows, cols] = self.shape().dims;
        let means = kernels::column_means(self.as_slice(), rows, cols);
        let mut centered = self.to_vec();
        let mut variances = vec![0.0f32; cols];
        if cols > 0 {
            for row in centered.chunks_mut(cols) {
                for ((v, m), var) in row.iter_mut().zip(&means).zip(variances.iter_mut()) {
                    *v -= m;
                    *var += *v * *v;
                }
            }
        }
        let denom = rows as f32 - 1.0;
        for var in &mut variances {
            *var /= denom;
        }

        let output = Tensor::from_vec_on(variances, Shape::new([cols]), self.device())?;
        record(output, &[self.tape()], VarianceBackward { centered, rows, cols })
    }

    /// Sum over the feature axis, one value per row
    pub fn row_sum(&self) -> TandemResult<Variable<1>> {
        let [rows, cols] = self.shape().dims;
        let data: Vec<f32> = if cols == 0 {
            vec![0.0; rows]
        } else {
            self.as_slice().chunks(cols).map(|row| row.iter().sum::<f32>()).collect()
        };
        let output = Tensor::from_vec_on(data, Shape::new([rows]), self.device())?;
        record(output, &[self.tape()], RowSumBackward { rows, cols })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autograd::AutogradEngine;

    fn matrix(rows: &[Vec<f32>]) -> Tensor<2> {
        Tensor::from_rows(rows).unwrap()
    }

    #[test]
    fn test_elementwise_ops() {
        let a = Variable::from_vec(vec![1.0, -2.0, 3.0], Shape::new([3])).unwrap();
        let b = Variable::from_vec(vec![2.0, 2.0, 2.0], Shape::new([3])).unwrap();
        assert_eq!(a.add(&b).unwrap().as_slice(), &[3.0, 0.0, 5.0]);
        assert_eq!(a.sub(&b).unwrap().as_slice(), &[-1.0, -4.0, 1.0]);
        assert_eq!(a.mul(&b).unwrap().as_slice(), &[2.0, -4.0, 6.0]);
        assert_eq!(a.relu().unwrap().as_slice(), &[1.0, 0.0, 3.0]);
        assert_eq!(a.neg().unwrap().as_slice(), &[-1.0, 2.0, -3.0]);
        assert_eq!(b.add_scalar(1.0).unwrap().sqrt().unwrap().as_slice()[0], 3.0f32.sqrt());

        let c = Variable::from_vec(vec![1.0, 2.0], Shape::new([2])).unwrap();
        assert!(matches!(a.add(&c), Err(TandemError::ShapeError(_))));
    }

    #[test]
    fn test_reductions() {
        let a = Variable::from_vec(vec![1.0, 2.0, 3.0, 6.0], Shape::new([2, 2])).unwrap();
        assert_eq!(a.sum().unwrap().item(), 12.0);
        assert_eq!(a.mean().unwrap().item(), 3.0);
        assert_eq!(a.row_sum().unwrap().as_slice(), &[3.0, 9.0]);
    }

    #[test]
    fn test_gather_validates_indices() {
        let a = Variable::from_vec(vec![1.0, 2.0, 3.0, 4.0], Shape::new([2, 2])).unwrap();
        let picked = a.gather(&[3, 0], Shape::new([2, 1])).unwrap();
        assert_eq!(picked.as_slice(), &[4.0, 1.0]);
        assert!(a.gather(&[4], Shape::new([1])).is_err());
        assert!(a.gather(&[0, 1], Shape::new([1])).is_err());
    }

    #[test]
    fn test_cat_axes() {
        let a = Variable::from_tensor(matrix(&[vec![1.0, 2.0]]));
        let b = Variable::from_tensor(matrix(&[vec![3.0, 4.0], vec![5.0, 6.0]]));
        let rows = Variable::cat(&[&a, &b], 0).unwrap();
        assert_eq!(rows.shape().dims, [3, 2]);
        assert_eq!(rows.as_slice(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

        let c = Variable::from_tensor(matrix(&[vec![7.0], vec![8.0]]));
        let cols = Variable::cat(&[&b, &c], 1).unwrap();
        assert_eq!(cols.shape().dims, [2, 3]);
        assert_eq!(cols.as_slice(), &[3.0, 4.0, 7.0, 5.0, 6.0, 8.0]);

        assert!(Variable::cat(&[&a, &c], 0).is_err());
        assert!(Variable::cat(&[&a, &b], 2).is_err());
        assert!(Variable::cat(&[], 0).is_err());
    }

    #[test]
    fn test_l2_normalize_zero_row() {
        let a = Variable::from_tensor(matrix(&[vec![3.0, 4.0], vec![0.0, 0.0]]));
        let normalized = a.l2_normalize(1e-12).unwrap();
        assert_eq!(normalized.as_slice(), &[0.6, 0.8, 0.0, 0.0]);
    }

    #[test]
    fn test_center_and_variance() {
        let a = Variable::from_tensor(matrix(&[vec![1.0, 10.0], vec![3.0, 10.0], vec![5.0, 10.0]]));
        let centered = a.center().unwrap();
        assert_eq!(centered.as_slice(), &[-2.0, 0.0, 0.0, 0.0, 2.0, 0.0]);
        let variance = a.variance().unwrap();
        assert_eq!(variance.as_slice(), &[4.0, 0.0]);
    }

    #[test]
    fn test_matmul_gradient() {
        // loss = sum(A · B)
        let engine = AutogradEngine::new();
        let a = engine.variable(matrix(&[vec![1.0, 2.0], vec![3.0, 4.0]]), true);
        let b = engine.variable(matrix(&[vec![5.0], vec![6.0]]), true);
        let loss = a.matmul(&b).unwrap().sum().unwrap();
        assert_eq!(loss.item(), 5.0 + 12.0 + 15.0 + 24.0);

        engine.backward(&loss).unwrap();
        let grad_a = engine.gradients(&a).unwrap();
        let grad_b = engine.gradients(&b).unwrap();
        assert_eq!(grad_a.as_slice(), &[5.0, 6.0, 5.0, 6.0]);
        assert_eq!(grad_b.as_slice(), &[4.0, 6.0]);
    }

    #[test]
    fn test_detach_stops_gradient() {
        let engine = AutogradEngine::new();
        let x = engine.variable(Tensor::from_vec(vec![1.0, 2.0], Shape::new([2])).unwrap(), true);
        let y = x.mul(&x.detach()).unwrap().sum().unwrap();
        engine.backward(&y).unwrap();
        // d/dx (x * c) = c, the detached factor contributes nothing
        assert_eq!(engine.gradients(&x).unwrap().as_slice(), &[1.0, 2.0]);
    }
}
