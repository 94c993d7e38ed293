//! Function trait and the backward rules of every differentiable op

use crate::{
    error::TandemResult,
    tensor::{ops as kernels, Tensor},
};

/// Backward rule stored on an operation node.
///
/// `backward` receives the gradient of the node's output (flat, row-major)
/// and returns one gradient buffer per input, in input order, each the size
/// of that input.
pub trait Function: Send + Sync {
    fn backward(&self, grad_output: &[f32]) -> TandemResult<Vec<Vec<f32>>>;

    /// Get function name for debugging
    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone)]
pub struct AddBackward;

impl Function for AddBackward {
    fn backward(&self, grad_output: &[f32]) -> TandemResult<Vec<Vec<f32>>> {
        Ok(vec![grad_output.to_vec(), grad_output.to_vec()])
    }

    fn name(&self) -> &'static str {
        "AddBackward"
    }
}

#[derive(Debug, Clone)]
pub struct SubBackward;

impl Function for SubBackward {
    fn backward(&self, grad_output: &[f32]) -> TandemResult<Vec<Vec<f32>>> {
        let negated = grad_output.iter().map(|g| -g).collect();
        Ok(vec![grad_output.to_vec(), negated])
    }

    fn name(&self) -> &'static str {
        "SubBackward"
    }
}

/// Product rule: d(a*b) = b*da + a*db
#[derive(Debug, Clone)]
pub struct MulBackward<const DIMS: usize> {
    pub lhs: Tensor<DIMS>,
    pub rhs: Tensor<DIMS>,
}

impl<const DIMS: usize> Function for MulBackward<DIMS> {
    fn backward(&self, grad_output: &[f32]) -> TandemResult<Vec<Vec<f32>>> {
        let grad_lhs = grad_output.iter().zip(self.rhs.as_slice()).map(|(g, b)| g * b).collect();
        let grad_rhs = grad_output.iter().zip(self.lhs.as_slice()).map(|(g, a)| g * a).collect();
        Ok(vec![grad_lhs, grad_rhs])
    }

    fn name(&self) -> &'static str {
        "MulBackward"
    }
}

#[derive(Debug, Clone)]
pub struct ScaleBackward {
    pub factor: f32,
}

impl Function for ScaleBackward {
    fn backward(&self, grad_output: &[f32]) -> TandemResult<Vec<Vec<f32>>> {
        Ok(vec![grad_output.iter().map(|g| g * self.factor).collect()])
    }

    fn name(&self) -> &'static str {
        "ScaleBackward"
    }
}

/// Ops that leave the buffer untouched up to a constant shift (reshape, add_scalar)
#[derive(Debug, Clone)]
pub struct PassThroughBackward;

impl Function for PassThroughBackward {
    fn backward(&self, grad_output: &[f32]) -> TandemResult<Vec<Vec<f32>>> {
        Ok(vec![grad_output.to_vec()])
    }

    fn name(&self) -> &'static str {
        "PassThroughBackward"
    }
}

/// dA = G·Bᵀ, dB = Aᵀ·G
#[derive(Debug, Clone)]
pub struct MatMulBackward {
    pub lhs: Tensor<2>,
    pub rhs: Tensor<2>,
}

impl Function for MatMulBackward {
    fn backward(&self, grad_output: &[f32]) -> TandemResult<Vec<Vec<f32>>> {
        let [m, k] = self.lhs.shape().dims;
        let n = self.rhs.shape().cols();
        let rhs_t = kernels::transpose(self.rhs.as_slice(), k, n);
        let lhs_t = kernels::transpose(self.lhs.as_slice(), m, k);
        Ok(vec![
            kernels::matmul(grad_output, &rhs_t, m, n, k),
            kernels::matmul(&lhs_t, grad_output, k, m, n),
        ])
    }

    fn name(&self) -> &'static str {
        "MatMulBackward"
    }
}

#[derive(Debug, Clone)]
pub struct TransposeBackward {
    /// Shape of the input, before transposition
    pub rows: usize,
    pub cols: usize,
}

impl Function for TransposeBackward {
    fn backward(&self, grad_output: &[f32]) -> TandemResult<Vec<Vec<f32>>> {
        Ok(vec![kernels::transpose(grad_output, self.cols, self.rows)])
    }

    fn name(&self) -> &'static str {
        "TransposeBackward"
    }
}

#[derive(Debug, Clone)]
pub struct SumBackward {
    pub numel: usize,
}

impl Function for SumBackward {
    fn backward(&self, grad_output: &[f32]) -> TandemResult<Vec<Vec<f32>>> {
        Ok(vec![vec![grad_output[0]; self.numel]])
    }

    fn name(&self) -> &'static str {
        "SumBackward"
    }
}

#[derive(Debug, Clone)]
pub struct MeanBackward {
    pub numel: usize,
}

impl Function for MeanBackward {
    fn backward(&self, grad_output: &[f32]) -> TandemResult<Vec<Vec<f32>>> {
        Ok(vec![vec![grad_output[0] / self.numel as f32; self.numel]])
    }

    fn name(&self) -> &'static str {
        "MeanBackward"
    }
}

/// Sum over the feature axis of a matrix
#[derive(Debug, Clone)]
pub struct RowSumBackward {
    pub rows: usize,
    pub cols: usize,
}

impl Function for RowSumBackward {
    fn backward(&self, grad_output: &[f32]) -> TandemResult<Vec<Vec<f32>>> {
        let mut grad = Vec::with_capacity(self.rows * self.cols);
        for &g in grad_output.iter().take(self.rows) {
            grad.extend(std::iter::repeat(g).take(self.cols));
        }
        Ok(vec![grad])
    }

    fn name(&self) -> &'static str {
        "RowSumBackward"
    }
}

/// Flat gather; the backward pass scatter-adds, so repeated indices accumulate
#[derive(Debug, Clone)]
pub struct GatherBackward {
    pub indices: Vec<usize>,
    pub input_numel: usize,
}

impl Function for GatherBackward {
    fn backward(&self, grad_output: &[f32]) -> TandemResult<Vec<Vec<f32>>> {
        let mut grad = vec![0.0f32; self.input_numel];
        for (&index, &g) in self.indices.iter().zip(grad_output) {
            grad[index] += g;
        }
        Ok(vec![grad])
    }

    fn name(&self) -> &'static str {
        "GatherBackward"
    }
}

/// Concatenation of matrices along rows (axis 0) or columns (axis 1)
#[derive(Debug, Clone)]
pub struct ConcatBackward {
    pub axis: usize,
    pub parts: Vec<[usize; 2]>,
}

impl Function for ConcatBackward {
    fn backward(&self, grad_output: &[f32]) -> TandemResult<Vec<Vec<f32>>> {
        if self.axis == 0 {
            let mut offset = 0;
            let grads = self.parts.iter().map(|&[rows, cols]| {
                let len = rows * cols;
                let grad = grad_output[offset..offset + len].to_vec();
                offset += len;
                grad
            }).collect();
            return Ok(grads);
        }

        let rows = self.parts.first().map_or(0, |p| p[0]);
        let total_cols: usize = self.parts.iter().map(|p| p[1]).sum();
        let mut grads: Vec<Vec<f32>> = self.parts.iter()
            .map(|&[rows, cols]| Vec::with_capacity(rows * cols))
            .collect();
        for r in 0..rows {
            let row = &grad_output[r * total_cols..(r + 1) * total_cols];
            let mut offset = 0;
            for (grad, &[_, cols]) in grads.iter_mut().zip(&self.parts) {
                grad.extend_from_slice(&row[offset..offset + cols]);
                offset += cols;
            }
        }
        Ok(grads)
    }

    fn name(&self) -> &'static str {
        "ConcatBackward"
    }
}

#[derive(Debug, Clone)]
pub struct ReluBackward<const DIMS: usize> {
    pub input: Tensor<DIMS>,
}

impl<const DIMS: usize> Function for ReluBackward<DIMS> {
    fn backward(&self, grad_output: &[f32]) -> TandemResult<Vec<Vec<f32>>> {
        let grad = grad_output.iter()
            .zip(self.input.as_slice())
            .map(|(&g, &x)| if x > 0.0 { g } else { 0.0 })
            .collect();
        Ok(vec![grad])
    }

    fn name(&self) -> &'static str {
        "ReluBackward"
    }
}

/// d sqrt(x) = 1 / (2 sqrt(x)), computed from the saved output
#[derive(Debug, Clone)]
pub struct SqrtBackward<const DIMS: usize> {
    pub output: Tensor<DIMS>,
}

impl<const DIMS: usize> Function for SqrtBackward<DIMS> {
    fn backward(&self, grad_output: &[f32]) -> TandemResult<Vec<Vec<f32>>> {
        let grad = grad_output.iter()
            .zip(self.output.as_slice())
            .map(|(&g, &y)| g * 0.5 / y)
            .collect();
        Ok(vec![grad])
    }

    fn name(&self) -> &'static str {
        "SqrtBackward"
    }
}

/// Row-wise: dx = g - softmax · Σg
#[derive(Debug, Clone)]
pub struct LogSoftmaxBackward {
    pub output: Tensor<2>,
}

impl Function for LogSoftmaxBackward {
    fn backward(&self, grad_output: &[f32]) -> TandemResult<Vec<Vec<f32>>> {
        let cols = self.output.shape().cols();
        let mut grad = vec![0.0f32; grad_output.len()];
        if cols == 0 {
            return Ok(vec![grad]);
        }
        for ((g_row, y_row), out_row) in grad_output.chunks(cols)
            .zip(self.output.as_slice().chunks(cols))
            .zip(grad.chunks_mut(cols))
        {
            let total: f32 = g_row.iter().sum();
            for ((o, &g), &y) in out_row.iter_mut().zip(g_row).zip(y_row) {
                *o = g - y.exp() * total;
            }
        }
        Ok(vec![grad])
    }

    fn name(&self) -> &'static str {
        "LogSoftmaxBackward"
    }
}

/// Row-wise `x / max(‖x‖, eps)`
#[derive(Debug, Clone)]
pub struct NormalizeBackward {
    pub input: Tensor<2>,
    pub norms: Vec<f32>,
    pub eps: f32,
}

impl Function for NormalizeBackward {
    fn backward(&self, grad_output: &[f32]) -> TandemResult<Vec<Vec<f32>>> {
        let cols = self.input.shape().cols();
        let mut grad = vec![0.0f32; grad_output.len()];
        if cols == 0 {
            return Ok(vec![grad]);
        }
        for (((g_row, x_row), out_row), &norm) in grad_output.chunks(cols)
            .zip(self.input.as_slice().chunks(cols))
            .zip(grad.chunks_mut(cols))
            .zip(&self.norms)
        {
            if norm > self.eps {
                // Jacobian of x/‖x‖ is (I - ŷŷᵀ)/‖x‖
                let dot: f32 = g_row.iter().zip(x_row).map(|(g, x)| g * x).sum::<f32>() / norm;
                for ((o, &g), &x) in out_row.iter_mut().zip(g_row).zip(x_row) {
                    *o = (g - x / norm * dot) / norm;
                }
            } else {
                for (o, &g) in out_row.iter_mut().zip(g_row) {
                    *o = g / self.eps;
                }
            }
        }
        Ok(vec![grad])
    }

    fn name(&self) -> &'static str {
        "NormalizeBackward"
    }
}

/// Column centering: dx = g - colmean(g)
#[derive(Debug, Clone)]
pub struct CenterBackward {
    pub rows: usize,
    pub cols: usize,
}

impl Function for CenterBackward {
    fn backward(&self, grad_output: &[f32]) -> TandemResult<Vec<Vec<f32>>> {
        let means = kernels::column_means(grad_output, self.rows, self.cols);
        let mut grad = grad_output.to_vec();
        if self.cols == 0 {
            return Ok(vec![grad]);
        }
        for row in grad.chunks_mut(self.cols) {
            for (v, m) in row.iter_mut().zip(&means) {
                *v -= m;
            }
        }
        Ok(vec![grad])
    }

    fn name(&self) -> &'static str {
        "CenterBackward"
    }
}

/// Unbiased per-column variance: d var_j / d x_ij = 2 (x_ij - mean_j) / (n - 1)
#[derive(Debug, Clone)]
pub struct VarianceBackward {
    pub centered: Vec<f32>,
    pub rows: usize,
    pub cols: usize,
}

impl Function for VarianceBackward {
    fn backward(&self, grad_output: &[f32]) -> TandemResult<Vec<Vec<f32>>> {
        let denom = self.rows as f32 - 1.0;
        let mut grad = vec![0.0f32; self.rows * self.cols];
        if self.cols == 0 {
            return Ok(vec![grad]);
        }
        for (out_row, c_row) in grad.chunks_mut(self.cols).zip(self.centered.chunks(self.cols)) {
            for ((o, &c), &g) in out_row.iter_mut().zip(c_row).zip(grad_output) {
                *o = g * 2.0 * c / denom;
            }
        }
        Ok(vec![grad])
    }

    fn name(&self) -> &'static str {
        "VarianceBackward"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Shape;

    #[test]
    fn test_gather_backward_accumulates_repeats() {
        let f = GatherBackward { indices: vec![0, 2, 0], input_numel: 3 };
        let grads = f.backward(&[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(grads, vec![vec![4.0, 0.0, 2.0]]);
    }

    #[test]
    fn test_concat_backward_splits_columns() {
        let f = ConcatBackward { axis: 1, parts: vec![[2, 1], [2, 2]] };
        let grads = f.backward(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(grads, vec![vec![1.0, 4.0], vec![2.0, 3.0, 5.0, 6.0]]);
    }

    #[test]
    fn test_concat_backward_splits_rows() {
        let f = ConcatBackward { axis: 0, parts: vec![[1, 2], [2, 2]] };
        let grads = f.backward(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(grads, vec![vec![1.0, 2.0], vec![3.0, 4.0, 5.0, 6.0]]);
    }

    #[test]
    fn test_matmul_backward_shapes() {
        let lhs = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], Shape::new([2, 3])).unwrap();
        let rhs = Tensor::from_vec(vec![1.0; 3], Shape::new([3, 1])).unwrap();
        let f = MatMulBackward { lhs, rhs };
        let grads = f.backward(&[1.0, 1.0]).unwrap();
        assert_eq!(grads[0], vec![1.0; 6]);
        assert_eq!(grads[1], vec![5.0, 7.0, 9.0]);
        assert_eq!(f.name(), "MatMulBackward");
    }
}
