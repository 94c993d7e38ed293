//! Variance-invariance-covariance regularization

use serde::Serialize;

use crate::{
    autograd::Variable,
    config::{LossConfig, NumericPolicy, VicRegConfig},
    error::{ErrorContext, TandemError, TandemResult, WithContext},
    tensor::{Device, Shape},
};
use super::{
    regression::MSELoss,
    utils::{check_pair, enforce_policy},
    Loss, Reduction,
};

/// Added to the variance before the square root
pub const VARIANCE_EPS: f32 = 1e-4;

/// Detached per-call statistics of a VICReg evaluation
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VicRegDiagnostics {
    /// Invariance term (mean squared distance between the views)
    pub positive_distance: f32,
    /// `-(covariance + variance)`
    pub log_prob: f32,
    /// `-invariance`
    pub log_cond_prob: f32,
    pub invariance: f32,
    pub variance: f32,
    pub covariance: f32,
}

/// Differentiable loss plus the diagnostics of the same call
#[derive(Debug, Clone)]
pub struct VicRegOutput {
    pub loss: Variable<0>,
    pub diagnostics: VicRegDiagnostics,
}

/// Flat row-major indices of the off-diagonal entries of an `n × n` matrix.
///
/// Dropping the last element and viewing the rest as `(n - 1, n + 1)` puts
/// the whole diagonal in column 0; every other column is off-diagonal.
pub fn off_diagonal_indices(n: usize) -> Vec<usize> {
    (0..n.saturating_sub(1))
        .flat_map(|row| (1..=n).map(move |col| row * (n + 1) + col))
        .collect()
}

/// The `n² - n` off-diagonal entries of a square matrix, row-major
pub fn off_diagonal(matrix: &Variable<2>) -> TandemResult<Variable<1>> {
    let [rows, cols] = matrix.shape().dims;
    if rows != cols {
        return Err(TandemError::shape_error(
            "square matrix",
            &matrix.shape().to_string(),
            None,
        ));
    }
    matrix.gather(&off_diagonal_indices(rows), Shape::new([rows * rows - rows]))
}

/// VICReg: `sim·invariance + std·variance + cov·covariance`
#[derive(Debug, Clone)]
pub struct VicRegLoss {
    batch_size: usize,
    hidden_dim: usize,
    coeffs: VicRegConfig,
    policy: NumericPolicy,
    device: Device,
}

impl VicRegLoss {
    pub fn new(batch_size: usize, hidden_dim: usize, coeffs: VicRegConfig) -> TandemResult<Self> {
        if batch_size < 2 {
            return Err(TandemError::config_error(
                "batch_size",
                &format!("vicreg needs at least 2 samples, got {}", batch_size),
            ));
        }
        if hidden_dim == 0 {
            return Err(TandemError::config_error("hidden_dim", "must be positive"));
        }
        coeffs.validate()?;
        Ok(Self {
            batch_size,
            hidden_dim,
            coeffs,
            policy: NumericPolicy::default(),
            device: Device::default(),
        })
    }

    pub fn from_config(config: &LossConfig) -> TandemResult<Self> {
        Ok(Self::new(config.batch_size, config.hidden_dim, config.vicreg.clone())?
            .with_numeric_policy(config.runtime.numeric_policy)
            .on_device(config.runtime.device))
    }

    pub fn with_numeric_policy(mut self, policy: NumericPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn on_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn coefficients(&self) -> &VicRegConfig {
        &self.coeffs
    }

    pub fn forward(&self, x: &Variable<2>, y: &Variable<2>) -> TandemResult<VicRegOutput> {
        check_pair(x, y, self.device, "VicRegLoss")?;
        let expected = [self.batch_size, self.hidden_dim];
        if x.shape().dims != expected {
            return Err(TandemError::shape_error(
                &Shape::new(expected).to_string(),
                &x.shape().to_string(),
                None,
            ))
            .with_context(|| {
                ErrorContext::new("VicRegLoss")
                    .with_shape(x.shape())
                    .with_hint("embeddings must be (batch_size, hidden_dim)")
            });
        }

        let invariance = MSELoss::new(Reduction::Mean).forward(x, y)?;

        let x = x.center()?;
        let y = y.center()?;

        let variance = self.std_hinge(&x)?.add(&self.std_hinge(&y)?)?;
        let covariance = self.cov_penalty(&x)?.add(&self.cov_penalty(&y)?)?;

        let loss = invariance.mul_scalar(self.coeffs.sim_coeff)?
            .add(&variance.mul_scalar(self.coeffs.std_coeff)?)?
            .add(&covariance.mul_scalar(self.coeffs.cov_coeff)?)?;

        let (inv, var, cov) = (invariance.item(), variance.item(), covariance.item());
        let diagnostics = VicRegDiagnostics {
            positive_distance: inv,
            log_prob: -cov - var,
            log_cond_prob: -inv,
            invariance: inv,
            variance: var,
            covariance: cov,
        };

        tracing::debug!(
            loss = loss.item(),
            invariance = inv,
            variance = var,
            covariance = cov,
            batch_size = self.batch_size,
            "vicreg forward"
        );
        let loss = enforce_policy(loss, self.policy, "VicRegLoss")?;
        Ok(VicRegOutput { loss, diagnostics })
    }

    // mean(relu(1 - sqrt(var + eps))) / 2
    fn std_hinge(&self, centered: &Variable<2>) -> TandemResult<Variable<0>> {
        centered.variance()?
            .add_scalar(VARIANCE_EPS)?
            .sqrt()?
            .neg()?
            .add_scalar(1.0)?
            .relu()?
            .mean()?
            .mul_scalar(0.5)
    }

    // sum(off_diagonal(XᵀX / (B - 1))²) / D
    fn cov_penalty(&self, centered: &Variable<2>) -> TandemResult<Variable<0>> {
        let cov = centered.transpose()?
            .matmul(centered)?
            .mul_scalar(1.0 / (self.batch_size as f32 - 1.0))?;
        off_diagonal(&cov)?
            .square()?
            .sum()?
            .mul_scalar(1.0 / self.hidden_dim as f32)
    }
}

impl Loss for VicRegLoss {
    fn forward(&self, x: &Variable<2>, x_pair: &Variable<2>) -> TandemResult<Variable<0>> {
        Ok(VicRegLoss::forward(self, x, x_pair)?.loss)
    }

    fn name(&self) -> &'static str { "VicRegLoss" }
    fn reduction(&self) -> Reduction { Reduction::Mean }
}
