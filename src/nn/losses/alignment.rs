//! Cosine alignment between an online prediction and a target projection

use crate::{
    autograd::Variable,
    config::{LossConfig, NumericPolicy},
    error::TandemResult,
    nn::similarity::{CosineSimilarity, SimilarityFunction},
    tensor::Device,
};
use super::{
    apply_reduction,
    utils::{check_pair, enforce_policy},
    Loss, Reduction,
};

/// Row floor of the L2 normalization
pub const NORMALIZE_EPS: f32 = 1e-12;

/// BYOL regression loss `2 - 2·⟨x̂, ŷ⟩` per sample, in `[0, 4]`
pub struct ByolLoss {
    // accepted for interface compatibility; the loss always uses normalized dot products
    similarity: Box<dyn SimilarityFunction>,
    reduction: Reduction,
    policy: NumericPolicy,
    device: Device,
}

impl Default for ByolLoss {
    fn default() -> Self {
        Self::new(Box::new(CosineSimilarity))
    }
}

impl ByolLoss {
    pub fn new(similarity: Box<dyn SimilarityFunction>) -> Self {
        Self {
            similarity,
            reduction: Reduction::Mean,
            policy: NumericPolicy::default(),
            device: Device::default(),
        }
    }

    pub fn from_config(config: &LossConfig) -> Self {
        Self::new(config.contrastive.similarity.build())
            .with_numeric_policy(config.runtime.numeric_policy)
            .on_device(config.runtime.device)
    }

    pub fn with_reduction(mut self, reduction: Reduction) -> Self {
        self.reduction = reduction;
        self
    }

    pub fn with_numeric_policy(mut self, policy: NumericPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn on_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// The similarity this loss was configured with
    pub fn similarity(&self) -> &dyn SimilarityFunction {
        self.similarity.as_ref()
    }

    /// One loss value per row
    pub fn per_sample(&self, x: &Variable<2>, x_pair: &Variable<2>) -> TandemResult<Variable<1>> {
        check_pair(x, x_pair, self.device, "ByolLoss")?;
        let x_hat = x.l2_normalize(NORMALIZE_EPS)?;
        let y_hat = x_pair.l2_normalize(NORMALIZE_EPS)?;
        let loss = x_hat.mul(&y_hat)?
            .row_sum()?
            .mul_scalar(-2.0)?
            .add_scalar(2.0)?;
        tracing::debug!(batch_size = x.shape().rows(), "byol forward");
        Ok(loss)
    }
}

impl Loss for ByolLoss {
    fn forward(&self, x: &Variable<2>, x_pair: &Variable<2>) -> TandemResult<Variable<0>> {
        let loss = apply_reduction(&self.per_sample(x, x_pair)?, self.reduction)?;
        enforce_policy(loss, self.policy, self.name())
    }

    fn name(&self) -> &'static str { "ByolLoss" }
    fn reduction(&self) -> Reduction { self.reduction }
}
