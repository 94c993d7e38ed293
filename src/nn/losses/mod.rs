//! Self-supervised loss functions with automatic differentiation support
//!
//! Every loss consumes two row-aligned batches of embeddings (two views of the
//! same samples) and produces a scalar that can be backpropagated to both.

pub mod classification;
pub mod regression;
pub mod contrastive;
pub mod alignment;
pub mod regularization;

pub use classification::*;
pub use regression::*;
pub use contrastive::*;
pub use alignment::*;
pub use regularization::*;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{
    autograd::Variable,
    config::LossConfig,
    error::{TandemError, TandemResult},
};

/// Reduction types for loss functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Reduction {
    /// No reduction - keep the loss for each sample
    None,
    /// Mean reduction - average over all elements
    #[default]
    Mean,
    /// Sum reduction - sum over all elements
    Sum,
}

/// Base trait for pairwise embedding losses
pub trait Loss: Send + Sync {
    /// Compute the scalar loss for a batch and its paired view
    fn forward(&self, x: &Variable<2>, x_pair: &Variable<2>) -> TandemResult<Variable<0>>;

    /// Get the name of the loss function
    fn name(&self) -> &'static str;

    /// Get the reduction type
    fn reduction(&self) -> Reduction;
}

/// Apply reduction to a loss tensor of any rank
pub fn apply_reduction<const DIMS: usize>(loss: &Variable<DIMS>, reduction: Reduction) -> TandemResult<Variable<0>> {
    match reduction {
        Reduction::None => Err(TandemError::InvalidInput(
            "None reduction not supported for scalar output".to_string(),
        )),
        Reduction::Mean => loss.mean(),
        Reduction::Sum => loss.sum(),
    }
}

/// Shared input checks and numeric guards
pub mod utils {
    use crate::{
        autograd::Variable,
        config::NumericPolicy,
        error::{ErrorContext, TandemError, TandemResult, WithContext},
        tensor::Device,
    };

    /// Both views must have the same shape and live on `device`
    pub fn check_pair(x: &Variable<2>, x_pair: &Variable<2>, device: Device, loss: &str) -> TandemResult<()> {
        let checked = if x.shape() != x_pair.shape() {
            Err(TandemError::shape_error(
                &format!("paired batch of shape {}", x.shape()),
                &x_pair.shape().to_string(),
                Some("views must be row-aligned and of identical shape"),
            ))
        } else {
            device.ensure_same(&x.device(), loss)
                .and_then(|_| device.ensure_same(&x_pair.device(), loss))
        };
        checked.with_context(|| {
            ErrorContext::new(loss)
                .with_shape(x.shape())
                .with_shape(x_pair.shape())
                .with_device(device)
        })
    }

    /// Apply the numeric policy to a finished loss value
    pub fn enforce_policy(loss: Variable<0>, policy: NumericPolicy, name: &str) -> TandemResult<Variable<0>> {
        if loss.is_finite() {
            return Ok(loss);
        }
        match policy {
            NumericPolicy::Propagate => {
                tracing::warn!(loss = name, value = loss.item(), "non-finite loss value");
                Ok(loss)
            }
            NumericPolicy::Reject => Err(TandemError::NumericInstability(format!(
                "{} produced a non-finite value ({})",
                name,
                loss.item()
            ))),
        }
    }
}

/// The self-supervised objectives the factory can build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LossKind {
    #[default]
    SimClr,
    Byol,
    VicReg,
}

impl LossKind {
    pub const ALL: [LossKind; 3] = [LossKind::SimClr, LossKind::Byol, LossKind::VicReg];

    pub const fn as_str(&self) -> &'static str {
        match self {
            LossKind::SimClr => "simclr",
            LossKind::Byol => "byol",
            LossKind::VicReg => "vicreg",
        }
    }
}

impl fmt::Display for LossKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LossKind {
    type Err = TandemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s.trim()
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_lowercase();
        LossKind::ALL.into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| TandemError::InvalidInput(format!("Unknown loss function: {}", s)))
    }
}

impl TryFrom<String> for LossKind {
    type Error = TandemError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<LossKind> for String {
    fn from(kind: LossKind) -> Self {
        kind.as_str().to_string()
    }
}

/// Loss function factory for creating losses from configuration
pub struct LossFactory;

impl LossFactory {
    /// Create a loss of the given kind; the rest of `config` supplies its hyperparameters
    pub fn create(kind: LossKind, config: &LossConfig) -> TandemResult<Box<dyn Loss>> {
        let mut config = config.clone();
        config.loss = kind;
        config.validate()?;

        let loss: Box<dyn Loss> = match kind {
            LossKind::SimClr => Box::new(SimClrLoss::from_config(&config)?),
            LossKind::Byol => Box::new(ByolLoss::from_config(&config)),
            LossKind::VicReg => Box::new(VicRegLoss::from_config(&config)?),
        };
        tracing::debug!(loss = loss.name(), batch_size = config.batch_size, "created loss");
        Ok(loss)
    }

    /// Create the loss selected by `config.loss`
    pub fn from_config(config: &LossConfig) -> TandemResult<Box<dyn Loss>> {
        Self::create(config.loss, config)
    }

    /// Create a loss function by name
    pub fn create_by_name(name: &str, config: &LossConfig) -> TandemResult<Box<dyn Loss>> {
        Self::create(name.parse()?, config)
    }

    /// List all available loss functions
    pub fn available_losses() -> Vec<&'static str> {
        LossKind::ALL.iter().map(|kind| kind.as_str()).collect()
    }
}
