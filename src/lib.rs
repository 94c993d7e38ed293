//! Tandem - self-supervised losses over paired embedding batches
//!
//! Features:
//! - SimCLR-style InfoNCE with optional random negative subsampling
//! - BYOL-style cosine alignment
//! - VICReg variance-invariance-covariance regularization with diagnostics
//! - A small reverse-mode autograd core so every loss can be backpropagated
//! - JSON and environment configuration, with a factory that builds any loss by name

pub mod tensor;
pub mod autograd;
pub mod nn;
pub mod config;
pub mod error;
pub mod verification;

pub use autograd::{AutogradEngine, Variable};
pub use config::{ConfigBuilder, LossConfig, NumericPolicy};
pub use error::{TandemError, TandemResult};
pub use nn::losses::{
    ByolLoss, Loss, LossFactory, LossKind, Reduction, SimClrLoss, VicRegDiagnostics, VicRegLoss,
    VicRegOutput,
};
pub use nn::similarity::{CosineSimilarity, DotProductSimilarity, SimilarityFunction, SimilarityKind};
pub use tensor::{Device, Shape, Tensor};

/// Install a `tracing_subscriber::fmt` subscriber; later calls are no-ops
pub fn init() -> TandemResult<()> {
    if tracing_subscriber::fmt().try_init().is_ok() {
        tracing::info!(version = version(), "tandem initialized");
    }
    Ok(())
}

/// Get the current crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
