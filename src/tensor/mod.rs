//! Dense tensors backing the loss computations
//!
//! This module provides the minimal tensor substrate the losses need:
//! - Const-generic ranks (`Shape<DIMS>`) so matrices, vectors and scalars are distinct types
//! - Shared, immutable row-major `f32` buffers
//! - Device placement tags checked between operands
//! - Host kernels, row-parallel with the `parallel` feature

pub mod core;
pub mod ops;
pub mod devices;

// Re-export main types for convenience
pub use self::core::{Shape, Tensor};
pub use self::devices::Device;
