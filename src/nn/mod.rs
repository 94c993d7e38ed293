//! Loss functions and the similarity measures they are built on

pub mod losses;
pub mod similarity;

pub use losses::*;
pub use similarity::*;
