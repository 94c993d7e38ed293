//! Pairwise similarity between two batches of embeddings

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{
    autograd::Variable,
    error::{TandemError, TandemResult},
};

/// Row floor used when normalizing for cosine similarity
pub const COSINE_EPS: f32 = 1e-8;

/// Pairwise similarity of the rows of `a` (m, d) against the rows of `b` (n, d).
///
/// Implementations return an (m, n) matrix that stays on the autograd graph.
pub trait SimilarityFunction: Send + Sync + fmt::Debug {
    fn similarity(&self, a: &Variable<2>, b: &Variable<2>) -> TandemResult<Variable<2>>;

    fn name(&self) -> &'static str;
}

/// `â · b̂ᵀ` with `v̂ = v / max(‖v‖, 1e-8)`
#[derive(Debug, Clone, Copy, Default)]
pub struct CosineSimilarity;

impl SimilarityFunction for CosineSimilarity {
    fn similarity(&self, a: &Variable<2>, b: &Variable<2>) -> TandemResult<Variable<2>> {
        let a_hat = a.l2_normalize(COSINE_EPS)?;
        let b_hat = b.l2_normalize(COSINE_EPS)?;
        a_hat.matmul(&b_hat.transpose()?)
    }

    fn name(&self) -> &'static str {
        "cosine"
    }
}

/// Raw inner products `a · bᵀ`
#[derive(Debug, Clone, Copy, Default)]
pub struct DotProductSimilarity;

impl SimilarityFunction for DotProductSimilarity {
    fn similarity(&self, a: &Variable<2>, b: &Variable<2>) -> TandemResult<Variable<2>> {
        a.matmul(&b.transpose()?)
    }

    fn name(&self) -> &'static str {
        "dot_product"
    }
}

/// Configurable choice of similarity function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimilarityKind {
    #[default]
    Cosine,
    DotProduct,
}

impl SimilarityKind {
    pub fn build(self) -> Box<dyn SimilarityFunction> {
        match self {
            SimilarityKind::Cosine => Box::new(CosineSimilarity),
            SimilarityKind::DotProduct => Box::new(DotProductSimilarity),
        }
    }
}

impl FromStr for SimilarityKind {
    type Err = TandemError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "cosine" | "cos" => Ok(SimilarityKind::Cosine),
            "dot_product" | "dot" => Ok(SimilarityKind::DotProduct),
            other => Err(TandemError::InvalidInput(format!("Unknown similarity function: {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;
    use crate::verification::GradientVerifier;

    fn var(rows: &[Vec<f32>]) -> Variable<2> {
        Variable::from_tensor(Tensor::from_rows(rows).unwrap())
    }

    #[test]
    fn test_cosine_similarity_values() {
        let a = var(&[vec![1.0, 0.0], vec![3.0, 4.0]]);
        let b = var(&[vec![2.0, 0.0], vec![0.0, -1.0], vec![0.0, 0.0]]);
        let sim = CosineSimilarity.similarity(&a, &b).unwrap();
        assert_eq!(sim.shape().dims, [2, 3]);

        let expected = [1.0, 0.0, 0.0, 0.6, -0.8, 0.0];
        for (got, want) in sim.as_slice().iter().zip(expected) {
            assert!((got - want).abs() < 1e-6, "{} != {}", got, want);
        }
    }

    #[test]
    fn test_dot_product_similarity_values() {
        let a = var(&[vec![1.0, 2.0], vec![3.0, 4.0]]);
        let sim = DotProductSimilarity.similarity(&a, &a).unwrap();
        assert_eq!(sim.as_slice(), &[5.0, 11.0, 11.0, 25.0]);
    }

    #[test]
    fn test_mismatched_widths_fail() {
        let a = var(&[vec![1.0, 2.0]]);
        let b = var(&[vec![1.0, 2.0, 3.0]]);
        assert!(CosineSimilarity.similarity(&a, &b).is_err());
        assert!(DotProductSimilarity.similarity(&a, &b).is_err());
    }

    #[test]
    fn test_kind_parsing_and_serde() {
        assert_eq!("Cosine".parse::<SimilarityKind>().unwrap(), SimilarityKind::Cosine);
        assert_eq!("dot-product".parse::<SimilarityKind>().unwrap(), SimilarityKind::DotProduct);
        assert!("euclidean".parse::<SimilarityKind>().is_err());

        let json = serde_json::to_string(&SimilarityKind::DotProduct).unwrap();
        assert_eq!(json, "\"dot_product\"");
        assert_eq!(SimilarityKind::DotProduct.build().name(), "dot_product");
    }

    #[test]
    fn test_cosine_gradient() {
        let input = Tensor::from_rows(&[vec![0.5, -1.0, 2.0], vec![1.5, 0.3, -0.4]]).unwrap();
        let weights = Variable::from_tensor(
            Tensor::from_rows(&[vec![0.7, -1.3], vec![0.2, 1.1]]).unwrap(),
        );
        let report = GradientVerifier::default()
            .verify(&input, |x| CosineSimilarity.similarity(x, x)?.mul(&weights)?.sum())
            .unwrap();
        assert!(report.passed(), "{:?}", report);
    }
}
