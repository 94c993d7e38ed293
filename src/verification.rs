//! Gradient verification against central finite differences

use crate::{
    autograd::{AutogradEngine, Variable},
    error::{TandemError, TandemResult},
    tensor::Tensor,
};

/// Outcome of a gradient check
#[derive(Debug, Clone, PartialEq)]
pub struct GradientReport {
    /// Number of input elements that were perturbed
    pub checked: usize,
    pub max_abs_error: f32,
    /// `(input, element, analytic, numeric)` for every element outside tolerance
    pub mismatches: Vec<(usize, usize, f32, f32)>,
}

impl GradientReport {
    pub fn passed(&self) -> bool {
        self.mismatches.is_empty()
    }
}

/// Compares backward-pass gradients with `(f(x + ε) - f(x - ε)) / 2ε`.
///
/// An element passes when `|analytic - numeric| <= tolerance * (1 + |numeric|)`.
#[derive(Debug, Clone, Copy)]
pub struct GradientVerifier {
    pub epsilon: f32,
    pub tolerance: f32,
}

impl Default for GradientVerifier {
    fn default() -> Self {
        Self {
            epsilon: 5e-3,
            tolerance: 2e-2,
        }
    }
}

impl GradientVerifier {
    pub fn new(epsilon: f32, tolerance: f32) -> Self {
        Self { epsilon, tolerance }
    }

    /// Verify the gradient of a scalar function of one matrix
    pub fn verify<F>(&self, input: &Tensor<2>, f: F) -> TandemResult<GradientReport>
    where
        F: Fn(&Variable<2>) -> TandemResult<Variable<0>>,
    {
        self.check(&[input], |vars| f(&vars[0]))
    }

    /// Verify the gradients of a scalar function of two matrices, such as a pairwise loss
    pub fn verify_pair<F>(&self, x: &Tensor<2>, y: &Tensor<2>, f: F) -> TandemResult<GradientReport>
    where
        F: Fn(&Variable<2>, &Variable<2>) -> TandemResult<Variable<0>>,
    {
        self.check(&[x, y], |vars| f(&vars[0], &vars[1]))
    }

    fn check<F>(&self, inputs: &[&Tensor<2>], f: F) -> TandemResult<GradientReport>
    where
        F: Fn(&[Variable<2>]) -> TandemResult<Variable<0>>,
    {
        if self.epsilon <= 0.0 {
            return Err(TandemError::config_error("epsilon", "must be positive"));
        }

        let engine = AutogradEngine::new();
        let tracked: Vec<Variable<2>> = inputs.iter()
            .map(|t| engine.variable((*t).clone(), true))
            .collect();
        let loss = f(&tracked)?;
        engine.backward(&loss)?;

        let mut report = GradientReport {
            checked: 0,
            max_abs_error: 0.0,
            mismatches: Vec::new(),
        };

        for (which, input) in inputs.iter().enumerate() {
            // an input the loss ignores has no recorded gradient
            let analytic = engine.gradients(&tracked[which])
                .map(|g| g.to_vec())
                .unwrap_or_else(|| vec![0.0; input.numel()]);

            for element in 0..input.numel() {
                let plus = self.evaluate(inputs, which, element, self.epsilon, &f)?;
                let minus = self.evaluate(inputs, which, element, -self.epsilon, &f)?;
                let numeric = (plus - minus) / (2.0 * self.epsilon);
                let error = (analytic[element] - numeric).abs();

                report.checked += 1;
                report.max_abs_error = report.max_abs_error.max(error);
                if !(error <= self.tolerance * (1.0 + numeric.abs())) {
                    tracing::warn!(
                        input = which,
                        element,
                        analytic = analytic[element],
                        numeric,
                        "gradient mismatch"
                    );
                    report.mismatches.push((which, element, analytic[element], numeric));
                }
            }
        }

        Ok(report)
    }

    fn evaluate<F>(&self, inputs: &[&Tensor<2>], which: usize, element: usize, delta: f32, f: &F) -> TandemResult<f32>
    where
        F: Fn(&[Variable<2>]) -> TandemResult<Variable<0>>,
    {
        let constants = inputs.iter().enumerate().map(|(i, t)| -> TandemResult<Variable<2>> {
            if i != which {
                return Ok(Variable::from_tensor((*t).clone()));
            }
            let mut data = t.to_vec();
            data[element] += delta;
            Ok(Variable::from_tensor(Tensor::from_vec_on(data, t.shape(), t.device())?))
        }).collect::<TandemResult<Vec<_>>>()?;
        Ok(f(&constants)?.item())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verifier_accepts_correct_gradient() {
        let input = Tensor::from_rows(&[vec![1.0, -2.0], vec![0.5, 3.0]]).unwrap();
        let report = GradientVerifier::default()
            .verify(&input, |x| x.square()?.sum())
            .unwrap();
        assert!(report.passed());
        assert_eq!(report.checked, 4);
        assert!(report.max_abs_error < 1e-2);
    }

    #[test]
    fn test_verifier_flags_wrong_gradient() {
        // detaching hides the dependence from the backward pass only
        let input = Tensor::from_rows(&[vec![1.0, 2.0]]).unwrap();
        let report = GradientVerifier::default()
            .verify(&input, |x| x.mul(&x.detach())?.sum())
            .unwrap();
        assert!(!report.passed());
        assert_eq!(report.mismatches.len(), 2);
    }

    #[test]
    fn test_verify_pair_covers_both_inputs() {
        let x = Tensor::from_rows(&[vec![1.0, 2.0]]).unwrap();
        let y = Tensor::from_rows(&[vec![3.0, -1.0]]).unwrap();
        let report = GradientVerifier::default()
            .verify_pair(&x, &y, |a, b| a.mul(b)?.sum())
            .unwrap();
        assert!(report.passed());
        assert_eq!(report.checked, 4);
    }

    #[test]
    fn test_rejects_non_positive_epsilon() {
        let input = Tensor::from_rows(&[vec![1.0]]).unwrap();
        let verifier = GradientVerifier::new(0.0, 1e-2);
        assert!(verifier.verify(&input, |x| x.sum()).is_err());
    }
}
