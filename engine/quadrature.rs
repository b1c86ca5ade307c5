//! Gauss-Hermite Quadrature for Random-Effect Marginalization
//!
//! This module integrates a one-dimensional Gaussian random effect out of a
//! nonlinear function of the linear predictor.
//!
//! # Background
//!
//! A conditional prediction `g⁻¹(η + u)` evaluated at `u = 0` is not the
//! marginal expectation `E[g⁻¹(η + u)]` with `u ~ N(0, σ²)` whenever the link
//! is curved (logit, complementary log-log, or an exponential event term).
//! When random-effect variability is disabled the predictors still need the
//! marginal value, so the random effect is integrated out numerically.
//!
//! # Implementation
//!
//! With the change of variable `u = μ + √2·σ·x`,
//!
//! `E[f(u)] ≈ π^(-1/2) Σᵢ wᵢ f(μ + √2·σ·xᵢ)`
//!
//! where `xᵢ`, `wᵢ` are the Gauss-Hermite nodes and weights for the weight
//! function `exp(-x²)`. An n-point rule is exact for polynomials up to degree
//! 2n - 1. The models use between 5 and 15 points; the more curved the
//! integrand the more points it gets.
//!
//! Nodes and weights are computed with the Golub-Welsch algorithm: the nodes
//! are the eigenvalues of the symmetric tridiagonal Jacobi matrix of the
//! Hermite recurrence and the weights are `√π` times the squared first
//! component of each normalized eigenvector.

use ndarray::Array2;
use ndarray_linalg::{Eigh, UPLO};
use std::f64::consts::{PI, SQRT_2};
use thiserror::Error;

/// Largest supported rule; weights underflow well before double precision
/// runs out of nodes beyond this.
pub const MAX_ORDER: usize = 64;

/// Below this standard deviation the integral collapses to a point evaluation.
const NEGLIGIBLE_STD_DEV: f64 = 1e-10;

#[derive(Error, Debug)]
pub enum QuadratureError {
    #[error("Gauss-Hermite order must be between 1 and {MAX_ORDER}, got {0}.")]
    InvalidOrder(usize),
    #[error("Eigendecomposition of the Jacobi matrix failed: {0}")]
    EigendecompositionFailed(#[from] ndarray_linalg::error::LinalgError),
}

/// Gauss-Hermite quadrature rule: nodes and weights for the `exp(-x²)` measure.
#[derive(Debug, Clone)]
pub struct GaussHermiteRule {
    nodes: Vec<f64>,
    weights: Vec<f64>,
}

impl GaussHermiteRule {
    pub fn new(order: usize) -> Result<Self, QuadratureError> {
        if order == 0 || order > MAX_ORDER {
            return Err(QuadratureError::InvalidOrder(order));
        }
        // Jacobi matrix: zero diagonal, off-diagonal sqrt(i/2) for i = 1..n-1
        let mut jacobi = Array2::<f64>::zeros((order, order));
        for i in 1..order {
            let off = ((i as f64) / 2.0).sqrt();
            jacobi[[i, i - 1]] = off;
            jacobi[[i - 1, i]] = off;
        }
        let (eigenvalues, eigenvectors) = jacobi.eigh(UPLO::Lower)?;
        let mu0 = PI.sqrt();
        let nodes = eigenvalues.to_vec();
        let weights = (0..order)
            .map(|j| {
                let v0 = eigenvectors[[0, j]];
                mu0 * v0 * v0
            })
            .collect();
        Ok(Self { nodes, weights })
    }

    pub fn order(&self) -> usize {
        self.nodes.len()
    }

    pub fn nodes(&self) -> &[f64] {
        &self.nodes
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }
}

/// Marginalizes a Gaussian random effect out of a function by Gauss-Hermite quadrature.
#[derive(Debug, Clone)]
pub struct QuadratureMarginalizer {
    rule: GaussHermiteRule,
}

impl QuadratureMarginalizer {
    pub fn new(order: usize) -> Result<Self, QuadratureError> {
        Ok(Self {
            rule: GaussHermiteRule::new(order)?,
        })
    }

    pub fn order(&self) -> usize {
        self.rule.order()
    }

    pub fn rule(&self) -> &GaussHermiteRule {
        &self.rule
    }

    /// Approximates `E[f(u)]` for `u ~ N(mean, std_dev²)`.
    ///
    /// When `std_dev` is zero or negligible this returns `f(mean)`.
    pub fn expectation<F>(&self, mean: f64, std_dev: f64, f: F) -> f64
    where
        F: Fn(f64) -> f64,
    {
        if std_dev < NEGLIGIBLE_STD_DEV {
            return f(mean);
        }
        let scale = SQRT_2 * std_dev;
        let sum: f64 = self
            .rule
            .nodes
            .iter()
            .zip(self.rule.weights.iter())
            .map(|(&x, &w)| w * f(mean + scale * x))
            .sum();
        sum / PI.sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::StandardNormal;

    /// Classic 7-point nodes and weights.
    const GH_NODES_7: [f64; 7] = [
        -2.651961356835233,
        -1.673551628767471,
        -0.816287882858965,
        0.0,
        0.816287882858965,
        1.673551628767471,
        2.651961356835233,
    ];

    const GH_WEIGHTS_7: [f64; 7] = [
        0.0009717812450995,
        0.0545155828191270,
        0.4256072526101277,
        0.8102646175568073,
        0.4256072526101277,
        0.0545155828191270,
        0.0009717812450995,
    ];

    fn sigmoid(x: f64) -> f64 {
        1.0 / (1.0 + (-x.clamp(-700.0, 700.0)).exp())
    }

    fn cloglog_inverse(x: f64) -> f64 {
        1.0 - (-x.exp()).exp()
    }

    /// Trapezoidal rule on a fine grid over ±12 standard deviations.
    fn reference_expectation(mean: f64, std_dev: f64, f: impl Fn(f64) -> f64) -> f64 {
        let n = 200_000;
        let (a, b) = (-12.0, 12.0);
        let h = (b - a) / n as f64;
        let mut total = 0.0;
        for k in 0..=n {
            let z = a + k as f64 * h;
            let density = (-0.5 * z * z).exp() / (2.0 * PI).sqrt();
            let weight = if k == 0 || k == n { 0.5 } else { 1.0 };
            total += weight * f(mean + std_dev * z) * density;
        }
        total * h
    }

    #[test]
    fn seven_point_rule_matches_tabulated_values() {
        let rule = GaussHermiteRule::new(7).unwrap();
        for i in 0..7 {
            assert_relative_eq!(rule.nodes()[i], GH_NODES_7[i], epsilon = 1e-12);
            assert_relative_eq!(rule.weights()[i], GH_WEIGHTS_7[i], epsilon = 1e-12);
        }
    }

    #[test]
    fn weights_sum_to_sqrt_pi() {
        for order in [1, 5, 10, 15, 30] {
            let rule = GaussHermiteRule::new(order).unwrap();
            let sum: f64 = rule.weights().iter().sum();
            assert_relative_eq!(sum, PI.sqrt(), epsilon = 1e-12);
        }
    }

    #[test]
    fn rejects_invalid_orders() {
        assert!(matches!(GaussHermiteRule::new(0), Err(QuadratureError::InvalidOrder(0))));
        assert!(matches!(
            GaussHermiteRule::new(MAX_ORDER + 1),
            Err(QuadratureError::InvalidOrder(_))
        ));
    }

    #[test]
    fn exact_for_low_degree_polynomials() {
        let quad = QuadratureMarginalizer::new(3).unwrap();
        // E[u^4] = 3σ⁴ for a centered normal
        let fourth = quad.expectation(0.0, 2.0, |u| u.powi(4));
        assert_relative_eq!(fourth, 48.0, epsilon = 1e-10);
        let second = quad.expectation(1.5, 0.5, |u| u * u);
        assert_relative_eq!(second, 1.5 * 1.5 + 0.25, epsilon = 1e-12);
    }

    #[test]
    fn zero_std_dev_returns_point_evaluation() {
        let quad = QuadratureMarginalizer::new(10).unwrap();
        assert_eq!(quad.expectation(1.5, 0.0, sigmoid), sigmoid(1.5));
    }

    #[test]
    fn error_shrinks_monotonically_with_order_for_exponential() {
        let (mean, std_dev): (f64, f64) = (0.3, 1.0);
        let exact = (mean + 0.5 * std_dev * std_dev).exp();
        let mut previous = f64::INFINITY;
        for order in [1, 2, 3, 4, 5, 6, 8, 10] {
            let quad = QuadratureMarginalizer::new(order).unwrap();
            let error = (quad.expectation(mean, std_dev, f64::exp) - exact).abs();
            assert!(error < previous, "order {order}: error {error} >= {previous}");
            previous = error;
        }
    }

    #[test]
    fn error_shrinks_monotonically_with_order_for_cloglog() {
        let (mean, std_dev) = (-2.0, 1.0);
        let reference = reference_expectation(mean, std_dev, cloglog_inverse);
        let mut previous = f64::INFINITY;
        for order in [2, 3, 5, 7, 10] {
            let quad = QuadratureMarginalizer::new(order).unwrap();
            let error = (quad.expectation(mean, std_dev, cloglog_inverse) - reference).abs();
            assert!(error < previous, "order {order}: error {error} >= {previous}");
            previous = error;
        }
    }

    #[test]
    fn logistic_expectation_shrinks_toward_one_half() {
        let quad = QuadratureMarginalizer::new(10).unwrap();
        let mean = quad.expectation(3.0, 1.0, sigmoid);
        assert!(mean < sigmoid(3.0));
        assert!(mean > 0.8);
        assert_relative_eq!(quad.expectation(0.0, 1.0, sigmoid), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn matches_monte_carlo() {
        let (eta, sd) = (2.0, 0.8);
        let quad = QuadratureMarginalizer::new(10).unwrap();
        let quad_mean = quad.expectation(eta, sd, sigmoid);

        let mut rng = StdRng::seed_from_u64(12345);
        let n_samples = 100_000;
        let mc_sum: f64 = (0..n_samples)
            .map(|_| {
                let z: f64 = rng.sample(StandardNormal);
                sigmoid(eta + sd * z)
            })
            .sum();
        let mc_mean = mc_sum / n_samples as f64;
        assert_relative_eq!(quad_mean, mc_mean, epsilon = 0.01);
    }
}
