//! Link-function evaluation for the mixed-effects predictors.
//!
//! A prediction is a two-stage function: an inner predictor `η` built from the
//! fixed part, an optional event parameter and a random effect, and an outer
//! inverse link `g⁻¹(η)`. The evaluator exposes the value together with its
//! gradient and Hessian with respect to `(fixed part, event parameter, random
//! effect)` so quadrature and uncertainty propagation can be composed without
//! knowing which model produced the function.

use crate::quadrature::QuadratureMarginalizer;
use ndarray::{Array1, Array2};

/// Guards `exp` against overflow in the inverse links.
const ETA_CLAMP: f64 = 700.0;

pub const FIXED_PART: usize = 0;
pub const EVENT_PARAMETER: usize = 1;
pub const RANDOM_EFFECT: usize = 2;

/// Defines the link function, connecting the linear predictor to the mean response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkFunction {
    /// Logistic link for event probabilities.
    Logit,
    /// Complementary log-log link, `p = 1 - exp(-exp(η))`.
    CLogLog,
    /// Continuous outcomes on the response scale.
    Identity,
    /// Continuous outcomes modelled on the log scale.
    Log,
}

impl LinkFunction {
    pub fn inverse(self, eta: f64) -> f64 {
        let guarded = eta.clamp(-ETA_CLAMP, ETA_CLAMP);
        match self {
            Self::Logit => 1.0 / (1.0 + (-guarded).exp()),
            Self::CLogLog => -(-guarded.exp()).exp_m1(),
            Self::Identity => eta,
            Self::Log => guarded.exp(),
        }
    }

    pub fn inverse_derivative(self, eta: f64) -> f64 {
        let guarded = eta.clamp(-ETA_CLAMP, ETA_CLAMP);
        match self {
            Self::Logit => {
                let p = Self::Logit.inverse(guarded);
                p * (1.0 - p)
            }
            Self::CLogLog => (guarded - guarded.exp()).exp(),
            Self::Identity => 1.0,
            Self::Log => guarded.exp(),
        }
    }

    pub fn inverse_second_derivative(self, eta: f64) -> f64 {
        let guarded = eta.clamp(-ETA_CLAMP, ETA_CLAMP);
        match self {
            Self::Logit => {
                let p = Self::Logit.inverse(guarded);
                p * (1.0 - p) * (1.0 - 2.0 * p)
            }
            Self::CLogLog => Self::CLogLog.inverse_derivative(guarded) * (1.0 - guarded.exp()),
            Self::Identity => 0.0,
            Self::Log => guarded.exp(),
        }
    }

    /// Whether the link maps onto a probability.
    pub fn is_probability(self) -> bool {
        matches!(self, Self::Logit | Self::CLogLog)
    }
}

/// Shape of the inner predictor `η`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InnerPredictor {
    /// `η = fixed + u`
    Linear,
    /// `η = fixed + I·exp(event + u)`, where `I` flags an occurring event.
    EventInteraction { indicator: f64 },
}

impl InnerPredictor {
    pub fn eta(&self, point: &LinkPoint) -> f64 {
        match *self {
            Self::Linear => point.fixed_part + point.random_effect,
            Self::EventInteraction { indicator } => {
                point.fixed_part
                    + indicator * (point.event_parameter + point.random_effect).exp()
            }
        }
    }

    /// False when `η` cannot change with the random effect, e.g. no event this period.
    pub fn depends_on_random_effect(&self) -> bool {
        match *self {
            Self::Linear => true,
            Self::EventInteraction { indicator } => indicator != 0.0,
        }
    }

    fn gradient(&self, point: &LinkPoint) -> [f64; 3] {
        match *self {
            Self::Linear => [1.0, 0.0, 1.0],
            Self::EventInteraction { indicator } => {
                let term = indicator * (point.event_parameter + point.random_effect).exp();
                [1.0, term, term]
            }
        }
    }

    fn hessian(&self, point: &LinkPoint) -> [[f64; 3]; 3] {
        match *self {
            Self::Linear => [[0.0; 3]; 3],
            Self::EventInteraction { indicator } => {
                let term = indicator * (point.event_parameter + point.random_effect).exp();
                [[0.0, 0.0, 0.0], [0.0, term, term], [0.0, term, term]]
            }
        }
    }
}

/// The variables an evaluation is made at.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LinkPoint {
    pub fixed_part: f64,
    pub event_parameter: f64,
    pub random_effect: f64,
}

impl LinkPoint {
    pub fn new(fixed_part: f64, event_parameter: f64, random_effect: f64) -> Self {
        Self {
            fixed_part,
            event_parameter,
            random_effect,
        }
    }

    pub fn with_random_effect(self, random_effect: f64) -> Self {
        Self {
            random_effect,
            ..self
        }
    }
}

/// Evaluates `g⁻¹(η(point))` and its derivatives.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinkFunctionEvaluator {
    link: LinkFunction,
    inner: InnerPredictor,
}

impl LinkFunctionEvaluator {
    pub fn new(link: LinkFunction, inner: InnerPredictor) -> Self {
        Self { link, inner }
    }

    pub fn link(&self) -> LinkFunction {
        self.link
    }

    pub fn inner(&self) -> InnerPredictor {
        self.inner
    }

    pub fn value(&self, point: &LinkPoint) -> f64 {
        self.link.inverse(self.inner.eta(point))
    }

    /// Gradient with respect to `(fixed part, event parameter, random effect)`.
    pub fn gradient(&self, point: &LinkPoint) -> Array1<f64> {
        let d1 = self.link.inverse_derivative(self.inner.eta(point));
        Array1::from_iter(self.inner.gradient(point).iter().map(|&g| d1 * g))
    }

    /// Hessian with respect to `(fixed part, event parameter, random effect)`.
    pub fn hessian(&self, point: &LinkPoint) -> Array2<f64> {
        let eta = self.inner.eta(point);
        let d1 = self.link.inverse_derivative(eta);
        let d2 = self.link.inverse_second_derivative(eta);
        let g = self.inner.gradient(point);
        let h = self.inner.hessian(point);
        Array2::from_shape_fn((3, 3), |(i, j)| d2 * g[i] * g[j] + d1 * h[i][j])
    }

    /// `E[g⁻¹(η)]` over `u ~ N(point.random_effect, std_dev²)`.
    ///
    /// When the random effect cannot move `η` the integral is skipped and the
    /// link is evaluated with the random effect fixed at zero.
    pub fn marginal_value(
        &self,
        point: &LinkPoint,
        std_dev: f64,
        quadrature: &QuadratureMarginalizer,
    ) -> f64 {
        if !self.inner.depends_on_random_effect() {
            return self.value(&point.with_random_effect(0.0));
        }
        quadrature.expectation(point.random_effect, std_dev, |u| {
            self.value(&point.with_random_effect(u))
        })
    }

    /// First-order standard error of the prediction given the variance of the fixed part.
    pub fn delta_method_std_error(&self, point: &LinkPoint, fixed_part_variance: f64) -> f64 {
        let slope = self.gradient(point)[FIXED_PART];
        slope.abs() * fixed_part_variance.max(0.0).sqrt()
    }

    /// Second-order approximation of the mean and variance of the prediction
    /// when the evaluation point is uncertain with the given 3x3 covariance.
    pub fn propagate_uncertainty(&self, point: &LinkPoint, covariance: &Array2<f64>) -> (f64, f64) {
        let gradient = self.gradient(point);
        let hessian = self.hessian(point);
        let mean = self.value(point) + 0.5 * (&hessian * covariance).sum();
        let variance = gradient.dot(&covariance.dot(&gradient));
        (mean, variance.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;

    const LINKS: [LinkFunction; 4] = [
        LinkFunction::Logit,
        LinkFunction::CLogLog,
        LinkFunction::Identity,
        LinkFunction::Log,
    ];

    fn shifted(point: &LinkPoint, index: usize, h: f64) -> LinkPoint {
        let mut p = *point;
        match index {
            FIXED_PART => p.fixed_part += h,
            EVENT_PARAMETER => p.event_parameter += h,
            _ => p.random_effect += h,
        }
        p
    }

    fn evaluators() -> Vec<LinkFunctionEvaluator> {
        let mut out = Vec::new();
        for link in LINKS {
            out.push(LinkFunctionEvaluator::new(link, InnerPredictor::Linear));
            out.push(LinkFunctionEvaluator::new(
                link,
                InnerPredictor::EventInteraction { indicator: 1.0 },
            ));
        }
        out
    }

    #[test]
    fn inverse_links_match_closed_forms() {
        assert_relative_eq!(LinkFunction::Logit.inverse(0.0), 0.5);
        assert_relative_eq!(
            LinkFunction::CLogLog.inverse(0.0),
            1.0 - (-1.0f64).exp(),
            epsilon = 1e-12
        );
        assert_eq!(LinkFunction::Identity.inverse(2.5), 2.5);
        assert_relative_eq!(LinkFunction::Log.inverse(1.0), std::f64::consts::E, epsilon = 1e-12);
        assert!(LinkFunction::CLogLog.inverse(800.0) <= 1.0);
        assert!(LinkFunction::Logit.inverse(-800.0) >= 0.0);
    }

    #[test]
    fn identity_link_is_exact_for_large_predictors() {
        let evaluator = LinkFunctionEvaluator::new(LinkFunction::Identity, InnerPredictor::Linear);
        let point = LinkPoint::new(1000.0, 0.0, 0.0);
        assert_eq!(evaluator.value(&point), 1000.0);
        assert_eq!(evaluator.gradient(&point)[FIXED_PART], 1.0);
        assert_eq!(LinkFunction::Identity.inverse(-1500.0), -1500.0);
    }

    #[test]
    fn gradient_matches_finite_differences() {
        let point = LinkPoint::new(-1.2, -0.4, 0.3);
        let h = 1e-6;
        for evaluator in evaluators() {
            let gradient = evaluator.gradient(&point);
            for k in 0..3 {
                let numeric = (evaluator.value(&shifted(&point, k, h))
                    - evaluator.value(&shifted(&point, k, -h)))
                    / (2.0 * h);
                assert_relative_eq!(gradient[k], numeric, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn hessian_matches_finite_differences() {
        let point = LinkPoint::new(-0.8, -0.2, 0.1);
        let h = 1e-5;
        for evaluator in evaluators() {
            let hessian = evaluator.hessian(&point);
            for i in 0..3 {
                for j in 0..3 {
                    let numeric = (evaluator.gradient(&shifted(&point, j, h))[i]
                        - evaluator.gradient(&shifted(&point, j, -h))[i])
                        / (2.0 * h);
                    assert_relative_eq!(hessian[[i, j]], numeric, epsilon = 1e-6);
                }
            }
        }
    }

    #[test]
    fn event_term_vanishes_without_event() {
        let evaluator = LinkFunctionEvaluator::new(
            LinkFunction::CLogLog,
            InnerPredictor::EventInteraction { indicator: 0.0 },
        );
        let point = LinkPoint::new(-2.0, 1.5, 0.8);
        assert_relative_eq!(evaluator.value(&point), LinkFunction::CLogLog.inverse(-2.0));
        assert_eq!(evaluator.gradient(&point)[EVENT_PARAMETER], 0.0);
    }

    #[test]
    fn marginalization_is_skipped_when_random_effect_is_inert() {
        let quadrature = QuadratureMarginalizer::new(15).unwrap();
        let evaluator = LinkFunctionEvaluator::new(
            LinkFunction::CLogLog,
            InnerPredictor::EventInteraction { indicator: 0.0 },
        );
        let point = LinkPoint::new(-2.0, 0.5, 0.0);
        let marginal = evaluator.marginal_value(&point, 3.0, &quadrature);
        assert_eq!(marginal, evaluator.value(&point));
    }

    #[test]
    fn marginalization_raises_event_probability_under_convex_event_term() {
        let quadrature = QuadratureMarginalizer::new(15).unwrap();
        let evaluator = LinkFunctionEvaluator::new(
            LinkFunction::CLogLog,
            InnerPredictor::EventInteraction { indicator: 1.0 },
        );
        let point = LinkPoint::new(-3.0, -1.0, 0.0);
        let conditional = evaluator.value(&point);
        let marginal = evaluator.marginal_value(&point, 1.0, &quadrature);
        assert!(marginal > conditional);
    }

    #[test]
    fn delta_method_scales_with_link_slope() {
        let evaluator = LinkFunctionEvaluator::new(LinkFunction::Logit, InnerPredictor::Linear);
        let point = LinkPoint::new(0.0, 0.0, 0.0);
        assert_relative_eq!(
            evaluator.delta_method_std_error(&point, 0.04),
            0.25 * 0.2,
            epsilon = 1e-12
        );
    }

    #[test]
    fn propagation_is_exact_for_identity_link() {
        let evaluator = LinkFunctionEvaluator::new(LinkFunction::Identity, InnerPredictor::Linear);
        let point = LinkPoint::new(2.0, 0.0, 0.5);
        let cov = array![[0.1, 0.0, 0.02], [0.0, 0.0, 0.0], [0.02, 0.0, 0.3]];
        let (mean, variance) = evaluator.propagate_uncertainty(&point, &cov);
        assert_relative_eq!(mean, 2.5);
        assert_relative_eq!(variance, 0.1 + 0.3 + 2.0 * 0.02, epsilon = 1e-12);
    }
}
