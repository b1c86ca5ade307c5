//! Shared machinery of the mixed-effects predictors.
//!
//! Every model owns one [`MixedEffectsEngine`], which bundles the term recipe,
//! the parameter groups, the coefficient sampler, the random-effect store and
//! the quadrature rule. The models only decide how these pieces combine into a
//! prediction.

use crate::blup::BlupError;
use crate::config::{ConfigError, PredictorConfig};
use crate::data::DataError;
use crate::design::{CovariateContext, DesignError, TermRecipe};
use crate::params::{ExclusionSelector, ParameterError, ParameterGroup, ParameterStore};
use crate::quadrature::{QuadratureError, QuadratureMarginalizer};
use crate::random_effects::RandomEffectStore;
use crate::sampler::StochasticParameterSampler;
use crate::streams::{StreamTag, stream_rng};
use crate::types::{Coefficients, HierarchicalLevel, Stand, StandEvent, Subject, Tree};
use rand::Rng;
use rand_distr::StandardNormal;
use thiserror::Error;

/// Probabilities within this distance of `[0, 1]` are clamped instead of
/// being reported out of domain.
const PROBABILITY_TOLERANCE: f64 = 1e-12;

#[derive(Error, Debug)]
pub enum PredictorError {
    #[error("Parameter error: {0}")]
    Parameter(#[from] ParameterError),
    #[error("Design error: {0}")]
    Design(#[from] DesignError),
    #[error("BLUP error: {0}")]
    Blup(#[from] BlupError),
    #[error("Quadrature error: {0}")]
    Quadrature(#[from] QuadratureError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Data error: {0}")]
    Data(#[from] DataError),
    #[error("The {model} model predicts trees but no tree was supplied.")]
    MissingTree { model: &'static str },
    #[error("Parameter group {group} of the {model} model has no '{component}' variance.")]
    MissingVarianceComponent {
        model: &'static str,
        group: u32,
        component: &'static str,
    },
    #[error("The {model} model needs a reference panel.")]
    MissingReferencePanel { model: &'static str },
}

/// Per-call options of a prediction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PredictionOptions {
    pub selector: ExclusionSelector,
    /// Events treated as not occurring, for counterfactual sub-predictions.
    pub disabled_events: Vec<StandEvent>,
}

impl PredictionOptions {
    pub fn for_group(group: u32) -> Self {
        Self {
            selector: ExclusionSelector::ExclusionGroup(group),
            ..Self::default()
        }
    }

    pub fn without_event(mut self, event: StandEvent) -> Self {
        if !self.disabled_events.contains(&event) {
            self.disabled_events.push(event);
        }
        self
    }
}

/// An event probability, or the raw value when the model left `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProbabilityOutcome {
    Valid(f64),
    OutOfDomain(f64),
}

impl ProbabilityOutcome {
    pub fn from_raw(p: f64) -> Self {
        if !p.is_finite() || p < -PROBABILITY_TOLERANCE || p > 1.0 + PROBABILITY_TOLERANCE {
            Self::OutOfDomain(p)
        } else {
            Self::Valid(p.clamp(0.0, 1.0))
        }
    }

    pub fn probability(self) -> Option<f64> {
        match self {
            Self::Valid(p) => Some(p),
            Self::OutOfDomain(_) => None,
        }
    }

    pub fn is_valid(self) -> bool {
        matches!(self, Self::Valid(_))
    }
}

/// Result of [`EventPredictor::predict_event`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum EventOutcome {
    /// A Bernoulli draw, made when residual variability is enabled.
    Drawn(bool),
    /// The probability itself, when residual variability is disabled.
    Expected(f64),
    OutOfDomain(f64),
}

/// Identifies the draws of one subject over one growth step.
pub(crate) fn step_key(subject_id: &str, stand: &dyn Stand) -> String {
    format!("{}@{}", subject_id, stand.date_yr())
}

pub trait EventPredictor: Send + Sync {
    fn engine(&self) -> &MixedEffectsEngine;

    fn predict_event_probability(
        &self,
        stand: &dyn Stand,
        tree: Option<&dyn Tree>,
        options: &PredictionOptions,
    ) -> Result<ProbabilityOutcome, PredictorError>;

    /// Probability, or a discrete outcome drawn from it when residual
    /// variability is enabled.
    fn predict_event(
        &self,
        stand: &dyn Stand,
        tree: Option<&dyn Tree>,
        options: &PredictionOptions,
    ) -> Result<EventOutcome, PredictorError> {
        let p = match self.predict_event_probability(stand, tree, options)? {
            ProbabilityOutcome::Valid(p) => p,
            ProbabilityOutcome::OutOfDomain(raw) => return Ok(EventOutcome::OutOfDomain(raw)),
        };
        let engine = self.engine();
        if !engine.config().residual_variability {
            return Ok(EventOutcome::Expected(p));
        }
        let (subject_id, realization) = match tree {
            Some(tree) => (tree.subject_id(), tree.monte_carlo_realization_id()),
            None => (stand.subject_id(), stand.monte_carlo_realization_id()),
        };
        let uniform =
            engine.uniform_draw(StreamTag::Event, &step_key(subject_id, stand), realization);
        Ok(EventOutcome::Drawn(uniform < p))
    }
}

pub trait GrowthPredictor: Send + Sync {
    fn engine(&self) -> &MixedEffectsEngine;

    fn predict_growth(
        &self,
        stand: &dyn Stand,
        tree: Option<&dyn Tree>,
        options: &PredictionOptions,
    ) -> Result<f64, PredictorError>;
}

/// Parameters, caches and quadrature rule shared by one model's predictions.
#[derive(Debug)]
pub struct MixedEffectsEngine {
    model: &'static str,
    recipe: TermRecipe,
    parameters: ParameterStore,
    sampler: StochasticParameterSampler,
    random_effects: RandomEffectStore,
    quadrature: QuadratureMarginalizer,
    config: PredictorConfig,
}

impl MixedEffectsEngine {
    /// Fails when any parameter group disagrees with the recipe's width.
    pub fn new(
        model: &'static str,
        recipe: TermRecipe,
        parameters: ParameterStore,
        config: PredictorConfig,
    ) -> Result<Self, PredictorError> {
        config.validate()?;
        for group in parameters.groups() {
            recipe.check_coefficients(group.num_coefficients())?;
        }
        let quadrature = QuadratureMarginalizer::new(config.quadrature_nodes)?;
        log::debug!(
            "{model}: {} design columns, {}-point quadrature, variability parameters={} random effects={} residual={}",
            recipe.width(),
            config.quadrature_nodes,
            config.parameter_variability,
            config.random_effect_variability,
            config.residual_variability
        );
        Ok(Self {
            model,
            recipe,
            parameters,
            sampler: StochasticParameterSampler::new(config.sampling_mode(), config.seed),
            random_effects: RandomEffectStore::new(config.seed),
            quadrature,
            config,
        })
    }

    pub fn model(&self) -> &'static str {
        self.model
    }

    pub fn recipe(&self) -> &TermRecipe {
        &self.recipe
    }

    pub fn parameters(&self) -> &ParameterStore {
        &self.parameters
    }

    pub fn random_effects(&self) -> &RandomEffectStore {
        &self.random_effects
    }

    pub fn quadrature(&self) -> &QuadratureMarginalizer {
        &self.quadrature
    }

    pub fn config(&self) -> &PredictorConfig {
        &self.config
    }

    pub fn group(&self, options: &PredictionOptions) -> Result<&ParameterGroup, PredictorError> {
        Ok(self.parameters.group(options.selector)?)
    }

    /// Coefficients for the subject's current realization.
    pub fn coefficients<S: Subject + ?Sized>(
        &self,
        group: &ParameterGroup,
        subject: &S,
    ) -> Coefficients {
        self.sampler.draw(group, subject)
    }

    pub fn fixed_part(
        &self,
        stand: &dyn Stand,
        tree: Option<&dyn Tree>,
        options: &PredictionOptions,
        coefficients: &Coefficients,
    ) -> Result<f64, PredictorError> {
        let context =
            CovariateContext::new(stand, tree).with_disabled_events(&options.disabled_events);
        let row = self.recipe.build_row(&context)?;
        Ok(self.recipe.fixed_effect(&row, coefficients)?)
    }

    pub fn random_effect_variance(
        &self,
        group: &ParameterGroup,
        level: HierarchicalLevel,
    ) -> Result<f64, PredictorError> {
        group
            .variance_components()
            .random_effect_variance(level)
            .ok_or(PredictorError::MissingVarianceComponent {
                model: self.model,
                group: group.id(),
                component: level.parameter_name(),
            })
    }

    pub fn residual_variance(&self, group: &ParameterGroup) -> Result<f64, PredictorError> {
        group
            .variance_components()
            .residual_variance()
            .ok_or(PredictorError::MissingVarianceComponent {
                model: self.model,
                group: group.id(),
                component: "residual",
            })
    }

    /// Mean and standard deviation of a subject's random effect as the
    /// deterministic mode sees it: the BLUP when one is known, else N(0, σ²).
    pub fn random_effect_distribution(
        &self,
        group: &ParameterGroup,
        level: HierarchicalLevel,
        subject_id: &str,
    ) -> Result<(f64, f64), PredictorError> {
        match self.random_effects.blup(level, subject_id) {
            Some(blup) => Ok((blup.mean()[0], blup.variance()[[0, 0]].max(0.0).sqrt())),
            None => Ok((0.0, self.random_effect_variance(group, level)?.sqrt())),
        }
    }

    /// The realized random effect when random-effect variability is enabled,
    /// the estimated one (BLUP mean or zero) otherwise.
    pub fn random_effect(
        &self,
        group: &ParameterGroup,
        level: HierarchicalLevel,
        subject_id: &str,
        realization: u32,
    ) -> Result<f64, PredictorError> {
        if self.config.random_effect_variability {
            let variance = match self.random_effects.blup(level, subject_id) {
                Some(_) => 0.0,
                None => self.random_effect_variance(group, level)?,
            };
            Ok(self
                .random_effects
                .deviate(level, subject_id, realization, variance))
        } else {
            Ok(self.random_effects.random_effect(level, subject_id))
        }
    }

    /// A N(0, `variance`) residual error; zero unless residual variability is enabled.
    pub fn residual_error(&self, key: &str, realization: u32, variance: f64) -> f64 {
        if !self.config.residual_variability {
            return 0.0;
        }
        let mut rng = stream_rng(self.config.seed, StreamTag::Residual, key, realization);
        let z: f64 = rng.sample(StandardNormal);
        variance.max(0.0).sqrt() * z
    }

    pub fn uniform_draw(&self, tag: StreamTag, key: &str, realization: u32) -> f64 {
        let mut rng = stream_rng(self.config.seed, tag, key, realization);
        rng.gen_range(0.0..1.0)
    }

    /// Drops simulated draws. BLUPs survive.
    pub fn reset(&self) {
        self.sampler.reset();
        self.random_effects.reset();
    }
}
