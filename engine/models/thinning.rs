//! Probability that a plot is thinned or harvested over a growth step.
//!
//! Plot-level logistic model. Plots of the same calendar year share a year
//! random effect, integrated out by quadrature in deterministic mode.

use crate::config::PredictorConfig;
use crate::design::{Covariate, Term, TermRecipe};
use crate::link::{InnerPredictor, LinkFunction, LinkFunctionEvaluator, LinkPoint};
use crate::params::ParameterStore;
use crate::predictor::{
    EventPredictor, MixedEffectsEngine, PredictionOptions, PredictorError, ProbabilityOutcome,
};
use crate::types::{HierarchicalLevel, Stand, Tree};

pub const PARAMETER_PREFIX: &str = "thinning";

pub fn thinning_recipe() -> TermRecipe {
    TermRecipe::new(vec![
        Term::Intercept,
        Term::Covariate(Covariate::BasalAreaM2Ha),
        Term::Covariate(Covariate::NumberOfStemsHa),
        Term::Covariate(Covariate::LatitudeDeg),
        Term::Offset(Covariate::LogGrowthStepLength),
    ])
}

#[derive(Debug)]
pub struct ThinningPredictor {
    engine: MixedEffectsEngine,
    evaluator: LinkFunctionEvaluator,
}

impl ThinningPredictor {
    pub fn new(parameters: ParameterStore, config: PredictorConfig) -> Result<Self, PredictorError> {
        Ok(Self {
            engine: MixedEffectsEngine::new("thinning", thinning_recipe(), parameters, config)?,
            evaluator: LinkFunctionEvaluator::new(LinkFunction::Logit, InnerPredictor::Linear),
        })
    }
}

impl EventPredictor for ThinningPredictor {
    fn engine(&self) -> &MixedEffectsEngine {
        &self.engine
    }

    /// The tree argument is ignored; the model is plot-level.
    fn predict_event_probability(
        &self,
        stand: &dyn Stand,
        _tree: Option<&dyn Tree>,
        options: &PredictionOptions,
    ) -> Result<ProbabilityOutcome, PredictorError> {
        let engine = &self.engine;
        let group = engine.group(options)?;
        let beta = engine.coefficients(group, stand);
        let fixed = engine.fixed_part(stand, None, options, &beta)?;
        let year = stand.year_id();

        let probability = if engine.config().random_effect_variability {
            let u = engine.random_effect(
                group,
                HierarchicalLevel::Year,
                &year,
                stand.monte_carlo_realization_id(),
            )?;
            self.evaluator.value(&LinkPoint::new(fixed, 0.0, u))
        } else {
            let (mean, std_dev) =
                engine.random_effect_distribution(group, HierarchicalLevel::Year, &year)?;
            self.evaluator.marginal_value(
                &LinkPoint::new(fixed, 0.0, mean),
                std_dev,
                engine.quadrature(),
            )
        };
        Ok(ProbabilityOutcome::from_raw(probability))
    }
}
