//! Tree mortality over a growth step.
//!
//! Complementary log-log model with a plot random effect and a harvest term
//! that enters nonlinearly: `η = xβ + u_plot + I_harvest·exp(β_h + u_interval)`.
//! `β_h` occupies a skipped column of the design row. In deterministic mode
//! both random effects are integrated out by nested Gauss-Hermite quadrature;
//! the inner integral disappears when the stand is not harvested.

use super::SPECIES_CATEGORIES;
use crate::config::PredictorConfig;
use crate::design::{Covariate, CovariateContext, Term, TermRecipe};
use crate::link::{InnerPredictor, LinkFunction, LinkFunctionEvaluator, LinkPoint};
use crate::params::ParameterStore;
use crate::predictor::{
    EventPredictor, MixedEffectsEngine, PredictionOptions, PredictorError, ProbabilityOutcome,
};
use crate::types::{HierarchicalLevel, Stand, StandEvent, Tree};

pub const PARAMETER_PREFIX: &str = "mortality";

pub fn mortality_recipe() -> TermRecipe {
    TermRecipe::new(vec![
        Term::Intercept,
        Term::SpeciesDummies {
            categories: SPECIES_CATEGORIES,
        },
        Term::Covariate(Covariate::LogDbh),
        Term::Covariate(Covariate::DbhCm),
        Term::Covariate(Covariate::BasalAreaLargerThanSubject),
        Term::Covariate(Covariate::BasalAreaM2Ha),
        Term::Event(StandEvent::Windstorm),
        Term::Event(StandEvent::Drought),
        // harvest parameter, used inside the exponential
        Term::Skip,
        Term::Offset(Covariate::LogGrowthStepLength),
    ])
}

#[derive(Debug)]
pub struct MortalityPredictor {
    engine: MixedEffectsEngine,
    harvest_column: usize,
}

impl MortalityPredictor {
    pub fn new(parameters: ParameterStore, config: PredictorConfig) -> Result<Self, PredictorError> {
        let recipe = mortality_recipe();
        let harvest_column = recipe.skipped_column(0)?;
        Ok(Self {
            engine: MixedEffectsEngine::new("mortality", recipe, parameters, config)?,
            harvest_column,
        })
    }
}

impl EventPredictor for MortalityPredictor {
    fn engine(&self) -> &MixedEffectsEngine {
        &self.engine
    }

    fn predict_event_probability(
        &self,
        stand: &dyn Stand,
        tree: Option<&dyn Tree>,
        options: &PredictionOptions,
    ) -> Result<ProbabilityOutcome, PredictorError> {
        let engine = &self.engine;
        let tree = tree.ok_or(PredictorError::MissingTree {
            model: engine.model(),
        })?;
        let group = engine.group(options)?;
        let beta = engine.coefficients(group, stand);
        let fixed = engine.fixed_part(stand, Some(tree), options, &beta)?;

        let indicator = CovariateContext::new(stand, Some(tree))
            .with_disabled_events(&options.disabled_events)
            .event_indicator(StandEvent::Harvest);
        let evaluator = LinkFunctionEvaluator::new(
            LinkFunction::CLogLog,
            InnerPredictor::EventInteraction { indicator },
        );
        let harvest_parameter = beta[self.harvest_column];
        let harvested = indicator != 0.0;
        let plot_id = stand.subject_id();
        let realization = stand.monte_carlo_realization_id();

        let probability = if engine.config().random_effect_variability {
            let u_plot = engine.random_effect(group, HierarchicalLevel::Plot, plot_id, realization)?;
            let u_interval = if harvested {
                engine.random_effect(
                    group,
                    HierarchicalLevel::Interval,
                    &stand.interval_id(),
                    realization,
                )?
            } else {
                0.0
            };
            evaluator.value(&LinkPoint::new(fixed + u_plot, harvest_parameter, u_interval))
        } else {
            let (plot_mean, plot_sd) =
                engine.random_effect_distribution(group, HierarchicalLevel::Plot, plot_id)?;
            let (interval_mean, interval_sd) = if harvested {
                engine.random_effect_distribution(
                    group,
                    HierarchicalLevel::Interval,
                    &stand.interval_id(),
                )?
            } else {
                (0.0, 0.0)
            };
            let quadrature = engine.quadrature();
            quadrature.expectation(plot_mean, plot_sd, |u_plot| {
                let point = LinkPoint::new(fixed + u_plot, harvest_parameter, interval_mean);
                evaluator.marginal_value(&point, interval_sd, quadrature)
            })
        };
        Ok(ProbabilityOutcome::from_raw(probability))
    }
}
