//! Diameter increment over a growth step.
//!
//! `log(Δd + 1) = xβ + u_plot + u_tree + ε`. Any of the three Gaussian terms
//! that is not simulated is folded into the exact lognormal expectation
//! `exp(μ + σ²/2) − 1`.

use super::SPECIES_CATEGORIES;
use crate::config::PredictorConfig;
use crate::design::{Covariate, Term, TermRecipe};
use crate::params::ParameterStore;
use crate::predictor::{
    GrowthPredictor, MixedEffectsEngine, PredictionOptions, PredictorError, step_key,
};
use crate::types::{HierarchicalLevel, Stand, Tree};

pub const PARAMETER_PREFIX: &str = "increment";

pub fn increment_recipe() -> TermRecipe {
    TermRecipe::new(vec![
        Term::Intercept,
        Term::SpeciesDummies {
            categories: SPECIES_CATEGORIES,
        },
        Term::Covariate(Covariate::LogDbh),
        Term::Covariate(Covariate::DbhCm),
        Term::Covariate(Covariate::BasalAreaLargerThanSubject),
        Term::Covariate(Covariate::BasalAreaM2Ha),
        Term::Covariate(Covariate::LogGrowthStepLength),
    ])
}

#[derive(Debug)]
pub struct DiameterIncrementPredictor {
    engine: MixedEffectsEngine,
}

impl DiameterIncrementPredictor {
    pub fn new(parameters: ParameterStore, config: PredictorConfig) -> Result<Self, PredictorError> {
        Ok(Self {
            engine: MixedEffectsEngine::new("increment", increment_recipe(), parameters, config)?,
        })
    }
}

impl GrowthPredictor for DiameterIncrementPredictor {
    fn engine(&self) -> &MixedEffectsEngine {
        &self.engine
    }

    /// Diameter increment in cm over the stand's growth step.
    fn predict_growth(
        &self,
        stand: &dyn Stand,
        tree: Option<&dyn Tree>,
        options: &PredictionOptions,
    ) -> Result<f64, PredictorError> {
        let engine = &self.engine;
        let config = engine.config();
        let tree = tree.ok_or(PredictorError::MissingTree {
            model: engine.model(),
        })?;
        let group = engine.group(options)?;
        let beta = engine.coefficients(group, stand);
        let mut eta = engine.fixed_part(stand, Some(tree), options, &beta)?;
        let mut unsimulated_variance = 0.0;

        let subjects = [
            (HierarchicalLevel::Plot, stand.subject_id(), stand.monte_carlo_realization_id()),
            (HierarchicalLevel::Tree, tree.subject_id(), tree.monte_carlo_realization_id()),
        ];
        for (level, subject_id, realization) in subjects {
            if config.random_effect_variability {
                eta += engine.random_effect(group, level, subject_id, realization)?;
            } else {
                let (mean, std_dev) = engine.random_effect_distribution(group, level, subject_id)?;
                eta += mean;
                unsimulated_variance += std_dev * std_dev;
            }
        }

        let residual_variance = engine.residual_variance(group)?;
        if config.residual_variability {
            eta += engine.residual_error(
                &step_key(tree.subject_id(), stand),
                tree.monte_carlo_realization_id(),
                residual_variance,
            );
        } else {
            unsimulated_variance += residual_variance;
        }

        Ok((eta + 0.5 * unsimulated_variance).exp() - 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{PlotRecord, TreeRecord};
    use crate::models::testing::{mean_and_std, store};
    use crate::params::VarianceComponents;
    use approx::assert_relative_eq;

    const PLOT_VARIANCE: f64 = 0.05;
    const TREE_VARIANCE: f64 = 0.03;
    const RESIDUAL_VARIANCE: f64 = 0.02;

    fn parameters() -> ParameterStore {
        store(
            vec![-1.2, 0.1, -0.05, 0.15, 0.6, -0.01, -0.02, -0.01, 0.5],
            1e-4,
            VarianceComponents::new()
                .with_random_effect(HierarchicalLevel::Plot, PLOT_VARIANCE)
                .with_random_effect(HierarchicalLevel::Tree, TREE_VARIANCE)
                .with_residual(RESIDUAL_VARIANCE),
        )
    }

    fn subjects() -> (PlotRecord, TreeRecord) {
        let plot = PlotRecord::new("p1");
        let mut tree = TreeRecord::new("t1", "p1", 2, 18.0);
        tree.basal_area_larger_m2_ha = 10.0;
        (plot, tree)
    }

    fn grow(predictor: &DiameterIncrementPredictor, plot: &PlotRecord, tree: &TreeRecord) -> f64 {
        predictor
            .predict_growth(plot, Some(tree), &PredictionOptions::default())
            .unwrap()
    }

    #[test]
    fn deterministic_value_is_the_lognormal_mean() {
        let predictor =
            DiameterIncrementPredictor::new(parameters(), PredictorConfig::deterministic()).unwrap();
        let (plot, tree) = subjects();
        let beta = predictor
            .engine()
            .parameters()
            .group(Default::default())
            .unwrap()
            .fixed_effects()
            .mean()
            .clone();
        let eta = predictor
            .engine()
            .fixed_part(&plot, Some(&tree), &PredictionOptions::default(), &beta.into())
            .unwrap();
        let total = PLOT_VARIANCE + TREE_VARIANCE + RESIDUAL_VARIANCE;
        assert_relative_eq!(
            grow(&predictor, &plot, &tree),
            (eta + 0.5 * total).exp() - 1.0,
            epsilon = 1e-12
        );
        assert_eq!(grow(&predictor, &plot, &tree), grow(&predictor, &plot, &tree));
    }

    #[test]
    fn missing_residual_variance_is_a_configuration_error() {
        let parameters = store(
            vec![0.0; 9],
            1e-4,
            VarianceComponents::new()
                .with_random_effect(HierarchicalLevel::Plot, PLOT_VARIANCE)
                .with_random_effect(HierarchicalLevel::Tree, TREE_VARIANCE),
        );
        let predictor =
            DiameterIncrementPredictor::new(parameters, PredictorConfig::deterministic()).unwrap();
        let (plot, tree) = subjects();
        assert!(matches!(
            predictor.predict_growth(&plot, Some(&tree), &PredictionOptions::default()),
            Err(PredictorError::MissingVarianceComponent { component: "residual", .. })
        ));
    }

    #[test]
    fn stochastic_mean_converges_to_the_deterministic_value() {
        let deterministic =
            DiameterIncrementPredictor::new(parameters(), PredictorConfig::deterministic()).unwrap();
        let config = PredictorConfig {
            random_effect_variability: true,
            residual_variability: true,
            ..PredictorConfig::deterministic()
        };
        let stochastic = DiameterIncrementPredictor::new(parameters(), config).unwrap();
        let (mut plot, mut tree) = subjects();
        let expected = grow(&deterministic, &plot, &tree);
        let draws: Vec<f64> = (0..50_000u32)
            .map(|r| {
                plot.set_monte_carlo_realization_id(r);
                tree.set_monte_carlo_realization_id(r);
                grow(&stochastic, &plot, &tree)
            })
            .collect();
        let (mean, _) = mean_and_std(&draws);
        assert_relative_eq!(mean, expected, epsilon = 0.02);
    }

    #[test]
    fn tree_effect_is_shared_by_successive_steps() {
        let config = PredictorConfig {
            random_effect_variability: true,
            ..PredictorConfig::deterministic()
        };
        let predictor = DiameterIncrementPredictor::new(parameters(), config).unwrap();
        let (mut plot, tree) = subjects();
        let first = grow(&predictor, &plot, &tree);
        plot.date_yr += 10;
        let second = grow(&predictor, &plot, &tree);
        // same realization: only the residual could differ, and it is disabled
        assert_eq!(first, second);
    }
}
