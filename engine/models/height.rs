//! Height-diameter relationship.
//!
//! `height = 1.3 + xβ + u_plot + ε`. When some trees of a plot were measured,
//! the plot random effect is replaced by its BLUP given their residuals.

use super::SPECIES_CATEGORIES;
use crate::blup::{
    BlupEngine, Covariogram, GeoLocation, NewSubject, ReferenceObservation, ReferencePanel,
    UncertaintyCorrection,
};
use crate::config::PredictorConfig;
use crate::design::{Covariate, Term, TermRecipe};
use crate::params::{Estimate, ParameterStore};
use crate::predictor::{
    GrowthPredictor, MixedEffectsEngine, PredictionOptions, PredictorError, step_key,
};
use crate::types::{Coefficients, HierarchicalLevel, Stand, Tree};
use ndarray::Array1;
use std::sync::Arc;

pub const PARAMETER_PREFIX: &str = "height";

/// Height of the diameter measurement, m.
pub const BREAST_HEIGHT_M: f64 = 1.3;

pub fn height_recipe() -> TermRecipe {
    TermRecipe::new(vec![
        Term::Intercept,
        Term::SpeciesDummies {
            categories: SPECIES_CATEGORIES,
        },
        Term::Covariate(Covariate::LogDbh),
        Term::SpeciesInteraction {
            categories: SPECIES_CATEGORIES,
            covariate: Covariate::LogDbh,
        },
        Term::Covariate(Covariate::BasalAreaM2Ha),
    ])
}

#[derive(Debug)]
pub struct HeightPredictor {
    engine: MixedEffectsEngine,
}

impl HeightPredictor {
    pub fn new(parameters: ParameterStore, config: PredictorConfig) -> Result<Self, PredictorError> {
        Ok(Self {
            engine: MixedEffectsEngine::new("height", height_recipe(), parameters, config)?,
        })
    }

    /// Estimates the plot random effect from the measured trees of the plot.
    ///
    /// Residuals are taken against the mean coefficients of the selected
    /// group. Returns `None` when no tree carries a height.
    pub fn calibrate_plot(
        &self,
        stand: &dyn Stand,
        trees: &[&dyn Tree],
        options: &PredictionOptions,
    ) -> Result<Option<Estimate>, PredictorError> {
        let engine = &self.engine;
        let group = engine.group(options)?;
        let beta = Coefficients::new(group.fixed_effects().mean().clone());
        let location = GeoLocation::new(stand.latitude_deg(), stand.longitude_deg());

        let mut observations = Vec::new();
        for tree in trees {
            let Some(height) = tree.height_m() else {
                continue;
            };
            let predicted = BREAST_HEIGHT_M + engine.fixed_part(stand, Some(*tree), options, &beta)?;
            observations.push(ReferenceObservation {
                subject_id: stand.subject_id().to_string(),
                observation: tree.subject_id().to_string(),
                location,
                design: Array1::zeros(0),
                residual: height - predicted,
            });
        }
        if observations.is_empty() {
            return Ok(None);
        }

        let blup = BlupEngine::new(
            Arc::new(ReferencePanel::new(observations)?),
            Covariogram::Independent {
                variance: engine.random_effect_variance(group, HierarchicalLevel::Plot)?,
            },
            engine.residual_variance(group)?,
            UncertaintyCorrection::Omitted,
        )?;
        let estimate = blup.blup(&NewSubject::new(stand.subject_id(), location))?;
        engine
            .random_effects()
            .register_blup(HierarchicalLevel::Plot, stand.subject_id(), estimate.clone())?;
        log::debug!(
            "height: plot '{}' calibrated on {} trees, BLUP {:.3}",
            stand.subject_id(),
            blup.panel().len(),
            estimate.mean()[0]
        );
        Ok(Some(estimate))
    }
}

impl GrowthPredictor for HeightPredictor {
    fn engine(&self) -> &MixedEffectsEngine {
        &self.engine
    }

    /// Total height in m.
    fn predict_growth(
        &self,
        stand: &dyn Stand,
        tree: Option<&dyn Tree>,
        options: &PredictionOptions,
    ) -> Result<f64, PredictorError> {
        let engine = &self.engine;
        let tree = tree.ok_or(PredictorError::MissingTree {
            model: engine.model(),
        })?;
        let group = engine.group(options)?;
        let beta = engine.coefficients(group, stand);
        let fixed = engine.fixed_part(stand, Some(tree), options, &beta)?;
        let u = engine.random_effect(
            group,
            HierarchicalLevel::Plot,
            stand.subject_id(),
            stand.monte_carlo_realization_id(),
        )?;
        let e = engine.residual_error(
            &step_key(tree.subject_id(), stand),
            tree.monte_carlo_realization_id(),
            engine.residual_variance(group)?,
        );
        Ok(BREAST_HEIGHT_M + fixed + u + e)
    }
}
