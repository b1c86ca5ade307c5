//! Plot climate variable, e.g. mean annual temperature.
//!
//! Identity-link model whose plot random effect is spatially correlated. The
//! random effect of a plot is its BLUP against a reference panel of
//! weather-station residuals, with the variance inflated for the error of the
//! fixed effects.

use crate::blup::{
    BlupEngine, Covariogram, GeoLocation, NewSubject, ReferencePanel, UncertaintyCorrection,
};
use crate::config::PredictorConfig;
use crate::design::{Covariate, Term, TermRecipe};
use crate::params::{ExclusionSelector, ParameterStore};
use crate::predictor::{
    GrowthPredictor, MixedEffectsEngine, PredictionOptions, PredictorError, step_key,
};
use crate::types::{HierarchicalLevel, Stand, Tree};
use std::sync::Arc;

pub const PARAMETER_PREFIX: &str = "climate";

pub fn climate_recipe() -> TermRecipe {
    TermRecipe::new(vec![
        Term::Intercept,
        Term::Covariate(Covariate::LatitudeDeg),
        Term::Covariate(Covariate::LongitudeDeg),
        Term::Covariate(Covariate::ElevationM),
        Term::Covariate(Covariate::DateYr),
    ])
}

#[derive(Debug)]
pub struct ClimatePredictor {
    engine: MixedEffectsEngine,
    blup: BlupEngine,
}

impl ClimatePredictor {
    /// The kriging setup comes from the default parameter group.
    pub fn new(
        parameters: ParameterStore,
        panel: Option<Arc<ReferencePanel>>,
        config: PredictorConfig,
    ) -> Result<Self, PredictorError> {
        let panel = panel.ok_or(PredictorError::MissingReferencePanel { model: "climate" })?;
        let engine = MixedEffectsEngine::new("climate", climate_recipe(), parameters, config)?;
        let group = engine.parameters().group(ExclusionSelector::Default)?;
        let variance = engine.random_effect_variance(group, HierarchicalLevel::Plot)?;
        let range_km = group.variance_components().spatial_range_km().ok_or(
            PredictorError::MissingVarianceComponent {
                model: "climate",
                group: group.id(),
                component: "range",
            },
        )?;
        let residual_variance = engine.residual_variance(group)?;
        let omega = group.fixed_effects().variance().clone();
        let blup = BlupEngine::new(
            panel,
            Covariogram::Spherical { variance, range_km },
            residual_variance,
            UncertaintyCorrection::Inflated(omega),
        )?;
        Ok(Self { engine, blup })
    }

    fn new_subject(stand: &dyn Stand) -> NewSubject {
        NewSubject::new(
            stand.subject_id(),
            GeoLocation::new(stand.latitude_deg(), stand.longitude_deg()),
        )
    }

    /// Solves the BLUPs of every plot not seen before in one system.
    pub fn prepare(&self, stands: &[&dyn Stand]) -> Result<(), PredictorError> {
        let store = self.engine.random_effects();
        let pending: Vec<NewSubject> = stands
            .iter()
            .filter(|s| store.blup(HierarchicalLevel::Plot, s.subject_id()).is_none())
            .map(|s| Self::new_subject(*s))
            .collect();
        if pending.is_empty() {
            return Ok(());
        }
        for (subject, estimate) in pending.iter().zip(self.blup.predict(&pending)?) {
            store.register_blup(HierarchicalLevel::Plot, &subject.subject_id, estimate)?;
        }
        Ok(())
    }

    pub fn predict_batch(
        &self,
        stands: &[&dyn Stand],
        options: &PredictionOptions,
    ) -> Result<Vec<f64>, PredictorError> {
        self.prepare(stands)?;
        stands
            .iter()
            .map(|stand| self.predict_growth(*stand, None, options))
            .collect()
    }
}

impl GrowthPredictor for ClimatePredictor {
    fn engine(&self) -> &MixedEffectsEngine {
        &self.engine
    }

    fn predict_growth(
        &self,
        stand: &dyn Stand,
        _tree: Option<&dyn Tree>,
        options: &PredictionOptions,
    ) -> Result<f64, PredictorError> {
        let engine = &self.engine;
        self.prepare(&[stand])?;
        let group = engine.group(options)?;
        let beta = engine.coefficients(group, stand);
        let fixed = engine.fixed_part(stand, None, options, &beta)?;
        let realization = stand.monte_carlo_realization_id();
        let u = engine.random_effect(group, HierarchicalLevel::Plot, stand.subject_id(), realization)?;
        let residual_variance = engine.residual_variance(group)?;
        let e = engine.residual_error(
            &step_key(stand.subject_id(), stand),
            realization,
            residual_variance,
        );
        Ok(fixed + u + e)
    }
}
