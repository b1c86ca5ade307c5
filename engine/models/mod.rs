//! The concrete predictors. Each one is a term recipe, a link and a choice of
//! random effects wired through [`crate::predictor::MixedEffectsEngine`].

pub mod climate;
pub mod height;
pub mod increment;
pub mod mortality;
pub mod thinning;

pub use climate::ClimatePredictor;
pub use height::HeightPredictor;
pub use increment::DiameterIncrementPredictor;
pub use mortality::MortalityPredictor;
pub use thinning::ThinningPredictor;

/// Species groups shared by the tree-level models; group 0 is the baseline.
pub const SPECIES_CATEGORIES: usize = 4;
