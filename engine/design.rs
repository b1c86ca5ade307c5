//! # Linear Predictor Builder
//!
//! A model's fixed part is described by a [`TermRecipe`]: an ordered list of
//! terms whose widths add up to the length of the coefficient vector. Building
//! a design row walks the recipe with a running column pointer, so the order
//! of the terms is the implicit contract between the parameter files and the
//! design row.
//!
//! Rows are allocated per call. Nothing here holds mutable state, so one
//! recipe can serve any number of threads.

use crate::types::{Coefficients, DesignRow, Stand, StandEvent, Tree};
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum DesignError {
    #[error("The recipe produces {expected} design columns but {found} coefficients were supplied.")]
    DimensionMismatch { expected: usize, found: usize },
    #[error("Covariate {0:?} needs a tree but the prediction was made at the plot level.")]
    MissingTree(Covariate),
    #[error("The recipe has no skipped term number {0}.")]
    MissingSkippedTerm(usize),
    #[error("Species category {category} is outside the {categories} categories of the model.")]
    UnknownSpecies { category: usize, categories: usize },
}

/// Raw or transformed covariates. Transformations are evaluated on each call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Covariate {
    DbhCm,
    /// `ln(dbh + 1)`
    LogDbh,
    DbhSquared,
    BasalAreaM2Ha,
    BasalAreaLargerThanSubject,
    NumberOfStemsHa,
    LatitudeDeg,
    LongitudeDeg,
    ElevationM,
    DateYr,
    GrowthStepLengthYr,
    LogGrowthStepLength,
}

impl Covariate {
    pub fn value(self, context: &CovariateContext<'_>) -> Result<f64, DesignError> {
        let stand = context.stand;
        let value = match self {
            Self::DbhCm => context.tree(self)?.dbh_cm(),
            Self::LogDbh => (context.tree(self)?.dbh_cm() + 1.0).ln(),
            Self::DbhSquared => context.tree(self)?.dbh_cm().powi(2),
            Self::BasalAreaLargerThanSubject => {
                context.tree(self)?.basal_area_larger_than_subject_m2_ha()
            }
            Self::BasalAreaM2Ha => stand.basal_area_m2_ha(),
            Self::NumberOfStemsHa => stand.number_of_stems_ha(),
            Self::LatitudeDeg => stand.latitude_deg(),
            Self::LongitudeDeg => stand.longitude_deg(),
            Self::ElevationM => stand.elevation_m(),
            Self::DateYr => f64::from(stand.date_yr()),
            Self::GrowthStepLengthYr => stand.growth_step_length_yr(),
            Self::LogGrowthStepLength => stand.growth_step_length_yr().ln(),
        };
        Ok(value)
    }
}

/// Everything a design row may read: the stand, the tree for tree-level
/// models, and the events switched off for a counterfactual prediction.
#[derive(Clone, Copy)]
pub struct CovariateContext<'a> {
    pub stand: &'a dyn Stand,
    pub tree: Option<&'a dyn Tree>,
    pub disabled_events: &'a [StandEvent],
}

impl<'a> CovariateContext<'a> {
    pub fn new(stand: &'a dyn Stand, tree: Option<&'a dyn Tree>) -> Self {
        Self {
            stand,
            tree,
            disabled_events: &[],
        }
    }

    pub fn with_disabled_events(mut self, disabled_events: &'a [StandEvent]) -> Self {
        self.disabled_events = disabled_events;
        self
    }

    fn tree(&self, covariate: Covariate) -> Result<&'a dyn Tree, DesignError> {
        self.tree.ok_or(DesignError::MissingTree(covariate))
    }

    /// 1.0 when the event occurs and has not been switched off, 0.0 otherwise.
    pub fn event_indicator(&self, event: StandEvent) -> f64 {
        if self.disabled_events.contains(&event) || !self.stand.is_event_occurring(event) {
            0.0
        } else {
            1.0
        }
    }

    fn species_column(&self, categories: usize) -> Result<Option<usize>, DesignError> {
        let Some(tree) = self.tree else {
            return Ok(None);
        };
        let category = tree.species_category();
        if category >= categories {
            return Err(DesignError::UnknownSpecies {
                category,
                categories,
            });
        }
        // category 0 is the baseline and owns no column
        Ok(category.checked_sub(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Term {
    Intercept,
    /// Indicator block of width `categories - 1`.
    SpeciesDummies { categories: usize },
    Covariate(Covariate),
    Interaction(Covariate, Covariate),
    /// `covariate` times each species indicator, width `categories - 1`.
    SpeciesInteraction { categories: usize, covariate: Covariate },
    Event(StandEvent),
    EventInteraction(StandEvent, Covariate),
    /// A covariate entering with its own coefficient, such as the log step length.
    Offset(Covariate),
    /// A coefficient slot with no design column. The column stays at zero and
    /// the coefficient is read separately by the model, e.g. a nonlinear event
    /// parameter.
    Skip,
}

impl Term {
    pub fn width(&self) -> usize {
        match *self {
            Self::SpeciesDummies { categories } | Self::SpeciesInteraction { categories, .. } => {
                categories.saturating_sub(1)
            }
            _ => 1,
        }
    }
}

/// Ordered term specification of a model's fixed part.
#[derive(Debug, Clone, PartialEq)]
pub struct TermRecipe {
    terms: Vec<Term>,
}

impl TermRecipe {
    pub fn new(terms: Vec<Term>) -> Self {
        Self { terms }
    }

    pub fn terms(&self) -> &[Term] {
        &self.terms
    }

    /// Number of design columns, which must equal the number of coefficients.
    pub fn width(&self) -> usize {
        self.terms.iter().map(Term::width).sum()
    }

    /// First column of the `n`-th occurrence of `Skip`.
    pub fn skipped_column(&self, n: usize) -> Result<usize, DesignError> {
        let mut column = 0usize;
        let mut seen = 0usize;
        for term in &self.terms {
            if *term == Term::Skip {
                if seen == n {
                    return Ok(column);
                }
                seen += 1;
            }
            column += term.width();
        }
        Err(DesignError::MissingSkippedTerm(n))
    }

    pub fn check_coefficients(&self, found: usize) -> Result<(), DesignError> {
        let expected = self.width();
        if expected != found {
            return Err(DesignError::DimensionMismatch { expected, found });
        }
        Ok(())
    }

    pub fn build_row(&self, context: &CovariateContext<'_>) -> Result<DesignRow, DesignError> {
        let mut row = DesignRow::zeros(self.width());
        let mut pointer = 0usize;
        for term in &self.terms {
            match *term {
                Term::Intercept => row[pointer] = 1.0,
                Term::SpeciesDummies { categories } => {
                    if let Some(offset) = context.species_column(categories)? {
                        row[pointer + offset] = 1.0;
                    }
                }
                Term::Covariate(covariate) | Term::Offset(covariate) => {
                    row[pointer] = covariate.value(context)?;
                }
                Term::Interaction(a, b) => {
                    row[pointer] = a.value(context)? * b.value(context)?;
                }
                Term::SpeciesInteraction {
                    categories,
                    covariate,
                } => {
                    if let Some(offset) = context.species_column(categories)? {
                        row[pointer + offset] = covariate.value(context)?;
                    }
                }
                Term::Event(event) => row[pointer] = context.event_indicator(event),
                Term::EventInteraction(event, covariate) => {
                    let indicator = context.event_indicator(event);
                    if indicator != 0.0 {
                        row[pointer] = indicator * covariate.value(context)?;
                    }
                }
                Term::Skip => {}
            }
            pointer += term.width();
        }
        Ok(row)
    }

    pub fn fixed_effect(
        &self,
        row: &DesignRow,
        coefficients: &Coefficients,
    ) -> Result<f64, DesignError> {
        if row.len() != coefficients.len() {
            return Err(DesignError::DimensionMismatch {
                expected: row.len(),
                found: coefficients.len(),
            });
        }
        Ok(row.dot(&coefficients.0))
    }
}
