use ndarray::{Array1, ArrayView1};
use std::fmt;
use std::ops::{Deref, DerefMut};

/// A realized fixed-effect coefficient vector (either the mean or a draw).
#[repr(transparent)]
#[derive(Clone, Debug, PartialEq)]
pub struct Coefficients(pub Array1<f64>);

impl Coefficients {
    pub fn new(values: Array1<f64>) -> Self {
        Self(values)
    }

    pub fn zeros(len: usize) -> Self {
        Self(Array1::zeros(len))
    }

    pub fn into_inner(self) -> Array1<f64> {
        self.0
    }

    pub fn as_view(&self) -> ArrayView1<'_, f64> {
        self.0.view()
    }
}

impl Deref for Coefficients {
    type Target = Array1<f64>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Coefficients {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl From<Array1<f64>> for Coefficients {
    fn from(values: Array1<f64>) -> Self {
        Self(values)
    }
}

impl From<Coefficients> for Array1<f64> {
    fn from(values: Coefficients) -> Self {
        values.0
    }
}

/// One row of the design matrix, allocated per prediction call.
#[repr(transparent)]
#[derive(Clone, Debug, PartialEq)]
pub struct DesignRow(pub Array1<f64>);

impl DesignRow {
    pub fn zeros(len: usize) -> Self {
        Self(Array1::zeros(len))
    }

    pub fn as_view(&self) -> ArrayView1<'_, f64> {
        self.0.view()
    }
}

impl Deref for DesignRow {
    type Target = Array1<f64>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for DesignRow {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Tier of the subject nesting at which a random effect can be defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HierarchicalLevel {
    Tree,
    Plot,
    /// A growth interval nested in a plot.
    Interval,
    /// A calendar year, shared by every plot.
    Year,
}

impl HierarchicalLevel {
    /// Name used in variance-component parameter files.
    pub fn parameter_name(self) -> &'static str {
        match self {
            Self::Tree => "tree",
            Self::Plot => "plot",
            Self::Interval => "interval",
            Self::Year => "year",
        }
    }

    pub fn from_parameter_name(name: &str) -> Option<Self> {
        match name {
            "tree" => Some(Self::Tree),
            "plot" => Some(Self::Plot),
            "interval" => Some(Self::Interval),
            "year" => Some(Self::Year),
            _ => None,
        }
    }
}

impl fmt::Display for HierarchicalLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.parameter_name())
    }
}

/// Stand-level events that may trigger a term in a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StandEvent {
    Harvest,
    Drought,
    Windstorm,
}

/// An entity at one hierarchical level. The realization id is owned by the
/// simulation driver and selects the Monte Carlo draws used for the subject.
pub trait Subject {
    fn subject_id(&self) -> &str;
    fn level(&self) -> HierarchicalLevel;
    fn monte_carlo_realization_id(&self) -> u32;
}

/// Plot-level covariates. Implementors are read, never mutated, by the engine.
pub trait Stand: Subject + Sync {
    fn basal_area_m2_ha(&self) -> f64;
    fn number_of_stems_ha(&self) -> f64;
    fn latitude_deg(&self) -> f64;
    fn longitude_deg(&self) -> f64;
    fn elevation_m(&self) -> f64;
    fn growth_step_length_yr(&self) -> f64;
    fn date_yr(&self) -> i32;
    fn is_going_to_be_harvested(&self) -> bool;

    fn is_drought_occurring(&self) -> bool {
        false
    }

    fn is_windstorm_occurring(&self) -> bool {
        false
    }

    fn is_event_occurring(&self, event: StandEvent) -> bool {
        match event {
            StandEvent::Harvest => self.is_going_to_be_harvested(),
            StandEvent::Drought => self.is_drought_occurring(),
            StandEvent::Windstorm => self.is_windstorm_occurring(),
        }
    }

    /// Identifier of the growth interval starting at this stand's date.
    fn interval_id(&self) -> String {
        format!("{}_{}", self.subject_id(), self.date_yr())
    }

    fn year_id(&self) -> String {
        self.date_yr().to_string()
    }
}

/// Tree-level covariates.
pub trait Tree: Subject + Sync {
    fn dbh_cm(&self) -> f64;
    /// Zero-based species category; category 0 is the baseline.
    fn species_category(&self) -> usize;
    fn basal_area_larger_than_subject_m2_ha(&self) -> f64;

    /// Observed height, when the tree was measured.
    fn height_m(&self) -> Option<f64> {
        None
    }
}
