//! Plot and tree records read from CSV inventories.
//!
//! These are the concrete covariate carriers used by the `sylvan` binary and
//! by the tests. A simulation driver with its own stand representation only
//! needs to implement [`Stand`] and [`Tree`].

use crate::types::{HierarchicalLevel, Stand, Subject, Tree};
use ahash::{AHashMap, AHashSet};
use serde::Deserialize;
use std::f64::consts::PI;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("Tree '{tree_id}' refers to plot '{plot_id}', which is not in the plot file.")]
    UnknownPlot { tree_id: String, plot_id: String },
    #[error("Duplicate {kind} identifier '{id}'.")]
    DuplicateId { kind: &'static str, id: String },
    #[error("Invalid value for '{field}' on '{id}': {value}")]
    InvalidValue {
        id: String,
        field: &'static str,
        value: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PlotRecord {
    pub plot_id: String,
    pub latitude_deg: f64,
    pub longitude_deg: f64,
    pub elevation_m: f64,
    pub basal_area_m2_ha: f64,
    pub number_of_stems_ha: f64,
    pub growth_step_length_yr: f64,
    pub date_yr: i32,
    #[serde(default)]
    pub harvested: bool,
    #[serde(default)]
    pub drought: bool,
    #[serde(default)]
    pub windstorm: bool,
    #[serde(skip)]
    pub realization: u32,
}

impl PlotRecord {
    /// A plot with typical boreal-mixedwood covariates.
    pub fn new(plot_id: impl Into<String>) -> Self {
        Self {
            plot_id: plot_id.into(),
            latitude_deg: 46.8,
            longitude_deg: -71.2,
            elevation_m: 200.0,
            basal_area_m2_ha: 25.0,
            number_of_stems_ha: 1000.0,
            growth_step_length_yr: 10.0,
            date_yr: 2020,
            harvested: false,
            drought: false,
            windstorm: false,
            realization: 0,
        }
    }

    pub fn set_monte_carlo_realization_id(&mut self, realization: u32) {
        self.realization = realization;
    }

    fn validate(&self) -> Result<(), DataError> {
        let checks = [
            ("latitude_deg", self.latitude_deg, (-90.0..=90.0).contains(&self.latitude_deg)),
            ("longitude_deg", self.longitude_deg, (-180.0..=180.0).contains(&self.longitude_deg)),
            ("basal_area_m2_ha", self.basal_area_m2_ha, self.basal_area_m2_ha >= 0.0),
            ("number_of_stems_ha", self.number_of_stems_ha, self.number_of_stems_ha >= 0.0),
            ("growth_step_length_yr", self.growth_step_length_yr, self.growth_step_length_yr > 0.0),
        ];
        for (field, value, ok) in checks {
            if !ok || !value.is_finite() {
                return Err(DataError::InvalidValue {
                    id: self.plot_id.clone(),
                    field,
                    value,
                });
            }
        }
        Ok(())
    }
}

impl Subject for PlotRecord {
    fn subject_id(&self) -> &str {
        &self.plot_id
    }

    fn level(&self) -> HierarchicalLevel {
        HierarchicalLevel::Plot
    }

    fn monte_carlo_realization_id(&self) -> u32 {
        self.realization
    }
}

impl Stand for PlotRecord {
    fn basal_area_m2_ha(&self) -> f64 {
        self.basal_area_m2_ha
    }

    fn number_of_stems_ha(&self) -> f64 {
        self.number_of_stems_ha
    }

    fn latitude_deg(&self) -> f64 {
        self.latitude_deg
    }

    fn longitude_deg(&self) -> f64 {
        self.longitude_deg
    }

    fn elevation_m(&self) -> f64 {
        self.elevation_m
    }

    fn growth_step_length_yr(&self) -> f64 {
        self.growth_step_length_yr
    }

    fn date_yr(&self) -> i32 {
        self.date_yr
    }

    fn is_going_to_be_harvested(&self) -> bool {
        self.harvested
    }

    fn is_drought_occurring(&self) -> bool {
        self.drought
    }

    fn is_windstorm_occurring(&self) -> bool {
        self.windstorm
    }
}

fn default_expansion_factor() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TreeRecord {
    pub tree_id: String,
    pub plot_id: String,
    pub species: usize,
    pub dbh_cm: f64,
    #[serde(default)]
    pub height_m: Option<f64>,
    /// Stems per hectare represented by this record.
    #[serde(default = "default_expansion_factor")]
    pub expansion_factor: f64,
    #[serde(skip)]
    pub basal_area_larger_m2_ha: f64,
    #[serde(skip)]
    pub realization: u32,
}

impl TreeRecord {
    pub fn new(
        tree_id: impl Into<String>,
        plot_id: impl Into<String>,
        species: usize,
        dbh_cm: f64,
    ) -> Self {
        Self {
            tree_id: tree_id.into(),
            plot_id: plot_id.into(),
            species,
            dbh_cm,
            height_m: None,
            expansion_factor: 1.0,
            basal_area_larger_m2_ha: 0.0,
            realization: 0,
        }
    }

    pub fn set_monte_carlo_realization_id(&mut self, realization: u32) {
        self.realization = realization;
    }

    /// Basal area of the stems represented by this record, m²/ha.
    pub fn basal_area_m2_ha(&self) -> f64 {
        PI * (self.dbh_cm / 200.0).powi(2) * self.expansion_factor
    }
}

impl Subject for TreeRecord {
    fn subject_id(&self) -> &str {
        &self.tree_id
    }

    fn level(&self) -> HierarchicalLevel {
        HierarchicalLevel::Tree
    }

    fn monte_carlo_realization_id(&self) -> u32 {
        self.realization
    }
}

impl Tree for TreeRecord {
    fn dbh_cm(&self) -> f64 {
        self.dbh_cm
    }

    fn species_category(&self) -> usize {
        self.species
    }

    fn basal_area_larger_than_subject_m2_ha(&self) -> f64 {
        self.basal_area_larger_m2_ha
    }

    fn height_m(&self) -> Option<f64> {
        self.height_m
    }
}

pub fn load_plots(path: &Path) -> Result<Vec<PlotRecord>, DataError> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut seen = AHashSet::new();
    let mut plots = Vec::new();
    for record in reader.deserialize() {
        let plot: PlotRecord = record?;
        plot.validate()?;
        if !seen.insert(plot.plot_id.clone()) {
            return Err(DataError::DuplicateId {
                kind: "plot",
                id: plot.plot_id,
            });
        }
        plots.push(plot);
    }
    log::info!("Loaded {} plots from {}", plots.len(), path.display());
    Ok(plots)
}

/// Reads trees, checks that every tree belongs to a known plot and fills in
/// the basal area of larger trees.
pub fn load_trees(path: &Path, plots: &[PlotRecord]) -> Result<Vec<TreeRecord>, DataError> {
    let known: AHashSet<&str> = plots.iter().map(|p| p.plot_id.as_str()).collect();
    let mut reader = csv::Reader::from_path(path)?;
    let mut seen = AHashSet::new();
    let mut trees = Vec::new();
    for record in reader.deserialize() {
        let tree: TreeRecord = record?;
        if !known.contains(tree.plot_id.as_str()) {
            return Err(DataError::UnknownPlot {
                tree_id: tree.tree_id,
                plot_id: tree.plot_id,
            });
        }
        if !(tree.dbh_cm.is_finite() && tree.dbh_cm > 0.0) {
            return Err(DataError::InvalidValue {
                id: tree.tree_id,
                field: "dbh_cm",
                value: tree.dbh_cm,
            });
        }
        if !seen.insert(tree.tree_id.clone()) {
            return Err(DataError::DuplicateId {
                kind: "tree",
                id: tree.tree_id,
            });
        }
        trees.push(tree);
    }
    compute_basal_area_larger(&mut trees);
    log::info!("Loaded {} trees from {}", trees.len(), path.display());
    Ok(trees)
}

/// Sets each tree's basal area of strictly larger trees in the same plot.
pub fn compute_basal_area_larger(trees: &mut [TreeRecord]) {
    let mut by_plot: AHashMap<String, Vec<(f64, f64)>> = AHashMap::new();
    for tree in trees.iter() {
        by_plot
            .entry(tree.plot_id.clone())
            .or_default()
            .push((tree.dbh_cm, tree.basal_area_m2_ha()));
    }
    for tree in trees.iter_mut() {
        tree.basal_area_larger_m2_ha = by_plot.get(&tree.plot_id).map_or(0.0, |stems| {
            stems
                .iter()
                .filter(|(dbh, _)| *dbh > tree.dbh_cm)
                .map(|(_, ba)| ba)
                .sum()
        });
    }
}
