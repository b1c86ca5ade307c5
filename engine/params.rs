//! # Parameter Store
//!
//! Holds the pre-fit fixed-effect estimates and variance components of a
//! model, one bundle per exclusion (cross-validation) group. Everything here
//! is read-only once loaded and can be shared freely between threads.
//!
//! On disk a model is a directory of small CSV files sharing a prefix:
//!
//! - `{prefix}_beta_{g}.csv`: column `value`, the fixed-effect mean vector.
//! - `{prefix}_omega_{g}.csv`: column `value`, the packed lower triangle of the
//!   fixed-effect covariance, row-wise.
//! - `{prefix}_covparms_{g}.csv`: columns `parameter,value`, the random-effect
//!   variances (`plot`, `tree`, `interval`, `year`), `residual` and `range`.

use crate::types::HierarchicalLevel;
use ndarray::{Array1, Array2};
use ndarray_linalg::{Cholesky, Eigh, UPLO};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

const SYMMETRY_TOLERANCE: f64 = 1e-9;
/// Negative eigenvalues within this fraction of the spectral radius are round-off.
const PSD_TOLERANCE: f64 = 1e-10;

#[derive(Error, Debug)]
pub enum ParameterError {
    #[error("Failed to read parameter file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse parameter file: {0}")]
    CsvError(#[from] csv::Error),
    #[error("Required parameter file '{0}' does not exist.")]
    MissingFile(PathBuf),
    #[error("No parameter groups with prefix '{prefix}' were found in '{dir}'.")]
    NoGroupsFound { dir: PathBuf, prefix: String },
    #[error(
        "Packed covariance has {found} entries, which does not match a {dim}x{dim} symmetric matrix ({expected} entries expected)."
    )]
    MalformedPackedMatrix {
        found: usize,
        dim: usize,
        expected: usize,
    },
    #[error("Estimate mean has length {mean} but its covariance matrix is {rows}x{cols}.")]
    DimensionMismatch { mean: usize, rows: usize, cols: usize },
    #[error("Covariance matrix is not symmetric at ({row}, {col}).")]
    NotSymmetric { row: usize, col: usize },
    #[error("Covariance matrix is not positive semi-definite (smallest eigenvalue {min_eigenvalue:e}).")]
    NotPositiveSemiDefinite { min_eigenvalue: f64 },
    #[error("A random-effect estimate must be univariate, found dimension {0}.")]
    NotUnivariate(usize),
    #[error("Non-finite value found in {0}.")]
    NonFinite(&'static str),
    #[error("Unknown variance component '{0}'.")]
    UnknownVarianceComponent(String),
    #[error("Variance component '{name}' must be non-negative and finite, found {value}.")]
    InvalidVariance { name: String, value: f64 },
    #[error("Exclusion group {0} was not loaded.")]
    UnknownGroup(u32),
    #[error("Failed to factor covariance matrix: {0}")]
    LinalgError(#[from] ndarray_linalg::error::LinalgError),
}

/// A Gaussian estimate: a mean vector and its covariance matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct Estimate {
    mean: Array1<f64>,
    variance: Array2<f64>,
}

impl Estimate {
    pub fn new(mean: Array1<f64>, variance: Array2<f64>) -> Result<Self, ParameterError> {
        let (rows, cols) = variance.dim();
        if rows != mean.len() || cols != mean.len() {
            return Err(ParameterError::DimensionMismatch {
                mean: mean.len(),
                rows,
                cols,
            });
        }
        if mean.iter().any(|v| !v.is_finite()) {
            return Err(ParameterError::NonFinite("estimate mean"));
        }
        if variance.iter().any(|v| !v.is_finite()) {
            return Err(ParameterError::NonFinite("estimate covariance"));
        }
        for i in 0..rows {
            for j in (i + 1)..cols {
                let a = variance[[i, j]];
                let b = variance[[j, i]];
                if (a - b).abs() > SYMMETRY_TOLERANCE * a.abs().max(b.abs()).max(1.0) {
                    return Err(ParameterError::NotSymmetric { row: i, col: j });
                }
            }
        }
        Ok(Self { mean, variance })
    }

    /// A one-dimensional estimate, as produced for a single random effect.
    pub fn univariate(mean: f64, variance: f64) -> Self {
        Self {
            mean: Array1::from_elem(1, mean),
            variance: Array2::from_elem((1, 1), variance),
        }
    }

    pub fn mean(&self) -> &Array1<f64> {
        &self.mean
    }

    pub fn variance(&self) -> &Array2<f64> {
        &self.variance
    }

    pub fn dimension(&self) -> usize {
        self.mean.len()
    }

    /// A matrix `L` with `L Lᵗ` equal to the covariance.
    ///
    /// Uses the Cholesky factor when the matrix is positive definite and falls
    /// back to the symmetric square root for positive semi-definite matrices,
    /// clipping round-off negative eigenvalues to zero. An indefinite matrix
    /// is an error.
    pub fn variance_root(&self) -> Result<Array2<f64>, ParameterError> {
        if self.dimension() == 0 {
            return Ok(Array2::zeros((0, 0)));
        }
        match self.variance.cholesky(UPLO::Lower) {
            Ok(lower) => Ok(lower),
            Err(_) => {
                log::warn!(
                    "Cholesky factorization failed for a {}x{} covariance, using the eigenvalue square root",
                    self.dimension(),
                    self.dimension()
                );
                let (eigenvalues, eigenvectors) = self.variance.eigh(UPLO::Lower)?;
                let spectral_radius = eigenvalues.iter().fold(0.0_f64, |m, ev| m.max(ev.abs()));
                let min_eigenvalue = eigenvalues.iter().copied().fold(f64::INFINITY, f64::min);
                if min_eigenvalue < -PSD_TOLERANCE * spectral_radius {
                    return Err(ParameterError::NotPositiveSemiDefinite { min_eigenvalue });
                }
                let scale = eigenvalues.mapv(|ev| ev.max(0.0).sqrt());
                Ok(&eigenvectors * &scale)
            }
        }
    }
}

/// Random-effect variances per level plus the residual variance and, for
/// spatially correlated models, the covariogram range.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VarianceComponents {
    random_effects: BTreeMap<HierarchicalLevel, f64>,
    residual: Option<f64>,
    spatial_range_km: Option<f64>,
}

impl VarianceComponents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_random_effect(mut self, level: HierarchicalLevel, variance: f64) -> Self {
        self.random_effects.insert(level, variance);
        self
    }

    pub fn with_residual(mut self, variance: f64) -> Self {
        self.residual = Some(variance);
        self
    }

    pub fn with_spatial_range(mut self, range_km: f64) -> Self {
        self.spatial_range_km = Some(range_km);
        self
    }

    pub fn random_effect_variance(&self, level: HierarchicalLevel) -> Option<f64> {
        self.random_effects.get(&level).copied()
    }

    pub fn residual_variance(&self) -> Option<f64> {
        self.residual
    }

    pub fn spatial_range_km(&self) -> Option<f64> {
        self.spatial_range_km
    }

    fn validate(&self) -> Result<(), ParameterError> {
        let named = self
            .random_effects
            .iter()
            .map(|(level, &v)| (level.parameter_name(), v))
            .chain(self.residual.map(|v| ("residual", v)))
            .chain(self.spatial_range_km.map(|v| ("range", v)));
        for (name, value) in named {
            if !value.is_finite() || value < 0.0 {
                return Err(ParameterError::InvalidVariance {
                    name: name.to_string(),
                    value,
                });
            }
        }
        Ok(())
    }
}

/// The parameters fitted for one exclusion group.
#[derive(Debug, Clone)]
pub struct ParameterGroup {
    id: u32,
    fixed_effects: Estimate,
    variance_components: VarianceComponents,
    fixed_effect_root: Array2<f64>,
}

impl ParameterGroup {
    pub fn new(
        id: u32,
        fixed_effects: Estimate,
        variance_components: VarianceComponents,
    ) -> Result<Self, ParameterError> {
        variance_components.validate()?;
        let fixed_effect_root = fixed_effects.variance_root()?;
        Ok(Self {
            id,
            fixed_effects,
            variance_components,
            fixed_effect_root,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn fixed_effects(&self) -> &Estimate {
        &self.fixed_effects
    }

    pub fn variance_components(&self) -> &VarianceComponents {
        &self.variance_components
    }

    /// Square root of the fixed-effect covariance, used to draw coefficients.
    pub fn fixed_effect_root(&self) -> &Array2<f64> {
        &self.fixed_effect_root
    }

    pub fn num_coefficients(&self) -> usize {
        self.fixed_effects.dimension()
    }
}

/// Which parameter group a prediction should use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExclusionSelector {
    /// The store's default group.
    #[default]
    Default,
    ExclusionGroup(u32),
}

/// All parameter groups of one model.
#[derive(Debug, Clone)]
pub struct ParameterStore {
    groups: BTreeMap<u32, ParameterGroup>,
    default_group: u32,
}

impl ParameterStore {
    pub fn from_groups(
        groups: Vec<ParameterGroup>,
        default_group: u32,
    ) -> Result<Self, ParameterError> {
        let groups: BTreeMap<u32, ParameterGroup> =
            groups.into_iter().map(|g| (g.id(), g)).collect();
        if !groups.contains_key(&default_group) {
            return Err(ParameterError::UnknownGroup(default_group));
        }
        Ok(Self {
            groups,
            default_group,
        })
    }

    /// Loads every exclusion group found under `dir` for `prefix`.
    pub fn load(dir: &Path, prefix: &str, default_group: u32) -> Result<Self, ParameterError> {
        let ids = internal::discover_groups(dir, prefix)?;
        if ids.is_empty() {
            return Err(ParameterError::NoGroupsFound {
                dir: dir.to_path_buf(),
                prefix: prefix.to_string(),
            });
        }
        let mut groups = Vec::with_capacity(ids.len());
        for id in ids {
            groups.push(internal::load_group(dir, prefix, id)?);
        }
        log::info!(
            "Loaded {} parameter group(s) for '{}' ({} coefficients).",
            groups.len(),
            prefix,
            groups[0].num_coefficients()
        );
        Self::from_groups(groups, default_group)
    }

    pub fn group(&self, selector: ExclusionSelector) -> Result<&ParameterGroup, ParameterError> {
        let id = match selector {
            ExclusionSelector::Default => self.default_group,
            ExclusionSelector::ExclusionGroup(id) => id,
        };
        self.groups.get(&id).ok_or(ParameterError::UnknownGroup(id))
    }

    pub fn groups(&self) -> impl Iterator<Item = &ParameterGroup> {
        self.groups.values()
    }

    pub fn default_group(&self) -> u32 {
        self.default_group
    }
}

/// Expands a row-wise packed lower triangle into a full symmetric matrix.
pub fn unpack_symmetric(packed: &[f64], dim: usize) -> Result<Array2<f64>, ParameterError> {
    let expected = dim * (dim + 1) / 2;
    if packed.len() != expected {
        return Err(ParameterError::MalformedPackedMatrix {
            found: packed.len(),
            dim,
            expected,
        });
    }
    let mut matrix = Array2::<f64>::zeros((dim, dim));
    let mut k = 0usize;
    for i in 0..dim {
        for j in 0..=i {
            matrix[[i, j]] = packed[k];
            matrix[[j, i]] = packed[k];
            k += 1;
        }
    }
    Ok(matrix)
}

mod internal {
    use super::*;
    use itertools::Itertools;

    #[derive(Deserialize)]
    struct ValueRecord {
        value: f64,
    }

    #[derive(Deserialize)]
    struct VarianceRecord {
        parameter: String,
        value: f64,
    }

    fn file_path(dir: &Path, prefix: &str, kind: &str, id: u32) -> PathBuf {
        dir.join(format!("{prefix}_{kind}_{id}.csv"))
    }

    pub(super) fn discover_groups(dir: &Path, prefix: &str) -> Result<Vec<u32>, ParameterError> {
        let stem = format!("{prefix}_beta_");
        let mut ids = Vec::new();
        for entry in fs::read_dir(dir)? {
            let name = entry?.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(id) = name
                .strip_prefix(&stem)
                .and_then(|rest| rest.strip_suffix(".csv"))
                .and_then(|id| id.parse::<u32>().ok())
            {
                ids.push(id);
            }
        }
        Ok(ids.into_iter().sorted().dedup().collect())
    }

    fn read_values(path: &Path) -> Result<Vec<f64>, ParameterError> {
        if !path.exists() {
            return Err(ParameterError::MissingFile(path.to_path_buf()));
        }
        let mut reader = csv::Reader::from_path(path)?;
        let mut values = Vec::new();
        for record in reader.deserialize::<ValueRecord>() {
            values.push(record?.value);
        }
        Ok(values)
    }

    fn read_variance_components(path: &Path) -> Result<VarianceComponents, ParameterError> {
        if !path.exists() {
            return Err(ParameterError::MissingFile(path.to_path_buf()));
        }
        let mut reader = csv::Reader::from_path(path)?;
        let mut components = VarianceComponents::new();
        for record in reader.deserialize::<VarianceRecord>() {
            let record = record?;
            let name = record.parameter.trim().to_ascii_lowercase();
            components = match name.as_str() {
                "residual" => components.with_residual(record.value),
                "range" => components.with_spatial_range(record.value),
                other => match HierarchicalLevel::from_parameter_name(other) {
                    Some(level) => components.with_random_effect(level, record.value),
                    None => {
                        return Err(ParameterError::UnknownVarianceComponent(
                            record.parameter.clone(),
                        ));
                    }
                },
            };
        }
        Ok(components)
    }

    pub(super) fn load_group(
        dir: &Path,
        prefix: &str,
        id: u32,
    ) -> Result<ParameterGroup, ParameterError> {
        let beta = read_values(&file_path(dir, prefix, "beta", id))?;
        let packed = read_values(&file_path(dir, prefix, "omega", id))?;
        let omega = unpack_symmetric(&packed, beta.len())?;
        let components = read_variance_components(&file_path(dir, prefix, "covparms", id))?;
        let estimate = Estimate::new(Array1::from(beta), omega)?;
        ParameterGroup::new(id, estimate, components)
    }
}
