//! # Best Linear Unbiased Prediction of random effects
//!
//! Predicts the random effect of subjects that were not part of the fitting
//! data by generalized least squares kriging against a reference panel of
//! subjects whose residuals are known.
//!
//! With `G` the random-effect covariance between subjects (from a
//! [`Covariogram`]), `Z` the observation-to-subject indicator matrix and
//! `R = σ²_e·I`, the marginal covariance of the known residuals is
//! `V = Z·G·Zᵗ + R`. For new subjects with cross covariance `C` to the known
//! observations:
//!
//! - mean: `C·V⁻¹·r`
//! - variance: `G_new − C·V⁻¹·Cᵗ`, optionally inflated by `K·Ω·Kᵗ` with
//!   `K = C·V⁻¹·X` to account for the error of the fixed effects.

use crate::params::Estimate;
use ahash::{AHashMap, AHashSet, RandomState};
use dashmap::DashMap;
use ndarray::{Array1, Array2, Axis};
use ndarray_linalg::error::LinalgError;
use ndarray_linalg::{EigValsh, InverseC, UPLO};
use std::path::Path;
use std::sync::{Arc, OnceLock};
use thiserror::Error;

/// Mean Earth radius, km.
const EARTH_RADIUS_KM: f64 = 6371.0;

/// Reciprocal condition number below which `V_known` is treated as singular.
const SINGULARITY_THRESHOLD: f64 = 1e-12;

#[derive(Error, Debug)]
pub enum BlupError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("Malformed reference panel: {0}")]
    MalformedPanel(String),
    #[error("The reference panel holds no observation.")]
    EmptyPanel,
    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),
    #[error(
        "Covariance of the known observations is singular or near-singular (eigenvalue ratio {ratio:e}); check for duplicated or collinear reference subjects."
    )]
    SingularCovariance { ratio: f64 },
    #[error("Linear algebra error: {0}")]
    LinalgError(#[from] LinalgError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoLocation {
    pub latitude_deg: f64,
    pub longitude_deg: f64,
}

impl GeoLocation {
    pub fn new(latitude_deg: f64, longitude_deg: f64) -> Self {
        Self {
            latitude_deg,
            longitude_deg,
        }
    }

    /// Great-circle distance by the haversine formula.
    pub fn distance_km(&self, other: &GeoLocation) -> f64 {
        let phi1 = self.latitude_deg.to_radians();
        let phi2 = other.latitude_deg.to_radians();
        let dphi = phi2 - phi1;
        let dlambda = (other.longitude_deg - self.longitude_deg).to_radians();
        let a = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
        2.0 * EARTH_RADIUS_KM * a.sqrt().min(1.0).asin()
    }
}

/// Covariance between the random effects of two subjects.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Covariogram {
    /// `σ²·(1 − 1.5·d/ρ + 0.5·(d/ρ)³)` for `d < ρ`, zero beyond.
    Spherical { variance: f64, range_km: f64 },
    /// Distinct subjects are uncorrelated.
    Independent { variance: f64 },
}

impl Covariogram {
    pub fn variance(&self) -> f64 {
        match *self {
            Self::Spherical { variance, .. } | Self::Independent { variance } => variance,
        }
    }

    /// Covariance between two distinct subjects `distance_km` apart.
    pub fn covariance(&self, distance_km: f64) -> f64 {
        match *self {
            Self::Spherical { variance, range_km } => {
                if distance_km >= range_km {
                    0.0
                } else {
                    let h = distance_km / range_km;
                    variance * (1.0 - 1.5 * h + 0.5 * h.powi(3))
                }
            }
            Self::Independent { .. } => 0.0,
        }
    }

    fn between(&self, a: &str, a_location: &GeoLocation, b: &str, b_location: &GeoLocation) -> f64 {
        if a == b {
            self.variance()
        } else {
            self.covariance(a_location.distance_km(b_location))
        }
    }
}

/// Whether the variance of a BLUP accounts for the error of the fixed effects.
#[derive(Debug, Clone, PartialEq)]
pub enum UncertaintyCorrection {
    /// Conditional variance only.
    Omitted,
    /// Adds `K·Ω·Kᵗ`; holds `Ω`, the covariance of the fixed effects.
    Inflated(Array2<f64>),
}

/// One residual of a known subject.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceObservation {
    pub subject_id: String,
    pub observation: String,
    pub location: GeoLocation,
    pub design: Array1<f64>,
    pub residual: f64,
}

/// Conditioning set of the BLUP solve. Read-only once built.
#[derive(Debug, Clone)]
pub struct ReferencePanel {
    observations: Vec<ReferenceObservation>,
    subjects: Vec<(String, GeoLocation)>,
    subject_of: Vec<usize>,
    design_width: usize,
}

impl ReferencePanel {
    /// Keeps the first observation of each `(subject_id, observation)` pair.
    pub fn new(observations: Vec<ReferenceObservation>) -> Result<Self, BlupError> {
        let Some(first) = observations.first() else {
            return Err(BlupError::EmptyPanel);
        };
        let design_width = first.design.len();
        let total = observations.len();

        let mut seen = AHashSet::new();
        let mut kept = Vec::with_capacity(total);
        let mut subjects: Vec<(String, GeoLocation)> = Vec::new();
        let mut index_of: AHashMap<String, usize> = AHashMap::new();
        let mut subject_of = Vec::with_capacity(total);
        for obs in observations {
            if obs.design.len() != design_width {
                return Err(BlupError::DimensionMismatch(format!(
                    "observation '{}' of '{}' has {} design columns, expected {}",
                    obs.observation,
                    obs.subject_id,
                    obs.design.len(),
                    design_width
                )));
            }
            if !obs.residual.is_finite() {
                return Err(BlupError::MalformedPanel(format!(
                    "non-finite residual for '{}'",
                    obs.subject_id
                )));
            }
            if !seen.insert((obs.subject_id.clone(), obs.observation.clone())) {
                continue;
            }
            let index = *index_of.entry(obs.subject_id.clone()).or_insert_with(|| {
                subjects.push((obs.subject_id.clone(), obs.location));
                subjects.len() - 1
            });
            subject_of.push(index);
            kept.push(obs);
        }
        if kept.len() < total {
            log::warn!(
                "Reference panel: dropped {} duplicated observations",
                total - kept.len()
            );
        }
        log::info!(
            "Reference panel: {} observations of {} subjects",
            kept.len(),
            subjects.len()
        );
        Ok(Self {
            observations: kept,
            subjects,
            subject_of,
            design_width,
        })
    }

    /// Reads `subject_id,observation,latitude,longitude,residual,x1..xp`.
    pub fn from_csv(path: &Path) -> Result<Self, BlupError> {
        let mut reader = csv::Reader::from_path(path)?;
        let headers = reader.headers()?.clone();
        let expected = ["subject_id", "observation", "latitude", "longitude", "residual"];
        for (i, name) in expected.iter().enumerate() {
            if headers.get(i) != Some(*name) {
                return Err(BlupError::MalformedPanel(format!(
                    "column {} should be '{}'",
                    i + 1,
                    name
                )));
            }
        }
        let design_width = headers.len() - expected.len();

        let parse = |field: Option<&str>, line: u64| -> Result<f64, BlupError> {
            field
                .and_then(|s| s.trim().parse::<f64>().ok())
                .ok_or_else(|| BlupError::MalformedPanel(format!("unparsable number on line {line}")))
        };

        let mut observations = Vec::new();
        for (row, record) in reader.records().enumerate() {
            let record = record?;
            let line = row as u64 + 2;
            let design = (0..design_width)
                .map(|j| parse(record.get(expected.len() + j), line))
                .collect::<Result<Array1<f64>, _>>()?;
            observations.push(ReferenceObservation {
                subject_id: record.get(0).unwrap_or_default().to_string(),
                observation: record.get(1).unwrap_or_default().to_string(),
                location: GeoLocation::new(parse(record.get(2), line)?, parse(record.get(3), line)?),
                residual: parse(record.get(4), line)?,
                design,
            });
        }
        Self::new(observations)
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn num_subjects(&self) -> usize {
        self.subjects.len()
    }

    pub fn design_width(&self) -> usize {
        self.design_width
    }

    pub fn observations(&self) -> &[ReferenceObservation] {
        &self.observations
    }

    fn residuals(&self) -> Array1<f64> {
        self.observations.iter().map(|o| o.residual).collect()
    }

    fn design(&self) -> Array2<f64> {
        let mut x = Array2::zeros((self.len(), self.design_width));
        for (mut row, obs) in x.axis_iter_mut(Axis(0)).zip(&self.observations) {
            row.assign(&obs.design);
        }
        x
    }
}

/// A subject whose random effect is to be predicted.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSubject {
    pub subject_id: String,
    pub location: GeoLocation,
}

impl NewSubject {
    pub fn new(subject_id: impl Into<String>, location: GeoLocation) -> Self {
        Self {
            subject_id: subject_id.into(),
            location,
        }
    }
}

/// `V_known⁻¹` and the products of it that every solve reuses.
#[derive(Debug)]
struct KnownSystem {
    inverse: Array2<f64>,
    /// `V⁻¹·r`
    weighted_residuals: Array1<f64>,
    /// `V⁻¹·X`, present only when the variance is inflated.
    weighted_design: Option<Array2<f64>>,
}

/// Solves and caches BLUPs against one reference panel.
#[derive(Debug)]
pub struct BlupEngine {
    panel: Arc<ReferencePanel>,
    covariogram: Covariogram,
    residual_variance: f64,
    correction: UncertaintyCorrection,
    known: OnceLock<KnownSystem>,
    cache: DashMap<String, Estimate, RandomState>,
}

impl BlupEngine {
    pub fn new(
        panel: Arc<ReferencePanel>,
        covariogram: Covariogram,
        residual_variance: f64,
        correction: UncertaintyCorrection,
    ) -> Result<Self, BlupError> {
        if let UncertaintyCorrection::Inflated(omega) = &correction {
            let p = panel.design_width();
            if omega.dim() != (p, p) {
                return Err(BlupError::DimensionMismatch(format!(
                    "fixed-effect covariance is {:?} but the panel has {} design columns",
                    omega.dim(),
                    p
                )));
            }
        }
        Ok(Self {
            panel,
            covariogram,
            residual_variance,
            correction,
            known: OnceLock::new(),
            cache: DashMap::with_hasher(RandomState::new()),
        })
    }

    pub fn panel(&self) -> &ReferencePanel {
        &self.panel
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// Cached BLUP of one subject, solving the system on a miss.
    pub fn blup(&self, subject: &NewSubject) -> Result<Estimate, BlupError> {
        if let Some(hit) = self.cache.get(&subject.subject_id) {
            return Ok(hit.value().clone());
        }
        let mut solved = self.predict(std::slice::from_ref(subject))?;
        solved
            .pop()
            .ok_or_else(|| BlupError::DimensionMismatch("empty BLUP batch".to_string()))
    }

    /// Predicts a batch of subjects with one solve; every result is cached.
    pub fn predict(&self, subjects: &[NewSubject]) -> Result<Vec<Estimate>, BlupError> {
        let pending: Vec<&NewSubject> = subjects
            .iter()
            .filter(|s| !self.cache.contains_key(&s.subject_id))
            .collect();
        if !pending.is_empty() {
            log::debug!("Solving BLUPs for {} new subjects", pending.len());
            for (subject, estimate) in pending.iter().zip(self.solve(&pending)?) {
                self.cache.insert(subject.subject_id.clone(), estimate);
            }
        }
        subjects
            .iter()
            .map(|s| {
                self.cache
                    .get(&s.subject_id)
                    .map(|e| e.value().clone())
                    .ok_or_else(|| {
                        BlupError::DimensionMismatch(format!("no BLUP for '{}'", s.subject_id))
                    })
            })
            .collect()
    }

    fn known_covariance(&self) -> Array2<f64> {
        let panel = &self.panel;
        let n = panel.len();
        let mut v = Array2::zeros((n, n));
        for i in 0..n {
            let (id_i, loc_i) = &panel.subjects[panel.subject_of[i]];
            for j in 0..=i {
                let (id_j, loc_j) = &panel.subjects[panel.subject_of[j]];
                let c = self.covariogram.between(id_i, loc_i, id_j, loc_j);
                v[[i, j]] = c;
                v[[j, i]] = c;
            }
            v[[i, i]] += self.residual_variance;
        }
        v
    }

    /// Factors `V_known` on first use; the panel never changes afterwards.
    fn known_system(&self) -> Result<&KnownSystem, BlupError> {
        if let Some(system) = self.known.get() {
            return Ok(system);
        }
        let v_known = self.known_covariance();
        let eigenvalues = v_known.eigvalsh(UPLO::Lower)?;
        let max = eigenvalues.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b));
        let min = eigenvalues.iter().fold(f64::INFINITY, |a, &b| a.min(b));
        let ratio = if max > 0.0 { min / max } else { 0.0 };
        if !(ratio >= SINGULARITY_THRESHOLD) {
            return Err(BlupError::SingularCovariance { ratio });
        }
        let inverse = v_known.invc()?;
        log::debug!("Factored the covariance of {} reference observations", self.panel.len());
        let weighted_residuals = inverse.dot(&self.panel.residuals());
        let weighted_design = match self.correction {
            UncertaintyCorrection::Inflated(_) => Some(inverse.dot(&self.panel.design())),
            UncertaintyCorrection::Omitted => None,
        };
        // A concurrent first solve may have won the race; both results are identical.
        let _ = self.known.set(KnownSystem {
            inverse,
            weighted_residuals,
            weighted_design,
        });
        self.known
            .get()
            .ok_or_else(|| BlupError::DimensionMismatch("reference system was not stored".to_string()))
    }

    fn solve(&self, subjects: &[&NewSubject]) -> Result<Vec<Estimate>, BlupError> {
        let panel = &self.panel;
        let known = self.known_system()?;

        let m = subjects.len();
        let mut cross = Array2::zeros((m, panel.len()));
        for (i, subject) in subjects.iter().enumerate() {
            for (j, &s) in panel.subject_of.iter().enumerate() {
                let (id, location) = &panel.subjects[s];
                cross[[i, j]] = self.covariogram.between(
                    &subject.subject_id,
                    &subject.location,
                    id,
                    location,
                );
            }
        }
        let mut g_new = Array2::zeros((m, m));
        for i in 0..m {
            for j in 0..m {
                g_new[[i, j]] = self.covariogram.between(
                    &subjects[i].subject_id,
                    &subjects[i].location,
                    &subjects[j].subject_id,
                    &subjects[j].location,
                );
            }
        }

        let means = cross.dot(&known.weighted_residuals);
        let mut variance = g_new - cross.dot(&known.inverse).dot(&cross.t());
        if let (UncertaintyCorrection::Inflated(omega), Some(weighted_design)) =
            (&self.correction, &known.weighted_design)
        {
            let k = cross.dot(weighted_design);
            variance = variance + k.dot(omega).dot(&k.t());
        }

        Ok((0..m)
            .map(|i| {
                let mut var = variance[[i, i]];
                if var < 0.0 {
                    log::debug!(
                        "Clamping negative BLUP variance {var:e} for '{}'",
                        subjects[i].subject_id
                    );
                    var = 0.0;
                }
                Estimate::univariate(means[i], var)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn observation(id: &str, obs: &str, location: GeoLocation, residual: f64) -> ReferenceObservation {
        ReferenceObservation {
            subject_id: id.to_string(),
            observation: obs.to_string(),
            location,
            design: array![1.0],
            residual,
        }
    }

    /// A point `km` east of `origin` along its parallel.
    fn east_of(origin: GeoLocation, km: f64) -> GeoLocation {
        let degrees = km / (EARTH_RADIUS_KM * origin.latitude_deg.to_radians().cos()) * 180.0
            / std::f64::consts::PI;
        GeoLocation::new(origin.latitude_deg, origin.longitude_deg + degrees)
    }

    #[test]
    fn spherical_covariogram_values() {
        let c = Covariogram::Spherical {
            variance: 4.0,
            range_km: 10.0,
        };
        assert_eq!(c.covariance(0.0), 4.0);
        assert_eq!(c.covariance(10.0), 0.0);
        assert_relative_eq!(c.covariance(5.0), 1.25, epsilon = 1e-12);
        assert_eq!(c.covariance(25.0), 0.0);
    }

    #[test]
    fn haversine_distance_of_one_degree_of_latitude() {
        let a = GeoLocation::new(45.0, -71.0);
        let b = GeoLocation::new(46.0, -71.0);
        assert_relative_eq!(a.distance_km(&b), 111.19, epsilon = 0.01);
        assert_eq!(a.distance_km(&a), 0.0);
    }

    #[test]
    fn blup_shrinks_with_distance() {
        let origin = GeoLocation::new(46.0, -72.0);
        let panel = Arc::new(ReferencePanel::new(vec![observation("k", "1", origin, 2.0)]).unwrap());
        let covariogram = Covariogram::Spherical {
            variance: 1.0,
            range_km: 50.0,
        };
        let residual_variance = 0.01;
        let engine =
            BlupEngine::new(panel, covariogram, residual_variance, UncertaintyCorrection::Omitted).unwrap();

        let near = engine.blup(&NewSubject::new("near", east_of(origin, 0.001))).unwrap();
        let mid = engine.blup(&NewSubject::new("mid", east_of(origin, 20.0))).unwrap();
        let far = engine.blup(&NewSubject::new("far", east_of(origin, 80.0))).unwrap();

        // limit d -> 0 is 2.0 * σ²/(σ² + σ²_e)
        assert_relative_eq!(near.mean()[0], 2.0 / 1.01, epsilon = 1e-3);
        assert!(mid.mean()[0] > 0.0 && mid.mean()[0] < near.mean()[0]);
        assert_eq!(far.mean()[0], 0.0);
        assert_relative_eq!(far.variance()[[0, 0]], 1.0, epsilon = 1e-12);
        assert!(near.variance()[[0, 0]] < mid.variance()[[0, 0]]);
    }

    #[test]
    fn independent_covariogram_gives_the_classic_shrinkage() {
        let here = GeoLocation::new(46.0, -72.0);
        let residuals = [0.5, 1.5, 1.0, 2.0];
        let observations = residuals
            .iter()
            .enumerate()
            .map(|(i, &r)| observation("p1", &i.to_string(), here, r))
            .collect();
        let panel = Arc::new(ReferencePanel::new(observations).unwrap());
        let (s2u, s2e) = (0.8, 0.4);
        let engine = BlupEngine::new(
            panel,
            Covariogram::Independent { variance: s2u },
            s2e,
            UncertaintyCorrection::Omitted,
        )
        .unwrap();
        let estimate = engine.blup(&NewSubject::new("p1", here)).unwrap();
        let n = residuals.len() as f64;
        let mean_r = residuals.iter().sum::<f64>() / n;
        let shrink = n * s2u / (n * s2u + s2e);
        assert_relative_eq!(estimate.mean()[0], shrink * mean_r, epsilon = 1e-10);
        assert_relative_eq!(estimate.variance()[[0, 0]], s2u * (1.0 - shrink), epsilon = 1e-10);
    }

    #[test]
    fn fixed_effect_uncertainty_inflates_the_variance() {
        let origin = GeoLocation::new(46.0, -72.0);
        let observations = vec![
            observation("a", "1", origin, 1.0),
            observation("b", "1", east_of(origin, 5.0), -0.5),
        ];
        let panel = Arc::new(ReferencePanel::new(observations).unwrap());
        let covariogram = Covariogram::Spherical {
            variance: 1.0,
            range_km: 30.0,
        };
        let target = NewSubject::new("n", east_of(origin, 2.0));
        let omitted = BlupEngine::new(panel.clone(), covariogram, 0.2, UncertaintyCorrection::Omitted)
            .unwrap()
            .blup(&target)
            .unwrap();
        let inflated = BlupEngine::new(
            panel,
            covariogram,
            0.2,
            UncertaintyCorrection::Inflated(array![[0.3]]),
        )
        .unwrap()
        .blup(&target)
        .unwrap();
        assert_eq!(omitted.mean(), inflated.mean());
        assert!(inflated.variance()[[0, 0]] > omitted.variance()[[0, 0]]);
    }

    #[test]
    fn singular_known_covariance_is_an_error() {
        let here = GeoLocation::new(46.0, -72.0);
        let observations = vec![observation("a", "1", here, 1.0), observation("b", "1", here, 1.2)];
        let panel = Arc::new(ReferencePanel::new(observations).unwrap());
        let engine = BlupEngine::new(
            panel,
            Covariogram::Spherical {
                variance: 1.0,
                range_km: 10.0,
            },
            0.0,
            UncertaintyCorrection::Omitted,
        )
        .unwrap();
        assert!(matches!(
            engine.blup(&NewSubject::new("n", here)),
            Err(BlupError::SingularCovariance { .. })
        ));
        assert_eq!(engine.cached(), 0);
    }

    #[test]
    fn batch_results_are_cached_individually() {
        let origin = GeoLocation::new(46.0, -72.0);
        let panel = Arc::new(ReferencePanel::new(vec![observation("k", "1", origin, 1.0)]).unwrap());
        let engine = BlupEngine::new(
            panel,
            Covariogram::Spherical {
                variance: 1.0,
                range_km: 50.0,
            },
            0.5,
            UncertaintyCorrection::Omitted,
        )
        .unwrap();
        let batch = vec![
            NewSubject::new("a", east_of(origin, 3.0)),
            NewSubject::new("b", east_of(origin, 9.0)),
        ];
        let together = engine.predict(&batch).unwrap();
        assert_eq!(engine.cached(), 2);
        let alone = engine.blup(&batch[1]).unwrap();
        assert_eq!(alone, together[1]);
        assert_eq!(engine.cached(), 2);
    }

    #[test]
    fn reference_covariance_is_factored_once() {
        let origin = GeoLocation::new(46.0, -72.0);
        let observations = vec![
            observation("a", "1", origin, 1.0),
            observation("b", "1", east_of(origin, 4.0), 0.3),
        ];
        let panel = Arc::new(ReferencePanel::new(observations).unwrap());
        let engine = BlupEngine::new(
            panel,
            Covariogram::Spherical {
                variance: 1.0,
                range_km: 20.0,
            },
            0.1,
            UncertaintyCorrection::Inflated(array![[0.05]]),
        )
        .unwrap();
        assert!(engine.known.get().is_none());
        engine.blup(&NewSubject::new("x", east_of(origin, 1.0))).unwrap();
        let first: *const KnownSystem = engine.known.get().unwrap();
        engine.blup(&NewSubject::new("y", east_of(origin, 2.0))).unwrap();
        let second: *const KnownSystem = engine.known.get().unwrap();
        assert!(std::ptr::eq(first, second));
        assert!(engine.known.get().unwrap().weighted_design.is_some());
    }

    #[test]
    fn fixed_effect_covariance_must_match_panel_width() {
        let here = GeoLocation::new(46.0, -72.0);
        let panel = Arc::new(ReferencePanel::new(vec![observation("a", "1", here, 1.0)]).unwrap());
        let result = BlupEngine::new(
            panel,
            Covariogram::Independent { variance: 1.0 },
            0.1,
            UncertaintyCorrection::Inflated(Array2::eye(3)),
        );
        assert!(matches!(result, Err(BlupError::DimensionMismatch(_))));
    }

    #[test]
    fn duplicated_observations_are_dropped() {
        let here = GeoLocation::new(46.0, -72.0);
        let panel = ReferencePanel::new(vec![
            observation("a", "1", here, 1.0),
            observation("a", "1", here, 9.0),
            observation("a", "2", here, 2.0),
        ])
        .unwrap();
        assert_eq!(panel.len(), 2);
        assert_eq!(panel.num_subjects(), 1);
        assert_eq!(panel.observations()[1].residual, 2.0);
    }

    #[test]
    fn reads_a_panel_from_csv() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "subject_id,observation,latitude,longitude,residual,x1,x2").unwrap();
        writeln!(file, "p1,2001,46.1,-71.2,0.4,1,12.5").unwrap();
        writeln!(file, "p2,2001,46.3,-71.0,-0.2,1,8.0").unwrap();
        let panel = ReferencePanel::from_csv(file.path()).unwrap();
        assert_eq!(panel.len(), 2);
        assert_eq!(panel.design_width(), 2);
        assert_eq!(panel.observations()[0].design, array![1.0, 12.5]);
        assert_eq!(panel.observations()[1].location, GeoLocation::new(46.3, -71.0));
    }

    #[test]
    fn rejects_a_panel_with_wrong_columns() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "plot,observation,latitude,longitude,residual").unwrap();
        writeln!(file, "p1,2001,46.1,-71.2,0.4").unwrap();
        assert!(matches!(
            ReferencePanel::from_csv(file.path()),
            Err(BlupError::MalformedPanel(_))
        ));
    }
}
