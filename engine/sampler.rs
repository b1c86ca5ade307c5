use crate::params::ParameterGroup;
use crate::streams::{StreamTag, stream_rng};
use crate::types::{Coefficients, Subject};
use ahash::RandomState;
use dashmap::DashMap;
use ndarray::Array1;
use rand::Rng;
use rand_distr::StandardNormal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingMode {
    /// Always use the fixed-effect mean.
    Deterministic,
    /// Draw coefficients from the fixed-effect Gaussian estimate.
    Stochastic,
}

#[derive(Debug, Clone)]
struct CachedDraw {
    realization: u32,
    standard_normal: Array1<f64>,
}

/// Selects the coefficient vector used for a prediction.
///
/// In stochastic mode one multivariate normal draw is made per subject and
/// realization and kept until the subject moves to another realization, so a
/// probability and any follow-up prediction for the same realization see the
/// same coefficients.
#[derive(Debug)]
pub struct StochasticParameterSampler {
    mode: SamplingMode,
    seed: u64,
    draws: DashMap<String, CachedDraw, RandomState>,
}

impl StochasticParameterSampler {
    pub fn new(mode: SamplingMode, seed: u64) -> Self {
        Self {
            mode,
            seed,
            draws: DashMap::with_hasher(RandomState::new()),
        }
    }

    pub fn mode(&self) -> SamplingMode {
        self.mode
    }

    pub fn draw<S: Subject + ?Sized>(&self, group: &ParameterGroup, subject: &S) -> Coefficients {
        let mean = group.fixed_effects().mean();
        match self.mode {
            SamplingMode::Deterministic => Coefficients::new(mean.clone()),
            SamplingMode::Stochastic => {
                let z = self.standard_normal(
                    subject.subject_id(),
                    subject.monte_carlo_realization_id(),
                    mean.len(),
                );
                Coefficients::new(mean + &group.fixed_effect_root().dot(&z))
            }
        }
    }

    fn standard_normal(&self, subject_id: &str, realization: u32, dim: usize) -> Array1<f64> {
        if let Some(cached) = self.draws.get(subject_id) {
            if cached.realization == realization && cached.standard_normal.len() == dim {
                return cached.standard_normal.clone();
            }
        }
        let mut rng = stream_rng(self.seed, StreamTag::Parameters, subject_id, realization);
        let standard_normal: Array1<f64> =
            (0..dim).map(|_| rng.sample::<f64, _>(StandardNormal)).collect();
        self.draws.insert(
            subject_id.to_string(),
            CachedDraw {
                realization,
                standard_normal: standard_normal.clone(),
            },
        );
        standard_normal
    }

    /// Drops every cached draw.
    pub fn reset(&self) {
        self.draws.clear();
    }

    pub fn cached_subjects(&self) -> usize {
        self.draws.len()
    }
}
