use crate::params::{Estimate, ParameterError};
use crate::streams::{StreamTag, stream_rng};
use crate::types::HierarchicalLevel;
use ahash::RandomState;
use dashmap::DashMap;
use rand::Rng;
use rand_distr::StandardNormal;

type SubjectKey = (HierarchicalLevel, String);

#[derive(Debug, Clone, Copy)]
struct CachedDeviate {
    realization: u32,
    standard_normal: f64,
}

/// Process-scoped cache of random effects, keyed by level and subject id.
///
/// BLUPs are realization-independent and persist until the store is dropped.
/// Simulated deviates are tied to a realization: a subject keeps only the
/// deviate of the last realization it was asked for, and asking for another
/// realization replaces it.
#[derive(Debug)]
pub struct RandomEffectStore {
    seed: u64,
    blups: DashMap<SubjectKey, Estimate, RandomState>,
    deviates: DashMap<SubjectKey, CachedDeviate, RandomState>,
}

impl RandomEffectStore {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            blups: DashMap::with_hasher(RandomState::new()),
            deviates: DashMap::with_hasher(RandomState::new()),
        }
    }

    /// Stores the BLUP of one subject; only univariate estimates are accepted.
    pub fn register_blup(
        &self,
        level: HierarchicalLevel,
        subject_id: &str,
        estimate: Estimate,
    ) -> Result<(), ParameterError> {
        if estimate.dimension() != 1 {
            return Err(ParameterError::NotUnivariate(estimate.dimension()));
        }
        self.blups.insert((level, subject_id.to_string()), estimate);
        Ok(())
    }

    pub fn blup(&self, level: HierarchicalLevel, subject_id: &str) -> Option<Estimate> {
        self.blups
            .get(&(level, subject_id.to_string()))
            .map(|entry| entry.value().clone())
    }

    /// Estimation mode: the BLUP mean when one is known, zero otherwise.
    pub fn random_effect(&self, level: HierarchicalLevel, subject_id: &str) -> f64 {
        self.blups
            .get(&(level, subject_id.to_string()))
            .map_or(0.0, |entry| entry.mean()[0])
    }

    /// Simulation mode: a realized random effect for `realization`.
    ///
    /// Subjects with a BLUP are drawn around the BLUP mean with the BLUP's own
    /// variance; others are drawn from N(0, `default_variance`).
    pub fn deviate(
        &self,
        level: HierarchicalLevel,
        subject_id: &str,
        realization: u32,
        default_variance: f64,
    ) -> f64 {
        let z = self.standard_normal(level, subject_id, realization);
        match self.blup(level, subject_id) {
            Some(estimate) => estimate.mean()[0] + estimate.variance()[[0, 0]].max(0.0).sqrt() * z,
            None => default_variance.max(0.0).sqrt() * z,
        }
    }

    fn standard_normal(&self, level: HierarchicalLevel, subject_id: &str, realization: u32) -> f64 {
        let key = (level, subject_id.to_string());
        if let Some(cached) = self.deviates.get(&key) {
            if cached.realization == realization {
                return cached.standard_normal;
            }
        }
        let mut rng = stream_rng(
            self.seed,
            StreamTag::RandomEffect(level),
            subject_id,
            realization,
        );
        let standard_normal: f64 = rng.sample(StandardNormal);
        self.deviates.insert(
            key,
            CachedDeviate {
                realization,
                standard_normal,
            },
        );
        standard_normal
    }

    /// Clears simulated deviates; BLUPs are kept.
    pub fn reset(&self) {
        self.deviates.clear();
    }

    pub fn cached_deviates(&self) -> usize {
        self.deviates.len()
    }
}
