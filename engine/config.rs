use crate::quadrature::MAX_ORDER;
use crate::sampler::SamplingMode;
use serde::Deserialize;
use std::fs;
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_SEED: u64 = 0x5f1_7a11;
pub const DEFAULT_QUADRATURE_NODES: usize = 10;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Which sources of variability a predictor simulates.
///
/// With every switch off the predictor is deterministic and returns
/// expectations; each switch that is on replaces an expectation with a draw
/// keyed on the subject's realization id.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PredictorConfig {
    pub parameter_variability: bool,
    pub random_effect_variability: bool,
    pub residual_variability: bool,
    pub quadrature_nodes: usize,
    pub seed: u64,
    pub default_exclusion_group: u32,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self::deterministic()
    }
}

impl PredictorConfig {
    pub fn deterministic() -> Self {
        Self {
            parameter_variability: false,
            random_effect_variability: false,
            residual_variability: false,
            quadrature_nodes: DEFAULT_QUADRATURE_NODES,
            seed: DEFAULT_SEED,
            default_exclusion_group: 0,
        }
    }

    /// Every source of variability switched on.
    pub fn stochastic() -> Self {
        Self {
            parameter_variability: true,
            random_effect_variability: true,
            residual_variability: true,
            ..Self::deterministic()
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        log::info!("Loaded predictor configuration from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.quadrature_nodes == 0 || self.quadrature_nodes > MAX_ORDER {
            return Err(ConfigError::InvalidValue {
                field: "quadrature_nodes",
                reason: format!("must be between 1 and {MAX_ORDER}, got {}", self.quadrature_nodes),
            });
        }
        Ok(())
    }

    pub fn sampling_mode(&self) -> SamplingMode {
        if self.parameter_variability {
            SamplingMode::Stochastic
        } else {
            SamplingMode::Deterministic
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn missing_fields_take_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "random_effect_variability = true").unwrap();
        writeln!(file, "seed = 42").unwrap();
        let config = PredictorConfig::load(file.path()).unwrap();
        assert!(config.random_effect_variability);
        assert!(!config.parameter_variability);
        assert_eq!(config.seed, 42);
        assert_eq!(config.quadrature_nodes, DEFAULT_QUADRATURE_NODES);
        assert_eq!(config.sampling_mode(), SamplingMode::Deterministic);
    }

    #[test]
    fn rejects_out_of_range_quadrature() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "quadrature_nodes = 0").unwrap();
        assert!(matches!(
            PredictorConfig::load(file.path()),
            Err(ConfigError::InvalidValue { field: "quadrature_nodes", .. })
        ));
    }

    #[test]
    fn rejects_unknown_keys() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "parameter_variabilty = true").unwrap();
        assert!(matches!(
            PredictorConfig::load(file.path()),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn stochastic_switches_everything_on() {
        let config = PredictorConfig::stochastic();
        assert!(config.parameter_variability && config.random_effect_variability && config.residual_variability);
        assert_eq!(config.sampling_mode(), SamplingMode::Stochastic);
        assert_eq!(config.seed, PredictorConfig::default().seed);
    }
}
