//! # Run Configuration
//!
//! Every tunable of the screening engine lives in `ScreeningConfig`, which is read
//! from and written to TOML. All fields carry defaults, so an empty file is a valid
//! configuration and a partially specified file only overrides what it names.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: &'static str, message: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreeningConfig {
    pub vectorize: VectorizeConfig,
    pub model: PriorConfig,
    pub optimizer: OptimizerConfig,
    pub loocv: LoocvConfig,
    pub classifier: ClassifierConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorizeConfig {
    /// Persons answering fewer items than this are excluded.
    pub min_responses: usize,
    /// Center and scale the age covariate over the included reference persons.
    pub standardize_covariate: bool,
}

impl Default for VectorizeConfig {
    fn default() -> Self {
        Self {
            min_responses: 5,
            standardize_covariate: true,
        }
    }
}

/// Scales of the weakly informative priors entering the MAP objective.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorConfig {
    pub threshold_sd: f64,
    pub slope_sd: f64,
    pub spacing_location: f64,
    pub spacing_scale: f64,
    pub spacing_df: f64,
}

impl Default for PriorConfig {
    fn default() -> Self {
        Self {
            threshold_sd: 5.0,
            slope_sd: 2.5,
            spacing_location: 1.0,
            spacing_scale: 1.0,
            spacing_df: 3.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerBackend {
    /// Limited-memory BFGS with a strong Wolfe line search.
    Lbfgs,
    /// Dense BFGS from the `wolfe_bfgs` crate. Only sensible for small problems.
    DenseBfgs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub backend: OptimizerBackend,
    pub max_iterations: usize,
    /// Absolute change in the objective between iterations.
    pub tol_obj: f64,
    /// Relative change in the objective, in units of machine epsilon.
    pub tol_rel_obj: f64,
    /// Largest absolute gradient component.
    pub tol_grad: f64,
    /// Relative gradient magnitude `g' H^-1 g / max(|f|, 1)`, in units of machine epsilon.
    pub tol_rel_grad: f64,
    /// Largest absolute parameter change between iterations.
    pub tol_param: f64,
    /// Number of correction pairs kept by L-BFGS.
    pub history_size: usize,
    /// Half-width of the uniform jitter applied to cold-start person effects.
    pub init_jitter: f64,
    pub seed: u64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            backend: OptimizerBackend::Lbfgs,
            max_iterations: 2000,
            tol_obj: 1e-12,
            tol_rel_obj: 1e4,
            tol_grad: 1e-8,
            tol_rel_grad: 1e7,
            tol_param: 1e-8,
            history_size: 5,
            init_jitter: 0.1,
            seed: 2024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureEscalation {
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoocvConfig {
    /// Worker count. `None` uses half of the logical cores.
    pub threads: Option<usize>,
    /// Completed folds between checkpoint flushes.
    pub checkpoint_every: usize,
    /// Upper bound on folds run in one invocation; the rest are skipped.
    pub max_folds: Option<usize>,
    /// Wall-clock budget for the whole batch, in seconds.
    pub wall_clock_budget_secs: Option<f64>,
    /// Wall-clock limit for a single fold's optimizer, in seconds.
    pub fold_timeout_secs: Option<f64>,
    pub max_failure_rate: f64,
    pub failure_escalation: FailureEscalation,
}

impl Default for LoocvConfig {
    fn default() -> Self {
        Self {
            threads: None,
            checkpoint_every: 25,
            max_folds: None,
            wall_clock_budget_secs: None,
            fold_timeout_secs: None,
            max_failure_rate: 0.05,
            failure_escalation: FailureEscalation::Warn,
        }
    }
}

impl LoocvConfig {
    pub fn worker_count(&self) -> usize {
        self.threads
            .unwrap_or_else(|| num_cpus::get() / 2)
            .max(1)
    }

    pub fn wall_clock_budget(&self) -> Option<Duration> {
        self.wall_clock_budget_secs
            .and_then(|s| Duration::try_from_secs_f64(s).ok())
    }

    pub fn fold_timeout(&self) -> Option<Duration> {
        self.fold_timeout_secs
            .and_then(|s| Duration::try_from_secs_f64(s).ok())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Probabilities at which avg_logpost breakpoints are taken. Quintiles by default.
    pub quantiles: Vec<f64>,
    /// Percentile of the reference lz distribution used as the decision cutoff.
    pub lz_percentile: f64,
    /// Raw weight per bucket, lowest bucket first. Linear `q / Q` when absent.
    pub bucket_weights: Option<Vec<f64>>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            quantiles: vec![0.2, 0.4, 0.6, 0.8],
            lz_percentile: 0.05,
            bucket_weights: None,
        }
    }
}

impl ClassifierConfig {
    pub fn bucket_count(&self) -> usize {
        self.quantiles.len() + 1
    }

    pub fn raw_bucket_weight(&self, quintile: usize) -> f64 {
        match &self.bucket_weights {
            Some(weights) => weights.get(quintile - 1).copied().unwrap_or(0.0),
            None => quintile as f64 / self.bucket_count() as f64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub dir: PathBuf,
    /// Rerun the full LOOCV batch even when a valid cached run exists.
    pub rebuild: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".fitscreen-cache"),
            rebuild: false,
        }
    }
}

impl ScreeningConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&toml_string)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        file.flush()?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field: &'static str, message: &str| -> Result<(), ConfigError> {
            Err(ConfigError::InvalidValue {
                field,
                message: message.to_string(),
            })
        };
        if self.optimizer.history_size == 0 {
            return invalid("optimizer.history_size", "must be at least 1");
        }
        if self.optimizer.max_iterations == 0 {
            return invalid("optimizer.max_iterations", "must be at least 1");
        }
        if !(self.model.threshold_sd > 0.0 && self.model.slope_sd > 0.0) {
            return invalid("model", "prior standard deviations must be positive");
        }
        if !(self.model.spacing_scale > 0.0 && self.model.spacing_df > 0.0) {
            return invalid("model", "spacing prior scale and df must be positive");
        }
        let quantiles = &self.classifier.quantiles;
        if quantiles.is_empty()
            || quantiles.iter().any(|&q| !(q > 0.0 && q < 1.0))
            || quantiles.windows(2).any(|pair| pair[0] >= pair[1])
        {
            return invalid(
                "classifier.quantiles",
                "must be a non-empty, strictly increasing list inside (0, 1)",
            );
        }
        if !(self.classifier.lz_percentile > 0.0 && self.classifier.lz_percentile < 1.0) {
            return invalid("classifier.lz_percentile", "must lie inside (0, 1)");
        }
        if let Some(weights) = &self.classifier.bucket_weights {
            if weights.len() != self.classifier.bucket_count() {
                return invalid(
                    "classifier.bucket_weights",
                    "needs exactly one weight per quantile bucket",
                );
            }
            if weights.iter().any(|&w| !(w >= 0.0 && w.is_finite())) {
                return invalid("classifier.bucket_weights", "weights must be finite and >= 0");
            }
        }
        if !(self.loocv.max_failure_rate >= 0.0 && self.loocv.max_failure_rate <= 1.0) {
            return invalid("loocv.max_failure_rate", "must lie inside [0, 1]");
        }
        if self.loocv.checkpoint_every == 0 {
            return invalid("loocv.checkpoint_every", "must be at least 1");
        }
        for (field, seconds) in [
            ("loocv.wall_clock_budget_secs", self.loocv.wall_clock_budget_secs),
            ("loocv.fold_timeout_secs", self.loocv.fold_timeout_secs),
        ] {
            if seconds.is_some_and(|s| !(s > 0.0 && s.is_finite())) {
                return invalid(field, "must be a positive, finite number of seconds");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn empty_toml_yields_defaults() {
        let config: ScreeningConfig = toml::from_str("").unwrap();
        assert_eq!(config, ScreeningConfig::default());
        assert_eq!(config.vectorize.min_responses, 5);
        assert_eq!(config.classifier.bucket_count(), 5);
    }

    #[test]
    fn partial_section_overrides_only_named_fields() {
        let config: ScreeningConfig =
            toml::from_str("[optimizer]\nhistory_size = 9\nbackend = \"dense_bfgs\"\n").unwrap();
        assert_eq!(config.optimizer.history_size, 9);
        assert_eq!(config.optimizer.backend, OptimizerBackend::DenseBfgs);
        assert_eq!(config.optimizer.max_iterations, 2000);
    }

    #[test]
    fn save_and_load_preserve_values() {
        let mut config = ScreeningConfig::default();
        config.loocv.threads = Some(3);
        config.classifier.bucket_weights = Some(vec![0.5, 0.75, 1.0, 1.0, 1.25]);
        let file = NamedTempFile::new().unwrap();
        config.save(file.path()).unwrap();
        let loaded = ScreeningConfig::load(file.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn rejects_negative_or_nan_time_limits() {
        let mut config = ScreeningConfig::default();
        config.loocv.wall_clock_budget_secs = Some(-1.0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "loocv.wall_clock_budget_secs", .. })
        ));
        config.loocv.wall_clock_budget_secs = Some(30.0);
        config.loocv.fold_timeout_secs = Some(f64::NAN);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "loocv.fold_timeout_secs", .. })
        ));
        config.loocv.fold_timeout_secs = Some(f64::INFINITY);
        assert!(config.validate().is_err());
        config.loocv.fold_timeout_secs = Some(0.5);
        assert!(config.validate().is_ok());
        assert_eq!(config.loocv.fold_timeout(), Some(Duration::from_millis(500)));
    }

    #[test]
    fn rejects_unsorted_quantiles() {
        let mut config = ScreeningConfig::default();
        config.classifier.quantiles = vec![0.5, 0.25];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "classifier.quantiles", .. })
        ));
    }

    #[test]
    fn linear_bucket_weights_by_default() {
        let config = ClassifierConfig::default();
        assert!((config.raw_bucket_weight(1) - 0.2).abs() < 1e-12);
        assert!((config.raw_bucket_weight(5) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn worker_count_is_never_zero() {
        let config = LoocvConfig {
            threads: Some(0),
            ..LoocvConfig::default()
        };
        assert_eq!(config.worker_count(), 1);
    }
}
