//! Configuration builders controlling filtering, subword learning, packing and tuning.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{NmtError, Result};

/// Length and ratio policy applied by [`crate::filter::CorpusFilter`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FilterConfig {
    /// Minimum whitespace token count allowed on either side (inclusive).
    pub min_tokens: usize,
    /// Maximum whitespace token count allowed on either side (inclusive).
    pub max_tokens: usize,
    /// Maximum ratio between the longer and the shorter side (inclusive).
    pub max_ratio: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            min_tokens: 1,
            max_tokens: 80,
            max_ratio: 3.0,
        }
    }
}

impl FilterConfig {
    /// Returns a builder initialised with [`FilterConfig::default`].
    #[must_use]
    pub fn builder() -> FilterBuilder {
        FilterBuilder::default()
    }

    /// Validates the thresholds.
    pub fn validate(&self) -> Result<()> {
        if self.min_tokens == 0 {
            return Err(NmtError::InvalidConfig(
                "min_tokens must be greater than zero".into(),
            ));
        }
        if self.max_tokens < self.min_tokens {
            return Err(NmtError::InvalidConfig(format!(
                "max_tokens ({}) must be >= min_tokens ({})",
                self.max_tokens, self.min_tokens
            )));
        }
        if !self.max_ratio.is_finite() || self.max_ratio < 1.0 {
            return Err(NmtError::InvalidConfig(format!(
                "max_ratio ({}) must be a finite value >= 1",
                self.max_ratio
            )));
        }
        Ok(())
    }
}

/// Builder for [`FilterConfig`].
#[derive(Debug, Default, Clone)]
pub struct FilterBuilder {
    cfg: FilterConfig,
}

impl FilterBuilder {
    /// Sets the minimum token count.
    #[must_use]
    pub fn min_tokens(mut self, value: usize) -> Self {
        self.cfg.min_tokens = value;
        self
    }

    /// Sets the maximum token count.
    #[must_use]
    pub fn max_tokens(mut self, value: usize) -> Self {
        self.cfg.max_tokens = value;
        self
    }

    /// Sets the maximum length ratio.
    #[must_use]
    pub fn max_ratio(mut self, value: f64) -> Self {
        self.cfg.max_ratio = value;
        self
    }

    /// Finalises the builder, returning a validated [`FilterConfig`].
    pub fn build(self) -> Result<FilterConfig> {
        self.cfg.validate()?;
        Ok(self.cfg)
    }
}

/// Settings for learning the shared subword model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SubwordConfig {
    /// Maximum number of merge operations (new symbols) learned.
    pub symbols: usize,
    /// Maximum number of subword terms kept per side; `None` keeps every observed term.
    pub max_vocabulary_size: Option<usize>,
    /// Minimum weighted pair frequency required before a merge is considered.
    pub min_frequency: usize,
    /// Enables periodic merge progress logging.
    pub show_progress: bool,
}

impl Default for SubwordConfig {
    fn default() -> Self {
        Self {
            symbols: 90_000,
            max_vocabulary_size: None,
            min_frequency: 2,
            show_progress: true,
        }
    }
}

impl SubwordConfig {
    /// Returns a builder initialised with [`SubwordConfig::default`].
    #[must_use]
    pub fn builder() -> SubwordBuilder {
        SubwordBuilder::default()
    }

    /// Validates the invariants required for learning.
    pub fn validate(&self) -> Result<()> {
        if self.symbols == 0 {
            return Err(NmtError::InvalidConfig(
                "symbols must be greater than zero".into(),
            ));
        }
        if self.min_frequency == 0 {
            return Err(NmtError::InvalidConfig(
                "min_frequency must be greater than zero".into(),
            ));
        }
        if self.max_vocabulary_size == Some(0) {
            return Err(NmtError::InvalidConfig(
                "max_vocabulary_size must be greater than zero when set".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`SubwordConfig`].
#[derive(Debug, Default, Clone)]
pub struct SubwordBuilder {
    cfg: SubwordConfig,
}

impl SubwordBuilder {
    /// Sets the merge budget.
    #[must_use]
    pub fn symbols(mut self, value: usize) -> Self {
        self.cfg.symbols = value;
        self
    }

    /// Caps the number of terms kept per side.
    #[must_use]
    pub fn max_vocabulary_size(mut self, value: Option<usize>) -> Self {
        self.cfg.max_vocabulary_size = value;
        self
    }

    /// Sets the minimum merge frequency.
    #[must_use]
    pub fn min_frequency(mut self, value: usize) -> Self {
        self.cfg.min_frequency = value;
        self
    }

    /// Enables or disables merge progress logging.
    #[must_use]
    pub fn show_progress(mut self, enabled: bool) -> Self {
        self.cfg.show_progress = enabled;
        self
    }

    /// Finalises the builder, returning a validated [`SubwordConfig`].
    pub fn build(self) -> Result<SubwordConfig> {
        self.cfg.validate()?;
        Ok(self.cfg)
    }
}

/// Memory bound applied while packing datasets.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PackingConfig {
    /// In-memory batch ceiling in megabytes.
    pub ram_limit_mb: usize,
}

impl Default for PackingConfig {
    fn default() -> Self {
        Self { ram_limit_mb: 1024 }
    }
}

impl PackingConfig {
    /// Validates the ceiling.
    pub fn validate(&self) -> Result<()> {
        if self.ram_limit_mb == 0 {
            return Err(NmtError::InvalidConfig(
                "ram_limit_mb must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Ceiling expressed in bytes.
    #[must_use]
    pub fn ram_limit_bytes(&self) -> usize {
        self.ram_limit_mb.saturating_mul(1024 * 1024)
    }
}

/// Grid search settings for learning-rate tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TuningConfig {
    /// Distance between two tried learning rates. The grid holds `round(1 / lr_step)` points
    /// at multiples of `lr_step`, so its last rate can land above or below 1.
    pub lr_step: f64,
    /// Adaptation epochs run for every translated sentence.
    pub max_epochs: usize,
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            lr_step: 0.1,
            max_epochs: 10,
        }
    }
}

impl TuningConfig {
    /// Validates the grid.
    pub fn validate(&self) -> Result<()> {
        if !self.lr_step.is_finite() || self.lr_step <= 0.0 || self.lr_step > 1.0 {
            return Err(NmtError::InvalidConfig(format!(
                "lr_step ({}) must be in (0, 1]",
                self.lr_step
            )));
        }
        if self.max_epochs == 0 {
            return Err(NmtError::InvalidConfig(
                "max_epochs must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Number of learning rates the grid tries, `round(1 / lr_step)`.
    #[must_use]
    pub fn trials(&self) -> usize {
        (1.0 / self.lr_step).round() as usize
    }
}

/// Aggregate configuration for a full engine build.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Corpus filter thresholds.
    pub filter: FilterConfig,
    /// Subword model settings.
    pub subword: SubwordConfig,
    /// Dataset packing memory bound.
    pub packing: PackingConfig,
    /// Learning-rate grid search.
    pub tuning: TuningConfig,
    /// Keeps the temporary workspace after a successful build.
    pub keep_temp: bool,
}

impl PipelineConfig {
    /// Validates every section.
    pub fn validate(&self) -> Result<()> {
        self.filter.validate()?;
        self.subword.validate()?;
        self.packing.validate()?;
        self.tuning.validate()
    }

    /// Loads and validates a JSON configuration file. Missing sections fall back to defaults.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|err| NmtError::io_at(err, path))?;
        let cfg: Self = serde_json::from_str(&raw)?;
        cfg.validate()?;
        Ok(cfg)
    }
}
