use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::metrics::QuotaMetrics;
use crate::types::QuotaError;

/// Default cap on distinct groups one accounting pass may touch.
pub const DEFAULT_MAX_PASS_GROUPS: usize = 1 << 20;

/// Configuration options supplied when opening a [`super::QuotaEngine`].
#[derive(Clone)]
pub struct QuotaOptions {
    /// Optional metrics collection implementation
    pub metrics: Option<Arc<dyn QuotaMetrics>>,
    /// Whether a rescan recorded in STATUS restarts on open
    pub auto_resume_rescan: bool,
    /// Upper bound on groups touched by one propagation pass
    pub max_pass_groups: usize,
    /// Pause between rescan steps
    pub rescan_throttle: Duration,
    /// Extent leaves processed per rescan commit
    pub rescan_leaf_batch: usize,
}

impl Default for QuotaOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl QuotaOptions {
    /// Creates options with default settings.
    pub fn new() -> Self {
        Self {
            metrics: None,
            auto_resume_rescan: true,
            max_pass_groups: DEFAULT_MAX_PASS_GROUPS,
            rescan_throttle: Duration::ZERO,
            rescan_leaf_batch: 1,
        }
    }

    /// Sets the metrics collection implementation.
    pub fn metrics(mut self, metrics: Arc<dyn QuotaMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Enables or disables resuming a persisted rescan on open.
    pub fn auto_resume_rescan(mut self, enabled: bool) -> Self {
        self.auto_resume_rescan = enabled;
        self
    }

    /// Sets the per-pass group budget.
    pub fn max_pass_groups(mut self, groups: usize) -> Self {
        self.max_pass_groups = groups.max(1);
        self
    }

    /// Sets the pause between rescan steps.
    pub fn rescan_throttle(mut self, throttle: Duration) -> Self {
        self.rescan_throttle = throttle;
        self
    }

    /// Sets how many leaves one rescan step covers.
    pub fn rescan_leaf_batch(mut self, leaves: usize) -> Self {
        self.rescan_leaf_batch = leaves.max(1);
        self
    }
}

/// Errors raised while loading a [`QuotaConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("failed to read quota config {path}: {source}")]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// Config text is not valid TOML for this schema.
    #[error("failed to parse quota config: {source}")]
    Parse {
        /// Underlying error.
        source: toml::de::Error,
    },
    /// A field holds an unusable value.
    #[error("quota config field '{field}' {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// What is wrong with it.
        reason: &'static str,
    },
}

impl From<ConfigError> for QuotaError {
    fn from(err: ConfigError) -> Self {
        QuotaError::Config(err.to_string())
    }
}

/// File representation of the engine tunables.
///
/// ```toml
/// [quota]
/// auto_resume_rescan = true
/// max_pass_groups = 65536
/// rescan_throttle_ms = 5
/// rescan_leaf_batch = 4
/// ```
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct QuotaConfig {
    /// Engine tunables.
    #[serde(default)]
    pub quota: QuotaSection,
}

/// The `[quota]` table.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct QuotaSection {
    /// Resume a persisted rescan on open.
    pub auto_resume_rescan: bool,
    /// Upper bound on groups touched by one propagation pass.
    pub max_pass_groups: usize,
    /// Milliseconds to sleep between rescan steps.
    pub rescan_throttle_ms: u64,
    /// Extent leaves processed per rescan commit.
    pub rescan_leaf_batch: usize,
}

impl Default for QuotaSection {
    fn default() -> Self {
        Self {
            auto_resume_rescan: true,
            max_pass_groups: DEFAULT_MAX_PASS_GROUPS,
            rescan_throttle_ms: 0,
            rescan_leaf_batch: 1,
        }
    }
}

impl QuotaConfig {
    /// Parses and validates TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: QuotaConfig =
            toml::from_str(text).map_err(|source| ConfigError::Parse { source })?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and validates a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.quota.max_pass_groups == 0 {
            return Err(ConfigError::Invalid {
                field: "max_pass_groups",
                reason: "must be at least 1",
            });
        }
        if self.quota.rescan_leaf_batch == 0 {
            return Err(ConfigError::Invalid {
                field: "rescan_leaf_batch",
                reason: "must be at least 1",
            });
        }
        Ok(())
    }

    /// Converts the file settings into engine options.
    pub fn into_options(self) -> QuotaOptions {
        QuotaOptions::new()
            .auto_resume_rescan(self.quota.auto_resume_rescan)
            .max_pass_groups(self.quota.max_pass_groups)
            .rescan_throttle(Duration::from_millis(self.quota.rescan_throttle_ms))
            .rescan_leaf_batch(self.quota.rescan_leaf_batch)
    }
}
