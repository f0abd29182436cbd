//! TOML-based scheduler and scenario configuration.
//!
//! A scenario file describes one scheduler and the slices to register on it:
//!
//! ```toml
//! run_for_secs = 3.0
//!
//! [scheduler]
//! base_interval_secs = 0.1
//! background_mode = true
//!
//! [[slices]]
//! tag = "heartbeat"
//! interval_secs = 0.5
//! count = -1
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::slice::slice_times;
use crate::tickable::{interval_from_secs, validate_count, Count};

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Base clock resolution in seconds.
    #[serde(default = "default_base_interval_secs")]
    pub base_interval_secs: f64,
    /// Drive the base clock with the drift-corrected driver.
    #[serde(default)]
    pub background_mode: bool,
    /// Default radical mode for slices created by the scheduler.
    #[serde(default)]
    pub radical_mode: bool,
}

/// One logical timer in a scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceConfig {
    #[serde(default)]
    pub tag: Option<String>,
    pub interval_secs: f64,
    #[serde(default)]
    pub count: Count,
    /// Overrides the scheduler's radical mode for this slice.
    #[serde(default)]
    pub radical: Option<bool>,
}

/// A scheduler plus the slices to run on it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub slices: Vec<SliceConfig>,
    /// How long a runner should drive the scenario, when it has no bound.
    #[serde(default)]
    pub run_for_secs: Option<f64>,
}

fn default_base_interval_secs() -> f64 {
    0.1
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            base_interval_secs: default_base_interval_secs(),
            background_mode: false,
            radical_mode: false,
        }
    }
}

impl SchedulerConfig {
    pub fn base_interval(&self) -> Result<Duration, ConfigError> {
        interval_from_secs("scheduler.base_interval_secs", self.base_interval_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.base_interval().map(|_| ())
    }
}

impl SliceConfig {
    pub fn interval(&self) -> Result<Duration, ConfigError> {
        interval_from_secs("slices.interval_secs", self.interval_secs)
    }
}

impl Scenario {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let scenario: Scenario = toml::from_str(content)?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Load and validate a scenario file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or describes a
    /// degenerate timer.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let base = self.scheduler.base_interval()?;
        let mut tags = HashSet::new();
        for slice in &self.slices {
            slice_times(slice.interval()?, base)?;
            validate_count("slices.count", slice.count)?;
            if let Some(tag) = &slice.tag {
                if !tags.insert(tag.as_str()) {
                    return Err(ConfigError::invalid("slices.tag", format!("duplicate tag {tag:?}")));
                }
            }
        }
        if let Some(secs) = self.run_for_secs {
            interval_from_secs("run_for_secs", secs)?;
        }
        Ok(())
    }

    pub fn run_for(&self) -> Option<Duration> {
        self.run_for_secs
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
    }

    /// True when every slice is bounded, so the scenario ends on its own.
    pub fn is_bounded(&self) -> bool {
        !self.slices.is_empty() && self.slices.iter().all(|s| s.count.is_bounded())
    }
}
