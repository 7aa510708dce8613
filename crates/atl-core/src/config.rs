//! Pipeline configuration
//!
//! Loaded from TOML; every field has a default so partial files work:
//!
//! ```toml
//! max_iterations = 3
//! stage_timeout_secs = 300
//!
//! [sandbox]
//! max_wall_seconds = 60
//! network_enabled = false
//!
//! [engine]
//! max_concurrent_runs = 4
//! ```

use crate::error::ConfigError;
use atl_sandbox::{EngineConfig, ResourceLimits};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Upper bound accepted for `max_iterations`
pub const MAX_ITERATIONS_LIMIT: u32 = 10;

/// Orchestrator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Revision loops allowed before forcing human approval
    pub max_iterations: u32,
    /// Timeout for each stage executor and publish call
    pub stage_timeout_secs: u64,
    /// Simultaneous stage executor calls across all tasks
    pub max_concurrent_stages: usize,
    /// Per-task event buffer; slower observers skip ahead
    pub event_capacity: usize,
    /// Limits applied to every sandbox run
    pub sandbox: ResourceLimits,
    /// Sandbox engine settings
    pub engine: EngineConfig,
}

impl PipelineConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With revision budget
    #[inline]
    #[must_use]
    pub fn with_max_iterations(mut self, max: u32) -> Self {
        self.max_iterations = max;
        self
    }

    /// With stage timeout
    #[inline]
    #[must_use]
    pub fn with_stage_timeout_secs(mut self, secs: u64) -> Self {
        self.stage_timeout_secs = secs;
        self
    }

    /// With stage concurrency bound
    #[inline]
    #[must_use]
    pub fn with_max_concurrent_stages(mut self, max: usize) -> Self {
        self.max_concurrent_stages = max;
        self
    }

    /// With sandbox limits
    #[inline]
    #[must_use]
    pub fn with_sandbox_limits(mut self, limits: ResourceLimits) -> Self {
        self.sandbox = limits;
        self
    }

    /// Stage timeout as a duration
    #[inline]
    #[must_use]
    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs)
    }

    /// Parse and validate TOML
    ///
    /// # Errors
    /// `Parse` for malformed TOML, `Invalid` for out-of-range values
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    ///
    /// # Errors
    /// `Io` when the file cannot be read, otherwise as [`Self::from_toml_str`]
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Check value ranges
    ///
    /// # Errors
    /// `Invalid` describing the first offending field
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_iterations > MAX_ITERATIONS_LIMIT {
            return Err(ConfigError::Invalid(format!(
                "max_iterations must be at most {MAX_ITERATIONS_LIMIT}"
            )));
        }
        if self.stage_timeout_secs == 0 {
            return Err(ConfigError::Invalid("stage_timeout_secs must be greater than zero".into()));
        }
        if self.max_concurrent_stages == 0 {
            return Err(ConfigError::Invalid("max_concurrent_stages must be greater than zero".into()));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid("event_capacity must be greater than zero".into()));
        }
        if self.engine.max_concurrent_runs == 0 {
            return Err(ConfigError::Invalid("engine.max_concurrent_runs must be greater than zero".into()));
        }
        self.sandbox
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("sandbox: {e}")))
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            stage_timeout_secs: 300,
            max_concurrent_stages: 8,
            event_capacity: 256,
            sandbox: ResourceLimits::default(),
            engine: EngineConfig::default(),
        }
    }
}
