//! Configuration for the mock engine.
//!
//! Controls the capture protocol limits and the defaults mocks are created
//! with.

use crate::recorder::RecorderSettings;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Upper bound on capture rounds per declaration block
    #[serde(default = "default_max_capture_rounds")]
    pub max_capture_rounds: usize,

    /// Capture rounds used when a boolean matcher is involved
    #[serde(default = "default_bool_rounds")]
    pub bool_rounds: usize,

    /// Create relaxed mocks unless asked otherwise
    #[serde(default)]
    pub relaxed_by_default: bool,

    /// Log every matched answer at debug level
    #[serde(default = "default_true")]
    pub log_matches: bool,

    /// Log calls that found no answer at debug level
    #[serde(default = "default_true")]
    pub log_unanswered: bool,
}

fn default_max_capture_rounds() -> usize {
    64
}

fn default_bool_rounds() -> usize {
    40
}

fn default_true() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_capture_rounds: default_max_capture_rounds(),
            bool_rounds: default_bool_rounds(),
            relaxed_by_default: false,
            log_matches: true,
            log_unanswered: true,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_capture_rounds == 0 {
            anyhow::bail!("max_capture_rounds must be at least 1");
        }
        if self.bool_rounds == 0 {
            anyhow::bail!("bool_rounds must be at least 1");
        }
        if self.bool_rounds > self.max_capture_rounds {
            anyhow::bail!(
                "bool_rounds ({}) exceeds max_capture_rounds ({})",
                self.bool_rounds,
                self.max_capture_rounds
            );
        }
        Ok(())
    }

    /// Round limits handed to every call recorder.
    pub fn recorder_settings(&self) -> RecorderSettings {
        RecorderSettings {
            max_rounds: self.max_capture_rounds,
            bool_rounds: self.bool_rounds,
        }
    }
}
