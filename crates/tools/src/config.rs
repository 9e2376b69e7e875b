//! YAML run configuration.
//!
//! ```yaml
//! demo: transforms
//! steps: 100
//! log_filter: info,brainflow_runtime=trace
//! scheduler:
//!   step_delay_ms: 10
//!   report_interval_ms: 500
//! devices:
//!   device_count: 2
//! ```
//!
//! Every section is optional; missing fields take their defaults.

use std::fs;
use std::path::Path;

use brainflow_runtime::{DeviceConfig, SchedulerConfig};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Demo run when neither the file nor the command line names one.
pub const DEFAULT_DEMO: &str = "transforms";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub scheduler: SchedulerConfig,
    pub devices: DeviceConfig,
    /// Demo network to build.
    pub demo: String,
    /// Steps to run; 0 runs until interrupted.
    pub steps: u64,
    /// Log filter used when `RUST_LOG` is unset.
    pub log_filter: Option<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            scheduler: SchedulerConfig::default(),
            devices: DeviceConfig::default(),
            demo: DEFAULT_DEMO.to_string(),
            steps: 10,
            log_filter: None,
        }
    }
}

impl RunConfig {
    /// Load a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::parse(&text).map_err(|source| Error::Config {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), demo = %config.demo, "loaded run configuration");
        Ok(config)
    }

    /// Parse YAML text. An empty document gives the defaults.
    pub fn parse(text: &str) -> std::result::Result<Self, serde_yaml::Error> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text)
    }
}
