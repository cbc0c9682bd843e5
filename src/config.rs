//! Configuration management for Tollgate.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TollgateError};
use crate::ratelimit::{LimiterOptions, Rule, RuleDefinition};

/// Main configuration for a Tollgate limiter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Limiter behaviour
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Rules to register, by name
    #[serde(default)]
    pub rules: HashMap<String, RuleDefinition>,
}

/// Limiter behaviour settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Commit usage of denied drops
    #[serde(default)]
    pub overflow: bool,

    /// How often the in-memory store sweeps expired states, in milliseconds
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_ms: u64,

    /// Gate concurrent drops per key inside the process
    #[serde(default = "default_serialize_writes")]
    pub serialize_writes: bool,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            overflow: false,
            maintenance_interval_ms: default_maintenance_interval(),
            serialize_writes: default_serialize_writes(),
        }
    }
}

fn default_maintenance_interval() -> u64 {
    5000
}

fn default_serialize_writes() -> bool {
    true
}

impl LimiterConfig {
    /// Limiter options derived from this configuration.
    pub fn options(&self) -> LimiterOptions {
        LimiterOptions {
            overflow: self.overflow,
            serialize_writes: self.serialize_writes,
        }
    }

    /// The store maintenance cadence.
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }
}

impl TollgateConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    ///
    /// Every rule is validated here so a bad definition fails at load time.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TollgateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.limiter.maintenance_interval_ms == 0 {
            return Err(TollgateError::Config(
                "maintenance_interval_ms must be greater than 0".to_string(),
            ));
        }

        for (name, definition) in &self.rules {
            Rule::try_from(definition)
                .map_err(|e| TollgateError::Config(format!("rule {}: {}", name, e)))?;
        }

        Ok(())
    }
}
