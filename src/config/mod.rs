//! TOML configuration for the supervisor and the shim
//!
//! ```toml
//! [supervisor]
//! restart_delay_ms = 5000
//! grace_period_ms = 5000
//!
//! [shim]
//! interval_ms = 10000
//! ```
//!
//! Every key is optional; command line flags override file values.

use crate::error::ConfigError;
use crate::process::{DEFAULT_GRACE_PERIOD, DEFAULT_RESTART_DELAY};
use log::{info, warn};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Collection interval used when nothing is configured
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub supervisor: SupervisorConfig,
    pub shim: ShimConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SupervisorConfig {
    /// Delay before restarting a child that exited
    pub restart_delay_ms: u64,
    /// Time between SIGTERM and SIGKILL on stop
    pub grace_period_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            restart_delay_ms: DEFAULT_RESTART_DELAY.as_millis() as u64,
            grace_period_ms: DEFAULT_GRACE_PERIOD.as_millis() as u64,
        }
    }
}

impl SupervisorConfig {
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShimConfig {
    /// Collection interval for input plugins; 0 collects on request only
    pub interval_ms: u64,
}

impl Default for ShimConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_INTERVAL.as_millis() as u64,
        }
    }
}

impl ShimConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Config {
    /// Load and validate a configuration file
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ReadError` if the file cannot be read,
    /// `ConfigError::TomlError` if it is not valid TOML for this schema, or
    /// `ConfigError::ValidationError` if a value is out of range.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;
        let config = Self::from_toml(&content)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parse and validate configuration text
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, falling back to defaults when the file is missing
    ///
    /// A file that exists but is unreadable or invalid is still an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) if !path.exists() => {
                warn!(
                    "Config file {} not found, using defaults",
                    path.display()
                );
                Ok(Self::default())
            }
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.supervisor.grace_period_ms == 0 {
            return Err(ConfigError::ValidationError(
                "supervisor.grace_period_ms must be greater than 0".to_string(),
            ));
        }
        // Guard against the restart loop spinning on a crashing child
        if self.supervisor.restart_delay_ms == 0 {
            return Err(ConfigError::ValidationError(
                "supervisor.restart_delay_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
