//! fleetd.toml configuration.
//!
//! Each subsystem owns its section; everything has a default, so an empty
//! file is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use fleetgrid_autoscale::ScalingConfig;
use fleetgrid_coordinator::CoordinatorConfig;
use fleetgrid_resources::ResourceConfig;
use fleetgrid_state::StateConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Shell hooks that start and stop agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Run with `FLEET_AGENT_TYPE` and `FLEET_AGENT_COUNT`; prints one agent id per line.
    pub spawn_command: Option<String>,
    /// Run with `FLEET_AGENT_ID`.
    pub terminate_command: Option<String>,
    #[serde(with = "humantime_serde")]
    pub command_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            spawn_command: None,
            terminate_command: None,
            command_timeout: Duration::from_secs(30),
        }
    }
}

/// Daemon-only loop settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// How often pending tasks are matched against agents.
    #[serde(with = "humantime_serde")]
    pub dispatch_interval: Duration,
    /// How often finished tasks past their retention are purged.
    #[serde(with = "humantime_serde")]
    pub retention_interval: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            dispatch_interval: Duration::from_secs(2),
            retention_interval: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub daemon: DaemonConfig,
    pub coordinator: CoordinatorConfig,
    pub resources: ResourceConfig,
    pub state: StateConfig,
    pub scaling: ScalingConfig,
    pub lifecycle: LifecycleConfig,
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: FleetConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.coordinator
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        self.scaling
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        let margin = self.resources.safety_margin;
        if !(margin > 0.0 && margin <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "resources.safety_margin {margin} outside (0, 1]"
            )));
        }
        if self.state.retry_attempts == 0 {
            return Err(ConfigError::Invalid("state.retry_attempts must be > 0".into()));
        }
        let zero = [
            ("daemon.dispatch_interval", self.daemon.dispatch_interval),
            ("daemon.retention_interval", self.daemon.retention_interval),
            ("coordinator.health_check_interval", self.coordinator.health_check_interval),
            ("resources.reclamation_interval", self.resources.reclamation_interval),
            ("scaling.evaluation_interval", self.scaling.evaluation_interval),
        ]
        .into_iter()
        .find(|(_, d)| d.is_zero());
        if let Some((name, _)) = zero {
            return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
        }
        Ok(())
    }
}
