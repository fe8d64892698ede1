use crate::AgentError;
use gantry_messaging::{MessagingConfig, IN_MEMORY_TRANSPORT};
use gantry_model::{validate_instance_name, CardinalityPolicy};
use gantry_plugin::{select_plugin, DEFAULT_SCRIPT_TIMEOUT};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

fn default_heartbeat_interval_ms() -> u64 {
    5_000
}

fn default_connect_attempts() -> u32 {
    10
}

fn default_script_timeout_secs() -> u64 {
    DEFAULT_SCRIPT_TIMEOUT.as_secs()
}

fn default_plugins() -> Vec<String> {
    vec!["script".to_owned(), "logger".to_owned()]
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    pub application: String,
    pub root_instance: String,
    /// Advertised to the manager and used to fill empty `ip` exports.
    #[serde(default)]
    pub ip_address: Option<String>,
    pub work_dir: PathBuf,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    #[serde(default = "default_plugins")]
    pub plugins: Vec<String>,
    /// Lifecycle scripts still running after this long are killed.
    #[serde(default = "default_script_timeout_secs")]
    pub script_timeout_secs: u64,
    #[serde(default)]
    pub cardinality: CardinalityPolicy,
    pub messaging: MessagingConfig,
}

impl AgentConfig {
    pub fn load(path: &Path) -> Result<Self, AgentError> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    /// Parse and validate.
    pub fn parse(input: &str) -> Result<Self, AgentError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AgentError> {
        if self.application.trim().is_empty() {
            return Err(AgentError::Config("application name is empty".to_owned()));
        }
        validate_instance_name(&self.root_instance)
            .map_err(|e| AgentError::Config(format!("root_instance: {e}")))?;
        if self.heartbeat_interval_ms == 0 {
            return Err(AgentError::Config(
                "heartbeat_interval_ms must be positive".to_owned(),
            ));
        }
        if self.script_timeout_secs == 0 {
            return Err(AgentError::Config(
                "script_timeout_secs must be positive".to_owned(),
            ));
        }
        if self.plugins.is_empty() {
            return Err(AgentError::Config("no plugins enabled".to_owned()));
        }
        for name in &self.plugins {
            select_plugin(name)?;
        }
        self.messaging.validate()?;
        if self.messaging.transport_type == IN_MEMORY_TRANSPORT {
            warn!("in-memory messaging only reaches managers in this process");
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn script_timeout(&self) -> Duration {
        Duration::from_secs(self.script_timeout_secs)
    }
}
