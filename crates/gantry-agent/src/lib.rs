//! The gantry agent daemon.
//!
//! One agent runs per root instance. It loads an [`AgentConfig`], builds
//! the plugin registry it names, connects to the broker and then serves DM
//! commands and peer import messages until it is told to shut down, at
//! which point it announces `machine-down` so the manager does not wait for
//! missed heartbeats.

pub mod config;
pub mod service;

pub use config::AgentConfig;
pub use service::{build_runtime, run_until};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse agent config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid agent config: {0}")]
    Config(String),
    #[error("messaging error: {0}")]
    Messaging(#[from] gantry_messaging::MessagingError),
    #[error("plugin error: {0}")]
    Plugin(#[from] gantry_plugin::PluginError),
    #[error(transparent)]
    Core(#[from] gantry_core::CoreError),
}
