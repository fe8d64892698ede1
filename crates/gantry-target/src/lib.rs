//! Targets: where root instances get their machines.
//!
//! A [`Target`] validates its configuration eagerly in
//! `set_target_properties`, then creates or terminates machines on request.
//! Built-ins: `in-memory` (agents run inside the current process and are
//! tracked in a [`LocalAgentRegistry`]), `embedded` (machines that already
//! exist) and `azure` (property validation only).

pub mod azure;
pub mod embedded;
pub mod memory;
pub mod properties;

pub use azure::AzureTarget;
pub use embedded::EmbeddedTarget;
pub use memory::{AgentLauncher, InMemoryTarget, LocalAgentHandle, LocalAgentRegistry, LocalAgents};
pub use properties::{load_properties, parse_properties, TargetProperties};

use gantry_messaging::MessagingConfig;
use gantry_model::MachineId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("target I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown target type: {0}")]
    UnknownTarget(String),
    #[error("missing required target property '{0}'")]
    MissingProperty(String),
    #[error("invalid target property '{key}': {reason}")]
    InvalidProperty { key: String, reason: String },
    #[error("target '{0}' has not been configured")]
    NotConfigured(String),
    #[error("target '{target}' does not support {operation}")]
    Unsupported { target: String, operation: String },
    #[error("unknown machine: {0}")]
    UnknownMachine(String),
    #[error("provisioning failed: {0}")]
    Provisioning(String),
}

/// Everything a target needs to bring up the agent of one root instance.
#[derive(Debug, Clone, Copy)]
pub struct MachineRequest<'a> {
    /// Messaging endpoint and credentials the new agent connects with.
    pub messaging: &'a MessagingConfig,
    pub application: &'a str,
    pub root_instance: &'a str,
}

pub trait Target: Send + Sync {
    fn target_type(&self) -> &'static str;

    /// Validate and store the configuration. Fails on the first missing or
    /// malformed key, before any provisioning is attempted.
    fn set_target_properties(&mut self, properties: &TargetProperties) -> Result<(), TargetError>;

    /// Create the machine for a root instance, or reconfigure the one that
    /// already exists. May block for as long as the provider takes.
    fn create_or_configure_machine(
        &self,
        request: &MachineRequest<'_>,
    ) -> Result<MachineId, TargetError>;

    fn terminate_machine(&self, machine_id: &MachineId) -> Result<(), TargetError>;
}

/// Build a target by type. `local` is required for the `in-memory` type.
pub fn select_target(
    target_type: &str,
    local: Option<&LocalAgents>,
) -> Result<Box<dyn Target>, TargetError> {
    match target_type {
        memory::IN_MEMORY_TARGET => match local {
            Some(local) => Ok(Box::new(InMemoryTarget::new(local.clone()))),
            None => Err(TargetError::Unsupported {
                target: target_type.to_owned(),
                operation: "machine creation without a local agent launcher".to_owned(),
            }),
        },
        embedded::EMBEDDED_TARGET => Ok(Box::new(EmbeddedTarget::new())),
        azure::AZURE_TARGET => Ok(Box::new(AzureTarget::new())),
        other => Err(TargetError::UnknownTarget(other.to_owned())),
    }
}
