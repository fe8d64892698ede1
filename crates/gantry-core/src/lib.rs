//! Orchestration core for gantry.
//!
//! The agent side ([`Agent`], driven by an [`AgentRuntime`]) applies
//! lifecycle commands to its instances through plugins, validated by the
//! [`lifecycle`] rules, and keeps their resolved imports current from the
//! import messages of peer agents ([`imports`]). The manager side
//! ([`Manager`]) owns the application models, provisions root instances
//! through targets, tracks agent liveness by heartbeat, and withdraws the
//! exports of agents it loses.

pub mod agent;
pub mod imports;
pub mod lifecycle;
pub mod local;
pub mod manager;
pub mod runtime;

pub use agent::{Agent, AgentSettings};
pub use imports::ImportLedger;
pub use lifecycle::{validate_command, LifecycleCommand};
pub use local::InProcessLauncher;
pub use manager::{Manager, ManagerConfig, ProvisioningHandle};
pub use runtime::AgentRuntime;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("model error: {0}")]
    Model(#[from] gantry_model::ModelError),
    #[error("messaging error: {0}")]
    Messaging(#[from] gantry_messaging::MessagingError),
    #[error("plugin error: {0}")]
    Plugin(#[from] gantry_plugin::PluginError),
    #[error("target error: {0}")]
    Target(#[from] gantry_target::TargetError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse manager config: {0}")]
    Config(#[from] toml::de::Error),
    #[error("cannot {command} {path} while it is {status}")]
    InvalidTransition {
        path: String,
        command: String,
        status: String,
    },
    #[error("cannot {command} {path}: parent is {parent_status}")]
    ParentNotReady {
        path: String,
        command: String,
        parent_status: String,
    },
    #[error("cannot stop {0}: a child instance is still started")]
    ChildrenStarted(String),
    #[error("root instance {0} is managed through its target, not by lifecycle commands")]
    RootInstance(String),
    #[error("instance graph not received yet")]
    NoModel,
    #[error("unknown application: {0}")]
    UnknownApplication(String),
    #[error("application {0} is already registered")]
    ApplicationExists(String),
    #[error("agent {root} of application {application} is not connected")]
    AgentUnavailable { application: String, root: String },
    #[error("unexpected {0} message")]
    UnexpectedMessage(&'static str),
}
