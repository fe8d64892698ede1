//! Lifecycle plugins for gantry instances.
//!
//! An instance's installer name selects a [`Plugin`] from the
//! [`PluginRegistry`] (case-insensitive). Built-ins: `mock` (records calls,
//! optional injected failures), `logger` (logs and succeeds) and `script`
//! (runs `scripts/<operation>.sh` from the instance's resources).

pub mod logger;
pub mod mock;
pub mod plugin;
pub mod registry;
pub mod script;

pub use logger::LoggerPlugin;
pub use mock::{MockPlugin, MockRecorder, PluginCall};
pub use plugin::{ImportChange, Plugin, PluginContext, PluginOperation};
pub use registry::{select_plugin, PluginRegistry};
pub use script::{ScriptPlugin, DEFAULT_SCRIPT_TIMEOUT};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no plugin found for installer '{0}'")]
    NotFound(String),
    #[error("plugin '{plugin}' failed to {operation}: {reason}")]
    OperationFailed {
        plugin: String,
        operation: String,
        reason: String,
    },
    #[error("script {script} exited with {code:?}: {stderr}")]
    ScriptFailed {
        script: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("script {script} did not finish within {timeout:?}")]
    ScriptTimedOut {
        script: String,
        timeout: std::time::Duration,
    },
}
