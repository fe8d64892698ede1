use crate::PluginError;
use gantry_model::{Import, Instance, InstancePath, InstanceStatus};
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PluginOperation {
    Initialize,
    Deploy,
    Start,
    Update,
    Stop,
    Undeploy,
}

impl PluginOperation {
    pub const ALL: [PluginOperation; 6] = [
        PluginOperation::Initialize,
        PluginOperation::Deploy,
        PluginOperation::Start,
        PluginOperation::Update,
        PluginOperation::Stop,
        PluginOperation::Undeploy,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PluginOperation::Initialize => "initialize",
            PluginOperation::Deploy => "deploy",
            PluginOperation::Start => "start",
            PluginOperation::Update => "update",
            PluginOperation::Stop => "stop",
            PluginOperation::Undeploy => "undeploy",
        }
    }
}

impl fmt::Display for PluginOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What changed in a started instance's resolved imports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportChange {
    /// A new exporter appeared for `prefix`.
    Added { prefix: String, import: Import },
    /// A known exporter published different values.
    Updated { prefix: String, import: Import },
    /// An exporter withdrew.
    Removed {
        prefix: String,
        exporter_path: InstancePath,
    },
}

impl ImportChange {
    pub fn prefix(&self) -> &str {
        match self {
            ImportChange::Added { prefix, .. }
            | ImportChange::Updated { prefix, .. }
            | ImportChange::Removed { prefix, .. } => prefix,
        }
    }

    pub fn exporter_path(&self) -> &InstancePath {
        match self {
            ImportChange::Added { import, .. } | ImportChange::Updated { import, .. } => {
                &import.exporter_path
            }
            ImportChange::Removed { exporter_path, .. } => exporter_path,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ImportChange::Added { .. } => "added",
            ImportChange::Updated { .. } => "updated",
            ImportChange::Removed { .. } => "removed",
        }
    }
}

/// What a plugin gets to work with for one call.
#[derive(Debug, Clone, Copy)]
pub struct PluginContext<'a> {
    pub instance: &'a Instance,
    /// Directory holding the instance's resource bundle files.
    pub resources: &'a Path,
}

/// A lifecycle plugin, selected by an instance's installer name.
///
/// Every operation may fail; the caller maps any failure to the `PROBLEM`
/// status.
pub trait Plugin: Send {
    fn name(&self) -> &str;

    fn set_names(&mut self, application: &str, root_instance: &str);

    fn initialize(&mut self, ctx: &PluginContext<'_>) -> Result<(), PluginError>;

    fn deploy(&mut self, ctx: &PluginContext<'_>) -> Result<(), PluginError>;

    fn start(&mut self, ctx: &PluginContext<'_>) -> Result<(), PluginError>;

    /// A started instance's imports changed, or its status did.
    fn update(
        &mut self,
        ctx: &PluginContext<'_>,
        changed_import: Option<&ImportChange>,
        changed_status: InstanceStatus,
    ) -> Result<(), PluginError>;

    fn stop(&mut self, ctx: &PluginContext<'_>) -> Result<(), PluginError>;

    fn undeploy(&mut self, ctx: &PluginContext<'_>) -> Result<(), PluginError>;
}
