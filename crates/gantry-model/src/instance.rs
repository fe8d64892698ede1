use crate::path::InstancePath;
use crate::status::InstanceStatus;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Instance data key holding the provider machine id of a root instance.
pub const DATA_MACHINE_ID: &str = "machine.id";
/// Instance data key holding the IP address reported for a root instance.
pub const DATA_IP_ADDRESS: &str = "ip.address";

/// Variables one exporter publishes under one component/facet name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Import {
    pub exporter_path: InstancePath,
    /// Component of the exporting instance.
    pub exporter_component: String,
    /// Qualified variable name (`prefix.variable`) → value.
    pub variables: BTreeMap<String, String>,
}

/// A node of the instance tree.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Instance {
    pub path: InstancePath,
    pub component: String,
    pub installer: String,
    #[serde(default)]
    pub status: InstanceStatus,
    /// Qualified exported variables with their current values.
    #[serde(default)]
    pub exports: BTreeMap<String, String>,
    /// Resolved imports: required prefix → exporter path → import.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub imports: BTreeMap<String, BTreeMap<InstancePath, Import>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data: BTreeMap<String, String>,
}

impl Instance {
    pub fn new(path: InstancePath, component: &str, installer: &str) -> Self {
        Self {
            path,
            component: component.to_owned(),
            installer: installer.to_owned(),
            status: InstanceStatus::NotDeployed,
            exports: BTreeMap::new(),
            imports: BTreeMap::new(),
            data: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_exports(mut self, exports: BTreeMap<String, String>) -> Self {
        self.exports = exports;
        self
    }

    pub fn name(&self) -> &str {
        self.path.name()
    }

    pub fn is_root(&self) -> bool {
        self.path.is_root()
    }

    /// Exported variables published under `prefix`.
    pub fn exports_for(&self, prefix: &str) -> BTreeMap<String, String> {
        let qualifier = format!("{prefix}.");
        self.exports
            .iter()
            .filter(|(k, _)| k.starts_with(&qualifier))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Number of exporters currently resolved for `prefix`.
    pub fn exporter_count(&self, prefix: &str) -> usize {
        self.imports.get(prefix).map_or(0, BTreeMap::len)
    }

    pub fn machine_id(&self) -> Option<&str> {
        self.data.get(DATA_MACHINE_ID).map(String::as_str)
    }
}
