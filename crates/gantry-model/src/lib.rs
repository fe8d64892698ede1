//! Application model for gantry: instance tree, component graph, and imports.
//!
//! This crate defines the data the orchestration protocol moves around:
//! root-anchored `InstancePath`s, the `InstanceStatus` lifecycle enum, the
//! `Graph` of component/facet declarations (loaded from TOML), `Instance`
//! nodes with their exports and resolved imports, the `Application` tree,
//! the configurable `CardinalityPolicy`, and digest-checked `ResourceBundle`s.

pub mod application;
pub mod bundle;
pub mod cardinality;
pub mod graph;
pub mod instance;
pub mod path;
pub mod status;
pub mod types;

pub use application::Application;
pub use bundle::ResourceBundle;
pub use cardinality::{imports_satisfied, missing_imports, CardinalityPolicy};
pub use graph::{
    parse_graph_file, parse_graph_str, Component, Facet, Graph, ImportDecl, TARGET_INSTALLER,
};
pub use instance::{Import, Instance, DATA_IP_ADDRESS, DATA_MACHINE_ID};
pub use path::{validate_instance_name, InstancePath};
pub use status::InstanceStatus;
pub use types::{BundleDigest, MachineId};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("failed to read model file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse graph: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("invalid name: {0}")]
    InvalidName(String),
    #[error("invalid instance path: '{0}'")]
    InvalidPath(String),
    #[error("unknown component: {0}")]
    UnknownComponent(String),
    #[error("component '{component}' references unknown facet '{facet}'")]
    UnknownFacet { component: String, facet: String },
    #[error("component '{component}' imports unknown prefix '{prefix}'")]
    UnknownImport { component: String, prefix: String },
    #[error("component '{0}' has an empty installer name")]
    EmptyInstaller(String),
    #[error("component '{0}' is not a root component (installer must be 'target')")]
    NotARootComponent(String),
    #[error("component '{child}' is not an allowed child of '{parent}'")]
    ChildNotAllowed { parent: String, child: String },
    #[error("instance not found: {0}")]
    InstanceNotFound(String),
    #[error("instance already exists: {0}")]
    DuplicateInstance(String),
    #[error("parent instance not found: {0}")]
    ParentNotFound(String),
    #[error("resource bundle integrity failure: expected {expected}, got {actual}")]
    BundleIntegrity { expected: String, actual: String },
    #[error("resource bundle path escapes its directory: {0}")]
    UnsafeBundlePath(String),
}
