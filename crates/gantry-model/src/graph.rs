use crate::ModelError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Installer name reserved for root components; their instances are machines
/// managed through a target, never through a plugin.
pub const TARGET_INSTALLER: &str = "target";

/// Static component/facet declarations of an application.
///
/// ```toml
/// [components.vm]
/// installer = "target"
/// children = ["tomcat"]
///
/// [components.tomcat]
/// installer = "script"
/// facets = ["web"]
/// exports = { port = "8080", ip = "" }
/// imports = [{ prefix = "mysql" }, { prefix = "cache", optional = true }]
///
/// [facets.web]
/// exports = { url = "" }
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Graph {
    #[serde(default)]
    pub components: BTreeMap<String, Component>,
    #[serde(default)]
    pub facets: BTreeMap<String, Facet>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Component {
    pub installer: String,
    #[serde(default)]
    pub facets: Vec<String>,
    /// Exported variables (local name → default value).
    #[serde(default)]
    pub exports: BTreeMap<String, String>,
    #[serde(default)]
    pub imports: Vec<ImportDecl>,
    /// Component names allowed as direct children.
    #[serde(default)]
    pub children: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct Facet {
    #[serde(default)]
    pub exports: BTreeMap<String, String>,
}

/// A dependency on the variables exported under a component or facet name.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ImportDecl {
    pub prefix: String,
    #[serde(default)]
    pub optional: bool,
}

impl Component {
    pub fn is_root(&self) -> bool {
        self.installer == TARGET_INSTALLER
    }
}

impl Graph {
    pub fn component(&self, name: &str) -> Result<&Component, ModelError> {
        self.components
            .get(name)
            .ok_or_else(|| ModelError::UnknownComponent(name.to_owned()))
    }

    /// Check cross references: facets, children and import prefixes must all
    /// name declared things, and every component needs an installer.
    pub fn validate(&self) -> Result<(), ModelError> {
        for (name, component) in &self.components {
            if component.installer.trim().is_empty() {
                return Err(ModelError::EmptyInstaller(name.clone()));
            }
            for facet in &component.facets {
                if !self.facets.contains_key(facet) {
                    return Err(ModelError::UnknownFacet {
                        component: name.clone(),
                        facet: facet.clone(),
                    });
                }
            }
            for child in &component.children {
                if !self.components.contains_key(child) {
                    return Err(ModelError::UnknownComponent(child.clone()));
                }
            }
            for import in &component.imports {
                if !self.components.contains_key(&import.prefix)
                    && !self.facets.contains_key(&import.prefix)
                {
                    return Err(ModelError::UnknownImport {
                        component: name.clone(),
                        prefix: import.prefix.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Names under which instances of `component` publish variables: the
    /// component name and each of its facets, when they declare any export.
    pub fn exported_prefixes(&self, component: &str) -> Vec<String> {
        let Some(decl) = self.components.get(component) else {
            return Vec::new();
        };
        let mut prefixes = Vec::new();
        if !decl.exports.is_empty() {
            prefixes.push(component.to_owned());
        }
        for facet in &decl.facets {
            if self.facets.get(facet).is_some_and(|f| !f.exports.is_empty()) {
                prefixes.push(facet.clone());
            }
        }
        prefixes
    }

    /// Default export values, keyed by qualified name (`prefix.variable`).
    pub fn default_exports(&self, component: &str) -> BTreeMap<String, String> {
        let mut exports = BTreeMap::new();
        let Some(decl) = self.components.get(component) else {
            return exports;
        };
        for (var, value) in &decl.exports {
            exports.insert(format!("{component}.{var}"), value.clone());
        }
        for facet in &decl.facets {
            if let Some(f) = self.facets.get(facet) {
                for (var, value) in &f.exports {
                    exports.insert(format!("{facet}.{var}"), value.clone());
                }
            }
        }
        exports
    }

    /// Prefixes `component` imports from.
    pub fn imports_of(&self, component: &str) -> &[ImportDecl] {
        self.components
            .get(component)
            .map(|c| c.imports.as_slice())
            .unwrap_or_default()
    }

    pub fn installer_of(&self, component: &str) -> Result<&str, ModelError> {
        Ok(self.component(component)?.installer.as_str())
    }
}

pub fn parse_graph_str(input: &str) -> Result<Graph, ModelError> {
    let graph: Graph = toml::from_str(input)?;
    graph.validate()?;
    Ok(graph)
}

pub fn parse_graph_file(path: impl AsRef<Path>) -> Result<Graph, ModelError> {
    let content = fs::read_to_string(path)?;
    parse_graph_str(&content)
}
