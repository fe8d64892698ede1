use crate::graph::Graph;
use crate::instance::Instance;
use crate::path::{validate_instance_name, InstancePath};
use crate::status::InstanceStatus;
use crate::ModelError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An application: its component graph plus the instance tree, stored flat
/// and keyed by path. Parent/child relations are derived from the paths.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Application {
    pub name: String,
    pub graph: Graph,
    instances: BTreeMap<InstancePath, Instance>,
}

impl Application {
    pub fn new(name: &str, graph: Graph) -> Result<Self, ModelError> {
        validate_instance_name(name)?;
        graph.validate()?;
        Ok(Self {
            name: name.to_owned(),
            graph,
            instances: BTreeMap::new(),
        })
    }

    /// Add a root instance (one machine). Its component must use the
    /// `target` installer.
    pub fn add_root(&mut self, name: &str, component: &str) -> Result<InstancePath, ModelError> {
        let decl = self.graph.component(component)?;
        if !decl.is_root() {
            return Err(ModelError::NotARootComponent(component.to_owned()));
        }
        let path = InstancePath::root(name)?;
        self.insert_new(path, component)
    }

    /// Add a child below `parent`; the parent's component must list
    /// `component` among its allowed children.
    pub fn add_instance(
        &mut self,
        parent: &InstancePath,
        name: &str,
        component: &str,
    ) -> Result<InstancePath, ModelError> {
        let parent_component = self
            .instances
            .get(parent)
            .ok_or_else(|| ModelError::ParentNotFound(parent.to_string()))?
            .component
            .clone();
        let allowed = &self.graph.component(&parent_component)?.children;
        if !allowed.iter().any(|c| c == component) {
            return Err(ModelError::ChildNotAllowed {
                parent: parent_component,
                child: component.to_owned(),
            });
        }
        let path = parent.child(name)?;
        self.insert_new(path, component)
    }

    fn insert_new(&mut self, path: InstancePath, component: &str) -> Result<InstancePath, ModelError> {
        let installer = self.graph.installer_of(component)?.to_owned();
        let exports = self.graph.default_exports(component);
        let instance = Instance::new(path.clone(), component, &installer).with_exports(exports);
        self.insert(instance)?;
        Ok(path)
    }

    /// Insert a fully formed instance, e.g. one received from the DM.
    pub fn insert(&mut self, instance: Instance) -> Result<(), ModelError> {
        if self.instances.contains_key(&instance.path) {
            return Err(ModelError::DuplicateInstance(instance.path.to_string()));
        }
        if let Some(parent) = instance.path.parent() {
            if !self.instances.contains_key(&parent) {
                return Err(ModelError::ParentNotFound(parent.to_string()));
            }
        }
        self.graph.component(&instance.component)?;
        self.instances.insert(instance.path.clone(), instance);
        Ok(())
    }

    pub fn get(&self, path: &InstancePath) -> Option<&Instance> {
        self.instances.get(path)
    }

    pub fn get_mut(&mut self, path: &InstancePath) -> Option<&mut Instance> {
        self.instances.get_mut(path)
    }

    pub fn require(&self, path: &InstancePath) -> Result<&Instance, ModelError> {
        self.get(path)
            .ok_or_else(|| ModelError::InstanceNotFound(path.to_string()))
    }

    pub fn require_mut(&mut self, path: &InstancePath) -> Result<&mut Instance, ModelError> {
        self.instances
            .get_mut(path)
            .ok_or_else(|| ModelError::InstanceNotFound(path.to_string()))
    }

    pub fn contains(&self, path: &InstancePath) -> bool {
        self.instances.contains_key(path)
    }

    pub fn instances(&self) -> impl Iterator<Item = &Instance> {
        self.instances.values()
    }

    pub fn instances_mut(&mut self) -> impl Iterator<Item = &mut Instance> {
        self.instances.values_mut()
    }

    pub fn roots(&self) -> impl Iterator<Item = &Instance> {
        self.instances.values().filter(|i| i.is_root())
    }

    /// Direct children of `path`.
    pub fn children(&self, path: &InstancePath) -> Vec<&Instance> {
        self.instances
            .values()
            .filter(|i| i.path.parent().as_ref() == Some(path))
            .collect()
    }

    /// All strict descendants of `path`, deepest first.
    pub fn descendants_deepest_first(&self, path: &InstancePath) -> Vec<InstancePath> {
        let mut below: Vec<InstancePath> = self
            .instances
            .keys()
            .filter(|p| path.is_ancestor_of(p))
            .cloned()
            .collect();
        below.sort_by(|a, b| b.depth().cmp(&a.depth()).then_with(|| a.cmp(b)));
        below
    }

    /// The instance at `path` plus all its descendants, parents first.
    pub fn subtree(&self, path: &InstancePath) -> Vec<Instance> {
        let mut nodes: Vec<Instance> = self
            .instances
            .values()
            .filter(|i| i.path == *path || path.is_ancestor_of(&i.path))
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.path.depth().cmp(&b.path.depth()).then_with(|| a.path.cmp(&b.path)));
        nodes
    }

    /// Remove `path` and its whole subtree. Returns the removed instances.
    pub fn remove(&mut self, path: &InstancePath) -> Result<Vec<Instance>, ModelError> {
        if !self.instances.contains_key(path) {
            return Err(ModelError::InstanceNotFound(path.to_string()));
        }
        let mut removed = Vec::new();
        for below in self.descendants_deepest_first(path) {
            if let Some(inst) = self.instances.remove(&below) {
                removed.push(inst);
            }
        }
        if let Some(inst) = self.instances.remove(path) {
            removed.push(inst);
        }
        Ok(removed)
    }

    /// Set the status of every instance below and including `path`.
    pub fn set_subtree_status(&mut self, path: &InstancePath, status: InstanceStatus) {
        for inst in self.instances.values_mut() {
            if inst.path == *path || path.is_ancestor_of(&inst.path) {
                inst.status = status;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::parse_graph_str;

    fn app() -> Application {
        let graph = parse_graph_str(
            r#"
[components.vm]
installer = "target"
children = ["tomcat"]

[components.tomcat]
installer = "logger"
exports = { port = "8080" }
children = ["war"]

[components.war]
installer = "logger"
"#,
        )
        .unwrap();
        Application::new("shop", graph).unwrap()
    }

    #[test]
    fn build_tree_and_navigate() {
        let mut app = app();
        let vm = app.add_root("vm1", "vm").unwrap();
        let tomcat = app.add_instance(&vm, "tomcat", "tomcat").unwrap();
        let war = app.add_instance(&tomcat, "shop-war", "war").unwrap();

        assert_eq!(app.roots().count(), 1);
        assert_eq!(app.children(&vm).len(), 1);
        assert_eq!(
            app.get(&tomcat).unwrap().exports.get("tomcat.port").map(String::as_str),
            Some("8080")
        );
        assert_eq!(app.descendants_deepest_first(&vm), vec![war.clone(), tomcat.clone()]);
        let subtree: Vec<_> = app.subtree(&vm).into_iter().map(|i| i.path).collect();
        assert_eq!(subtree, vec![vm, tomcat, war]);
    }

    #[test]
    fn duplicate_paths_rejected() {
        let mut app = app();
        let vm = app.add_root("vm1", "vm").unwrap();
        app.add_instance(&vm, "tomcat", "tomcat").unwrap();
        assert!(matches!(
            app.add_instance(&vm, "tomcat", "tomcat"),
            Err(ModelError::DuplicateInstance(_))
        ));
    }

    #[test]
    fn child_must_be_declared_by_parent_component() {
        let mut app = app();
        let vm = app.add_root("vm1", "vm").unwrap();
        assert!(matches!(
            app.add_instance(&vm, "war", "war"),
            Err(ModelError::ChildNotAllowed { .. })
        ));
        assert!(matches!(
            app.add_root("vm2", "tomcat"),
            Err(ModelError::NotARootComponent(_))
        ));
    }

    #[test]
    fn insert_requires_existing_parent() {
        let mut app = app();
        let orphan = Instance::new(InstancePath::parse("/vm9/tomcat").unwrap(), "tomcat", "logger");
        assert!(matches!(app.insert(orphan), Err(ModelError::ParentNotFound(_))));
    }

    #[test]
    fn remove_takes_subtree() {
        let mut app = app();
        let vm = app.add_root("vm1", "vm").unwrap();
        let tomcat = app.add_instance(&vm, "tomcat", "tomcat").unwrap();
        app.add_instance(&tomcat, "w", "war").unwrap();
        let removed = app.remove(&tomcat).unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(app.instances().count(), 1);
        assert!(app.remove(&tomcat).is_err());
    }

    #[test]
    fn subtree_status_update() {
        let mut app = app();
        let vm = app.add_root("vm1", "vm").unwrap();
        let tomcat = app.add_instance(&vm, "tomcat", "tomcat").unwrap();
        app.set_subtree_status(&vm, InstanceStatus::Problem);
        assert_eq!(app.get(&tomcat).unwrap().status, InstanceStatus::Problem);
    }
}
