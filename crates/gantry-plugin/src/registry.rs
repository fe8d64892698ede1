use crate::plugin::Plugin;
use crate::PluginError;
use std::collections::BTreeMap;
use tracing::debug;

/// Build a built-in plugin by name.
pub fn select_plugin(name: &str) -> Result<Box<dyn Plugin>, PluginError> {
    match name.to_ascii_lowercase().as_str() {
        "mock" => Ok(Box::new(crate::mock::MockPlugin::new())),
        "logger" => Ok(Box::new(crate::logger::LoggerPlugin::new())),
        "script" => Ok(Box::new(crate::script::ScriptPlugin::new())),
        _ => Err(PluginError::NotFound(name.to_owned())),
    }
}

/// Installer name → plugin, matched case-insensitively.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: BTreeMap<String, Box<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in plugins listed in `names`.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self, PluginError> {
        let mut registry = Self::new();
        for name in names {
            registry.register(select_plugin(name.as_ref())?);
        }
        Ok(registry)
    }

    /// Add a plugin under its own name, replacing any previous one.
    pub fn register(&mut self, plugin: Box<dyn Plugin>) -> Option<Box<dyn Plugin>> {
        let key = plugin.name().to_ascii_lowercase();
        debug!("registering plugin '{key}'");
        self.plugins.insert(key, plugin)
    }

    pub fn contains(&self, installer: &str) -> bool {
        self.plugins.contains_key(&installer.to_ascii_lowercase())
    }

    pub fn get_mut(&mut self, installer: &str) -> Result<&mut (dyn Plugin + 'static), PluginError> {
        self.plugins
            .get_mut(&installer.to_ascii_lowercase())
            .map(AsMut::as_mut)
            .ok_or_else(|| PluginError::NotFound(installer.to_owned()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.plugins.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Forward the agent's identity to every plugin.
    pub fn set_names(&mut self, application: &str, root_instance: &str) {
        for plugin in self.plugins.values_mut() {
            plugin.set_names(application, root_instance);
        }
    }
}
