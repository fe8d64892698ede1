use crate::plugin::{ImportChange, Plugin, PluginContext};
use crate::PluginError;
use gantry_model::InstanceStatus;
use tracing::info;

/// Logs every lifecycle call and always succeeds.
#[derive(Debug, Default)]
pub struct LoggerPlugin {
    application: String,
    root_instance: String,
}

impl LoggerPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    fn log(&self, operation: &str, ctx: &PluginContext<'_>) {
        info!(
            "[{}/{}] {operation} {} ({})",
            self.application, self.root_instance, ctx.instance.path, ctx.instance.component
        );
    }
}

impl Plugin for LoggerPlugin {
    fn name(&self) -> &'static str {
        "logger"
    }

    fn set_names(&mut self, application: &str, root_instance: &str) {
        application.clone_into(&mut self.application);
        root_instance.clone_into(&mut self.root_instance);
    }

    fn initialize(&mut self, ctx: &PluginContext<'_>) -> Result<(), PluginError> {
        self.log("initialize", ctx);
        Ok(())
    }

    fn deploy(&mut self, ctx: &PluginContext<'_>) -> Result<(), PluginError> {
        self.log("deploy", ctx);
        Ok(())
    }

    fn start(&mut self, ctx: &PluginContext<'_>) -> Result<(), PluginError> {
        self.log("start", ctx);
        Ok(())
    }

    fn update(
        &mut self,
        ctx: &PluginContext<'_>,
        changed_import: Option<&ImportChange>,
        changed_status: InstanceStatus,
    ) -> Result<(), PluginError> {
        match changed_import {
            Some(change) => info!(
                "[{}/{}] update {}: import '{}' {} by {} (status {changed_status})",
                self.application,
                self.root_instance,
                ctx.instance.path,
                change.prefix(),
                change.kind(),
                change.exporter_path()
            ),
            None => info!(
                "[{}/{}] update {}: status {changed_status}",
                self.application, self.root_instance, ctx.instance.path
            ),
        }
        Ok(())
    }

    fn stop(&mut self, ctx: &PluginContext<'_>) -> Result<(), PluginError> {
        self.log("stop", ctx);
        Ok(())
    }

    fn undeploy(&mut self, ctx: &PluginContext<'_>) -> Result<(), PluginError> {
        self.log("undeploy", ctx);
        Ok(())
    }
}
