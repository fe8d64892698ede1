use crate::plugin::{ImportChange, Plugin, PluginContext, PluginOperation};
use crate::PluginError;
use gantry_model::{InstancePath, InstanceStatus};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// One recorded plugin invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginCall {
    pub operation: PluginOperation,
    pub path: InstancePath,
    pub change: Option<ImportChange>,
    pub status: Option<InstanceStatus>,
}

#[derive(Default)]
struct Journal {
    calls: Vec<PluginCall>,
    failing: BTreeSet<PluginOperation>,
    names: Option<(String, String)>,
}

/// Shared view of a `MockPlugin`'s journal. Stays usable after the plugin
/// has been moved into a registry.
#[derive(Clone, Default)]
pub struct MockRecorder {
    journal: Arc<Mutex<Journal>>,
}

impl MockRecorder {
    fn lock(&self) -> MutexGuard<'_, Journal> {
        self.journal.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn calls(&self) -> Vec<PluginCall> {
        self.lock().calls.clone()
    }

    pub fn calls_for(&self, path: &InstancePath) -> Vec<PluginCall> {
        self.lock()
            .calls
            .iter()
            .filter(|c| &c.path == path)
            .cloned()
            .collect()
    }

    pub fn operations_for(&self, path: &InstancePath) -> Vec<PluginOperation> {
        self.calls_for(path).into_iter().map(|c| c.operation).collect()
    }

    pub fn count(&self, operation: PluginOperation) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    /// Make every later call of `operation` fail.
    pub fn fail_on(&self, operation: PluginOperation) {
        self.lock().failing.insert(operation);
    }

    pub fn clear_failures(&self) {
        self.lock().failing.clear();
    }

    pub fn names(&self) -> Option<(String, String)> {
        self.lock().names.clone()
    }

    pub fn clear(&self) {
        self.lock().calls.clear();
    }
}

/// Plugin that performs no real action. Succeeds unless told otherwise.
pub struct MockPlugin {
    name: String,
    recorder: MockRecorder,
}

impl Default for MockPlugin {
    fn default() -> Self {
        Self::named("mock")
    }
}

impl MockPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    /// A mock answering to another installer name.
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            recorder: MockRecorder::default(),
        }
    }

    pub fn recorder(&self) -> MockRecorder {
        self.recorder.clone()
    }

    fn record(
        &self,
        operation: PluginOperation,
        ctx: &PluginContext<'_>,
        change: Option<&ImportChange>,
        status: Option<InstanceStatus>,
    ) -> Result<(), PluginError> {
        let mut journal = self.recorder.lock();
        journal.calls.push(PluginCall {
            operation,
            path: ctx.instance.path.clone(),
            change: change.cloned(),
            status,
        });
        if journal.failing.contains(&operation) {
            return Err(PluginError::OperationFailed {
                plugin: self.name.clone(),
                operation: operation.to_string(),
                reason: "injected failure".to_owned(),
            });
        }
        Ok(())
    }
}

impl Plugin for MockPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_names(&mut self, application: &str, root_instance: &str) {
        self.recorder.lock().names = Some((application.to_owned(), root_instance.to_owned()));
    }

    fn initialize(&mut self, ctx: &PluginContext<'_>) -> Result<(), PluginError> {
        self.record(PluginOperation::Initialize, ctx, None, None)
    }

    fn deploy(&mut self, ctx: &PluginContext<'_>) -> Result<(), PluginError> {
        self.record(PluginOperation::Deploy, ctx, None, None)
    }

    fn start(&mut self, ctx: &PluginContext<'_>) -> Result<(), PluginError> {
        self.record(PluginOperation::Start, ctx, None, None)
    }

    fn update(
        &mut self,
        ctx: &PluginContext<'_>,
        changed_import: Option<&ImportChange>,
        changed_status: InstanceStatus,
    ) -> Result<(), PluginError> {
        self.record(
            PluginOperation::Update,
            ctx,
            changed_import,
            Some(changed_status),
        )
    }

    fn stop(&mut self, ctx: &PluginContext<'_>) -> Result<(), PluginError> {
        self.record(PluginOperation::Stop, ctx, None, None)
    }

    fn undeploy(&mut self, ctx: &PluginContext<'_>) -> Result<(), PluginError> {
        self.record(PluginOperation::Undeploy, ctx, None, None)
    }
}
