//! The agent-side message handler.
//!
//! An [`Agent`] owns the model of one root subtree. It is driven by a single
//! message processor, so every lifecycle command and import event for the
//! subtree is applied in arrival order, one at a time. Commands are checked
//! against the current state when they are dequeued; a command that was legal
//! when the DM sent it may be rejected by the time it runs.
//!
//! A status report or export announcement that cannot be published, even
//! after retries, marks the agent out of sync. The next heartbeat asks the DM
//! for the instance graph, and receiving it re-announces everything.

use crate::imports::{self, AppliedChange, ImportLedger};
use crate::lifecycle::{validate_command, LifecycleCommand};
use crate::CoreError;
use gantry_messaging::{AgentClient, Message, MessageHandler};
use gantry_model::{
    missing_imports, Application, CardinalityPolicy, Graph, Import, Instance, InstancePath,
    InstanceStatus, ModelError, ResourceBundle,
};
use gantry_plugin::{ImportChange, PluginContext, PluginOperation, PluginRegistry};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub application: String,
    pub root_instance: String,
    /// Filled into empty `ip` exports when an instance starts.
    pub ip_address: Option<String>,
    /// Resource bundles land in `<work_dir>/<application>/<instance path>`.
    pub work_dir: PathBuf,
    pub cardinality: CardinalityPolicy,
}

impl AgentSettings {
    pub fn new(application: &str, root_instance: &str, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            application: application.to_owned(),
            root_instance: root_instance.to_owned(),
            ip_address: None,
            work_dir: work_dir.into(),
            cardinality: CardinalityPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_ip_address(mut self, ip: &str) -> Self {
        self.ip_address = Some(ip.to_owned());
        self
    }

    #[must_use]
    pub fn with_cardinality(mut self, cardinality: CardinalityPolicy) -> Self {
        self.cardinality = cardinality;
        self
    }
}

pub struct Agent {
    settings: AgentSettings,
    client: Arc<AgentClient>,
    plugins: PluginRegistry,
    model: Option<Application>,
    ledger: ImportLedger,
    /// Prefixes whose imports channel we listen to.
    importing: BTreeSet<String>,
    /// Prefixes whose exports channel (import requests) we listen to.
    exporting: BTreeSet<String>,
    /// Set when a publication was lost; cleared by the next instance graph.
    out_of_sync: Arc<AtomicBool>,
}

impl Agent {
    pub fn new(settings: AgentSettings, client: Arc<AgentClient>, mut plugins: PluginRegistry) -> Self {
        plugins.set_names(&settings.application, &settings.root_instance);
        Self {
            settings,
            client,
            plugins,
            model: None,
            ledger: ImportLedger::new(),
            importing: BTreeSet::new(),
            exporting: BTreeSet::new(),
            out_of_sync: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    /// Shared with the heartbeat, which asks for a resync while it is set.
    pub fn resync_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.out_of_sync)
    }

    pub fn needs_resync(&self) -> bool {
        self.out_of_sync.load(Ordering::SeqCst)
    }

    fn lost_publication(&self) {
        if !self.out_of_sync.swap(true, Ordering::SeqCst) {
            warn!("{}: publication lost, asking for a resync", self.settings.root_instance);
        }
    }

    /// A copy of the current model, `None` until the DM sent the graph.
    pub fn snapshot(&self) -> Option<Application> {
        self.model.clone()
    }

    pub fn status(&self, path: &InstancePath) -> Option<InstanceStatus> {
        self.model.as_ref()?.get(path).map(|i| i.status)
    }

    /// Whether every required import of `path` has enough exporters.
    pub fn imports_satisfied(&self, path: &InstancePath) -> Option<bool> {
        let model = self.model.as_ref()?;
        let instance = model.get(path)?;
        Some(missing_imports(&model.graph, instance, self.settings.cardinality).is_empty())
    }

    pub fn resource_dir(&self, path: &InstancePath) -> PathBuf {
        self.settings
            .work_dir
            .join(&self.settings.application)
            .join(path.as_str().trim_start_matches('/'))
    }

    fn model(&self) -> Result<&Application, CoreError> {
        self.model.as_ref().ok_or(CoreError::NoModel)
    }

    fn model_mut(&mut self) -> Result<&mut Application, CoreError> {
        self.model.as_mut().ok_or(CoreError::NoModel)
    }

    fn dispatch(&mut self, message: Message) -> Result<(), CoreError> {
        match message {
            Message::SendInstanceGraph {
                application,
                graph,
                instances,
            } => self.receive_graph(&application, graph, instances),
            Message::AddInstance { parent, instance } => self.add_instance(&parent, instance),
            Message::DeployInstance { path, bundle } => self.deploy(&path, &bundle),
            Message::StartInstance { path } => self.start(&path),
            Message::StopInstance { path } => self.stop(&path),
            Message::UndeployInstance { path } => self.undeploy(&path),
            Message::RemoveInstance { path } => self.remove(&path),
            Message::ImportAdded {
                prefix,
                exporter_path,
                exporter_component,
                variables,
                revision,
            } => {
                let import = Import {
                    exporter_path,
                    exporter_component,
                    variables,
                };
                self.import_added(&prefix, &import, revision)
            }
            Message::ImportRemoved {
                prefix,
                exporter_path,
                revision,
                forced,
            } => self.import_removed(&prefix, &exporter_path, revision, forced),
            Message::ImportRequest { prefix, requester } => {
                self.import_requested(&prefix, &requester);
                Ok(())
            }
            other => Err(CoreError::UnexpectedMessage(other.kind())),
        }
    }

    // Model synchronisation

    fn receive_graph(
        &mut self,
        application: &str,
        graph: Graph,
        instances: Vec<Instance>,
    ) -> Result<(), CoreError> {
        if application != self.settings.application {
            return Err(CoreError::UnknownApplication(application.to_owned()));
        }
        let resync = self.model.is_some();
        // Everything below is re-announced; failures set the flag again.
        self.out_of_sync.store(false, Ordering::SeqCst);
        let mut fresh = Application::new(application, graph)?;
        let mut initialize = Vec::new();
        let mut differing = Vec::new();

        for mut instance in instances {
            if instance.path.root_name() != self.settings.root_instance {
                warn!("ignoring {} sent to agent {}", instance.path, self.settings.root_instance);
                continue;
            }
            if instance.is_root() {
                instance.status = InstanceStatus::DeployedStarted;
            } else {
                // What this agent did to an instance wins over what the DM
                // remembers; an instance it never saw has not been deployed.
                let known = self.model.as_ref().and_then(|m| m.get(&instance.path));
                let local = known.map_or(InstanceStatus::NotDeployed, |k| k.status);
                if local != instance.status {
                    differing.push(instance.path.clone());
                }
                match known {
                    Some(k) => {
                        instance.exports.clone_from(&k.exports);
                        instance.imports.clone_from(&k.imports);
                    }
                    None => {
                        instance.imports.clear();
                        initialize.push(instance.path.clone());
                    }
                }
                instance.status = local;
            }
            fresh.insert(instance)?;
        }

        info!(
            "{}: received instance graph ({} instance(s))",
            self.settings.root_instance,
            fresh.instances().count()
        );
        self.model = Some(fresh);

        for path in initialize {
            self.initialize(&path);
        }
        for path in differing {
            if let Some(status) = self.status(&path) {
                self.report(&path, status, None);
            }
        }
        self.refresh_subscriptions();
        if resync {
            self.resync_imports();
            // Peers may have dropped our exports while we were unreachable.
            let started = self.started_instances();
            for path in started {
                self.publish_exports(&path);
            }
        }
        Ok(())
    }

    /// Forget what remote exporters told us and ask them again. Anything
    /// published while we were unreachable is missing or stale here, and the
    /// broker may have dropped our subscriptions.
    fn resync_imports(&mut self) {
        if let Some(model) = self.model.as_mut() {
            let changes = self.ledger.withdraw_remote(model, &self.settings.root_instance);
            if let Err(e) = self.notify_import_changes(changes) {
                warn!("{}: resync left an instance in PROBLEM: {e}", self.settings.root_instance);
            }
        }
        for prefix in &self.exporting {
            if let Err(e) = self.client.listen_to_requests_from_other_agents(prefix) {
                warn!("failed to renew requests subscription for '{prefix}': {e}");
                self.lost_publication();
            }
        }
        for prefix in &self.importing {
            let renewed = self
                .client
                .listen_to_exports_from_other_agents(prefix)
                .and_then(|()| self.client.request_exports_from_other_agents(prefix));
            if let Err(e) = renewed {
                warn!("failed to renew imports of '{prefix}': {e}");
                self.lost_publication();
            }
        }
    }

    fn add_instance(&mut self, parent: &InstancePath, instance: Instance) -> Result<(), CoreError> {
        if instance.path.parent().as_ref() != Some(parent) {
            return Err(ModelError::InvalidPath(instance.path.to_string()).into());
        }
        let model = self.model_mut()?;
        if model.contains(&instance.path) {
            debug!("{} already known, ignoring duplicate add", instance.path);
            return Ok(());
        }
        let path = instance.path.clone();
        let mut instance = instance;
        instance.status = InstanceStatus::NotDeployed;
        instance.imports.clear();
        model.insert(instance)?;
        info!("{path}: added below {parent}");
        self.initialize(&path);
        self.refresh_subscriptions();
        Ok(())
    }

    fn initialize(&mut self, path: &InstancePath) {
        if let Err(e) = self.invoke(path, PluginOperation::Initialize, None) {
            warn!("{path}: initialization failed: {e}");
            self.set_status(path, InstanceStatus::Problem, Some(e.to_string()));
        }
    }

    /// Listen to the imports channel of every prefix some local instance
    /// requires, asking exporters to announce themselves, and to the exports
    /// channel of every prefix some local instance can export.
    fn refresh_subscriptions(&mut self) {
        let Some(model) = self.model.as_ref() else {
            return;
        };
        let required = imports::required_prefixes(model);
        let exported = imports::exported_prefixes(model);

        let stale: Vec<String> = self.exporting.difference(&exported).cloned().collect();
        for prefix in stale {
            if let Err(e) = self.client.stop_listening_to_requests_from_other_agents(&prefix) {
                warn!("failed to stop listening to requests for '{prefix}': {e}");
            }
            self.exporting.remove(&prefix);
        }
        let wanted: Vec<String> = exported.difference(&self.exporting).cloned().collect();
        for prefix in wanted {
            match self.client.listen_to_requests_from_other_agents(&prefix) {
                Ok(()) => {
                    self.exporting.insert(prefix);
                }
                Err(e) => {
                    warn!("failed to listen to requests for '{prefix}': {e}");
                    self.lost_publication();
                }
            }
        }

        let stale: Vec<String> = self.importing.difference(&required).cloned().collect();
        for prefix in stale {
            if let Err(e) = self.client.stop_listening_to_exports_from_other_agents(&prefix) {
                warn!("failed to stop listening to imports of '{prefix}': {e}");
            }
            self.importing.remove(&prefix);
        }
        let wanted: Vec<String> = required.difference(&self.importing).cloned().collect();
        for prefix in wanted {
            let subscribed = self
                .client
                .listen_to_exports_from_other_agents(&prefix)
                .and_then(|()| self.client.request_exports_from_other_agents(&prefix));
            match subscribed {
                Ok(()) => {
                    debug!("{}: importing '{prefix}'", self.settings.root_instance);
                    self.importing.insert(prefix);
                }
                Err(e) => {
                    warn!("failed to listen to imports of '{prefix}': {e}");
                    self.lost_publication();
                }
            }
        }
    }

    // Lifecycle

    fn deploy(&mut self, path: &InstancePath, bundle: &ResourceBundle) -> Result<(), CoreError> {
        validate_command(self.model()?, path, LifecycleCommand::Deploy)?;
        self.set_status(path, InstanceStatus::Deploying, None);
        let outcome = self
            .install_bundle(path, bundle)
            .and_then(|()| self.invoke(path, PluginOperation::Deploy, None));
        self.settle(path, outcome, InstanceStatus::DeployedStopped)
    }

    fn start(&mut self, path: &InstancePath) -> Result<(), CoreError> {
        validate_command(self.model()?, path, LifecycleCommand::Start)?;
        self.set_status(path, InstanceStatus::Starting, None);
        self.fill_ip_exports(path);
        let outcome = self.invoke(path, PluginOperation::Start, None);
        self.settle(path, outcome, InstanceStatus::DeployedStarted)?;
        self.publish_exports(path);
        self.log_missing_imports(path);
        Ok(())
    }

    fn stop(&mut self, path: &InstancePath) -> Result<(), CoreError> {
        validate_command(self.model()?, path, LifecycleCommand::Stop)?;
        self.set_status(path, InstanceStatus::Stopping, None);
        let outcome = self.invoke(path, PluginOperation::Stop, None);
        self.withdraw_exports(path);
        self.settle(path, outcome, InstanceStatus::DeployedStopped)
    }

    /// Undeploy `path` and everything below it, deepest first. Stops at the
    /// first failure, leaving the ancestors of the failed instance untouched.
    fn undeploy(&mut self, path: &InstancePath) -> Result<(), CoreError> {
        let model = self.model()?;
        validate_command(model, path, LifecycleCommand::Undeploy)?;
        let mut order = model.descendants_deepest_first(path);
        order.push(path.clone());
        for target in order {
            self.undeploy_one(&target)?;
        }
        Ok(())
    }

    fn undeploy_one(&mut self, path: &InstancePath) -> Result<(), CoreError> {
        match self.status(path) {
            None | Some(InstanceStatus::NotDeployed) => return Ok(()),
            Some(InstanceStatus::DeployedStarted) => {
                self.set_status(path, InstanceStatus::Stopping, None);
                if let Err(e) = self.invoke(path, PluginOperation::Stop, None) {
                    warn!("{path}: stop before undeploy failed: {e}");
                }
                self.withdraw_exports(path);
            }
            Some(_) => {}
        }
        self.set_status(path, InstanceStatus::Undeploying, None);
        let outcome = self.invoke(path, PluginOperation::Undeploy, None);
        if outcome.is_ok() {
            self.remove_resources(path);
        }
        self.settle(path, outcome, InstanceStatus::NotDeployed)
    }

    fn remove(&mut self, path: &InstancePath) -> Result<(), CoreError> {
        validate_command(self.model()?, path, LifecycleCommand::Remove)?;
        let removed = self.model_mut()?.remove(path)?;
        for instance in &removed {
            self.remove_resources(&instance.path);
        }
        info!("{path}: removed ({} instance(s))", removed.len());
        let message = Message::InstanceRemoved {
            application: self.settings.application.clone(),
            path: path.clone(),
        };
        if let Err(e) = self.client.send_to_dm(&message) {
            warn!("failed to report removal of {path}: {e}");
            self.lost_publication();
        }
        self.refresh_subscriptions();
        Ok(())
    }

    fn settle(
        &mut self,
        path: &InstancePath,
        outcome: Result<(), CoreError>,
        success: InstanceStatus,
    ) -> Result<(), CoreError> {
        match outcome {
            Ok(()) => {
                self.set_status(path, success, None);
                Ok(())
            }
            Err(e) => {
                warn!("{path}: {e}");
                self.set_status(path, InstanceStatus::Problem, Some(e.to_string()));
                Err(e)
            }
        }
    }

    fn install_bundle(&self, path: &InstancePath, bundle: &ResourceBundle) -> Result<(), CoreError> {
        bundle.verify()?;
        let dir = self.resource_dir(path);
        std::fs::create_dir_all(&dir)?;
        bundle.write_to(&dir)?;
        debug!("{path}: {} resource file(s) in {}", bundle.files.len(), dir.display());
        Ok(())
    }

    fn remove_resources(&self, path: &InstancePath) {
        let dir = self.resource_dir(path);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to remove {}: {e}", dir.display()),
        }
    }

    fn invoke(
        &mut self,
        path: &InstancePath,
        operation: PluginOperation,
        change: Option<&ImportChange>,
    ) -> Result<(), CoreError> {
        let resources = self.resource_dir(path);
        let instance = self
            .model
            .as_ref()
            .ok_or(CoreError::NoModel)?
            .require(path)?;
        let plugin = self.plugins.get_mut(&instance.installer)?;
        let ctx = PluginContext {
            instance,
            resources: &resources,
        };
        debug!("{path}: {operation} via '{}'", plugin.name());
        match operation {
            PluginOperation::Initialize => plugin.initialize(&ctx)?,
            PluginOperation::Deploy => plugin.deploy(&ctx)?,
            PluginOperation::Start => plugin.start(&ctx)?,
            PluginOperation::Update => plugin.update(&ctx, change, instance.status)?,
            PluginOperation::Stop => plugin.stop(&ctx)?,
            PluginOperation::Undeploy => plugin.undeploy(&ctx)?,
        }
        Ok(())
    }

    fn set_status(&mut self, path: &InstancePath, status: InstanceStatus, problem: Option<String>) {
        let Some(instance) = self.model.as_mut().and_then(|m| m.get_mut(path)) else {
            return;
        };
        if instance.status == status && problem.is_none() {
            return;
        }
        debug!("{path}: {} -> {status}", instance.status);
        instance.status = status;
        self.report(path, status, problem);
    }

    fn report(&self, path: &InstancePath, status: InstanceStatus, problem: Option<String>) {
        let message = Message::InstanceStatusChanged {
            application: self.settings.application.clone(),
            path: path.clone(),
            status,
            problem,
        };
        if let Err(e) = self.client.send_to_dm(&message) {
            warn!("failed to report {path} as {status}: {e}");
            self.lost_publication();
        }
    }

    // Exports and imports

    fn fill_ip_exports(&mut self, path: &InstancePath) {
        let Some(ip) = self.settings.ip_address.clone() else {
            return;
        };
        let Some(instance) = self.model.as_mut().and_then(|m| m.get_mut(path)) else {
            return;
        };
        for (name, value) in &mut instance.exports {
            let is_ip = name == "ip" || name.ends_with(".ip");
            if is_ip && value.is_empty() {
                value.clone_from(&ip);
            }
        }
    }

    fn started_instances(&self) -> Vec<InstancePath> {
        self.model.as_ref().map_or_else(Vec::new, |m| {
            m.instances()
                .filter(|i| !i.is_root() && i.status == InstanceStatus::DeployedStarted)
                .map(|i| i.path.clone())
                .collect()
        })
    }

    fn publish_exports(&self, path: &InstancePath) {
        self.for_each_export(path, |client, instance, prefix| {
            client.publish_exports(instance, prefix)
        });
    }

    fn withdraw_exports(&self, path: &InstancePath) {
        self.for_each_export(path, |client, instance, prefix| {
            client.unpublish_exports(instance, prefix)
        });
    }

    fn for_each_export(
        &self,
        path: &InstancePath,
        op: impl Fn(&AgentClient, &Instance, &str) -> Result<(), gantry_messaging::MessagingError>,
    ) {
        let Some(model) = self.model.as_ref() else {
            return;
        };
        let Some(instance) = model.get(path) else {
            return;
        };
        for prefix in model.graph.exported_prefixes(&instance.component) {
            if let Err(e) = op(&self.client, instance, &prefix) {
                warn!("{path}: failed to propagate exports for '{prefix}': {e}");
                self.lost_publication();
            }
        }
    }

    fn log_missing_imports(&self, path: &InstancePath) {
        let Some(model) = self.model.as_ref() else {
            return;
        };
        let Some(instance) = model.get(path) else {
            return;
        };
        let missing = missing_imports(&model.graph, instance, self.settings.cardinality);
        if !missing.is_empty() {
            info!("{path}: started with unresolved imports: {}", missing.join(", "));
        }
    }

    fn import_added(&mut self, prefix: &str, import: &Import, revision: u64) -> Result<(), CoreError> {
        let Some(model) = self.model.as_mut() else {
            debug!("no model yet, dropping import-added for '{prefix}'");
            return Ok(());
        };
        let changes = self.ledger.apply_added(model, prefix, import, revision);
        self.notify_import_changes(changes)
    }

    fn import_removed(
        &mut self,
        prefix: &str,
        exporter: &InstancePath,
        revision: u64,
        forced: bool,
    ) -> Result<(), CoreError> {
        let Some(model) = self.model.as_mut() else {
            debug!("no model yet, dropping import-removed for '{prefix}'");
            return Ok(());
        };
        let changes = if forced {
            self.ledger.apply_withdrawn(model, prefix, exporter)
        } else {
            self.ledger.apply_removed(model, prefix, exporter, revision)
        };
        self.notify_import_changes(changes)
    }

    /// Tell the plugin of every started instance whose imports changed.
    fn notify_import_changes(&mut self, changes: Vec<AppliedChange>) -> Result<(), CoreError> {
        let mut failure = None;
        for (path, change) in changes {
            if self.status(&path) != Some(InstanceStatus::DeployedStarted) {
                continue;
            }
            if let Err(e) = self.invoke(&path, PluginOperation::Update, Some(&change)) {
                warn!("{path}: update after import {} failed: {e}", change.kind());
                self.withdraw_exports(&path);
                self.set_status(&path, InstanceStatus::Problem, Some(e.to_string()));
                failure.get_or_insert(e);
                continue;
            }
            self.log_missing_imports(&path);
        }
        failure.map_or(Ok(()), Err)
    }

    fn import_requested(&self, prefix: &str, requester: &str) {
        let Some(model) = self.model.as_ref() else {
            return;
        };
        let exporters: Vec<&Instance> = model
            .instances()
            .filter(|i| i.status == InstanceStatus::DeployedStarted)
            .filter(|i| model.graph.exported_prefixes(&i.component).iter().any(|p| p == prefix))
            .collect();
        if !exporters.is_empty() {
            debug!("{requester} asked for '{prefix}', re-publishing {} exporter(s)", exporters.len());
        }
        for instance in exporters {
            if let Err(e) = self.client.publish_exports(instance, prefix) {
                warn!("{}: failed to re-publish '{prefix}': {e}", instance.path);
                self.lost_publication();
            }
        }
    }
}

impl MessageHandler for Agent {
    type Error = CoreError;

    fn handle(&mut self, message: Message) -> Result<(), CoreError> {
        self.dispatch(message)
    }
}
