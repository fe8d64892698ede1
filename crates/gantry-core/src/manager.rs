//! The deployment manager.
//!
//! The manager owns the authoritative application models. Root instances
//! are provisioned through their application's target on a worker thread;
//! everything below a root is delegated to the root's agent over messaging.
//! Agents are tracked by heartbeat. When one goes quiet for longer than
//! `heartbeat_interval * missed_heartbeats`, or announces its shutdown, its
//! subtree is marked PROBLEM and the exports of its started instances are
//! withdrawn on its behalf, once. When it comes back, it gets its subtree
//! again and reports its real statuses.

use crate::lifecycle::LifecycleCommand;
use crate::CoreError;
use gantry_messaging::{retry, Backoff, DmClient, Message, MessageHandler, MessageProcessor, MessagingConfig};
use gantry_model::{
    Application, CardinalityPolicy, InstancePath, InstanceStatus, MachineId, ResourceBundle,
    DATA_IP_ADDRESS, DATA_MACHINE_ID,
};
use gantry_target::{MachineRequest, Target, TargetError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ManagerConfig {
    pub heartbeat_interval_ms: u64,
    /// Heartbeats an agent may miss before it is considered lost.
    pub missed_heartbeats: u32,
    /// How often the liveness sweep runs.
    pub check_period_ms: u64,
    pub connect_attempts: u32,
    /// Handed to the agents this manager starts in-process.
    pub cardinality: CardinalityPolicy,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 5_000,
            missed_heartbeats: 3,
            check_period_ms: 1_000,
            connect_attempts: 5,
            cardinality: CardinalityPolicy::default(),
        }
    }
}

impl ManagerConfig {
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    pub fn parse(input: &str) -> Result<Self, CoreError> {
        Ok(toml::from_str(input)?)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn loss_timeout(&self) -> Duration {
        self.heartbeat_interval() * self.missed_heartbeats.max(1)
    }

    pub fn check_period(&self) -> Duration {
        Duration::from_millis(self.check_period_ms.max(1))
    }
}

/// A provisioning or termination running on its own thread.
pub struct ProvisioningHandle<T> {
    worker: JoinHandle<Result<T, TargetError>>,
}

impl<T> ProvisioningHandle<T> {
    pub fn is_finished(&self) -> bool {
        self.worker.is_finished()
    }

    pub fn wait(self) -> Result<T, TargetError> {
        self.worker
            .join()
            .unwrap_or_else(|_| Err(TargetError::Provisioning("worker thread panicked".to_owned())))
    }
}

struct Deployment {
    app: Application,
    target: Arc<dyn Target>,
    last_seen: BTreeMap<String, Instant>,
    /// Lost agents, with the statuses their instances had when they went quiet.
    lost: BTreeMap<String, BTreeMap<InstancePath, InstanceStatus>>,
    problems: BTreeMap<InstancePath, String>,
}

impl Deployment {
    fn is_connected(&self, root: &str) -> bool {
        if self.lost.contains_key(root) {
            return false;
        }
        InstancePath::root(root)
            .ok()
            .and_then(|p| self.app.get(&p))
            .is_some_and(|i| i.status == InstanceStatus::DeployedStarted)
    }

    /// Withdrawals for every started, exporting instance below `root`.
    fn withdrawals(&self, application: &str, root: &InstancePath) -> Vec<Outgoing> {
        let mut out = Vec::new();
        for instance in self.app.subtree(root) {
            if instance.is_root() || instance.status != InstanceStatus::DeployedStarted {
                continue;
            }
            for prefix in self.app.graph.exported_prefixes(&instance.component) {
                out.push(Outgoing::Withdraw {
                    application: application.to_owned(),
                    prefix,
                    exporter: instance.path.clone(),
                });
            }
        }
        out
    }
}

#[derive(Default)]
struct Registry {
    deployments: BTreeMap<String, Deployment>,
}

impl Registry {
    fn deployment(&self, name: &str) -> Result<&Deployment, CoreError> {
        self.deployments
            .get(name)
            .ok_or_else(|| CoreError::UnknownApplication(name.to_owned()))
    }

    fn deployment_mut(&mut self, name: &str) -> Result<&mut Deployment, CoreError> {
        self.deployments
            .get_mut(name)
            .ok_or_else(|| CoreError::UnknownApplication(name.to_owned()))
    }
}

type Shared = Arc<Mutex<Registry>>;

fn lock(shared: &Shared) -> MutexGuard<'_, Registry> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Messages decided under the registry lock, sent once it is released.
enum Outgoing {
    ToAgent {
        application: String,
        root: String,
        message: Message,
    },
    Withdraw {
        application: String,
        prefix: String,
        exporter: InstancePath,
    },
}

fn flush(client: &DmClient, outgoing: Vec<Outgoing>) {
    for out in outgoing {
        let sent = match &out {
            Outgoing::ToAgent {
                application,
                root,
                message,
            } => client.send_to_agent(application, root, message),
            Outgoing::Withdraw {
                application,
                prefix,
                exporter,
            } => {
                debug!("withdrawing {prefix} exports of {exporter}");
                client.withdraw_exports(application, prefix, exporter)
            }
        };
        if let Err(e) = sent {
            warn!("failed to send to agents: {e}");
        }
    }
}

/// Mark the agent of `root` lost. Returns the withdrawals to publish, or
/// `None` when it was already lost.
fn mark_lost(dep: &mut Deployment, application: &str, root: &str) -> Option<Vec<Outgoing>> {
    if dep.lost.contains_key(root) {
        return None;
    }
    let root_path = InstancePath::root(root).ok()?;
    if !dep.app.contains(&root_path) {
        return None;
    }
    dep.last_seen.remove(root);
    let withdrawals = dep.withdrawals(application, &root_path);
    let saved = dep
        .app
        .subtree(&root_path)
        .into_iter()
        .filter(|i| !i.is_root())
        .map(|i| (i.path, i.status))
        .collect();
    dep.lost.insert(root.to_owned(), saved);
    dep.app.set_subtree_status(&root_path, InstanceStatus::Problem);
    warn!(
        "agent {root} of {application} lost, withdrew {} export(s)",
        withdrawals.len()
    );
    Some(withdrawals)
}

fn sweep(shared: &Shared, client: &DmClient, timeout: Duration, now: Instant) -> Vec<(String, String)> {
    let mut newly_lost = Vec::new();
    let mut outgoing = Vec::new();
    {
        let mut registry = lock(shared);
        for (name, dep) in &mut registry.deployments {
            let expired: Vec<String> = dep
                .last_seen
                .iter()
                .filter(|(_, seen)| now.saturating_duration_since(**seen) > timeout)
                .map(|(root, _)| root.clone())
                .collect();
            for root in expired {
                if let Some(withdrawals) = mark_lost(dep, name, &root) {
                    outgoing.extend(withdrawals);
                    newly_lost.push((name.clone(), root));
                }
            }
        }
    }
    flush(client, outgoing);
    newly_lost
}

/// Handles everything agents send to the DM.
struct DmHandler {
    shared: Shared,
    client: Arc<DmClient>,
}

impl DmHandler {
    fn heartbeat(
        &self,
        application: &str,
        root: &str,
        ip_address: Option<String>,
        resync: bool,
    ) -> Result<(), CoreError> {
        let outgoing = {
            let mut registry = lock(&self.shared);
            let dep = registry.deployment_mut(application)?;
            let root_path = InstancePath::root(root)?;
            let status = dep.app.require(&root_path)?.status;
            if matches!(status, InstanceStatus::NotDeployed | InstanceStatus::Undeploying) {
                debug!("ignoring heartbeat from {root}: root is {status}");
                return Ok(());
            }
            dep.last_seen.insert(root.to_owned(), Instant::now());
            let instance = dep.app.require_mut(&root_path)?;
            if let Some(ip) = ip_address {
                instance.data.insert(DATA_IP_ADDRESS.to_owned(), ip);
            }
            let saved = dep.lost.remove(root);
            if saved.is_none() && status == InstanceStatus::DeployedStarted && !resync {
                return Ok(());
            }
            instance.status = InstanceStatus::DeployedStarted;
            match saved {
                Some(saved) => {
                    for (path, status) in saved {
                        if let Some(i) = dep.app.get_mut(&path) {
                            i.status = status;
                        }
                    }
                    info!("agent {root} of {application} is back");
                }
                None if resync => info!("agent {root} of {application} asked for a resync"),
                None => info!("agent {root} of {application} is up"),
            }
            vec![Outgoing::ToAgent {
                application: application.to_owned(),
                root: root.to_owned(),
                message: Message::SendInstanceGraph {
                    application: application.to_owned(),
                    graph: dep.app.graph.clone(),
                    instances: dep.app.subtree(&root_path),
                },
            }]
        };
        flush(&self.client, outgoing);
        Ok(())
    }

    fn status_changed(
        &self,
        application: &str,
        path: &InstancePath,
        status: InstanceStatus,
        problem: Option<String>,
    ) -> Result<(), CoreError> {
        let mut registry = lock(&self.shared);
        let dep = registry.deployment_mut(application)?;
        if path.is_root() {
            debug!("ignoring agent-reported status of root {path}");
            return Ok(());
        }
        if let Some(saved) = dep.lost.get_mut(path.root_name()) {
            saved.insert(path.clone(), status);
            return Ok(());
        }
        let Some(instance) = dep.app.get_mut(path) else {
            debug!("status for unknown instance {path}");
            return Ok(());
        };
        debug!("{application}{path}: {} -> {status}", instance.status);
        instance.status = status;
        match problem {
            Some(reason) => {
                warn!("{application}{path}: {reason}");
                dep.problems.insert(path.clone(), reason);
            }
            None => {
                dep.problems.remove(path);
            }
        }
        Ok(())
    }

    fn instance_removed(&self, application: &str, path: &InstancePath) -> Result<(), CoreError> {
        let mut registry = lock(&self.shared);
        let dep = registry.deployment_mut(application)?;
        if dep.app.contains(path) {
            for removed in dep.app.remove(path)? {
                dep.problems.remove(&removed.path);
            }
            info!("{application}{path} removed");
        }
        Ok(())
    }

    fn machine_down(&self, application: &str, root: &str) -> Result<(), CoreError> {
        let outgoing = {
            let mut registry = lock(&self.shared);
            let dep = registry.deployment_mut(application)?;
            let status = dep.app.require(&InstancePath::root(root)?)?.status;
            if matches!(status, InstanceStatus::NotDeployed | InstanceStatus::Undeploying) {
                debug!("agent {root} shut down as requested");
                return Ok(());
            }
            info!("agent {root} of {application} announced its shutdown");
            mark_lost(dep, application, root).unwrap_or_default()
        };
        flush(&self.client, outgoing);
        Ok(())
    }
}

impl MessageHandler for DmHandler {
    type Error = CoreError;

    fn handle(&mut self, message: Message) -> Result<(), CoreError> {
        match message {
            Message::Heartbeat {
                application,
                root_instance,
                ip_address,
                resync,
                ..
            } => self.heartbeat(&application, &root_instance, ip_address, resync),
            Message::InstanceStatusChanged {
                application,
                path,
                status,
                problem,
            } => self.status_changed(&application, &path, status, problem),
            Message::InstanceRemoved { application, path } => {
                self.instance_removed(&application, &path)
            }
            Message::MachineDown {
                application,
                root_instance,
            } => self.machine_down(&application, &root_instance),
            other => Err(CoreError::UnexpectedMessage(other.kind())),
        }
    }
}

struct Monitor {
    stop: mpsc::Sender<()>,
    worker: JoinHandle<()>,
}

pub struct Manager {
    config: ManagerConfig,
    messaging: MessagingConfig,
    client: Arc<DmClient>,
    shared: Shared,
    processor: MessageProcessor<DmHandler>,
    monitor: Option<Monitor>,
}

impl Manager {
    /// `messaging` is what new agents are told to connect with.
    pub fn new(config: ManagerConfig, messaging: MessagingConfig, client: DmClient) -> Self {
        let client = Arc::new(client);
        let shared = Shared::default();
        let handler = DmHandler {
            shared: Arc::clone(&shared),
            client: Arc::clone(&client),
        };
        Self {
            config,
            messaging,
            client,
            shared,
            processor: MessageProcessor::new("dm", handler),
            monitor: None,
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn start(&mut self) -> Result<(), CoreError> {
        self.processor.start()?;
        self.client.set_message_queue(self.processor.queue());
        let client = Arc::clone(&self.client);
        let connected = retry(
            "connect to messaging",
            self.config.connect_attempts.max(1),
            Backoff::default(),
            || client.open_connection(),
        );
        if let Err(e) = connected {
            self.processor.stop();
            return Err(e.into());
        }
        for name in self.applications() {
            self.client.listen_to_agents(&name)?;
        }
        self.start_monitor()?;
        info!("manager started");
        Ok(())
    }

    fn start_monitor(&mut self) -> Result<(), CoreError> {
        let (stop, ticks) = mpsc::channel();
        let shared = Arc::clone(&self.shared);
        let client = Arc::clone(&self.client);
        let timeout = self.config.loss_timeout();
        let period = self.config.check_period();
        let worker = std::thread::Builder::new()
            .name("dm-liveness".to_owned())
            .spawn(move || loop {
                match ticks.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => {
                        sweep(&shared, &client, timeout, Instant::now());
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        self.monitor = Some(Monitor { stop, worker });
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            let _ = monitor.stop.send(());
            if monitor.worker.join().is_err() {
                error!("liveness monitor panicked");
            }
        }
        self.processor.stop();
        if self.client.is_connected() {
            if let Err(e) = self.client.close_connection() {
                warn!("failed to close messaging connection: {e}");
            }
            info!("manager stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.processor.is_running()
    }

    pub fn register_application(
        &self,
        app: Application,
        target: Box<dyn Target>,
    ) -> Result<(), CoreError> {
        let name = app.name.clone();
        {
            let mut registry = lock(&self.shared);
            if registry.deployments.contains_key(&name) {
                return Err(CoreError::ApplicationExists(name));
            }
            registry.deployments.insert(
                name.clone(),
                Deployment {
                    app,
                    target: Arc::from(target),
                    last_seen: BTreeMap::new(),
                    lost: BTreeMap::new(),
                    problems: BTreeMap::new(),
                },
            );
        }
        if self.client.is_connected() {
            self.client.listen_to_agents(&name)?;
        }
        info!("registered application {name}");
        Ok(())
    }

    /// Forget an application and clean its messaging artifacts. Every root
    /// must be NOT_DEPLOYED.
    pub fn delete_application(&self, name: &str) -> Result<Application, CoreError> {
        let deployment = {
            let mut registry = lock(&self.shared);
            let dep = registry.deployment(name)?;
            if let Some(root) = dep.app.roots().find(|r| r.status != InstanceStatus::NotDeployed) {
                return Err(CoreError::InvalidTransition {
                    path: root.path.to_string(),
                    command: "delete".to_owned(),
                    status: root.status.to_string(),
                });
            }
            registry
                .deployments
                .remove(name)
                .ok_or_else(|| CoreError::UnknownApplication(name.to_owned()))?
        };
        if self.client.is_connected() {
            self.client.stop_listening_to_agents(name)?;
            self.client.delete_messaging_server_artifacts(name)?;
        }
        info!("deleted application {name}");
        Ok(deployment.app)
    }

    pub fn applications(&self) -> Vec<String> {
        lock(&self.shared).deployments.keys().cloned().collect()
    }

    pub fn snapshot(&self, application: &str) -> Option<Application> {
        lock(&self.shared)
            .deployments
            .get(application)
            .map(|d| d.app.clone())
    }

    pub fn status(&self, application: &str, path: &InstancePath) -> Option<InstanceStatus> {
        lock(&self.shared)
            .deployments
            .get(application)
            .and_then(|d| d.app.get(path))
            .map(|i| i.status)
    }

    /// The last failure an agent reported for `path`, if it is still current.
    pub fn problem(&self, application: &str, path: &InstancePath) -> Option<String> {
        lock(&self.shared)
            .deployments
            .get(application)
            .and_then(|d| d.problems.get(path).cloned())
    }

    pub fn lost_agents(&self, application: &str) -> BTreeSet<String> {
        lock(&self.shared)
            .deployments
            .get(application)
            .map(|d| d.lost.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_agent_connected(&self, application: &str, root: &str) -> bool {
        lock(&self.shared)
            .deployments
            .get(application)
            .is_some_and(|d| d.is_connected(root))
    }

    /// Run a liveness sweep as of `now`. Returns the (application, root)
    /// pairs newly considered lost.
    pub fn check_agents(&self, now: Instant) -> Vec<(String, String)> {
        sweep(&self.shared, &self.client, self.config.loss_timeout(), now)
    }

    pub fn add_root_instance(
        &self,
        application: &str,
        name: &str,
        component: &str,
    ) -> Result<InstancePath, CoreError> {
        let mut registry = lock(&self.shared);
        Ok(registry
            .deployment_mut(application)?
            .app
            .add_root(name, component)?)
    }

    /// Add an instance under `parent`. A connected agent is told right away;
    /// otherwise it receives the instance with its next graph.
    pub fn add_instance(
        &self,
        application: &str,
        parent: &InstancePath,
        name: &str,
        component: &str,
    ) -> Result<InstancePath, CoreError> {
        let (path, outgoing) = {
            let mut registry = lock(&self.shared);
            let dep = registry.deployment_mut(application)?;
            let path = dep.app.add_instance(parent, name, component)?;
            let instance = dep.app.require(&path)?.clone();
            let root = path.root_name().to_owned();
            let outgoing = if dep.is_connected(&root) {
                vec![Outgoing::ToAgent {
                    application: application.to_owned(),
                    root,
                    message: Message::AddInstance {
                        parent: parent.clone(),
                        instance,
                    },
                }]
            } else {
                Vec::new()
            };
            (path, outgoing)
        };
        flush(&self.client, outgoing);
        Ok(path)
    }

    /// Remove a NOT_DEPLOYED instance and its subtree. When the agent is
    /// connected it performs the removal and reports back.
    pub fn remove_instance(&self, application: &str, path: &InstancePath) -> Result<(), CoreError> {
        let root = path.root_name().to_owned();
        {
            let mut registry = lock(&self.shared);
            let dep = registry.deployment_mut(application)?;
            let status = dep.app.require(path)?.status;
            if status != InstanceStatus::NotDeployed {
                return Err(CoreError::InvalidTransition {
                    path: path.to_string(),
                    command: LifecycleCommand::Remove.to_string(),
                    status: status.to_string(),
                });
            }
            if path.is_root() || !dep.is_connected(&root) {
                for removed in dep.app.remove(path)? {
                    dep.problems.remove(&removed.path);
                }
                info!("{application}{path} removed");
                return Ok(());
            }
        }
        self.client.send_to_agent(
            application,
            &root,
            &Message::RemoveInstance { path: path.clone() },
        )?;
        Ok(())
    }

    /// Provision the machine of a root instance. The root is DEPLOYING until
    /// its agent's first heartbeat, or PROBLEM if provisioning fails.
    pub fn deploy_root(
        &self,
        application: &str,
        root: &str,
    ) -> Result<ProvisioningHandle<MachineId>, CoreError> {
        let root_path = InstancePath::root(root)?;
        let target = {
            let mut registry = lock(&self.shared);
            let dep = registry.deployment_mut(application)?;
            let instance = dep.app.require_mut(&root_path)?;
            if !matches!(instance.status, InstanceStatus::NotDeployed | InstanceStatus::Problem) {
                return Err(CoreError::InvalidTransition {
                    path: root_path.to_string(),
                    command: LifecycleCommand::Deploy.to_string(),
                    status: instance.status.to_string(),
                });
            }
            instance.status = InstanceStatus::Deploying;
            dep.problems.remove(&root_path);
            Arc::clone(&dep.target)
        };
        info!("provisioning {root} of {application} on {}", target.target_type());

        let shared = Arc::clone(&self.shared);
        let messaging = self.messaging.clone();
        let application = application.to_owned();
        let root = root.to_owned();
        let worker = std::thread::Builder::new()
            .name(format!("provision-{root}"))
            .spawn(move || {
                let request = MachineRequest {
                    messaging: &messaging,
                    application: &application,
                    root_instance: &root,
                };
                let outcome = target.create_or_configure_machine(&request);
                let mut registry = lock(&shared);
                let Some(dep) = registry.deployments.get_mut(&application) else {
                    return outcome;
                };
                match &outcome {
                    Ok(machine_id) => {
                        if let Some(instance) = dep.app.get_mut(&root_path) {
                            instance
                                .data
                                .insert(DATA_MACHINE_ID.to_owned(), machine_id.to_string());
                        }
                        info!("machine {machine_id} ready for {root}");
                    }
                    Err(e) => {
                        warn!("provisioning {root} of {application} failed: {e}");
                        if let Some(instance) = dep.app.get_mut(&root_path) {
                            instance.status = InstanceStatus::Problem;
                        }
                        dep.problems.insert(root_path.clone(), e.to_string());
                    }
                }
                outcome
            })?;
        Ok(ProvisioningHandle { worker })
    }

    /// Terminate the machine of a root instance. Exports of its started
    /// instances are withdrawn first; the whole subtree ends NOT_DEPLOYED,
    /// or the root ends PROBLEM if termination fails.
    pub fn undeploy_root(&self, application: &str, root: &str) -> Result<ProvisioningHandle<()>, CoreError> {
        let root_path = InstancePath::root(root)?;
        let (target, machine_id, outgoing) = {
            let mut registry = lock(&self.shared);
            let dep = registry.deployment_mut(application)?;
            let instance = dep.app.require(&root_path)?;
            if !matches!(
                instance.status,
                InstanceStatus::DeployedStarted | InstanceStatus::Problem
            ) {
                return Err(CoreError::InvalidTransition {
                    path: root_path.to_string(),
                    command: LifecycleCommand::Undeploy.to_string(),
                    status: instance.status.to_string(),
                });
            }
            let machine_id = instance.machine_id().map(MachineId::new);
            let outgoing = if dep.lost.contains_key(root) {
                Vec::new()
            } else {
                dep.withdrawals(application, &root_path)
            };
            dep.last_seen.remove(root);
            dep.lost.remove(root);
            dep.app.require_mut(&root_path)?.status = InstanceStatus::Undeploying;
            (Arc::clone(&dep.target), machine_id, outgoing)
        };
        flush(&self.client, outgoing);
        info!("terminating {root} of {application}");

        let shared = Arc::clone(&self.shared);
        let application = application.to_owned();
        let root = root.to_owned();
        let worker = std::thread::Builder::new()
            .name(format!("terminate-{root}"))
            .spawn(move || {
                let outcome = match &machine_id {
                    Some(id) => target.terminate_machine(id),
                    None => Ok(()),
                };
                let mut registry = lock(&shared);
                let Some(dep) = registry.deployments.get_mut(&application) else {
                    return outcome;
                };
                match &outcome {
                    Ok(()) => {
                        dep.app.set_subtree_status(&root_path, InstanceStatus::NotDeployed);
                        if let Some(instance) = dep.app.get_mut(&root_path) {
                            instance.data.remove(DATA_MACHINE_ID);
                            instance.data.remove(DATA_IP_ADDRESS);
                        }
                        dep.problems
                            .retain(|p, _| *p != root_path && !root_path.is_ancestor_of(p));
                        info!("{root} of {application} undeployed");
                    }
                    Err(e) => {
                        warn!("terminating {root} of {application} failed: {e}");
                        if let Some(instance) = dep.app.get_mut(&root_path) {
                            instance.status = InstanceStatus::Problem;
                        }
                        dep.problems.insert(root_path.clone(), e.to_string());
                    }
                }
                outcome
            })?;
        Ok(ProvisioningHandle { worker })
    }

    /// Ask the agent to deploy `path`, shipping `bundle` with the command.
    pub fn deploy_instance(
        &self,
        application: &str,
        path: &InstancePath,
        bundle: ResourceBundle,
    ) -> Result<(), CoreError> {
        self.send_command(
            application,
            path,
            Message::DeployInstance {
                path: path.clone(),
                bundle,
            },
        )
    }

    /// Send a lifecycle command for a non-root instance to its agent. Deploy
    /// ships an empty bundle; use [`Manager::deploy_instance`] to send files.
    pub fn change_state(
        &self,
        application: &str,
        path: &InstancePath,
        command: LifecycleCommand,
    ) -> Result<(), CoreError> {
        let message = match command {
            LifecycleCommand::Deploy => Message::DeployInstance {
                path: path.clone(),
                bundle: ResourceBundle::empty(),
            },
            LifecycleCommand::Start => Message::StartInstance { path: path.clone() },
            LifecycleCommand::Stop => Message::StopInstance { path: path.clone() },
            LifecycleCommand::Undeploy => Message::UndeployInstance { path: path.clone() },
            LifecycleCommand::Remove => return self.remove_instance(application, path),
        };
        self.send_command(application, path, message)
    }

    pub fn start_instance(&self, application: &str, path: &InstancePath) -> Result<(), CoreError> {
        self.change_state(application, path, LifecycleCommand::Start)
    }

    pub fn stop_instance(&self, application: &str, path: &InstancePath) -> Result<(), CoreError> {
        self.change_state(application, path, LifecycleCommand::Stop)
    }

    pub fn undeploy_instance(&self, application: &str, path: &InstancePath) -> Result<(), CoreError> {
        self.change_state(application, path, LifecycleCommand::Undeploy)
    }

    fn send_command(
        &self,
        application: &str,
        path: &InstancePath,
        message: Message,
    ) -> Result<(), CoreError> {
        if path.is_root() {
            return Err(CoreError::RootInstance(path.to_string()));
        }
        let root = path.root_name();
        {
            let registry = lock(&self.shared);
            let dep = registry.deployment(application)?;
            dep.app.require(path)?;
            if !dep.is_connected(root) {
                return Err(CoreError::AgentUnavailable {
                    application: application.to_owned(),
                    root: root.to_owned(),
                });
            }
        }
        debug!("{application}{path}: sending {}", message.kind());
        self.client.send_to_agent(application, root, &message)?;
        Ok(())
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_messaging::{Channel, InMemoryBroker, MessageQueue, MessagingClient};
    use gantry_model::parse_graph_str;
    use gantry_target::EmbeddedTarget;

    fn app() -> Application {
        let graph = parse_graph_str(
            r#"
[components.vm]
installer = "target"
children = ["db"]

[components.db]
installer = "mock"
exports = { port = "5432" }
"#,
        )
        .unwrap();
        let mut app = Application::new("shop", graph).unwrap();
        let vm = app.add_root("vm", "vm").unwrap();
        app.add_instance(&vm, "db", "db").unwrap();
        app
    }

    fn p(raw: &str) -> InstancePath {
        InstancePath::parse(raw).unwrap()
    }

    struct Fixture {
        manager: Manager,
        handler: DmHandler,
        /// Everything published to the agent of `/vm` and on the `db` imports topic.
        inbox: MessageQueue,
        _observer: gantry_messaging::InMemoryClient,
    }

    /// A manager that is connected but not processing: tests drive the
    /// handler directly.
    fn fixture() -> Fixture {
        let broker = InMemoryBroker::new();
        let dm = DmClient::new(Box::new(broker.client("dm")));
        dm.open_connection().unwrap();
        let manager = Manager::new(ManagerConfig::default(), MessagingConfig::in_memory(), dm);
        manager
            .register_application(app(), Box::new(EmbeddedTarget::new()))
            .unwrap();

        let observer = broker.client("observer");
        let inbox = MessageQueue::new();
        observer.set_message_queue(inbox.clone());
        observer.open_connection().unwrap();
        observer.subscribe(&Channel::agent("shop", "vm")).unwrap();
        observer.subscribe(&Channel::imports("shop", "db")).unwrap();

        let handler = DmHandler {
            shared: Arc::clone(&manager.shared),
            client: Arc::clone(&manager.client),
        };
        Fixture {
            manager,
            handler,
            inbox,
            _observer: observer,
        }
    }

    fn heartbeat() -> Message {
        heartbeat_with(false)
    }

    fn heartbeat_with(resync: bool) -> Message {
        Message::Heartbeat {
            application: "shop".to_owned(),
            root_instance: "vm".to_owned(),
            timestamp: chrono::Utc::now(),
            ip_address: Some("10.0.0.7".to_owned()),
            resync,
        }
    }

    fn status(path: &str, status: InstanceStatus) -> Message {
        Message::InstanceStatusChanged {
            application: "shop".to_owned(),
            path: p(path),
            status,
            problem: None,
        }
    }

    fn drain(queue: &MessageQueue) -> Vec<Message> {
        std::iter::from_fn(|| queue.try_take()).collect()
    }

    #[test]
    fn config_defaults_and_toml() {
        let config = ManagerConfig::default();
        assert_eq!(config.loss_timeout(), Duration::from_secs(15));
        let parsed = ManagerConfig::parse(
            r#"
heartbeat_interval_ms = 100
missed_heartbeats = 2
cardinality = { policy = "at-least", count = 2 }
"#,
        )
        .unwrap();
        assert_eq!(parsed.loss_timeout(), Duration::from_millis(200));
        assert_eq!(parsed.cardinality, CardinalityPolicy::AtLeast(2));
        assert!(matches!(
            ManagerConfig::parse("heartbeat = 1"),
            Err(CoreError::Config(_))
        ));
    }

    #[test]
    fn first_heartbeat_brings_the_root_up_and_sends_the_graph() {
        let mut f = fixture();
        // NOT_DEPLOYED roots ignore heartbeats.
        f.handler.handle(heartbeat()).unwrap();
        assert!(drain(&f.inbox).is_empty());

        f.manager.deploy_root("shop", "vm").unwrap().wait().unwrap();
        assert_eq!(f.manager.status("shop", &p("/vm")), Some(InstanceStatus::Deploying));
        f.handler.handle(heartbeat()).unwrap();
        assert_eq!(
            f.manager.status("shop", &p("/vm")),
            Some(InstanceStatus::DeployedStarted)
        );
        let root = f.manager.snapshot("shop").unwrap();
        let root = root.get(&p("/vm")).unwrap();
        assert_eq!(root.data.get(DATA_IP_ADDRESS).map(String::as_str), Some("10.0.0.7"));
        assert_eq!(root.machine_id(), Some("embedded:shop:vm"));

        let sent = drain(&f.inbox);
        assert_eq!(sent.len(), 1);
        let Message::SendInstanceGraph { instances, .. } = &sent[0] else {
            panic!("expected the instance graph");
        };
        assert_eq!(instances.len(), 2);

        // Later heartbeats only refresh liveness.
        f.handler.handle(heartbeat()).unwrap();
        assert!(drain(&f.inbox).is_empty());
    }

    #[test]
    fn heartbeat_asking_for_resync_gets_the_graph_again() {
        let mut f = fixture();
        f.manager.deploy_root("shop", "vm").unwrap().wait().unwrap();
        f.handler.handle(heartbeat()).unwrap();
        f.handler
            .handle(status("/vm/db", InstanceStatus::DeployedStopped))
            .unwrap();
        drain(&f.inbox);

        f.handler.handle(heartbeat_with(true)).unwrap();
        let sent = drain(&f.inbox);
        let [Message::SendInstanceGraph { instances, .. }] = sent.as_slice() else {
            panic!("expected the instance graph, got {sent:?}");
        };
        let db = instances.iter().find(|i| i.path == p("/vm/db")).unwrap();
        assert_eq!(db.status, InstanceStatus::DeployedStopped);
        assert!(f.manager.lost_agents("shop").is_empty());
        assert_eq!(
            f.manager.status("shop", &p("/vm")),
            Some(InstanceStatus::DeployedStarted)
        );
    }

    #[test]
    fn lost_agent_is_withdrawn_once_then_resynced() {
        let mut f = fixture();
        f.manager.deploy_root("shop", "vm").unwrap().wait().unwrap();
        f.handler.handle(heartbeat()).unwrap();
        f.handler
            .handle(status("/vm/db", InstanceStatus::DeployedStarted))
            .unwrap();
        drain(&f.inbox);

        let later = Instant::now() + Duration::from_secs(60);
        assert_eq!(
            f.manager.check_agents(later),
            vec![("shop".to_owned(), "vm".to_owned())]
        );
        assert_eq!(f.manager.status("shop", &p("/vm/db")), Some(InstanceStatus::Problem));
        assert_eq!(f.manager.status("shop", &p("/vm")), Some(InstanceStatus::Problem));
        let withdrawn = drain(&f.inbox);
        assert_eq!(withdrawn.len(), 1);
        assert!(matches!(
            &withdrawn[0],
            Message::ImportRemoved { prefix, exporter_path, forced: true, .. }
                if prefix == "db" && *exporter_path == p("/vm/db")
        ));

        // A second sweep and a late shutdown notice do nothing more.
        assert!(f.manager.check_agents(later).is_empty());
        f.handler
            .handle(Message::MachineDown {
                application: "shop".to_owned(),
                root_instance: "vm".to_owned(),
            })
            .unwrap();
        assert!(drain(&f.inbox).is_empty());
        assert!(matches!(
            f.manager.start_instance("shop", &p("/vm/db")),
            Err(CoreError::AgentUnavailable { .. })
        ));

        f.handler.handle(heartbeat()).unwrap();
        assert!(f.manager.lost_agents("shop").is_empty());
        assert_eq!(
            f.manager.status("shop", &p("/vm/db")),
            Some(InstanceStatus::DeployedStarted)
        );
        assert!(matches!(
            drain(&f.inbox).as_slice(),
            [Message::SendInstanceGraph { .. }]
        ));
    }

    #[test]
    fn machine_down_is_a_loss_unless_undeploying() {
        let mut f = fixture();
        f.manager.deploy_root("shop", "vm").unwrap().wait().unwrap();
        f.handler.handle(heartbeat()).unwrap();
        let down = Message::MachineDown {
            application: "shop".to_owned(),
            root_instance: "vm".to_owned(),
        };
        f.handler.handle(down.clone()).unwrap();
        assert_eq!(
            f.manager.lost_agents("shop"),
            BTreeSet::from(["vm".to_owned()])
        );

        f.handler.handle(heartbeat()).unwrap();
        f.manager.undeploy_root("shop", "vm").unwrap().wait().unwrap();
        f.handler.handle(down).unwrap();
        assert!(f.manager.lost_agents("shop").is_empty());
        assert_eq!(f.manager.status("shop", &p("/vm")), Some(InstanceStatus::NotDeployed));
        assert_eq!(
            f.manager.status("shop", &p("/vm/db")),
            Some(InstanceStatus::NotDeployed)
        );
    }

    #[test]
    fn agent_reports_update_the_model() {
        let mut f = fixture();
        f.manager.deploy_root("shop", "vm").unwrap().wait().unwrap();
        f.handler.handle(heartbeat()).unwrap();
        f.handler
            .handle(Message::InstanceStatusChanged {
                application: "shop".to_owned(),
                path: p("/vm/db"),
                status: InstanceStatus::Problem,
                problem: Some("script exited with 1".to_owned()),
            })
            .unwrap();
        assert_eq!(
            f.manager.problem("shop", &p("/vm/db")).as_deref(),
            Some("script exited with 1")
        );
        f.handler
            .handle(status("/vm/db", InstanceStatus::NotDeployed))
            .unwrap();
        assert!(f.manager.problem("shop", &p("/vm/db")).is_none());

        // Agents never drive the root status.
        f.handler
            .handle(status("/vm", InstanceStatus::NotDeployed))
            .unwrap();
        assert_eq!(
            f.manager.status("shop", &p("/vm")),
            Some(InstanceStatus::DeployedStarted)
        );

        f.handler
            .handle(Message::InstanceRemoved {
                application: "shop".to_owned(),
                path: p("/vm/db"),
            })
            .unwrap();
        assert!(f.manager.status("shop", &p("/vm/db")).is_none());
        assert!(matches!(
            f.handler.handle(Message::StopInstance { path: p("/vm/db") }),
            Err(CoreError::UnexpectedMessage("stop-instance"))
        ));
    }

    #[test]
    fn commands_need_a_connected_agent_and_a_non_root_path() {
        let mut f = fixture();
        assert!(matches!(
            f.manager.start_instance("shop", &p("/vm/db")),
            Err(CoreError::AgentUnavailable { .. })
        ));
        assert!(matches!(
            f.manager.stop_instance("shop", &p("/vm")),
            Err(CoreError::RootInstance(_))
        ));
        assert!(matches!(
            f.manager.start_instance("nope", &p("/vm/db")),
            Err(CoreError::UnknownApplication(_))
        ));

        f.manager.deploy_root("shop", "vm").unwrap().wait().unwrap();
        f.handler.handle(heartbeat()).unwrap();
        drain(&f.inbox);
        f.manager
            .deploy_instance("shop", &p("/vm/db"), ResourceBundle::empty())
            .unwrap();
        f.manager.start_instance("shop", &p("/vm/db")).unwrap();
        let kinds: Vec<_> = drain(&f.inbox).iter().map(Message::kind).collect();
        assert_eq!(kinds, ["deploy-instance", "start-instance"]);
    }

    #[test]
    fn add_and_remove_follow_agent_connectivity() {
        let mut f = fixture();
        let vm = p("/vm");
        // Offline: the model changes directly.
        let extra = f.manager.add_instance("shop", &vm, "db2", "db").unwrap();
        assert!(drain(&f.inbox).is_empty());
        f.manager.remove_instance("shop", &extra).unwrap();
        assert!(f.manager.status("shop", &extra).is_none());

        f.manager.deploy_root("shop", "vm").unwrap().wait().unwrap();
        f.handler.handle(heartbeat()).unwrap();
        drain(&f.inbox);
        let extra = f.manager.add_instance("shop", &vm, "db2", "db").unwrap();
        f.manager.remove_instance("shop", &extra).unwrap();
        let kinds: Vec<_> = drain(&f.inbox).iter().map(Message::kind).collect();
        assert_eq!(kinds, ["add-instance", "remove-instance"]);
        // Removed only once the agent confirms.
        assert!(f.manager.status("shop", &extra).is_some());
    }

    #[test]
    fn undeploy_and_delete_guards() {
        let f = fixture();
        assert!(matches!(
            f.manager.undeploy_root("shop", "vm"),
            Err(CoreError::InvalidTransition { .. })
        ));
        assert!(matches!(
            f.manager
                .register_application(app(), Box::new(EmbeddedTarget::new())),
            Err(CoreError::ApplicationExists(_))
        ));
        f.manager.deploy_root("shop", "vm").unwrap().wait().unwrap();
        assert!(f.manager.delete_application("shop").is_err());
        assert!(matches!(
            f.manager.deploy_root("shop", "vm"),
            Err(CoreError::InvalidTransition { .. })
        ));
    }
}
