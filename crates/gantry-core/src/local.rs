use crate::agent::AgentSettings;
use crate::runtime::{AgentRuntime, DEFAULT_HEARTBEAT_INTERVAL};
use gantry_messaging::MessagingFactory;
use gantry_model::{CardinalityPolicy, MachineId};
use gantry_plugin::{PluginError, PluginRegistry};
use gantry_target::{AgentLauncher, LocalAgentHandle, LocalAgents, MachineRequest, TargetError};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Builds the plugins of a new agent, given its application and root names.
pub type PluginFactory =
    Arc<dyn Fn(&str, &str) -> Result<PluginRegistry, PluginError> + Send + Sync>;

/// Starts agents as threads of the current process, for the `in-memory`
/// target.
pub struct InProcessLauncher {
    messaging: MessagingFactory,
    plugins: PluginFactory,
    work_dir: PathBuf,
    heartbeat_interval: Duration,
    cardinality: CardinalityPolicy,
    ip_address: String,
}

impl InProcessLauncher {
    pub fn new(
        messaging: MessagingFactory,
        work_dir: impl Into<PathBuf>,
        plugins: impl Fn(&str, &str) -> Result<PluginRegistry, PluginError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            messaging,
            plugins: Arc::new(plugins),
            work_dir: work_dir.into(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            cardinality: CardinalityPolicy::default(),
            ip_address: "127.0.0.1".to_owned(),
        }
    }

    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    #[must_use]
    pub fn with_cardinality(mut self, cardinality: CardinalityPolicy) -> Self {
        self.cardinality = cardinality;
        self
    }

    pub fn into_local_agents(self) -> LocalAgents {
        LocalAgents::new(Arc::new(self))
    }
}

fn provisioning(what: &str, e: impl std::fmt::Display) -> TargetError {
    TargetError::Provisioning(format!("{what}: {e}"))
}

impl AgentLauncher for InProcessLauncher {
    fn launch(
        &self,
        request: &MachineRequest<'_>,
        machine_id: &MachineId,
    ) -> Result<Box<dyn LocalAgentHandle>, TargetError> {
        let client = self
            .messaging
            .create_agent_client(request.messaging, request.application, request.root_instance)
            .map_err(|e| provisioning("messaging client", e))?;
        let plugins = (self.plugins)(request.application, request.root_instance)
            .map_err(|e| provisioning("plugins", e))?;
        let settings = AgentSettings::new(
            request.application,
            request.root_instance,
            self.work_dir.join(request.root_instance),
        )
        .with_ip_address(&self.ip_address)
        .with_cardinality(self.cardinality);

        let mut runtime = AgentRuntime::new(settings, client, plugins)
            .with_machine_id(machine_id.clone())
            .with_heartbeat_interval(self.heartbeat_interval);
        runtime
            .start()
            .map_err(|e| provisioning("agent start", e))?;
        Ok(Box::new(runtime))
    }
}
