use crate::properties::{optional_u64, TargetProperties};
use crate::{MachineRequest, Target, TargetError};
use gantry_model::MachineId;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{info, warn};

pub const IN_MEMORY_TARGET: &str = "in-memory";
/// Simulated provisioning latency, in milliseconds.
pub const PROP_DELAY_MS: &str = "in-memory.delay.ms";

/// A running in-process agent that can be stopped.
pub trait LocalAgentHandle: Send {
    fn machine_id(&self) -> &MachineId;

    fn stop(&mut self);
}

/// Starts an agent inside the current process.
pub trait AgentLauncher: Send + Sync {
    fn launch(
        &self,
        request: &MachineRequest<'_>,
        machine_id: &MachineId,
    ) -> Result<Box<dyn LocalAgentHandle>, TargetError>;
}

/// Machine id → running local agent. Owned by whoever creates it and
/// shared by handle; there is no global instance.
#[derive(Clone, Default)]
pub struct LocalAgentRegistry {
    agents: Arc<Mutex<BTreeMap<MachineId, Box<dyn LocalAgentHandle>>>>,
}

impl LocalAgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<MachineId, Box<dyn LocalAgentHandle>>> {
        self.agents.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, handle: Box<dyn LocalAgentHandle>) {
        let id = handle.machine_id().clone();
        if let Some(mut previous) = self.lock().insert(id.clone(), handle) {
            warn!("replacing local agent registered as {id}");
            previous.stop();
        }
    }

    pub fn unregister(&self, machine_id: &MachineId) -> Option<Box<dyn LocalAgentHandle>> {
        self.lock().remove(machine_id)
    }

    pub fn contains(&self, machine_id: &MachineId) -> bool {
        self.lock().contains_key(machine_id)
    }

    pub fn machine_ids(&self) -> Vec<MachineId> {
        self.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Stop and forget every registered agent.
    pub fn stop_all(&self) {
        let drained: Vec<_> = std::mem::take(&mut *self.lock()).into_values().collect();
        for mut handle in drained {
            handle.stop();
        }
    }
}

/// The registry plus a way to fill it.
#[derive(Clone)]
pub struct LocalAgents {
    pub registry: LocalAgentRegistry,
    pub launcher: Arc<dyn AgentLauncher>,
}

impl LocalAgents {
    pub fn new(launcher: Arc<dyn AgentLauncher>) -> Self {
        Self {
            registry: LocalAgentRegistry::new(),
            launcher,
        }
    }
}

/// Emulated IaaS: every "machine" is an agent started in this process.
pub struct InMemoryTarget {
    local: LocalAgents,
    delay: Option<Duration>,
}

impl InMemoryTarget {
    pub fn new(local: LocalAgents) -> Self {
        Self { local, delay: None }
    }

    pub fn machine_id_for(application: &str, root_instance: &str) -> MachineId {
        MachineId::new(format!("in-memory:{application}:{root_instance}"))
    }

    pub fn registry(&self) -> &LocalAgentRegistry {
        &self.local.registry
    }
}

impl Target for InMemoryTarget {
    fn target_type(&self) -> &'static str {
        IN_MEMORY_TARGET
    }

    fn set_target_properties(&mut self, properties: &TargetProperties) -> Result<(), TargetError> {
        self.delay = optional_u64(properties, PROP_DELAY_MS)?.map(Duration::from_millis);
        Ok(())
    }

    fn create_or_configure_machine(
        &self,
        request: &MachineRequest<'_>,
    ) -> Result<MachineId, TargetError> {
        let machine_id = Self::machine_id_for(request.application, request.root_instance);
        if self.local.registry.contains(&machine_id) {
            info!("local agent {machine_id} already running, reusing it");
            return Ok(machine_id);
        }
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        let handle = self.local.launcher.launch(request, &machine_id)?;
        self.local.registry.register(handle);
        info!("started local agent {machine_id}");
        Ok(machine_id)
    }

    fn terminate_machine(&self, machine_id: &MachineId) -> Result<(), TargetError> {
        let mut handle = self
            .local
            .registry
            .unregister(machine_id)
            .ok_or_else(|| TargetError::UnknownMachine(machine_id.to_string()))?;
        handle.stop();
        info!("stopped local agent {machine_id}");
        Ok(())
    }
}
