use crate::agent::{Agent, AgentSettings};
use crate::CoreError;
use chrono::Utc;
use gantry_messaging::{retry, AgentClient, Backoff, Message, MessageProcessor};
use gantry_model::{Application, InstancePath, InstanceStatus, MachineId};
use gantry_plugin::PluginRegistry;
use gantry_target::LocalAgentHandle;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 5;

struct Heartbeat {
    stop: mpsc::Sender<()>,
    worker: JoinHandle<()>,
}

/// One running agent: its message processor, its messaging connection and
/// its heartbeat thread.
pub struct AgentRuntime {
    application: String,
    root_instance: String,
    ip_address: Option<String>,
    machine_id: MachineId,
    client: Arc<AgentClient>,
    processor: MessageProcessor<Agent>,
    /// Set by the agent when a publication was lost.
    resync: Arc<AtomicBool>,
    heartbeat_interval: Duration,
    connect_attempts: u32,
    backoff: Backoff,
    heartbeat: Option<Heartbeat>,
    connected: bool,
}

impl AgentRuntime {
    pub fn new(settings: AgentSettings, client: AgentClient, plugins: PluginRegistry) -> Self {
        let client = Arc::new(client);
        let application = settings.application.clone();
        let root_instance = settings.root_instance.clone();
        let ip_address = settings.ip_address.clone();
        let agent = Agent::new(settings, Arc::clone(&client), plugins);
        let resync = agent.resync_flag();
        let processor = MessageProcessor::new(&format!("agent-{root_instance}"), agent);
        Self {
            machine_id: MachineId::new(format!("{application}:{root_instance}")),
            application,
            root_instance,
            ip_address,
            client,
            processor,
            resync,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            backoff: Backoff::default(),
            heartbeat: None,
            connected: false,
        }
    }

    #[must_use]
    pub fn with_machine_id(mut self, machine_id: MachineId) -> Self {
        self.machine_id = machine_id;
        self
    }

    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    #[must_use]
    pub fn with_connect_retry(mut self, attempts: u32, backoff: Backoff) -> Self {
        self.connect_attempts = attempts.max(1);
        self.backoff = backoff;
        self
    }

    pub fn application(&self) -> &str {
        &self.application
    }

    pub fn root_instance(&self) -> &str {
        &self.root_instance
    }

    /// Start processing, connect (retrying with backoff), listen to the DM
    /// and begin sending heartbeats.
    pub fn start(&mut self) -> Result<(), CoreError> {
        self.processor.start()?;
        self.client.set_message_queue(self.processor.queue());
        if let Err(e) = self.connect() {
            self.processor.stop();
            return Err(e);
        }
        info!("agent {}/{} started", self.application, self.root_instance);
        Ok(())
    }

    fn connect(&mut self) -> Result<(), CoreError> {
        let client = Arc::clone(&self.client);
        retry("connect to messaging", self.connect_attempts, self.backoff, || {
            client.open_connection()
        })
        .and_then(|()| self.client.listen_to_dm())?;
        self.connected = true;
        self.start_heartbeat()
    }

    /// Drop the messaging connection without announcing anything, as a
    /// network partition would. Processing keeps running.
    pub fn disconnect(&mut self) {
        self.stop_heartbeat();
        if !self.connected {
            return;
        }
        if let Err(e) = self.client.close_connection() {
            warn!("failed to close messaging connection: {e}");
        }
        self.connected = false;
        info!("agent {}/{} disconnected", self.application, self.root_instance);
    }

    /// Connect again after [`AgentRuntime::disconnect`]. The DM answers the
    /// next heartbeat with the instance graph if it lost track of this agent.
    pub fn reconnect(&mut self) -> Result<(), CoreError> {
        if self.connected {
            return Ok(());
        }
        self.connect()?;
        info!("agent {}/{} reconnected", self.application, self.root_instance);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn start_heartbeat(&mut self) -> Result<(), CoreError> {
        if self.heartbeat.is_some() {
            return Ok(());
        }
        let (stop, ticks) = mpsc::channel();
        let client = Arc::clone(&self.client);
        let resync = Arc::clone(&self.resync);
        let interval = self.heartbeat_interval;
        let ip_address = self.ip_address.clone();
        let worker = std::thread::Builder::new()
            .name(format!("{}-heartbeat", self.root_instance))
            .spawn(move || loop {
                send_heartbeat(&client, ip_address.as_deref(), resync.load(Ordering::SeqCst));
                match ticks.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        self.heartbeat = Some(Heartbeat { stop, worker });
        Ok(())
    }

    /// Stop heartbeats without telling the DM. It will eventually consider
    /// this agent lost.
    pub fn stop_heartbeat(&mut self) {
        let Some(heartbeat) = self.heartbeat.take() else {
            return;
        };
        let _ = heartbeat.stop.send(());
        if heartbeat.worker.join().is_err() {
            error!("heartbeat thread of {} panicked", self.root_instance);
        }
    }

    /// Announce the shutdown to the DM, then stop heartbeats, processing and
    /// the connection. Idempotent.
    pub fn stop(&mut self) {
        self.stop_heartbeat();
        if self.connected {
            let down = Message::MachineDown {
                application: self.application.clone(),
                root_instance: self.root_instance.clone(),
            };
            if let Err(e) = self.client.send_to_dm(&down) {
                warn!("failed to announce shutdown of {}: {e}", self.root_instance);
            }
        }
        self.processor.stop();
        if self.connected {
            if let Err(e) = self.client.close_connection() {
                warn!("failed to close messaging connection: {e}");
            }
            self.connected = false;
            info!("agent {}/{} stopped", self.application, self.root_instance);
        }
    }

    pub fn is_running(&self) -> bool {
        self.processor.is_running()
    }

    pub fn is_sending_heartbeats(&self) -> bool {
        self.heartbeat.is_some()
    }

    pub fn processed_count(&self) -> u64 {
        self.processor.processed_count()
    }

    pub fn snapshot(&self) -> Option<Application> {
        self.processor.with_handler(|agent| agent.snapshot())
    }

    pub fn status(&self, path: &InstancePath) -> Option<InstanceStatus> {
        self.processor.with_handler(|agent| agent.status(path))
    }
}

fn send_heartbeat(client: &AgentClient, ip_address: Option<&str>, resync: bool) {
    let heartbeat = Message::Heartbeat {
        application: client.application().to_owned(),
        root_instance: client.root_instance().to_owned(),
        timestamp: Utc::now(),
        ip_address: ip_address.map(str::to_owned),
        resync,
    };
    match client.send_to_dm(&heartbeat) {
        Ok(()) => debug!("{}: heartbeat sent", client.root_instance()),
        Err(e) => warn!("{}: heartbeat failed: {e}", client.root_instance()),
    }
}

impl Drop for AgentRuntime {
    fn drop(&mut self) {
        self.stop();
    }
}

impl LocalAgentHandle for AgentRuntime {
    fn machine_id(&self) -> &MachineId {
        &self.machine_id
    }

    fn stop(&mut self) {
        AgentRuntime::stop(self);
    }
}
