use crate::client::{AgentClient, DmClient};
use crate::config::{MessagingConfig, HTTP_TRANSPORT, IN_MEMORY_TRANSPORT};
use crate::http::HttpClient;
use crate::memory::InMemoryBroker;
use crate::transport::MessagingClient;
use crate::MessagingError;
use tracing::debug;

/// Builds transport clients from a `MessagingConfig`.
///
/// The factory owns the process-wide in-memory broker, so every client it
/// creates for the `in-memory` type shares one topic space.
#[derive(Clone, Default)]
pub struct MessagingFactory {
    in_memory: InMemoryBroker,
}

impl MessagingFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_broker(broker: InMemoryBroker) -> Self {
        Self { in_memory: broker }
    }

    pub fn in_memory_broker(&self) -> &InMemoryBroker {
        &self.in_memory
    }

    /// Select the transport named by `config.transport_type`.
    pub fn create_client(
        &self,
        config: &MessagingConfig,
        owner: &str,
    ) -> Result<Box<dyn MessagingClient>, MessagingError> {
        config.validate()?;
        debug!("creating {} messaging client for {owner}", config.transport_type);
        match config.transport_type.as_str() {
            IN_MEMORY_TRANSPORT => Ok(Box::new(self.in_memory.client(owner))),
            HTTP_TRANSPORT => Ok(Box::new(HttpClient::new(config, owner)?)),
            other => Err(MessagingError::UnknownTransport(other.to_owned())),
        }
    }

    pub fn create_dm_client(&self, config: &MessagingConfig) -> Result<DmClient, MessagingError> {
        Ok(DmClient::new(self.create_client(config, "dm")?))
    }

    pub fn create_agent_client(
        &self,
        config: &MessagingConfig,
        application: &str,
        root_instance: &str,
    ) -> Result<AgentClient, MessagingError> {
        let owner = format!("agent-{application}-{root_instance}");
        Ok(AgentClient::new(
            self.create_client(config, &owner)?,
            application,
            root_instance,
        ))
    }
}
