//! Role-specific wrappers over a raw transport client.
//!
//! `DmClient` and `AgentClient` expose the protocol's operations by intent
//! (listen to agents, publish exports, request exports) and translate them
//! into channel subscriptions and publications. Publications are retried
//! with backoff before a failure is handed back to the caller.

use crate::channel::Channel;
use crate::message::Message;
use crate::queue::MessageQueue;
use crate::retry::{retry, Backoff};
use crate::revision::RevisionClock;
use crate::transport::MessagingClient;
use crate::MessagingError;
use gantry_model::{Instance, InstancePath};
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_PUBLISH_ATTEMPTS: u32 = 3;

pub const DEFAULT_PUBLISH_BACKOFF: Backoff = Backoff {
    initial: Duration::from_millis(50),
    max: Duration::from_secs(1),
};

#[derive(Debug, Clone, Copy)]
struct PublishRetry {
    attempts: u32,
    backoff: Backoff,
}

impl Default for PublishRetry {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_PUBLISH_ATTEMPTS,
            backoff: DEFAULT_PUBLISH_BACKOFF,
        }
    }
}

impl PublishRetry {
    fn publish(
        self,
        client: &dyn MessagingClient,
        channel: &Channel,
        message: &Message,
    ) -> Result<(), MessagingError> {
        let what = format!("publishing {} to {channel}", message.kind());
        retry(&what, self.attempts, self.backoff, || client.publish(channel, message))
    }
}

pub struct DmClient {
    client: Box<dyn MessagingClient>,
    clock: RevisionClock,
    retry: PublishRetry,
}

impl DmClient {
    pub fn new(client: Box<dyn MessagingClient>) -> Self {
        Self {
            client,
            clock: RevisionClock::new(),
            retry: PublishRetry::default(),
        }
    }

    #[must_use]
    pub fn with_publish_retry(mut self, attempts: u32, backoff: Backoff) -> Self {
        self.retry = PublishRetry {
            attempts: attempts.max(1),
            backoff,
        };
        self
    }

    fn publish(&self, channel: &Channel, message: &Message) -> Result<(), MessagingError> {
        self.retry.publish(self.client.as_ref(), channel, message)
    }

    pub fn open_connection(&self) -> Result<(), MessagingError> {
        self.client.open_connection()
    }

    pub fn close_connection(&self) -> Result<(), MessagingError> {
        self.client.close_connection()
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    pub fn set_message_queue(&self, queue: MessageQueue) {
        self.client.set_message_queue(queue);
    }

    pub fn listen_to_agents(&self, application: &str) -> Result<(), MessagingError> {
        self.client.subscribe(&Channel::dm(application))
    }

    pub fn stop_listening_to_agents(&self, application: &str) -> Result<(), MessagingError> {
        self.client.unsubscribe(&Channel::dm(application))
    }

    pub fn send_to_agent(
        &self,
        application: &str,
        root_instance: &str,
        message: &Message,
    ) -> Result<(), MessagingError> {
        debug!("dm -> {application}/{root_instance}: {}", message.kind());
        self.publish(&Channel::agent(application, root_instance), message)
    }

    /// Announce, on behalf of an agent that can no longer speak, that
    /// `exporter_path` stopped exporting `prefix`. The withdrawal is forced:
    /// receivers apply it without comparing revisions.
    pub fn withdraw_exports(
        &self,
        application: &str,
        prefix: &str,
        exporter_path: &InstancePath,
    ) -> Result<(), MessagingError> {
        let message = Message::ImportRemoved {
            prefix: prefix.to_owned(),
            exporter_path: exporter_path.clone(),
            revision: self.clock.next(),
            forced: true,
        };
        self.publish(&Channel::imports(application, prefix), &message)
    }

    pub fn delete_messaging_server_artifacts(&self, application: &str) -> Result<(), MessagingError> {
        self.client.delete_messaging_server_artifacts(application)
    }
}

pub struct AgentClient {
    client: Box<dyn MessagingClient>,
    application: String,
    root_instance: String,
    clock: RevisionClock,
    retry: PublishRetry,
}

impl AgentClient {
    pub fn new(client: Box<dyn MessagingClient>, application: &str, root_instance: &str) -> Self {
        Self {
            client,
            application: application.to_owned(),
            root_instance: root_instance.to_owned(),
            clock: RevisionClock::new(),
            retry: PublishRetry::default(),
        }
    }

    #[must_use]
    pub fn with_publish_retry(mut self, attempts: u32, backoff: Backoff) -> Self {
        self.retry = PublishRetry {
            attempts: attempts.max(1),
            backoff,
        };
        self
    }

    fn publish(&self, channel: &Channel, message: &Message) -> Result<(), MessagingError> {
        self.retry.publish(self.client.as_ref(), channel, message)
    }

    pub fn application(&self) -> &str {
        &self.application
    }

    pub fn root_instance(&self) -> &str {
        &self.root_instance
    }

    pub fn open_connection(&self) -> Result<(), MessagingError> {
        self.client.open_connection()
    }

    pub fn close_connection(&self) -> Result<(), MessagingError> {
        self.client.close_connection()
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    pub fn set_message_queue(&self, queue: MessageQueue) {
        self.client.set_message_queue(queue);
    }

    pub fn listen_to_dm(&self) -> Result<(), MessagingError> {
        self.client
            .subscribe(&Channel::agent(&self.application, &self.root_instance))
    }

    pub fn stop_listening_to_dm(&self) -> Result<(), MessagingError> {
        self.client
            .unsubscribe(&Channel::agent(&self.application, &self.root_instance))
    }

    pub fn send_to_dm(&self, message: &Message) -> Result<(), MessagingError> {
        self.publish(&Channel::dm(&self.application), message)
    }

    /// Publish `instance`'s variables under `prefix` to every consumer.
    pub fn publish_exports(&self, instance: &Instance, prefix: &str) -> Result<(), MessagingError> {
        let message = Message::ImportAdded {
            prefix: prefix.to_owned(),
            exporter_path: instance.path.clone(),
            exporter_component: instance.component.clone(),
            variables: instance.exports_for(prefix),
            revision: self.clock.next(),
        };
        debug!("{}: publishing exports of {} as '{prefix}'", self.root_instance, instance.path);
        self.publish(&Channel::imports(&self.application, prefix), &message)
    }

    pub fn unpublish_exports(&self, instance: &Instance, prefix: &str) -> Result<(), MessagingError> {
        let message = Message::ImportRemoved {
            prefix: prefix.to_owned(),
            exporter_path: instance.path.clone(),
            revision: self.clock.next(),
            forced: false,
        };
        debug!("{}: withdrawing exports of {} as '{prefix}'", self.root_instance, instance.path);
        self.publish(&Channel::imports(&self.application, prefix), &message)
    }

    pub fn listen_to_exports_from_other_agents(&self, prefix: &str) -> Result<(), MessagingError> {
        self.client
            .subscribe(&Channel::imports(&self.application, prefix))
    }

    pub fn stop_listening_to_exports_from_other_agents(
        &self,
        prefix: &str,
    ) -> Result<(), MessagingError> {
        self.client
            .unsubscribe(&Channel::imports(&self.application, prefix))
    }

    pub fn listen_to_requests_from_other_agents(&self, prefix: &str) -> Result<(), MessagingError> {
        self.client
            .subscribe(&Channel::exports(&self.application, prefix))
    }

    pub fn stop_listening_to_requests_from_other_agents(
        &self,
        prefix: &str,
    ) -> Result<(), MessagingError> {
        self.client
            .unsubscribe(&Channel::exports(&self.application, prefix))
    }

    /// Ask every current exporter of `prefix` to publish again.
    pub fn request_exports_from_other_agents(&self, prefix: &str) -> Result<(), MessagingError> {
        let message = Message::ImportRequest {
            prefix: prefix.to_owned(),
            requester: self.root_instance.clone(),
        };
        self.publish(&Channel::exports(&self.application, prefix), &message)
    }
}
