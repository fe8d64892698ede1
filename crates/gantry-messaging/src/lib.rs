//! Messaging layer for gantry: the message catalog, per-endpoint ordered
//! processing, and pluggable pub/sub transports.
//!
//! Transports implement [`MessagingClient`] and are selected at runtime by
//! [`MessagingFactory`] from a [`MessagingConfig`]. Inbound messages land in
//! a [`MessageQueue`] drained by a single-threaded [`MessageProcessor`], which
//! gives every DM and agent endpoint strictly sequential handling.

pub mod channel;
pub mod client;
pub mod config;
pub mod factory;
pub mod http;
pub mod memory;
pub mod message;
pub mod processor;
pub mod queue;
pub mod retry;
pub mod revision;
pub mod transport;

pub use channel::Channel;
pub use client::{AgentClient, DmClient, DEFAULT_PUBLISH_ATTEMPTS, DEFAULT_PUBLISH_BACKOFF};
pub use config::{MessagingConfig, HTTP_TRANSPORT, IN_MEMORY_TRANSPORT, PROP_BROKER_URL};
pub use factory::MessagingFactory;
pub use http::HttpClient;
pub use memory::{InMemoryBroker, InMemoryClient};
pub use message::{Direction, Message};
pub use processor::{MessageHandler, MessageProcessor};
pub use queue::MessageQueue;
pub use retry::{retry, Backoff};
pub use revision::RevisionClock;
pub use transport::MessagingClient;

/// Protocol version sent as `X-Gantry-Protocol` header on all HTTP requests.
pub const PROTOCOL_VERSION: u32 = 1;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MessagingError {
    #[error("messaging I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("not connected: {0}")]
    NotConnected(String),
    #[error("broker does not know client {0}")]
    UnknownClient(String),
    #[error("unknown messaging type: {0}")]
    UnknownTransport(String),
    #[error("messaging config error: {0}")]
    Config(String),
    #[error("message processor already running: {0}")]
    AlreadyRunning(String),
}

impl MessagingError {
    /// Transport-level failures, as opposed to bad input or misuse.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            MessagingError::Io(_)
                | MessagingError::Http(_)
                | MessagingError::NotConnected(_)
                | MessagingError::UnknownClient(_)
        )
    }
}
