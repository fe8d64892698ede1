use crate::MessagingError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

pub const IN_MEMORY_TRANSPORT: &str = "in-memory";
pub const HTTP_TRANSPORT: &str = "http";

/// Base URL of the HTTP broker, e.g. `http://10.0.0.5:7878`.
pub const PROP_BROKER_URL: &str = "http.broker.url";
/// How long one poll request may block on the broker, in milliseconds.
pub const PROP_POLL_WAIT_MS: &str = "http.poll.wait.ms";

const DEFAULT_POLL_WAIT_MS: u64 = 5_000;

/// Messaging configuration: a transport type plus flat string properties.
/// The same value is shared by the DM and handed to every agent it creates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MessagingConfig {
    #[serde(rename = "type")]
    pub transport_type: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl MessagingConfig {
    pub fn in_memory() -> Self {
        Self {
            transport_type: IN_MEMORY_TRANSPORT.to_owned(),
            properties: BTreeMap::new(),
        }
    }

    pub fn http(broker_url: &str) -> Self {
        Self::in_memory()
            .with_type(HTTP_TRANSPORT)
            .with_property(PROP_BROKER_URL, broker_url.trim_end_matches('/'))
    }

    #[must_use]
    pub fn with_type(mut self, transport_type: &str) -> Self {
        transport_type.clone_into(&mut self.transport_type);
        self
    }

    #[must_use]
    pub fn with_property(mut self, key: &str, value: &str) -> Self {
        self.properties.insert(key.to_owned(), value.to_owned());
        self
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn broker_url(&self) -> Result<&str, MessagingError> {
        self.property(PROP_BROKER_URL)
            .map(|u| u.trim_end_matches('/'))
            .filter(|u| !u.is_empty())
            .ok_or_else(|| MessagingError::Config(format!("missing property '{PROP_BROKER_URL}'")))
    }

    pub fn poll_wait_ms(&self) -> Result<u64, MessagingError> {
        match self.property(PROP_POLL_WAIT_MS) {
            None => Ok(DEFAULT_POLL_WAIT_MS),
            Some(raw) => raw.parse().map_err(|_| {
                MessagingError::Config(format!("invalid value '{raw}' for '{PROP_POLL_WAIT_MS}'"))
            }),
        }
    }

    /// Check that the transport is known and carries its required
    /// properties.
    pub fn validate(&self) -> Result<(), MessagingError> {
        match self.transport_type.as_str() {
            IN_MEMORY_TRANSPORT => Ok(()),
            HTTP_TRANSPORT => {
                let url = self.broker_url()?;
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(MessagingError::Config(format!(
                        "'{PROP_BROKER_URL}' must be an http(s) URL, got '{url}'"
                    )));
                }
                self.poll_wait_ms()?;
                Ok(())
            }
            other => Err(MessagingError::UnknownTransport(other.to_owned())),
        }
    }

    pub fn load(path: &Path) -> Result<Self, MessagingError> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| MessagingError::Config(format!("invalid messaging config: {e}")))
    }

    pub fn save(&self, path: &Path) -> Result<(), MessagingError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| MessagingError::Serialization(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
