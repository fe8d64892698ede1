//! The closed catalog of messages exchanged between the DM and agents.
//!
//! Every message is self-describing on the wire: serialized as JSON with a
//! `type` tag, so both in-memory and networked transports carry the same
//! value.

use chrono::{DateTime, Utc};
use gantry_model::{Graph, Instance, InstancePath, InstanceStatus, ResourceBundle};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Who is expected to send a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    DmToAgent,
    AgentToDm,
    AgentToAgent,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    /// Full model of one root subtree, sent once an agent is alive.
    SendInstanceGraph {
        application: String,
        graph: Graph,
        /// Root first, parents before children.
        instances: Vec<Instance>,
    },
    AddInstance {
        parent: InstancePath,
        instance: Instance,
    },
    DeployInstance {
        path: InstancePath,
        #[serde(default)]
        bundle: ResourceBundle,
    },
    StartInstance {
        path: InstancePath,
    },
    StopInstance {
        path: InstancePath,
    },
    UndeployInstance {
        path: InstancePath,
    },
    RemoveInstance {
        path: InstancePath,
    },

    InstanceStatusChanged {
        application: String,
        path: InstancePath,
        status: InstanceStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        problem: Option<String>,
    },
    InstanceRemoved {
        application: String,
        path: InstancePath,
    },
    Heartbeat {
        application: String,
        root_instance: String,
        timestamp: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ip_address: Option<String>,
        /// The agent lost a report or announcement and wants the instance
        /// graph again.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        resync: bool,
    },
    MachineDown {
        application: String,
        root_instance: String,
    },

    /// An exporter's variables under one component/facet name.
    ImportAdded {
        prefix: String,
        exporter_path: InstancePath,
        exporter_component: String,
        variables: BTreeMap<String, String>,
        revision: u64,
    },
    /// Withdrawal of everything `exporter_path` exported under `prefix`.
    ImportRemoved {
        prefix: String,
        exporter_path: InstancePath,
        revision: u64,
        /// Sent by the DM for a lost agent. Applies whatever the revision,
        /// since it does not come from the exporter's clock.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        forced: bool,
    },
    /// Asks every exporter of `prefix` to re-publish its variables.
    ImportRequest {
        prefix: String,
        requester: String,
    },
}

impl Message {
    /// Short wire name, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::SendInstanceGraph { .. } => "send-instance-graph",
            Message::AddInstance { .. } => "add-instance",
            Message::DeployInstance { .. } => "deploy-instance",
            Message::StartInstance { .. } => "start-instance",
            Message::StopInstance { .. } => "stop-instance",
            Message::UndeployInstance { .. } => "undeploy-instance",
            Message::RemoveInstance { .. } => "remove-instance",
            Message::InstanceStatusChanged { .. } => "instance-status-changed",
            Message::InstanceRemoved { .. } => "instance-removed",
            Message::Heartbeat { .. } => "heartbeat",
            Message::MachineDown { .. } => "machine-down",
            Message::ImportAdded { .. } => "import-added",
            Message::ImportRemoved { .. } => "import-removed",
            Message::ImportRequest { .. } => "import-request",
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            Message::SendInstanceGraph { .. }
            | Message::AddInstance { .. }
            | Message::DeployInstance { .. }
            | Message::StartInstance { .. }
            | Message::StopInstance { .. }
            | Message::UndeployInstance { .. }
            | Message::RemoveInstance { .. } => Direction::DmToAgent,
            Message::InstanceStatusChanged { .. }
            | Message::InstanceRemoved { .. }
            | Message::Heartbeat { .. }
            | Message::MachineDown { .. } => Direction::AgentToDm,
            Message::ImportAdded { .. }
            | Message::ImportRemoved { .. }
            | Message::ImportRequest { .. } => Direction::AgentToAgent,
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, crate::MessagingError> {
        serde_json::to_vec(self).map_err(|e| crate::MessagingError::Serialization(e.to_string()))
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, crate::MessagingError> {
        serde_json::from_slice(bytes)
            .map_err(|e| crate::MessagingError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_tag_is_kebab_case() {
        let msg = Message::StartInstance {
            path: InstancePath::parse("/vm/tomcat").unwrap(),
        };
        let json = String::from_utf8(msg.to_json().unwrap()).unwrap();
        assert!(json.contains(r#""type":"start-instance""#));
        assert!(json.contains(r#""path":"/vm/tomcat""#));
        assert_eq!(Message::from_json(json.as_bytes()).unwrap(), msg);
    }

    #[test]
    fn kind_matches_wire_tag() {
        let msg = Message::ImportRemoved {
            prefix: "db".to_owned(),
            exporter_path: InstancePath::parse("/vm/db").unwrap(),
            revision: 7,
            forced: false,
        };
        let value: serde_json::Value = serde_json::from_slice(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["type"], msg.kind());
        assert!(value.get("forced").is_none());
    }

    #[test]
    fn status_change_omits_empty_problem() {
        let msg = Message::InstanceStatusChanged {
            application: "shop".to_owned(),
            path: InstancePath::parse("/vm").unwrap(),
            status: InstanceStatus::DeployedStarted,
            problem: None,
        };
        let json = String::from_utf8(msg.to_json().unwrap()).unwrap();
        assert!(!json.contains("problem"));
        assert!(json.contains("DEPLOYED_STARTED"));
    }

    #[test]
    fn directions() {
        let hb = Message::Heartbeat {
            application: "a".to_owned(),
            root_instance: "vm".to_owned(),
            timestamp: Utc::now(),
            ip_address: None,
            resync: false,
        };
        assert_eq!(hb.direction(), Direction::AgentToDm);
        let json = String::from_utf8(hb.to_json().unwrap()).unwrap();
        assert!(!json.contains("resync"));
        let req = Message::ImportRequest {
            prefix: "db".to_owned(),
            requester: "vm".to_owned(),
        };
        assert_eq!(req.direction(), Direction::AgentToAgent);
    }

    #[test]
    fn garbage_is_a_serialization_error() {
        assert!(matches!(
            Message::from_json(b"{\"type\":\"nope\"}"),
            Err(crate::MessagingError::Serialization(_))
        ));
    }
}
