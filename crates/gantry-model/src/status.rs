use serde::{Deserialize, Serialize};

/// Lifecycle status of an instance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    #[default]
    NotDeployed,
    Deploying,
    DeployedStopped,
    #[serde(rename = "DEPLOYED_STARTING")]
    Starting,
    DeployedStarted,
    #[serde(rename = "DEPLOYED_STOPPING")]
    Stopping,
    Undeploying,
    Problem,
}

impl InstanceStatus {
    /// Stable statuses are the ones an instance rests in between operations.
    pub fn is_stable(self) -> bool {
        matches!(
            self,
            InstanceStatus::NotDeployed
                | InstanceStatus::DeployedStopped
                | InstanceStatus::DeployedStarted
                | InstanceStatus::Problem
        )
    }

    /// A lifecycle operation is currently running for the instance.
    pub fn is_in_flight(self) -> bool {
        !self.is_stable()
    }

    /// At least `DEPLOYED_STOPPED`: the instance's software is installed.
    pub fn is_deployed(self) -> bool {
        matches!(
            self,
            InstanceStatus::DeployedStopped
                | InstanceStatus::Starting
                | InstanceStatus::DeployedStarted
                | InstanceStatus::Stopping
        )
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceStatus::NotDeployed => write!(f, "NOT_DEPLOYED"),
            InstanceStatus::Deploying => write!(f, "DEPLOYING"),
            InstanceStatus::DeployedStopped => write!(f, "DEPLOYED_STOPPED"),
            InstanceStatus::Starting => write!(f, "DEPLOYED_STARTING"),
            InstanceStatus::DeployedStarted => write!(f, "DEPLOYED_STARTED"),
            InstanceStatus::Stopping => write!(f, "DEPLOYED_STOPPING"),
            InstanceStatus::Undeploying => write!(f, "UNDEPLOYING"),
            InstanceStatus::Problem => write!(f, "PROBLEM"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_wire_names() {
        for status in [
            InstanceStatus::NotDeployed,
            InstanceStatus::Deploying,
            InstanceStatus::DeployedStopped,
            InstanceStatus::Starting,
            InstanceStatus::DeployedStarted,
            InstanceStatus::Stopping,
            InstanceStatus::Undeploying,
            InstanceStatus::Problem,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{status}\""));
        }
    }

    #[test]
    fn stable_and_in_flight_partition() {
        assert!(InstanceStatus::NotDeployed.is_stable());
        assert!(InstanceStatus::Problem.is_stable());
        assert!(InstanceStatus::Starting.is_in_flight());
        assert!(InstanceStatus::Undeploying.is_in_flight());
    }

    #[test]
    fn deployed_statuses() {
        assert!(InstanceStatus::DeployedStopped.is_deployed());
        assert!(InstanceStatus::DeployedStarted.is_deployed());
        assert!(!InstanceStatus::NotDeployed.is_deployed());
        assert!(!InstanceStatus::Deploying.is_deployed());
        assert!(!InstanceStatus::Problem.is_deployed());
    }
}
