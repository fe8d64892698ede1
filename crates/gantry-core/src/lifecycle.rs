use crate::CoreError;
use gantry_model::{Application, InstancePath, InstanceStatus};
use std::fmt;

/// A lifecycle command the DM sends to an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleCommand {
    Deploy,
    Start,
    Stop,
    Undeploy,
    Remove,
}

impl LifecycleCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleCommand::Deploy => "deploy",
            LifecycleCommand::Start => "start",
            LifecycleCommand::Stop => "stop",
            LifecycleCommand::Undeploy => "undeploy",
            LifecycleCommand::Remove => "remove",
        }
    }

    /// Status held while the command's plugin call runs.
    pub fn in_flight_status(self) -> Option<InstanceStatus> {
        match self {
            LifecycleCommand::Deploy => Some(InstanceStatus::Deploying),
            LifecycleCommand::Start => Some(InstanceStatus::Starting),
            LifecycleCommand::Stop => Some(InstanceStatus::Stopping),
            LifecycleCommand::Undeploy => Some(InstanceStatus::Undeploying),
            LifecycleCommand::Remove => None,
        }
    }

    /// Status reached when the plugin call succeeds.
    pub fn settled_status(self) -> Option<InstanceStatus> {
        match self {
            LifecycleCommand::Deploy | LifecycleCommand::Stop => {
                Some(InstanceStatus::DeployedStopped)
            }
            LifecycleCommand::Start => Some(InstanceStatus::DeployedStarted),
            LifecycleCommand::Undeploy => Some(InstanceStatus::NotDeployed),
            LifecycleCommand::Remove => None,
        }
    }
}

impl fmt::Display for LifecycleCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Check `command` against the current state of `path` and its relatives.
/// Rejections never change anything.
pub fn validate_command(
    app: &Application,
    path: &InstancePath,
    command: LifecycleCommand,
) -> Result<(), CoreError> {
    let instance = app.require(path)?;
    if instance.is_root() {
        return Err(CoreError::RootInstance(path.to_string()));
    }
    let status = instance.status;
    let parent_status = path
        .parent()
        .and_then(|p| app.get(&p))
        .map(|p| p.status);

    let legal = match command {
        LifecycleCommand::Deploy => status == InstanceStatus::NotDeployed,
        LifecycleCommand::Start => status == InstanceStatus::DeployedStopped,
        LifecycleCommand::Stop => status == InstanceStatus::DeployedStarted,
        LifecycleCommand::Undeploy => matches!(
            status,
            InstanceStatus::DeployedStopped
                | InstanceStatus::DeployedStarted
                | InstanceStatus::Problem
        ),
        LifecycleCommand::Remove => status == InstanceStatus::NotDeployed,
    };
    if !legal {
        return Err(CoreError::InvalidTransition {
            path: path.to_string(),
            command: command.to_string(),
            status: status.to_string(),
        });
    }

    let parent_ready = match command {
        LifecycleCommand::Deploy => parent_status.is_none_or(InstanceStatus::is_deployed),
        LifecycleCommand::Start => {
            parent_status.is_none_or(|s| s == InstanceStatus::DeployedStarted)
        }
        _ => true,
    };
    if !parent_ready {
        return Err(CoreError::ParentNotReady {
            path: path.to_string(),
            command: command.to_string(),
            parent_status: parent_status.unwrap_or_default().to_string(),
        });
    }

    match command {
        LifecycleCommand::Stop => {
            let started = app.children(path).into_iter().any(|c| {
                matches!(
                    c.status,
                    InstanceStatus::Starting | InstanceStatus::DeployedStarted
                )
            });
            if started {
                return Err(CoreError::ChildrenStarted(path.to_string()));
            }
        }
        LifecycleCommand::Remove => {
            for below in app.descendants_deepest_first(path) {
                let child = app.require(&below)?;
                if child.status != InstanceStatus::NotDeployed {
                    return Err(CoreError::InvalidTransition {
                        path: below.to_string(),
                        command: command.to_string(),
                        status: child.status.to_string(),
                    });
                }
            }
        }
        _ => {}
    }
    Ok(())
}
