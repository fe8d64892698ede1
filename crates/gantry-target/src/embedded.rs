use crate::properties::TargetProperties;
use crate::{MachineRequest, Target, TargetError};
use gantry_model::MachineId;
use tracing::debug;

pub const EMBEDDED_TARGET: &str = "embedded";

/// Machines that already exist and run their agent on their own: nothing
/// to provision, nothing to terminate.
#[derive(Debug, Default)]
pub struct EmbeddedTarget {
    properties: TargetProperties,
}

impl EmbeddedTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn properties(&self) -> &TargetProperties {
        &self.properties
    }
}

impl Target for EmbeddedTarget {
    fn target_type(&self) -> &'static str {
        EMBEDDED_TARGET
    }

    fn set_target_properties(&mut self, properties: &TargetProperties) -> Result<(), TargetError> {
        self.properties.clone_from(properties);
        Ok(())
    }

    fn create_or_configure_machine(
        &self,
        request: &MachineRequest<'_>,
    ) -> Result<MachineId, TargetError> {
        let id = MachineId::new(format!(
            "embedded:{}:{}",
            request.application, request.root_instance
        ));
        debug!("embedded machine {id} needs no provisioning");
        Ok(id)
    }

    fn terminate_machine(&self, machine_id: &MachineId) -> Result<(), TargetError> {
        debug!("embedded machine {machine_id} is left running");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_messaging::MessagingConfig;

    #[test]
    fn machine_id_is_derived_from_names() {
        let target = EmbeddedTarget::new();
        let config = MessagingConfig::in_memory();
        let id = target
            .create_or_configure_machine(&MachineRequest {
                messaging: &config,
                application: "shop",
                root_instance: "vm1",
            })
            .unwrap();
        assert_eq!(id, "embedded:shop:vm1");
        assert!(target.terminate_machine(&id).is_ok());
    }
}
