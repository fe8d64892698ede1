use crate::properties::{require, TargetProperties};
use crate::{MachineRequest, Target, TargetError};
use gantry_model::MachineId;

pub const AZURE_TARGET: &str = "azure";

pub const AZURE_SUBSCRIPTION_ID: &str = "azure.subscription.id";
pub const AZURE_KEY_STORE_FILE: &str = "azure.key.store.file";
pub const AZURE_KEY_STORE_PASSWORD: &str = "azure.key.store.password";
pub const AZURE_LOCATION: &str = "azure.location";
pub const AZURE_VM_SIZE: &str = "azure.vm.size";
pub const AZURE_VM_TEMPLATE: &str = "azure.vm.template";

/// Checked in this order; the first one missing is reported.
pub const REQUIRED_PROPERTIES: [&str; 6] = [
    AZURE_SUBSCRIPTION_ID,
    AZURE_KEY_STORE_FILE,
    AZURE_KEY_STORE_PASSWORD,
    AZURE_LOCATION,
    AZURE_VM_SIZE,
    AZURE_VM_TEMPLATE,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AzureSettings {
    pub subscription_id: String,
    pub key_store_file: String,
    pub key_store_password: String,
    pub location: String,
    pub vm_size: String,
    pub vm_template: String,
}

impl AzureSettings {
    pub fn from_properties(properties: &TargetProperties) -> Result<Self, TargetError> {
        for key in REQUIRED_PROPERTIES {
            require(properties, key)?;
        }
        let subscription_id = require(properties, AZURE_SUBSCRIPTION_ID)?;
        if !subscription_id
            .chars()
            .all(|c| c.is_ascii_hexdigit() || c == '-')
        {
            return Err(TargetError::InvalidProperty {
                key: AZURE_SUBSCRIPTION_ID.to_owned(),
                reason: "expected a GUID".to_owned(),
            });
        }
        Ok(Self {
            subscription_id: subscription_id.to_owned(),
            key_store_file: require(properties, AZURE_KEY_STORE_FILE)?.to_owned(),
            key_store_password: require(properties, AZURE_KEY_STORE_PASSWORD)?.to_owned(),
            location: require(properties, AZURE_LOCATION)?.to_owned(),
            vm_size: require(properties, AZURE_VM_SIZE)?.to_owned(),
            vm_template: require(properties, AZURE_VM_TEMPLATE)?.to_owned(),
        })
    }
}

/// Azure target. Configuration is fully validated; provider calls are not
/// implemented, so provisioning and termination report `Unsupported`.
#[derive(Debug, Default)]
pub struct AzureTarget {
    settings: Option<AzureSettings>,
}

impl AzureTarget {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn settings(&self) -> Option<&AzureSettings> {
        self.settings.as_ref()
    }

    fn unsupported(&self, operation: &str) -> TargetError {
        if self.settings.is_none() {
            return TargetError::NotConfigured(AZURE_TARGET.to_owned());
        }
        TargetError::Unsupported {
            target: AZURE_TARGET.to_owned(),
            operation: operation.to_owned(),
        }
    }
}

impl Target for AzureTarget {
    fn target_type(&self) -> &'static str {
        AZURE_TARGET
    }

    fn set_target_properties(&mut self, properties: &TargetProperties) -> Result<(), TargetError> {
        self.settings = Some(AzureSettings::from_properties(properties)?);
        Ok(())
    }

    fn create_or_configure_machine(
        &self,
        _request: &MachineRequest<'_>,
    ) -> Result<MachineId, TargetError> {
        Err(self.unsupported("machine creation"))
    }

    fn terminate_machine(&self, _machine_id: &MachineId) -> Result<(), TargetError> {
        Err(self.unsupported("machine termination"))
    }
}
