//! VM config spec building
//!
//! Resolves the network and datastores a new VM needs, assembles its device
//! list and the `guestinfo.*` properties the guest reads at boot to find its
//! Buildkite agent token, its name and its source disk.

use super::devices::{add_disk, add_ethernet, add_scsi, add_usb};
use super::{
    ControlPlane, DeviceChangeOperation, DeviceList, Finder, VirtualDeviceConfigSpec,
    VsphereError,
};
use crate::models::VirtualMachineCreationParams;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Namespace for properties readable from inside the guest
pub const GUESTINFO_PREFIX: &str = "guestinfo.";

/// Pin the first NIC to a stable PCI slot so the guest names it consistently
const ETHERNET_PCI_SLOT_KEY: &str = "ethernet0.pciSlotNumber";
const ETHERNET_PCI_SLOT: &str = "32";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionValue {
    pub key: String,
    pub value: String,
}

impl OptionValue {
    fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    fn guestinfo(key: &str, value: impl Into<String>) -> Self {
        Self::new(format!("{}{}", GUESTINFO_PREFIX, key), value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualMachineFileInfo {
    /// Datastore holding the VM's own files, e.g. `[vm-store]`
    pub vm_path_name: String,
}

/// The CreateVM request body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualMachineConfigSpec {
    pub name: String,
    pub guest_id: String,
    pub memory_mb: i64,
    pub num_cpus: i32,
    pub num_cores_per_socket: i32,
    pub nested_hv_enabled: bool,
    pub virtual_ich7m_present: bool,
    pub virtual_smc_present: bool,
    pub files: VirtualMachineFileInfo,
    pub device_change: Vec<VirtualDeviceConfigSpec>,
    pub extra_config: Vec<OptionValue>,
}

/// Devices and configuration resolved against the inventory
#[derive(Debug, Clone, PartialEq)]
pub struct BuiltSpec {
    pub devices: DeviceList,
    pub extra_config: Vec<OptionValue>,
    pub files: VirtualMachineFileInfo,
}

/// Builds the hardware and extra config for a new VM
pub struct ConfigSpecBuilder<'a, C: ControlPlane> {
    finder: &'a Finder<C>,
}

impl<'a, C: ControlPlane> ConfigSpecBuilder<'a, C> {
    pub fn new(finder: &'a Finder<C>) -> Self {
        Self { finder }
    }

    /// Resolve inventory objects and assemble devices, extra config and
    /// file placement. Any failed lookup aborts the build.
    pub async fn build(
        &self,
        params: &VirtualMachineCreationParams,
    ) -> Result<BuiltSpec, VsphereError> {
        let network = self
            .finder
            .network(&format!("*{}", params.network_label))
            .await?;
        let backing = self.finder.ethernet_card_backing(&network).await?;
        let devices = add_ethernet(DeviceList::new(), backing);

        let devices = add_scsi(devices)?;

        let src_datastore = self.finder.datastore(&params.src_disk_datastore).await?;
        let devices = add_disk(devices, &src_datastore, &params.src_disk_path)?;

        let devices = add_usb(devices);

        let datastore = self.finder.datastore(&params.datastore_name).await?;
        let files = VirtualMachineFileInfo {
            vm_path_name: format!("[{}]", datastore.name),
        };

        debug!(
            name = %params.name,
            devices = devices.len(),
            "Built VM device list"
        );

        Ok(BuiltSpec {
            devices,
            extra_config: extra_config(params),
            files,
        })
    }
}

/// Properties injected into the VM's extra config: the agent token, the VM
/// name and the source disk path, then each extra guest-info pair, then the
/// NIC PCI slot
pub fn extra_config(params: &VirtualMachineCreationParams) -> Vec<OptionValue> {
    let mut extra_config = vec![
        OptionValue::guestinfo(
            "vmkite-buildkite-agent-token",
            params.buildkite_agent_token.as_str(),
        ),
        OptionValue::guestinfo("vmkite-name", params.name.as_str()),
        OptionValue::guestinfo("vmkite-vmdk", params.src_disk_path.as_str()),
    ];

    for (key, value) in &params.guest_info {
        debug!(key = %key, value = %value, "Setting guestinfo property");
        extra_config.push(OptionValue::guestinfo(key, value.as_str()));
    }

    extra_config.push(OptionValue::new(ETHERNET_PCI_SLOT_KEY, ETHERNET_PCI_SLOT));
    extra_config
}

/// Combine built devices and configuration with the scalar VM settings
pub fn config_spec(
    params: &VirtualMachineCreationParams,
    built: BuiltSpec,
) -> VirtualMachineConfigSpec {
    VirtualMachineConfigSpec {
        name: params.name.clone(),
        guest_id: params.guest_id.clone(),
        memory_mb: params.memory_mb,
        num_cpus: params.num_cpus,
        num_cores_per_socket: params.num_cores_per_socket,
        nested_hv_enabled: true,
        virtual_ich7m_present: true,
        virtual_smc_present: true,
        files: built.files,
        device_change: built.devices.config_spec(DeviceChangeOperation::Add),
        extra_config: built.extra_config,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn params(guest_info: BTreeMap<String, String>) -> VirtualMachineCreationParams {
        VirtualMachineCreationParams {
            buildkite_agent_token: "agent-token".to_string(),
            cluster_path: "macOS".to_string(),
            folder_path: None,
            datastore_name: "vm-store".to_string(),
            guest_id: "darwin19_64Guest".to_string(),
            memory_mb: 8192,
            name: "vmkite-job-1".to_string(),
            network_label: "VM Network".to_string(),
            num_cpus: 4,
            num_cores_per_socket: 2,
            src_disk_datastore: "images".to_string(),
            src_disk_path: "/vol/base.vmdk".to_string(),
            guest_info,
        }
    }

    #[test]
    fn test_extra_config_fixed_entries() {
        let config = extra_config(&params(BTreeMap::new()));

        assert_eq!(
            config,
            vec![
                OptionValue::new("guestinfo.vmkite-buildkite-agent-token", "agent-token"),
                OptionValue::new("guestinfo.vmkite-name", "vmkite-job-1"),
                OptionValue::new("guestinfo.vmkite-vmdk", "/vol/base.vmdk"),
                OptionValue::new("ethernet0.pciSlotNumber", "32"),
            ]
        );
    }

    #[test]
    fn test_extra_config_includes_guest_info() {
        let guest_info = BTreeMap::from([
            ("region".to_string(), "syd".to_string()),
            ("agent-tags".to_string(), "queue=macos".to_string()),
        ]);
        let config = extra_config(&params(guest_info.clone()));

        assert_eq!(config.len(), 4 + guest_info.len());
        assert_eq!(config[3], OptionValue::new("guestinfo.agent-tags", "queue=macos"));
        assert_eq!(config[4], OptionValue::new("guestinfo.region", "syd"));
        assert_eq!(
            config
                .iter()
                .filter(|o| o.key == "ethernet0.pciSlotNumber")
                .count(),
            1
        );
        assert!(config.iter().all(|o| o.key.starts_with(GUESTINFO_PREFIX)
            || o.key == "ethernet0.pciSlotNumber"));
    }

    #[test]
    fn test_config_spec_platform_flags() {
        let built = BuiltSpec {
            devices: DeviceList::new(),
            extra_config: Vec::new(),
            files: VirtualMachineFileInfo {
                vm_path_name: "[vm-store]".to_string(),
            },
        };
        let spec = config_spec(&params(BTreeMap::new()), built);

        assert!(spec.nested_hv_enabled);
        assert!(spec.virtual_ich7m_present);
        assert!(spec.virtual_smc_present);
        assert_eq!(spec.guest_id, "darwin19_64Guest");
        assert_eq!(spec.memory_mb, 8192);
        assert_eq!(spec.num_cpus, 4);
        assert_eq!(spec.num_cores_per_socket, 2);
        assert_eq!(spec.files.vm_path_name, "[vm-store]");
    }
}
