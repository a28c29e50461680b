//! Virtual hardware for new VMs
//!
//! Devices are collected in an ordered [`DeviceList`]. Order matters: a disk
//! is attached to the SCSI controller already present in the list, so the
//! controller has to be added first. Each `add_*` step takes the list built
//! so far and returns the extended list.

use super::{Datastore, EthernetBacking, ManagedObjectReference};
use serde::{Deserialize, Serialize};

/// Keys of devices being added are negative; the first one is -201
const NEW_KEY_BASE: i32 = -200;

/// Unit number taken by the SCSI controller itself
const SCSI_RESERVED_UNIT: i32 = 7;

const SCSI_UNITS_PER_BUS: i32 = 16;

const SCSI_MAX_BUSES: i32 = 4;

/// Errors while assembling the device list
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("no {kind} controller in device list")]
    ControllerNotFound { kind: &'static str },

    #[error("no free unit on controller {controller_key}")]
    NoFreeUnit { controller_key: i32 },

    #[error("no free SCSI bus number")]
    NoFreeBus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EthernetAdapter {
    Vmxnet3,
    E1000e,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MacAddressType {
    Generated,
    Manual,
    Assigned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScsiControllerKind {
    LsiLogic,
    LsiLogicSas,
    ParaVirtual,
    BusLogic,
}

/// vSphere `VirtualDiskMode` values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskMode {
    Persistent,
    Nonpersistent,
    Undoable,
    IndependentPersistent,
    IndependentNonpersistent,
    Append,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualEthernetCard {
    pub key: i32,
    pub adapter: EthernetAdapter,
    pub backing: EthernetBacking,
    pub address_type: MacAddressType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualScsiController {
    pub key: i32,
    pub bus_number: i32,
    pub kind: ScsiControllerKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskBacking {
    /// Datastore path, e.g. `[images] /macos.vmdk`
    pub file_name: String,
    pub datastore: ManagedObjectReference,
    pub thin_provisioned: bool,
    pub disk_mode: DiskMode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualDisk {
    pub key: i32,
    pub controller_key: i32,
    pub unit_number: i32,
    pub backing: DiskBacking,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualUsbController {
    pub key: i32,
    pub auto_connect_devices: bool,
    pub ehci_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "device", rename_all = "snake_case")]
pub enum VirtualDevice {
    EthernetCard(VirtualEthernetCard),
    ScsiController(VirtualScsiController),
    Disk(VirtualDisk),
    UsbController(VirtualUsbController),
}

impl VirtualDevice {
    pub fn key(&self) -> i32 {
        match self {
            VirtualDevice::EthernetCard(d) => d.key,
            VirtualDevice::ScsiController(d) => d.key,
            VirtualDevice::Disk(d) => d.key,
            VirtualDevice::UsbController(d) => d.key,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceChangeOperation {
    Add,
    Edit,
    Remove,
}

/// One entry of a config spec's `deviceChange`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualDeviceConfigSpec {
    pub operation: DeviceChangeOperation,
    pub device: VirtualDevice,
}

/// Ordered list of devices for a new VM
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceList(Vec<VirtualDevice>);

impl DeviceList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &VirtualDevice> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[VirtualDevice] {
        &self.0
    }

    /// Next unused temporary key
    pub fn new_key(&self) -> i32 {
        self.0
            .iter()
            .map(VirtualDevice::key)
            .fold(NEW_KEY_BASE, i32::min)
            - 1
    }

    fn push(mut self, device: VirtualDevice) -> Self {
        self.0.push(device);
        self
    }

    fn scsi_controllers(&self) -> impl Iterator<Item = &VirtualScsiController> {
        self.0.iter().filter_map(|device| match device {
            VirtualDevice::ScsiController(c) => Some(c),
            _ => None,
        })
    }

    /// First SCSI controller that still has a free unit
    pub fn find_scsi_controller(&self) -> Result<&VirtualScsiController, DeviceError> {
        let mut first = None;
        for controller in self.scsi_controllers() {
            if self.free_unit_number(controller.key).is_some() {
                return Ok(controller);
            }
            first.get_or_insert(controller.key);
        }
        match first {
            Some(controller_key) => Err(DeviceError::NoFreeUnit { controller_key }),
            None => Err(DeviceError::ControllerNotFound { kind: "SCSI" }),
        }
    }

    /// Lowest unit number not used on the controller, skipping the
    /// controller's own unit
    pub fn free_unit_number(&self, controller_key: i32) -> Option<i32> {
        let used: Vec<i32> = self
            .0
            .iter()
            .filter_map(|device| match device {
                VirtualDevice::Disk(d) if d.controller_key == controller_key => {
                    Some(d.unit_number)
                }
                _ => None,
            })
            .collect();

        (0..SCSI_UNITS_PER_BUS)
            .filter(|unit| *unit != SCSI_RESERVED_UNIT)
            .find(|unit| !used.contains(unit))
    }

    fn free_scsi_bus(&self) -> Option<i32> {
        let used: Vec<i32> = self.scsi_controllers().map(|c| c.bus_number).collect();
        (0..SCSI_MAX_BUSES).find(|bus| !used.contains(bus))
    }

    /// Device changes applying `operation` to every device, in list order
    pub fn config_spec(&self, operation: DeviceChangeOperation) -> Vec<VirtualDeviceConfigSpec> {
        self.0
            .iter()
            .cloned()
            .map(|device| VirtualDeviceConfigSpec { operation, device })
            .collect()
    }
}

/// Append a vmxnet3 card on `backing` with a generated MAC address
pub fn add_ethernet(devices: DeviceList, backing: EthernetBacking) -> DeviceList {
    let card = VirtualEthernetCard {
        key: devices.new_key(),
        adapter: EthernetAdapter::Vmxnet3,
        backing,
        address_type: MacAddressType::Generated,
    };
    devices.push(VirtualDevice::EthernetCard(card))
}

/// Append an LSI Logic SCSI controller on the first free bus
pub fn add_scsi(devices: DeviceList) -> Result<DeviceList, DeviceError> {
    let bus_number = devices.free_scsi_bus().ok_or(DeviceError::NoFreeBus)?;
    let controller = VirtualScsiController {
        key: devices.new_key(),
        bus_number,
        kind: ScsiControllerKind::LsiLogic,
    };
    Ok(devices.push(VirtualDevice::ScsiController(controller)))
}

/// Append a disk for an existing file on `datastore`, attached to the SCSI
/// controller already in the list.
///
/// The disk is thin provisioned and independent-nonpersistent, so writes
/// made by the VM never reach the shared source image.
pub fn add_disk(
    devices: DeviceList,
    datastore: &Datastore,
    path: &str,
) -> Result<DeviceList, DeviceError> {
    let controller_key = devices.find_scsi_controller()?.key;
    let unit_number = devices
        .free_unit_number(controller_key)
        .ok_or(DeviceError::NoFreeUnit { controller_key })?;

    let disk = VirtualDisk {
        key: devices.new_key(),
        controller_key,
        unit_number,
        backing: DiskBacking {
            file_name: datastore.path(path),
            datastore: datastore.reference.clone(),
            thin_provisioned: true,
            disk_mode: DiskMode::IndependentNonpersistent,
        },
    };
    Ok(devices.push(VirtualDevice::Disk(disk)))
}

/// Append a USB controller with auto-connect and EHCI enabled
pub fn add_usb(devices: DeviceList) -> DeviceList {
    let usb = VirtualUsbController {
        key: devices.new_key(),
        auto_connect_devices: true,
        ehci_enabled: true,
    };
    devices.push(VirtualDevice::UsbController(usb))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn datastore() -> Datastore {
        Datastore {
            reference: ManagedObjectReference::new("Datastore", "datastore-12"),
            name: "images".to_string(),
            inventory_path: "/dc1/datastore/images".to_string(),
        }
    }

    fn backing() -> EthernetBacking {
        EthernetBacking::Network {
            device_name: "VM Network".to_string(),
            network: ManagedObjectReference::new("Network", "network-7"),
        }
    }

    #[test]
    fn test_new_keys_decrease_from_base() {
        let devices = DeviceList::new();
        assert_eq!(devices.new_key(), -201);

        let devices = add_ethernet(devices, backing());
        assert_eq!(devices.new_key(), -202);
    }

    #[test]
    fn test_full_device_order() {
        let devices = add_ethernet(DeviceList::new(), backing());
        let devices = add_scsi(devices).unwrap();
        let devices = add_disk(devices, &datastore(), "/vol/base.vmdk").unwrap();
        let devices = add_usb(devices);

        let kinds: Vec<_> = devices
            .iter()
            .map(|d| match d {
                VirtualDevice::EthernetCard(_) => "ethernet",
                VirtualDevice::ScsiController(_) => "scsi",
                VirtualDevice::Disk(_) => "disk",
                VirtualDevice::UsbController(_) => "usb",
            })
            .collect();
        assert_eq!(kinds, vec!["ethernet", "scsi", "disk", "usb"]);
    }

    #[test]
    fn test_disk_attaches_to_preceding_controller() {
        let devices = add_scsi(DeviceList::new()).unwrap();
        let controller_key = devices.as_slice()[0].key();

        let devices = add_disk(devices, &datastore(), "/vol/base.vmdk").unwrap();
        let VirtualDevice::Disk(disk) = &devices.as_slice()[1] else {
            panic!("expected disk");
        };

        assert_eq!(disk.controller_key, controller_key);
        assert_eq!(disk.unit_number, 0);
        assert_eq!(disk.backing.file_name, "[images] /vol/base.vmdk");
        assert_eq!(disk.backing.datastore.value, "datastore-12");
        assert!(disk.backing.thin_provisioned);
        assert_eq!(disk.backing.disk_mode, DiskMode::IndependentNonpersistent);
    }

    #[test]
    fn test_disk_without_controller_fails() {
        let devices = add_ethernet(DeviceList::new(), backing());
        let err = add_disk(devices, &datastore(), "/vol/base.vmdk").unwrap_err();
        assert_eq!(err, DeviceError::ControllerNotFound { kind: "SCSI" });
    }

    #[test]
    fn test_disk_units_skip_reserved_slot() {
        let mut devices = add_scsi(DeviceList::new()).unwrap();
        for _ in 0..8 {
            devices = add_disk(devices, &datastore(), "/vol/base.vmdk").unwrap();
        }

        let units: Vec<_> = devices
            .iter()
            .filter_map(|d| match d {
                VirtualDevice::Disk(disk) => Some(disk.unit_number),
                _ => None,
            })
            .collect();
        assert_eq!(units, vec![0, 1, 2, 3, 4, 5, 6, 8]);
    }

    #[test]
    fn test_full_controller_reports_no_free_unit() {
        let mut devices = add_scsi(DeviceList::new()).unwrap();
        let controller_key = devices.as_slice()[0].key();
        for _ in 0..15 {
            devices = add_disk(devices, &datastore(), "/vol/base.vmdk").unwrap();
        }

        let err = add_disk(devices, &datastore(), "/vol/base.vmdk").unwrap_err();
        assert_eq!(err, DeviceError::NoFreeUnit { controller_key });
    }

    #[test]
    fn test_scsi_bus_numbers() {
        let mut devices = DeviceList::new();
        for _ in 0..4 {
            devices = add_scsi(devices).unwrap();
        }
        assert_eq!(add_scsi(devices).unwrap_err(), DeviceError::NoFreeBus);
    }

    #[test]
    fn test_ethernet_and_usb_flags() {
        let devices = add_usb(add_ethernet(DeviceList::new(), backing()));

        let VirtualDevice::EthernetCard(card) = &devices.as_slice()[0] else {
            panic!("expected ethernet card");
        };
        assert_eq!(card.adapter, EthernetAdapter::Vmxnet3);
        assert_eq!(card.address_type, MacAddressType::Generated);

        let VirtualDevice::UsbController(usb) = &devices.as_slice()[1] else {
            panic!("expected usb controller");
        };
        assert!(usb.auto_connect_devices);
        assert!(usb.ehci_enabled);
    }

    #[test]
    fn test_config_spec_preserves_order() {
        let devices = add_usb(add_scsi(DeviceList::new()).unwrap());
        let changes = devices.config_spec(DeviceChangeOperation::Add);

        assert_eq!(changes.len(), 2);
        assert!(changes
            .iter()
            .all(|c| c.operation == DeviceChangeOperation::Add));
        assert_eq!(changes[0].device, devices.as_slice()[0]);
        assert_eq!(changes[1].device, devices.as_slice()[1]);
    }

    #[test]
    fn test_disk_mode_wire_name() {
        let json = serde_json::to_string(&DiskMode::IndependentNonpersistent).unwrap();
        assert_eq!(json, "\"independent_nonpersistent\"");
    }
}
