//! vim25 request bodies
//!
//! Elements are written in WSDL sequence order; vCenter rejects requests
//! whose children are out of order.

use super::super::{
    DeviceChangeOperation, DiskMode, EthernetAdapter, EthernetBacking, MacAddressType,
    ManagedObjectReference, ScsiControllerKind, VirtualDevice, VirtualMachineConfigSpec,
};
use quick_xml::escape::escape;
use std::fmt::Display;

const ENVELOPE_OPEN: &str = concat!(
    r#"<?xml version="1.0" encoding="UTF-8"?>"#,
    r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" "#,
    r#"xmlns:xsd="http://www.w3.org/2001/XMLSchema" "#,
    r#"xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">"#,
    "<soapenv:Body>",
);
const ENVELOPE_CLOSE: &str = "</soapenv:Body></soapenv:Envelope>";

/// Wrap a request body in a SOAP envelope
pub(crate) fn envelope(body: &str) -> String {
    format!("{}{}{}", ENVELOPE_OPEN, body, ENVELOPE_CLOSE)
}

fn text(out: &mut String, name: &str, value: impl Display) {
    let value = value.to_string();
    out.push_str(&format!("<{0}>{1}</{0}>", name, escape(value.as_str())));
}

fn moref(out: &mut String, name: &str, reference: &ManagedObjectReference) {
    out.push_str(&format!(
        r#"<{0} type="{1}">{2}</{0}>"#,
        name,
        escape(reference.kind.as_str()),
        escape(reference.value.as_str())
    ));
}

fn open_typed(out: &mut String, name: &str, xsi_type: &str) {
    out.push_str(&format!(r#"<{} xsi:type="{}">"#, name, xsi_type));
}

fn close(out: &mut String, name: &str) {
    out.push_str(&format!("</{}>", name));
}

/// Start a method call on `this`
fn method(name: &str, this: &ManagedObjectReference) -> String {
    let mut out = format!(r#"<{} xmlns="urn:vim25">"#, name);
    moref(&mut out, "_this", this);
    out
}

pub(crate) fn retrieve_service_content() -> String {
    let mut out = method(
        "RetrieveServiceContent",
        &ManagedObjectReference::new("ServiceInstance", "ServiceInstance"),
    );
    close(&mut out, "RetrieveServiceContent");
    out
}

pub(crate) fn login(
    session_manager: &ManagedObjectReference,
    user: &str,
    password: &str,
) -> String {
    let mut out = method("Login", session_manager);
    text(&mut out, "userName", user);
    text(&mut out, "password", password);
    close(&mut out, "Login");
    out
}

pub(crate) fn current_time() -> String {
    let mut out = method(
        "CurrentTime",
        &ManagedObjectReference::new("ServiceInstance", "ServiceInstance"),
    );
    close(&mut out, "CurrentTime");
    out
}

/// `path` is relative to the root folder, e.g. `dc1/host/macOS`
pub(crate) fn find_by_inventory_path(
    search_index: &ManagedObjectReference,
    path: &str,
) -> String {
    let mut out = method("FindByInventoryPath", search_index);
    text(&mut out, "inventoryPath", path);
    close(&mut out, "FindByInventoryPath");
    out
}

/// Read one property of each object
pub(crate) fn retrieve_properties(
    collector: &ManagedObjectReference,
    objects: &[ManagedObjectReference],
    path: &str,
) -> String {
    let mut out = method("RetrievePropertiesEx", collector);
    out.push_str("<specSet>");

    let mut kinds: Vec<&str> = Vec::new();
    for object in objects {
        if !kinds.contains(&object.kind.as_str()) {
            kinds.push(&object.kind);
        }
    }
    for kind in kinds {
        out.push_str("<propSet>");
        text(&mut out, "type", kind);
        text(&mut out, "pathSet", path);
        close(&mut out, "propSet");
    }
    for object in objects {
        out.push_str("<objectSet>");
        moref(&mut out, "obj", object);
        close(&mut out, "objectSet");
    }

    close(&mut out, "specSet");
    out.push_str("<options/>");
    close(&mut out, "RetrievePropertiesEx");
    out
}

pub(crate) fn create_vm_task(
    folder: &ManagedObjectReference,
    spec: &VirtualMachineConfigSpec,
    pool: &ManagedObjectReference,
) -> String {
    let mut out = method("CreateVM_Task", folder);
    out.push_str("<config>");
    config_spec(&mut out, spec);
    close(&mut out, "config");
    moref(&mut out, "pool", pool);
    close(&mut out, "CreateVM_Task");
    out
}

fn config_spec(out: &mut String, spec: &VirtualMachineConfigSpec) {
    text(out, "name", &spec.name);
    text(out, "guestId", &spec.guest_id);
    out.push_str("<files>");
    text(out, "vmPathName", &spec.files.vm_path_name);
    close(out, "files");
    text(out, "numCPUs", spec.num_cpus);
    text(out, "numCoresPerSocket", spec.num_cores_per_socket);
    text(out, "memoryMB", spec.memory_mb);
    text(out, "virtualICH7MPresent", spec.virtual_ich7m_present);
    text(out, "virtualSMCPresent", spec.virtual_smc_present);

    for change in &spec.device_change {
        out.push_str("<deviceChange>");
        text(out, "operation", operation(change.operation));
        device(out, &change.device);
        close(out, "deviceChange");
    }

    for option in &spec.extra_config {
        open_typed(out, "extraConfig", "OptionValue");
        text(out, "key", &option.key);
        open_typed(out, "value", "xsd:string");
        out.push_str(&escape(option.value.as_str()));
        close(out, "value");
        close(out, "extraConfig");
    }

    text(out, "nestedHVEnabled", spec.nested_hv_enabled);
}

fn device(out: &mut String, device: &VirtualDevice) {
    match device {
        VirtualDevice::EthernetCard(card) => {
            let xsi_type = match card.adapter {
                EthernetAdapter::Vmxnet3 => "VirtualVmxnet3",
                EthernetAdapter::E1000e => "VirtualE1000e",
            };
            open_typed(out, "device", xsi_type);
            text(out, "key", card.key);
            match &card.backing {
                EthernetBacking::Network {
                    device_name,
                    network,
                } => {
                    open_typed(out, "backing", "VirtualEthernetCardNetworkBackingInfo");
                    text(out, "deviceName", device_name);
                    moref(out, "network", network);
                }
                EthernetBacking::DistributedPort {
                    switch_uuid,
                    portgroup_key,
                } => {
                    open_typed(
                        out,
                        "backing",
                        "VirtualEthernetCardDistributedVirtualPortBackingInfo",
                    );
                    out.push_str("<port>");
                    text(out, "switchUuid", switch_uuid);
                    text(out, "portgroupKey", portgroup_key);
                    close(out, "port");
                }
            }
            close(out, "backing");
            text(out, "addressType", address_type(card.address_type));
        }
        VirtualDevice::ScsiController(controller) => {
            let xsi_type = match controller.kind {
                ScsiControllerKind::LsiLogic => "VirtualLsiLogicController",
                ScsiControllerKind::LsiLogicSas => "VirtualLsiLogicSASController",
                ScsiControllerKind::ParaVirtual => "ParaVirtualSCSIController",
                ScsiControllerKind::BusLogic => "VirtualBusLogicController",
            };
            open_typed(out, "device", xsi_type);
            text(out, "key", controller.key);
            text(out, "busNumber", controller.bus_number);
            text(out, "sharedBus", "noSharing");
        }
        VirtualDevice::Disk(disk) => {
            open_typed(out, "device", "VirtualDisk");
            text(out, "key", disk.key);
            open_typed(out, "backing", "VirtualDiskFlatVer2BackingInfo");
            text(out, "fileName", &disk.backing.file_name);
            moref(out, "datastore", &disk.backing.datastore);
            text(out, "diskMode", disk_mode(disk.backing.disk_mode));
            text(out, "thinProvisioned", disk.backing.thin_provisioned);
            close(out, "backing");
            text(out, "controllerKey", disk.controller_key);
            text(out, "unitNumber", disk.unit_number);
            text(out, "capacityInKB", 0);
        }
        VirtualDevice::UsbController(usb) => {
            open_typed(out, "device", "VirtualUSBController");
            text(out, "key", usb.key);
            text(out, "busNumber", 0);
            text(out, "autoConnectDevices", usb.auto_connect_devices);
            text(out, "ehciEnabled", usb.ehci_enabled);
        }
    }
    close(out, "device");
}

fn operation(operation: DeviceChangeOperation) -> &'static str {
    match operation {
        DeviceChangeOperation::Add => "add",
        DeviceChangeOperation::Edit => "edit",
        DeviceChangeOperation::Remove => "remove",
    }
}

fn address_type(address_type: MacAddressType) -> &'static str {
    match address_type {
        MacAddressType::Generated => "generated",
        MacAddressType::Manual => "manual",
        MacAddressType::Assigned => "assigned",
    }
}

fn disk_mode(mode: DiskMode) -> &'static str {
    match mode {
        DiskMode::Persistent => "persistent",
        DiskMode::Nonpersistent => "nonpersistent",
        DiskMode::Undoable => "undoable",
        DiskMode::IndependentPersistent => "independent_persistent",
        DiskMode::IndependentNonpersistent => "independent_nonpersistent",
        DiskMode::Append => "append",
    }
}
