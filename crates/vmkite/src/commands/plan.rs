//! Dry-run VM planning against an inventory file

use anyhow::{Context, Result};
use chrono::Utc;
use colored::Colorize;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tabled::Tabled;
use vmkite_lib::vsphere::{
    ConnectionParams, CreatedVm, EthernetBacking, Inventory, InventoryControlPlane, OptionValue,
    Session, SessionConfig, VirtualDevice,
};
use vmkite_lib::StructuredLogger;

use super::IntentArgs;
use crate::config::VmkiteConfig;
use crate::output::{
    format_memory_mb, mask_secret, print_json, print_success, print_table, OutputFormat,
};

const AGENT_TOKEN_KEY: &str = "guestinfo.vmkite-buildkite-agent-token";

/// Arguments of `vmkite plan`
#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub inventory: PathBuf,
    pub intent: IntentArgs,
}

#[derive(Serialize)]
struct PlanOutput<'a> {
    path: &'a str,
    folder: &'a str,
    resource_pool: &'a str,
    spec: &'a vmkite_lib::vsphere::VirtualMachineConfigSpec,
}

/// Row for the device table
#[derive(Tabled, Serialize)]
struct DeviceRow {
    #[tabled(rename = "Key")]
    key: i32,
    #[tabled(rename = "Device")]
    device: String,
    #[tabled(rename = "Details")]
    details: String,
}

/// Row for the extra config table
#[derive(Tabled, Serialize)]
struct ExtraConfigRow {
    #[tabled(rename = "Key")]
    key: String,
    #[tabled(rename = "Value")]
    value: String,
}

/// Load an inventory description; the format follows the file extension
pub fn load_inventory(path: &Path) -> Result<Inventory> {
    config::Config::builder()
        .add_source(config::File::from(path).required(true))
        .build()
        .and_then(|c| c.try_deserialize())
        .with_context(|| format!("failed to load inventory from {}", path.display()))
}

/// Run VM creation against the inventory and print the resulting request
pub async fn plan_vm(
    config: &VmkiteConfig,
    request: PlanRequest,
    logger: &StructuredLogger,
    format: OutputFormat,
) -> Result<()> {
    let intent = request.intent.complete_intent()?;
    let template = config.vm_template()?;
    let inventory = load_inventory(&request.inventory)?;

    let name = request
        .intent
        .name
        .clone()
        .unwrap_or_else(|| format!("vmkite-plan-{}", Utc::now().format("%Y%m%d%H%M%S")));
    let params = template.params_for(&intent, name, config.buildkite_agent_token.clone());

    let (connection, session_config) = match &config.vsphere {
        Some(vsphere) => (vsphere.connection_params(), vsphere.session_config()),
        None => (
            ConnectionParams {
                host: "inventory.local".to_string(),
                user: String::new(),
                password: String::new(),
                insecure: true,
            },
            SessionConfig::default(),
        ),
    };
    // Log in with whatever the inventory accepts
    let connection = ConnectionParams {
        user: inventory.user.clone().unwrap_or(connection.user),
        password: inventory.password.clone().unwrap_or(connection.password),
        ..connection
    };

    let plane = Arc::new(InventoryControlPlane::new(inventory));
    let session = Session::connect_with_config(plane.clone(), &connection, session_config).await?;
    let result = session.create_vm(&params).await;
    session.close().await;

    let vm = match result {
        Ok(vm) => vm,
        Err(e) => {
            logger.log_vm_created(&params, Err(e.to_string().as_str()));
            return Err(e.into());
        }
    };

    let created = plane
        .created()
        .await
        .pop()
        .context("inventory recorded no virtual machine")?;
    logger.log_vm_planned(&params, created.spec.device_change.len());

    let mut spec = created.spec.clone();
    for option in spec.extra_config.iter_mut() {
        if option.key == AGENT_TOKEN_KEY {
            option.value = mask_secret(&option.value);
        }
    }

    match format {
        OutputFormat::Json => print_json(&PlanOutput {
            path: &vm.inventory_path,
            folder: &created.folder.inventory_path,
            resource_pool: &created.pool.inventory_path,
            spec: &spec,
        })?,
        OutputFormat::Table => render_plan(&vm.inventory_path, &created, &spec.extra_config),
    }

    Ok(())
}

fn render_plan(path: &str, created: &CreatedVm, extra_config: &[OptionValue]) {
    let spec = &created.spec;

    println!("{}", "VM Creation Plan".bold());
    println!("{}", "=".repeat(60));
    println!("Name:          {}", spec.name.cyan());
    println!("Path:          {}", path);
    println!("Resource pool: {}", created.pool.inventory_path);
    println!("Files:         {}", spec.files.vm_path_name);
    println!("Guest ID:      {}", spec.guest_id);
    println!(
        "CPUs:          {} ({} per socket)",
        spec.num_cpus, spec.num_cores_per_socket
    );
    println!("Memory:        {}", format_memory_mb(spec.memory_mb));
    println!(
        "Platform:      nestedHV={} ich7m={} smc={}",
        spec.nested_hv_enabled, spec.virtual_ich7m_present, spec.virtual_smc_present
    );
    println!();

    let devices: Vec<DeviceRow> = spec
        .device_change
        .iter()
        .map(|change| device_row(&change.device))
        .collect();
    print_table(&devices, OutputFormat::Table);

    let options: Vec<ExtraConfigRow> = extra_config
        .iter()
        .map(|option| ExtraConfigRow {
            key: option.key.clone(),
            value: option.value.clone(),
        })
        .collect();
    print_table(&options, OutputFormat::Table);

    print_success(&format!(
        "{} would be created with {} devices",
        spec.name,
        devices.len()
    ));
}

fn device_row(device: &VirtualDevice) -> DeviceRow {
    let (name, details) = match device {
        VirtualDevice::EthernetCard(card) => {
            let network = match &card.backing {
                EthernetBacking::Network { device_name, .. } => device_name.clone(),
                EthernetBacking::DistributedPort { portgroup_key, .. } => {
                    format!("portgroup {}", portgroup_key)
                }
            };
            ("ethernet", format!("{:?} on {}", card.adapter, network))
        }
        VirtualDevice::ScsiController(controller) => (
            "scsi",
            format!("{:?} bus {}", controller.kind, controller.bus_number),
        ),
        VirtualDevice::Disk(disk) => (
            "disk",
            format!(
                "{} (controller {}, unit {}, thin={}, {:?})",
                disk.backing.file_name,
                disk.controller_key,
                disk.unit_number,
                disk.backing.thin_provisioned,
                disk.backing.disk_mode
            ),
        ),
        VirtualDevice::UsbController(usb) => (
            "usb",
            format!(
                "ehci={} auto_connect={}",
                usb.ehci_enabled, usb.auto_connect_devices
            ),
        ),
    };

    DeviceRow {
        key: device.key(),
        device: name.to_string(),
        details,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_inventory() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(
            br#"
user = "vmkite"
password = "secret"

[[datacenters]]
name = "dc1"
networks = ["VM Network"]
datastores = ["images", "vm-store"]
clusters = ["macOS"]
"#,
        )
        .unwrap();

        let inventory = load_inventory(file.path()).unwrap();
        assert_eq!(inventory.user.as_deref(), Some("vmkite"));
        assert_eq!(inventory.datacenters.len(), 1);
        assert_eq!(inventory.datacenters[0].datastores.len(), 2);
        assert!(inventory.datacenters[0].folders.is_empty());
    }
}
