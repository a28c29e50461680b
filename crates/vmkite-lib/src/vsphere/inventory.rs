//! In-memory control plane backed by a declarative inventory
//!
//! Used by `vmkite plan` to show the exact CreateVM request a job would
//! produce, and by tests. Objects get inventory paths laid out the way
//! vCenter lays them out:
//!
//! ```text
//! /{datacenter}
//! /{datacenter}/vm[/{folder}]
//! /{datacenter}/network/{network}
//! /{datacenter}/datastore/{datastore}
//! /{datacenter}/host/{cluster}[/Resources]
//! ```
//!
//! Relative lookup paths resolve under the root folder for their kind and
//! may use `*` as a wildcard within one path segment.

use super::path::{absolute, glob_match};
use super::{
    Cluster, ControlPlane, Datacenter, Datastore, DeviceChangeOperation, EthernetBacking, Fault,
    Folder, Login, ManagedObjectReference, Network, ResourcePool, Task, VirtualDevice,
    VirtualMachine, VirtualMachineConfigSpec,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::debug;

/// Declarative description of a vCenter inventory
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Inventory {
    /// Accepted user name; any user is accepted when unset
    #[serde(default)]
    pub user: Option<String>,
    /// Accepted password; any password is accepted when unset
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub datacenters: Vec<DatacenterInventory>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatacenterInventory {
    pub name: String,
    /// Standard port groups
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub distributed_port_groups: Vec<String>,
    #[serde(default)]
    pub datastores: Vec<String>,
    #[serde(default)]
    pub clusters: Vec<String>,
    /// Folders below the datacenter VM folder, e.g. `ci/macos`
    #[serde(default)]
    pub folders: Vec<String>,
}

/// A VM created through [`InventoryControlPlane::create_vm`]
#[derive(Debug, Clone)]
pub struct CreatedVm {
    pub vm: VirtualMachine,
    pub folder: Folder,
    pub pool: ResourcePool,
    pub spec: VirtualMachineConfigSpec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Datacenter,
    Folder,
    Network,
    DistributedPortGroup,
    Datastore,
    Cluster,
    ResourcePool,
}

#[derive(Debug, Clone)]
struct Object {
    kind: Kind,
    datacenter: String,
    name: String,
    path: String,
    reference: ManagedObjectReference,
}

#[derive(Debug, Default)]
struct State {
    authenticated: bool,
    reject_logins: bool,
    check_fault: Option<Fault>,
    calls: HashMap<&'static str, u64>,
    tasks: HashMap<String, Result<(), Fault>>,
    created: Vec<CreatedVm>,
    next_id: u64,
}

impl State {
    fn record(&mut self, call: &'static str) {
        *self.calls.entry(call).or_default() += 1;
    }

    fn require_auth(&mut self, call: &'static str) -> Result<(), Fault> {
        self.record(call);
        if self.authenticated {
            Ok(())
        } else {
            Err(Fault::NotAuthenticated)
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// A [`ControlPlane`] over an in-memory [`Inventory`]
pub struct InventoryControlPlane {
    inventory: Inventory,
    objects: Vec<Object>,
    state: Mutex<State>,
}

impl InventoryControlPlane {
    pub fn new(inventory: Inventory) -> Self {
        let objects = index(&inventory);
        Self {
            inventory,
            objects,
            state: Mutex::new(State::default()),
        }
    }

    pub fn inventory(&self) -> &Inventory {
        &self.inventory
    }

    /// VMs created so far, in creation order
    pub async fn created(&self) -> Vec<CreatedVm> {
        self.state.lock().await.created.clone()
    }

    /// Number of times a trait method was called, e.g. `"login"`
    pub async fn call_count(&self, call: &str) -> u64 {
        self.state
            .lock()
            .await
            .calls
            .get(call)
            .copied()
            .unwrap_or(0)
    }

    /// Drop the server-side session, as vCenter does after its idle timeout
    pub async fn expire_session(&self) {
        self.state.lock().await.authenticated = false;
    }

    /// Make every following login fail with [`Fault::InvalidLogin`]
    pub async fn reject_logins(&self, reject: bool) {
        self.state.lock().await.reject_logins = reject;
    }

    /// Fail the next clock check with `fault`
    pub async fn fail_next_check(&self, fault: Fault) {
        self.state.lock().await.check_fault = Some(fault);
    }

    pub async fn is_authenticated(&self) -> bool {
        self.state.lock().await.authenticated
    }

    fn lookup(
        &self,
        kind: Kind,
        label: &'static str,
        datacenter: &Datacenter,
        root: &str,
        path: &str,
    ) -> Result<&Object, Fault> {
        let pattern = absolute(root, path);
        let mut matches = self.objects.iter().filter(|o| {
            o.kind == kind && o.datacenter == datacenter.name && glob_match(&pattern, &o.path)
        });

        match (matches.next(), matches.next()) {
            (Some(object), None) => Ok(object),
            (Some(_), Some(_)) => Err(Fault::Ambiguous {
                kind: label,
                path: path.to_string(),
            }),
            (None, _) => Err(Fault::NotFound {
                kind: label,
                path: path.to_string(),
            }),
        }
    }

    fn find_network(&self, datacenter: &Datacenter, path: &str) -> Result<&Object, Fault> {
        let pattern = absolute(&format!("{}/network", datacenter.inventory_path), path);
        let mut matches = self.objects.iter().filter(|o| {
            matches!(o.kind, Kind::Network | Kind::DistributedPortGroup)
                && o.datacenter == datacenter.name
                && glob_match(&pattern, &o.path)
        });

        match (matches.next(), matches.next()) {
            (Some(object), None) => Ok(object),
            (Some(_), Some(_)) => Err(Fault::Ambiguous {
                kind: "network",
                path: path.to_string(),
            }),
            (None, _) => Err(Fault::NotFound {
                kind: "network",
                path: path.to_string(),
            }),
        }
    }
}

fn index(inventory: &Inventory) -> Vec<Object> {
    let mut objects = Vec::new();
    let mut next = 0u64;
    let mut add = |kind: Kind,
                   datacenter: &str,
                   name: &str,
                   path: String,
                   mo_kind: &str,
                   prefix: &str| {
        next += 1;
        objects.push(Object {
            kind,
            datacenter: datacenter.to_string(),
            name: name.to_string(),
            path,
            reference: ManagedObjectReference::new(mo_kind, format!("{}-{}", prefix, next)),
        });
    };

    for dc in &inventory.datacenters {
        let root = format!("/{}", dc.name);
        add(Kind::Datacenter, &dc.name, &dc.name, root.clone(), "Datacenter", "datacenter");
        add(Kind::Folder, &dc.name, "vm", format!("{}/vm", root), "Folder", "group-v");
        for folder in &dc.folders {
            let name = folder.rsplit('/').next().unwrap_or(folder);
            let path = format!("{}/vm/{}", root, folder.trim_matches('/'));
            add(Kind::Folder, &dc.name, name, path, "Folder", "group-v");
        }
        for network in &dc.networks {
            let path = format!("{}/network/{}", root, network);
            add(Kind::Network, &dc.name, network, path, "Network", "network");
        }
        for portgroup in &dc.distributed_port_groups {
            let path = format!("{}/network/{}", root, portgroup);
            add(
                Kind::DistributedPortGroup,
                &dc.name,
                portgroup,
                path,
                "DistributedVirtualPortgroup",
                "dvportgroup",
            );
        }
        for datastore in &dc.datastores {
            let path = format!("{}/datastore/{}", root, datastore);
            add(Kind::Datastore, &dc.name, datastore, path, "Datastore", "datastore");
        }
        for cluster in &dc.clusters {
            let path = format!("{}/host/{}", root, cluster);
            add(
                Kind::Cluster,
                &dc.name,
                cluster,
                path.clone(),
                "ClusterComputeResource",
                "domain-c",
            );
            add(
                Kind::ResourcePool,
                &dc.name,
                "Resources",
                format!("{}/Resources", path),
                "ResourcePool",
                "resgroup",
            );
        }
    }

    objects
}

/// Check that every disk references a controller added before it
fn validate_devices(spec: &VirtualMachineConfigSpec) -> Result<(), Fault> {
    let mut controllers = Vec::new();
    for change in &spec.device_change {
        if change.operation != DeviceChangeOperation::Add {
            continue;
        }
        match &change.device {
            VirtualDevice::ScsiController(c) => controllers.push(c.key),
            VirtualDevice::Disk(d) if !controllers.contains(&d.controller_key) => {
                return Err(Fault::InvalidDeviceConfig(format!(
                    "disk {} references unknown controller {}",
                    d.key, d.controller_key
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

#[async_trait]
impl ControlPlane for InventoryControlPlane {
    async fn login(&self, login: &Login) -> Result<(), Fault> {
        let mut state = self.state.lock().await;
        state.record("login");

        let user_ok = self.inventory.user.as_deref().map_or(true, |u| u == login.user);
        let password_ok = self
            .inventory
            .password
            .as_deref()
            .map_or(true, |p| p == login.password);
        if state.reject_logins || !user_ok || !password_ok {
            return Err(Fault::InvalidLogin);
        }

        debug!(url = %login.url, user = %login.user, "Inventory login");
        state.authenticated = true;
        Ok(())
    }

    async fn current_time(&self) -> Result<DateTime<Utc>, Fault> {
        let mut state = self.state.lock().await;
        if let Some(fault) = state.check_fault.take() {
            state.record("current_time");
            return Err(fault);
        }
        state.require_auth("current_time")?;
        Ok(Utc::now())
    }

    async fn default_datacenter(&self) -> Result<Datacenter, Fault> {
        self.state.lock().await.require_auth("default_datacenter")?;

        let mut datacenters = self.objects.iter().filter(|o| o.kind == Kind::Datacenter);
        match (datacenters.next(), datacenters.next()) {
            (Some(dc), None) => Ok(Datacenter {
                reference: dc.reference.clone(),
                name: dc.name.clone(),
                inventory_path: dc.path.clone(),
            }),
            (Some(_), Some(_)) => Err(Fault::Ambiguous {
                kind: "datacenter",
                path: "*".to_string(),
            }),
            (None, _) => Err(Fault::NotFound {
                kind: "datacenter",
                path: "*".to_string(),
            }),
        }
    }

    async fn vm_folder(&self, datacenter: &Datacenter) -> Result<Folder, Fault> {
        self.state.lock().await.require_auth("vm_folder")?;
        let root = datacenter.inventory_path.as_str();
        let object = self.lookup(Kind::Folder, "folder", datacenter, root, "vm")?;
        Ok(Folder {
            reference: object.reference.clone(),
            inventory_path: object.path.clone(),
        })
    }

    async fn folder(&self, datacenter: &Datacenter, path: &str) -> Result<Folder, Fault> {
        self.state.lock().await.require_auth("folder")?;
        let root = format!("{}/vm", datacenter.inventory_path);
        let object = self.lookup(Kind::Folder, "folder", datacenter, &root, path)?;
        Ok(Folder {
            reference: object.reference.clone(),
            inventory_path: object.path.clone(),
        })
    }

    async fn network(&self, datacenter: &Datacenter, path: &str) -> Result<Network, Fault> {
        self.state.lock().await.require_auth("network")?;
        let object = self.find_network(datacenter, path)?;
        Ok(Network {
            reference: object.reference.clone(),
            name: object.name.clone(),
            inventory_path: object.path.clone(),
        })
    }

    async fn ethernet_card_backing(&self, network: &Network) -> Result<EthernetBacking, Fault> {
        self.state.lock().await.require_auth("ethernet_card_backing")?;
        let object = self
            .objects
            .iter()
            .find(|o| o.reference == network.reference)
            .ok_or_else(|| Fault::NotFound {
                kind: "network",
                path: network.inventory_path.clone(),
            })?;

        Ok(match object.kind {
            Kind::DistributedPortGroup => EthernetBacking::DistributedPort {
                switch_uuid: format!("dvs-{}", object.datacenter),
                portgroup_key: object.reference.value.clone(),
            },
            _ => EthernetBacking::Network {
                device_name: object.name.clone(),
                network: object.reference.clone(),
            },
        })
    }

    async fn datastore(&self, datacenter: &Datacenter, path: &str) -> Result<Datastore, Fault> {
        self.state.lock().await.require_auth("datastore")?;
        let root = format!("{}/datastore", datacenter.inventory_path);
        let object = self.lookup(Kind::Datastore, "datastore", datacenter, &root, path)?;
        Ok(Datastore {
            reference: object.reference.clone(),
            name: object.name.clone(),
            inventory_path: object.path.clone(),
        })
    }

    async fn cluster(&self, datacenter: &Datacenter, path: &str) -> Result<Cluster, Fault> {
        self.state.lock().await.require_auth("cluster")?;
        let root = format!("{}/host", datacenter.inventory_path);
        let object = self.lookup(Kind::Cluster, "cluster", datacenter, &root, path)?;
        Ok(Cluster {
            reference: object.reference.clone(),
            inventory_path: object.path.clone(),
        })
    }

    async fn resource_pool(&self, cluster: &Cluster) -> Result<ResourcePool, Fault> {
        self.state.lock().await.require_auth("resource_pool")?;
        let path = format!("{}/Resources", cluster.inventory_path);
        let object = self
            .objects
            .iter()
            .find(|o| o.kind == Kind::ResourcePool && o.path == path)
            .ok_or(Fault::NotFound {
                kind: "resource pool",
                path: path.clone(),
            })?;
        Ok(ResourcePool {
            reference: object.reference.clone(),
            inventory_path: object.path.clone(),
        })
    }

    async fn virtual_machine(
        &self,
        datacenter: &Datacenter,
        path: &str,
    ) -> Result<VirtualMachine, Fault> {
        let mut state = self.state.lock().await;
        state.require_auth("virtual_machine")?;

        let pattern = absolute(&format!("{}/vm", datacenter.inventory_path), path);
        let mut matches = state
            .created
            .iter()
            .filter(|c| glob_match(&pattern, &c.vm.inventory_path));
        match (matches.next(), matches.next()) {
            (Some(created), None) => Ok(created.vm.clone()),
            (Some(_), Some(_)) => Err(Fault::Ambiguous {
                kind: "virtual machine",
                path: path.to_string(),
            }),
            (None, _) => Err(Fault::NotFound {
                kind: "virtual machine",
                path: path.to_string(),
            }),
        }
    }

    async fn create_vm(
        &self,
        folder: &Folder,
        spec: &VirtualMachineConfigSpec,
        pool: &ResourcePool,
    ) -> Result<Task, Fault> {
        let mut state = self.state.lock().await;
        state.require_auth("create_vm")?;

        let task = format!("task-{}", state.next_id());
        let inventory_path = format!("{}/{}", folder.inventory_path, spec.name);

        let result = if state
            .created
            .iter()
            .any(|c| c.vm.inventory_path == inventory_path)
        {
            Err(Fault::DuplicateName(spec.name.clone()))
        } else {
            validate_devices(spec)
        };

        if result.is_ok() {
            let vm_id = state.next_id();
            state.created.push(CreatedVm {
                vm: VirtualMachine {
                    reference: ManagedObjectReference::new(
                        "VirtualMachine",
                        format!("vm-{}", vm_id),
                    ),
                    name: spec.name.clone(),
                    inventory_path,
                },
                folder: folder.clone(),
                pool: pool.clone(),
                spec: spec.clone(),
            });
        }

        state.tasks.insert(task.clone(), result);
        Ok(Task {
            reference: ManagedObjectReference::new("Task", task),
        })
    }

    async fn wait_for_task(&self, task: &Task) -> Result<(), Fault> {
        let mut state = self.state.lock().await;
        state.require_auth("wait_for_task")?;

        match state.tasks.get(&task.reference.value) {
            Some(Ok(())) => Ok(()),
            Some(Err(fault)) => Err(Fault::TaskFailed {
                task: task.reference.value.clone(),
                message: fault.to_string(),
            }),
            None => Err(Fault::NotFound {
                kind: "task",
                path: task.reference.value.clone(),
            }),
        }
    }
}
