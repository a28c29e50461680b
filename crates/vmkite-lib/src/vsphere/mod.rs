//! vmkite-specific abstraction over the vSphere control plane
//!
//! This module provides:
//! - The [`ControlPlane`] trait, the boundary to the vSphere API
//! - A self-reauthenticating [`Session`] with a cached datacenter [`Finder`]
//! - Virtual device construction and VM config spec building
//! - VM creation on a cluster
//! - A SOAP control plane that talks to vCenter over HTTPS
//! - An inventory-backed control plane for dry runs and tests

mod config_spec;
mod create;
mod devices;
mod finder;
mod inventory;
mod path;
mod session;
mod soap;


pub use config_spec::{
    config_spec, extra_config, BuiltSpec, ConfigSpecBuilder, OptionValue,
    VirtualMachineConfigSpec, VirtualMachineFileInfo, GUESTINFO_PREFIX,
};
pub use devices::{
    add_disk, add_ethernet, add_scsi, add_usb, DeviceChangeOperation, DeviceError, DeviceList,
    DiskBacking, DiskMode, EthernetAdapter, MacAddressType, ScsiControllerKind,
    VirtualDevice, VirtualDeviceConfigSpec, VirtualDisk, VirtualEthernetCard,
    VirtualScsiController, VirtualUsbController,
};
pub use finder::Finder;
pub use inventory::{CreatedVm, DatacenterInventory, Inventory, InventoryControlPlane};
pub use session::{
    ConnectionParams, KeepaliveOutcome, KeepaliveStats, Session, SessionConfig, SessionState,
};
pub use soap::{SoapConfig, SoapControlPlane};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// Reference to a managed object, e.g. `Datastore:datastore-12`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ManagedObjectReference {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

impl ManagedObjectReference {
    pub fn new(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for ManagedObjectReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datacenter {
    pub reference: ManagedObjectReference,
    pub name: String,
    pub inventory_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Folder {
    pub reference: ManagedObjectReference,
    pub inventory_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Network {
    pub reference: ManagedObjectReference,
    pub name: String,
    pub inventory_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datastore {
    pub reference: ManagedObjectReference,
    pub name: String,
    pub inventory_path: String,
}

impl Datastore {
    /// Datastore path of a file, e.g. `[images] /macos.vmdk`
    pub fn path(&self, file: &str) -> String {
        format!("[{}] {}", self.name, file)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    pub reference: ManagedObjectReference,
    pub inventory_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePool {
    pub reference: ManagedObjectReference,
    pub inventory_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub reference: ManagedObjectReference,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualMachine {
    pub reference: ManagedObjectReference,
    pub name: String,
    pub inventory_path: String,
}

/// Network backing for a virtual ethernet card
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EthernetBacking {
    /// Standard vSwitch port group
    Network {
        device_name: String,
        network: ManagedObjectReference,
    },
    /// Distributed vSwitch port group
    DistributedPort {
        switch_uuid: String,
        portgroup_key: String,
    },
}

/// Credentials and endpoint for a login
#[derive(Clone)]
pub struct Login {
    pub url: Url,
    pub user: String,
    pub password: String,
    pub insecure: bool,
}

impl fmt::Debug for Login {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Login")
            .field("url", &self.url.as_str())
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("insecure", &self.insecure)
            .finish()
    }
}

/// Faults reported by the control plane
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Fault {
    #[error("session is not authenticated")]
    NotAuthenticated,

    #[error("cannot complete login due to an incorrect user name or password")]
    InvalidLogin,

    #[error("{kind} '{path}' not found")]
    NotFound { kind: &'static str, path: String },

    #[error("path '{path}' resolves to multiple {kind}s")]
    Ambiguous { kind: &'static str, path: String },

    #[error("the name '{0}' already exists")]
    DuplicateName(String),

    #[error("invalid device configuration: {0}")]
    InvalidDeviceConfig(String),

    #[error("task {task} failed: {message}")]
    TaskFailed { task: String, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    /// Any other fault the server reported, by its vSphere type name
    #[error("{kind}: {message}")]
    Server { kind: String, message: String },
}

impl Fault {
    /// Whether the server-side session has expired
    pub fn is_not_authenticated(&self) -> bool {
        matches!(self, Fault::NotAuthenticated)
    }
}

/// Errors surfaced by session and provisioning operations
#[derive(Debug, thiserror::Error)]
pub enum VsphereError {
    #[error("invalid vSphere endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),

    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: Fault,
    },

    #[error(transparent)]
    Fault(#[from] Fault),

    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// The subset of the vSphere API that vmkite drives
#[async_trait]
pub trait ControlPlane: Send + Sync + 'static {
    /// Log in, replacing any previous session
    async fn login(&self, login: &Login) -> Result<(), Fault>;

    /// Server clock; used as the keepalive check
    async fn current_time(&self) -> Result<DateTime<Utc>, Fault>;

    /// The single datacenter of the inventory
    async fn default_datacenter(&self) -> Result<Datacenter, Fault>;

    /// The datacenter's root VM folder
    async fn vm_folder(&self, datacenter: &Datacenter) -> Result<Folder, Fault>;

    async fn folder(&self, datacenter: &Datacenter, path: &str) -> Result<Folder, Fault>;

    async fn network(&self, datacenter: &Datacenter, path: &str) -> Result<Network, Fault>;

    async fn ethernet_card_backing(&self, network: &Network) -> Result<EthernetBacking, Fault>;

    async fn datastore(&self, datacenter: &Datacenter, path: &str) -> Result<Datastore, Fault>;

    async fn cluster(&self, datacenter: &Datacenter, path: &str) -> Result<Cluster, Fault>;

    /// Root resource pool of a cluster
    async fn resource_pool(&self, cluster: &Cluster) -> Result<ResourcePool, Fault>;

    async fn virtual_machine(
        &self,
        datacenter: &Datacenter,
        path: &str,
    ) -> Result<VirtualMachine, Fault>;

    /// Submit a CreateVM task
    async fn create_vm(
        &self,
        folder: &Folder,
        spec: &VirtualMachineConfigSpec,
        pool: &ResourcePool,
    ) -> Result<Task, Fault>;

    /// Block until a task succeeds or fails
    async fn wait_for_task(&self, task: &Task) -> Result<(), Fault>;
}
