//! Core data models shared between the job source and the provisioner

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Provisioning intent decoded from a job's agent query rules
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningIntent {
    /// Path of the source disk image on the source datastore
    pub disk_image: String,
    /// vSphere guest OS identifier, e.g. `darwin19_64Guest`
    pub guest_identity: String,
}

impl ProvisioningIntent {
    /// An intent is actionable only when both fields are present
    pub fn is_complete(&self) -> bool {
        !self.disk_image.is_empty() && !self.guest_identity.is_empty()
    }
}

/// A schedulable Buildkite job that wants a VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub build_number: String,
    pub pipeline: String,
    pub intent: ProvisioningIntent,
}

/// Everything needed to create one VM
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualMachineCreationParams {
    pub buildkite_agent_token: String,
    pub cluster_path: String,
    /// Inventory path of the target folder; the datacenter VM folder when unset
    pub folder_path: Option<String>,
    pub datastore_name: String,
    pub guest_id: String,
    pub memory_mb: i64,
    pub name: String,
    pub network_label: String,
    pub num_cpus: i32,
    pub num_cores_per_socket: i32,
    pub src_disk_datastore: String,
    pub src_disk_path: String,
    /// Extra `guestinfo.*` properties, injected in key order
    pub guest_info: BTreeMap<String, String>,
}

/// Deployment-wide VM settings, combined with a job's intent to produce
/// [`VirtualMachineCreationParams`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmTemplate {
    pub cluster_path: String,
    #[serde(default)]
    pub folder_path: Option<String>,
    pub datastore_name: String,
    pub network_label: String,
    pub src_disk_datastore: String,
    #[serde(default = "default_memory_mb")]
    pub memory_mb: i64,
    #[serde(default = "default_num_cpus")]
    pub num_cpus: i32,
    #[serde(default = "default_num_cores_per_socket")]
    pub num_cores_per_socket: i32,
    #[serde(default)]
    pub guest_info: BTreeMap<String, String>,
}

fn default_memory_mb() -> i64 {
    4096
}

fn default_num_cpus() -> i32 {
    2
}

fn default_num_cores_per_socket() -> i32 {
    1
}

impl VmTemplate {
    /// Fill in the per-job parts of the creation params
    pub fn params_for(
        &self,
        intent: &ProvisioningIntent,
        name: impl Into<String>,
        buildkite_agent_token: impl Into<String>,
    ) -> VirtualMachineCreationParams {
        VirtualMachineCreationParams {
            buildkite_agent_token: buildkite_agent_token.into(),
            cluster_path: self.cluster_path.clone(),
            folder_path: self.folder_path.clone(),
            datastore_name: self.datastore_name.clone(),
            guest_id: intent.guest_identity.clone(),
            memory_mb: self.memory_mb,
            name: name.into(),
            network_label: self.network_label.clone(),
            num_cpus: self.num_cpus,
            num_cores_per_socket: self.num_cores_per_socket,
            src_disk_datastore: self.src_disk_datastore.clone(),
            src_disk_path: intent.disk_image.clone(),
            guest_info: self.guest_info.clone(),
        }
    }
}

/// Name of the VM provisioned for a job
pub fn vm_name_for(job: &Job) -> String {
    format!("vmkite-{}", job.id)
}
