//! Structured event logging for vmkite
//!
//! Every significant provisioning event is emitted as a tracing event with a
//! stable `event` field, so JSON log consumers can filter on it.

use crate::models::{Job, VirtualMachineCreationParams};
use crate::vsphere::KeepaliveStats;
use tracing::{info, warn};

/// Structured logger for provisioning events
#[derive(Clone)]
pub struct StructuredLogger {
    endpoint: String,
}

impl StructuredLogger {
    /// `endpoint` identifies the vCenter this process provisions on
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }

    /// Log startup
    pub fn log_startup(&self, version: &str, org: &str) {
        info!(
            event = "vmkite_started",
            endpoint = %self.endpoint,
            vmkite_version = %version,
            org = %org,
            "vmkite started"
        );
    }

    /// Log a job that carries a provisioning intent
    pub fn log_job_discovered(&self, job: &Job) {
        if job.intent.is_complete() {
            info!(
                event = "job_discovered",
                endpoint = %self.endpoint,
                job_id = %job.id,
                pipeline = %job.pipeline,
                build_number = %job.build_number,
                vmdk = %job.intent.disk_image,
                guest_id = %job.intent.guest_identity,
                "Discovered job wanting a VM"
            );
        } else {
            warn!(
                event = "job_discovered",
                endpoint = %self.endpoint,
                job_id = %job.id,
                pipeline = %job.pipeline,
                build_number = %job.build_number,
                vmdk = %job.intent.disk_image,
                guest_id = %job.intent.guest_identity,
                "Discovered job with incomplete VM rules"
            );
        }
    }

    /// Log a dry-run plan
    pub fn log_vm_planned(&self, params: &VirtualMachineCreationParams, devices: usize) {
        info!(
            event = "vm_planned",
            endpoint = %self.endpoint,
            name = %params.name,
            cluster = %params.cluster_path,
            guest_id = %params.guest_id,
            devices = devices,
            "Planned virtual machine"
        );
    }

    /// Log the result of a creation attempt
    pub fn log_vm_created(
        &self,
        params: &VirtualMachineCreationParams,
        result: Result<&str, &str>,
    ) {
        match result {
            Ok(path) => {
                info!(
                    event = "vm_created",
                    endpoint = %self.endpoint,
                    name = %params.name,
                    path = %path,
                    guest_id = %params.guest_id,
                    vmdk = %params.src_disk_path,
                    "Virtual machine created"
                );
            }
            Err(error) => {
                warn!(
                    event = "vm_create_failed",
                    endpoint = %self.endpoint,
                    name = %params.name,
                    guest_id = %params.guest_id,
                    vmdk = %params.src_disk_path,
                    error = %error,
                    "Virtual machine creation failed"
                );
            }
        }
    }

    /// Log shutdown along with the final keepalive counters
    pub fn log_shutdown(&self, reason: &str, stats: Option<&KeepaliveStats>) {
        info!(
            event = "vmkite_shutdown",
            endpoint = %self.endpoint,
            reason = %reason,
            keepalive_checks = stats.map(|s| s.checks).unwrap_or(0),
            reauthentications = stats.map(|s| s.reauthentications).unwrap_or(0),
            "vmkite shutting down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ProvisioningIntent;
    use std::collections::BTreeMap;

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("https://vcenter/sdk");
        assert_eq!(logger.endpoint, "https://vcenter/sdk");
    }

    #[test]
    fn test_log_events_without_subscriber() {
        let logger = StructuredLogger::new("https://vcenter/sdk");
        let job = Job {
            id: "job-1".to_string(),
            build_number: "7".to_string(),
            pipeline: "app".to_string(),
            intent: ProvisioningIntent::default(),
        };
        let params = VirtualMachineCreationParams {
            buildkite_agent_token: "token".to_string(),
            cluster_path: "macOS".to_string(),
            folder_path: None,
            datastore_name: "vm-store".to_string(),
            guest_id: "darwin19_64Guest".to_string(),
            memory_mb: 4096,
            name: "vmkite-job-1".to_string(),
            network_label: "VM Network".to_string(),
            num_cpus: 2,
            num_cores_per_socket: 1,
            src_disk_datastore: "images".to_string(),
            src_disk_path: "/vol/base.vmdk".to_string(),
            guest_info: BTreeMap::new(),
        };

        logger.log_startup("0.1.0", "acme");
        logger.log_job_discovered(&job);
        logger.log_vm_planned(&params, 4);
        logger.log_vm_created(&params, Ok("/dc1/vm/vmkite-job-1"));
        logger.log_vm_created(&params, Err("network 'x' not found"));
        logger.log_shutdown("completed", Some(&KeepaliveStats::default()));
    }
}
