//! VM creation on a cluster

use super::{config_spec, ConfigSpecBuilder, ControlPlane, Session, VirtualMachine, VsphereError};
use crate::models::VirtualMachineCreationParams;
use std::time::Instant;
use tracing::{debug, info};

impl<C: ControlPlane> Session<C> {
    /// Look up a VM by inventory path
    pub async fn virtual_machine(&self, path: &str) -> Result<VirtualMachine, VsphereError> {
        let finder = self.finder().await?;
        Ok(finder.virtual_machine(path).await?)
    }

    /// Create a VM and wait for the CreateVM task to complete.
    ///
    /// Nothing is cleaned up if a step fails part way.
    pub async fn create_vm(
        &self,
        params: &VirtualMachineCreationParams,
    ) -> Result<VirtualMachine, VsphereError> {
        let start = Instant::now();
        let finder = self.finder().await?;

        let folder = match &params.folder_path {
            Some(path) => finder.folder(path).await?,
            None => finder.vm_folder().await?,
        };
        let cluster = finder.cluster_compute_resource(&params.cluster_path).await?;
        let pool = finder.resource_pool(&cluster).await?;

        let built = ConfigSpecBuilder::new(finder).build(params).await?;
        let spec = config_spec(params, built);

        debug!(
            name = %params.name,
            pool = %pool.reference,
            "Submitting CreateVM"
        );
        let task = self.plane().create_vm(&folder, &spec, &pool).await?;

        debug!(task = %task.reference, "Waiting for CreateVM");
        self.plane().wait_for_task(&task).await?;

        // The task result is only a reference; look the VM up again by path
        let vm = self
            .virtual_machine(&format!("{}/{}", folder.inventory_path, params.name))
            .await?;

        info!(
            name = %vm.name,
            path = %vm.inventory_path,
            guest_id = %params.guest_id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Created virtual machine"
        );
        Ok(vm)
    }
}
