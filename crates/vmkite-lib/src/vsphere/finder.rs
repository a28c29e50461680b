//! Inventory path lookups scoped to one datacenter

use super::{
    Cluster, ControlPlane, Datacenter, Datastore, EthernetBacking, Fault, Folder, Network,
    ResourcePool, VirtualMachine,
};
use std::sync::Arc;
use tracing::debug;

/// Resolves inventory paths within a datacenter
pub struct Finder<C: ControlPlane> {
    plane: Arc<C>,
    datacenter: Datacenter,
}

impl<C: ControlPlane> Finder<C> {
    /// Resolve the default datacenter and scope a finder to it
    pub async fn for_default_datacenter(plane: Arc<C>) -> Result<Self, Fault> {
        debug!("Resolving default datacenter");
        let datacenter = plane.default_datacenter().await?;
        debug!(datacenter = %datacenter.inventory_path, "Scoped finder to datacenter");
        Ok(Self { plane, datacenter })
    }

    pub fn datacenter(&self) -> &Datacenter {
        &self.datacenter
    }

    pub async fn vm_folder(&self) -> Result<Folder, Fault> {
        debug!(datacenter = %self.datacenter.name, "Looking up VM folder");
        self.plane.vm_folder(&self.datacenter).await
    }

    pub async fn folder(&self, path: &str) -> Result<Folder, Fault> {
        debug!(path = %path, "Looking up folder");
        self.plane.folder(&self.datacenter, path).await
    }

    pub async fn network(&self, path: &str) -> Result<Network, Fault> {
        debug!(path = %path, "Looking up network");
        self.plane.network(&self.datacenter, path).await
    }

    pub async fn ethernet_card_backing(&self, network: &Network) -> Result<EthernetBacking, Fault> {
        self.plane.ethernet_card_backing(network).await
    }

    pub async fn datastore(&self, path: &str) -> Result<Datastore, Fault> {
        debug!(path = %path, "Looking up datastore");
        self.plane.datastore(&self.datacenter, path).await
    }

    pub async fn cluster_compute_resource(&self, path: &str) -> Result<Cluster, Fault> {
        debug!(path = %path, "Looking up cluster");
        self.plane.cluster(&self.datacenter, path).await
    }

    pub async fn resource_pool(&self, cluster: &Cluster) -> Result<ResourcePool, Fault> {
        debug!(cluster = %cluster.inventory_path, "Looking up cluster resource pool");
        self.plane.resource_pool(cluster).await
    }

    pub async fn virtual_machine(&self, path: &str) -> Result<VirtualMachine, Fault> {
        debug!(path = %path, "Looking up virtual machine");
        self.plane.virtual_machine(&self.datacenter, path).await
    }
}
