//! Control plane over the vim25 SOAP API
//!
//! Logs in through the `SessionManager`, keeps the session cookie in the
//! HTTP client, resolves inventory paths with the `SearchIndex` and reads
//! properties through the `PropertyCollector`.

mod encode;
mod xml;


use super::path::{absolute, glob_match, split_leaf};
use super::{
    Cluster, ControlPlane, Datacenter, Datastore, EthernetBacking, Fault, Folder, Login,
    ManagedObjectReference, Network, ResourcePool, Task, VirtualMachine,
    VirtualMachineConfigSpec,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use url::Url;
use xml::Element;

const SOAP_ACTION: &str = "urn:vim25/7.0";

/// Timeouts for SOAP calls and task polling
#[derive(Debug, Clone)]
pub struct SoapConfig {
    pub request_timeout: Duration,
    pub task_poll_interval: Duration,
    /// Give up waiting on a task after this long
    pub task_timeout: Duration,
}

impl Default for SoapConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            task_poll_interval: Duration::from_secs(1),
            task_timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone)]
struct ServiceContent {
    root_folder: ManagedObjectReference,
    property_collector: ManagedObjectReference,
    search_index: ManagedObjectReference,
    session_manager: ManagedObjectReference,
}

impl ServiceContent {
    fn from_response(response: &Element) -> Result<Self, Fault> {
        let content = response
            .child("returnval")
            .ok_or_else(|| unexpected("RetrieveServiceContent returned nothing"))?;
        let reference = |name: &str| {
            content
                .child(name)
                .and_then(Element::moref)
                .ok_or_else(|| unexpected(format!("service content has no {}", name)))
        };
        Ok(Self {
            root_folder: reference("rootFolder")?,
            property_collector: reference("propertyCollector")?,
            search_index: reference("searchIndex")?,
            session_manager: reference("sessionManager")?,
        })
    }
}

/// A logged-in HTTP client; the session lives in its cookie store
struct Connection {
    client: Client,
    url: Url,
    service: ServiceContent,
}

/// An object found by inventory path
struct Resolved {
    reference: ManagedObjectReference,
    name: String,
    inventory_path: String,
}

/// A [`ControlPlane`] that talks to vCenter or ESXi at `{host}/sdk`
pub struct SoapControlPlane {
    config: SoapConfig,
    connection: RwLock<Option<Arc<Connection>>>,
}

impl SoapControlPlane {
    pub fn new(config: SoapConfig) -> Self {
        Self {
            config,
            connection: RwLock::new(None),
        }
    }

    async fn connection(&self) -> Result<Arc<Connection>, Fault> {
        self.connection
            .read()
            .await
            .clone()
            .ok_or(Fault::NotAuthenticated)
    }

    async fn invoke(&self, body: &str) -> Result<Element, Fault> {
        let connection = self.connection().await?;
        call(&connection.client, &connection.url, body).await
    }

    async fn find_by_inventory_path(
        &self,
        path: &str,
    ) -> Result<Option<ManagedObjectReference>, Fault> {
        let connection = self.connection().await?;
        let body = encode::find_by_inventory_path(
            &connection.service.search_index,
            path.trim_start_matches('/'),
        );
        let response = call(&connection.client, &connection.url, &body).await?;
        Ok(response.child("returnval").and_then(Element::moref))
    }

    /// Read `path` on every object; objects lacking it map to `None`
    async fn properties(
        &self,
        objects: &[ManagedObjectReference],
        path: &str,
    ) -> Result<Vec<(ManagedObjectReference, Option<Element>)>, Fault> {
        if objects.is_empty() {
            return Ok(Vec::new());
        }
        let connection = self.connection().await?;
        let body =
            encode::retrieve_properties(&connection.service.property_collector, objects, path);
        let response = call(&connection.client, &connection.url, &body).await?;

        let mut values: Vec<(ManagedObjectReference, Option<Element>)> =
            objects.iter().map(|o| (o.clone(), None)).collect();
        let returned = response
            .child("returnval")
            .map(|r| r.children_named("objects").collect::<Vec<_>>())
            .unwrap_or_default();
        for object in returned {
            let Some(reference) = object.child("obj").and_then(Element::moref) else {
                continue;
            };
            let value = object
                .children_named("propSet")
                .find(|p| p.child("name").map(Element::text) == Some(path))
                .and_then(|p| p.child("val"))
                .cloned();
            if let Some(slot) = values.iter_mut().find(|(r, _)| *r == reference) {
                slot.1 = value;
            }
        }
        Ok(values)
    }

    async fn property(
        &self,
        object: &ManagedObjectReference,
        path: &str,
    ) -> Result<Element, Fault> {
        self.properties(std::slice::from_ref(object), path)
            .await?
            .pop()
            .and_then(|(_, value)| value)
            .ok_or_else(|| unexpected(format!("{} has no property {}", object, path)))
    }

    async fn reference_property(
        &self,
        object: &ManagedObjectReference,
        path: &str,
    ) -> Result<ManagedObjectReference, Fault> {
        self.property(object, path)
            .await?
            .moref()
            .ok_or_else(|| unexpected(format!("{}.{} is not a reference", object, path)))
    }

    async fn children(
        &self,
        folder: &ManagedObjectReference,
    ) -> Result<Vec<ManagedObjectReference>, Fault> {
        let children = self.property(folder, "childEntity").await?;
        Ok(children.children.iter().filter_map(Element::moref).collect())
    }

    /// Resolve `path` under `{datacenter}/{root}`. A `*` is honoured in the
    /// last path segment only.
    async fn resolve(
        &self,
        datacenter: &Datacenter,
        root: &str,
        path: &str,
        kinds: &[&str],
        label: &'static str,
    ) -> Result<Resolved, Fault> {
        let full = absolute(&format!("{}/{}", datacenter.inventory_path, root), path);
        let (parent, leaf) = split_leaf(&full);
        let not_found = || Fault::NotFound {
            kind: label,
            path: path.to_string(),
        };

        if !leaf.contains('*') {
            let reference = self
                .find_by_inventory_path(&full)
                .await?
                .filter(|r| kinds.contains(&r.kind.as_str()))
                .ok_or_else(not_found)?;
            return Ok(Resolved {
                reference,
                name: leaf.to_string(),
                inventory_path: full.clone(),
            });
        }

        let parent_ref = self
            .find_by_inventory_path(parent)
            .await?
            .ok_or_else(not_found)?;
        let candidates: Vec<_> = self
            .children(&parent_ref)
            .await?
            .into_iter()
            .filter(|r| kinds.contains(&r.kind.as_str()))
            .collect();
        let mut matches = self
            .properties(&candidates, "name")
            .await?
            .into_iter()
            .filter_map(|(reference, name)| Some((reference, name?.text)))
            .filter(|(_, name)| glob_match(leaf, name));

        match (matches.next(), matches.next()) {
            (Some((reference, name)), None) => Ok(Resolved {
                inventory_path: format!("{}/{}", parent, name),
                reference,
                name,
            }),
            (Some(_), Some(_)) => Err(Fault::Ambiguous {
                kind: label,
                path: path.to_string(),
            }),
            (None, _) => Err(not_found()),
        }
    }

    async fn task_state(&self, task: &Task) -> Result<Option<Result<(), Fault>>, Fault> {
        let info = self.property(&task.reference, "info").await?;
        let state = info.child("state").map(Element::text).unwrap_or_default();
        match state {
            "success" => Ok(Some(Ok(()))),
            "error" => {
                let error = info.child("error");
                let message = error
                    .and_then(|e| e.child("localizedMessage"))
                    .map(Element::text)
                    .filter(|m| !m.is_empty())
                    .or_else(|| error.and_then(|e| e.child("fault")).and_then(Element::xsi_type))
                    .unwrap_or("unknown error")
                    .to_string();
                Ok(Some(Err(Fault::TaskFailed {
                    task: task.reference.value.clone(),
                    message,
                })))
            }
            _ => Ok(None),
        }
    }
}

fn transport(err: reqwest::Error) -> Fault {
    Fault::Transport(err.to_string())
}

fn unexpected(detail: impl Into<String>) -> Fault {
    Fault::Transport(format!("unexpected SOAP response: {}", detail.into()))
}

/// POST one request and return the `...Response` element of the body
async fn call(client: &Client, url: &Url, body: &str) -> Result<Element, Fault> {
    let response = client
        .post(url.clone())
        .header(CONTENT_TYPE, "text/xml; charset=utf-8")
        .header("SOAPAction", SOAP_ACTION)
        .body(encode::envelope(body))
        .send()
        .await
        .map_err(transport)?;

    let status = response.status();
    let text = response.text().await.map_err(transport)?;
    let envelope = match xml::parse(&text) {
        Ok(envelope) => envelope,
        Err(_) if !status.is_success() => {
            return Err(Fault::Transport(format!("HTTP {} from {}", status, url)))
        }
        Err(e) => return Err(e),
    };

    let mut body = envelope
        .children
        .into_iter()
        .find(|c| c.name == "Body")
        .ok_or_else(|| unexpected("envelope has no body"))?;
    if let Some(fault) = body.child("Fault") {
        return Err(fault_from(fault));
    }
    if !status.is_success() {
        return Err(Fault::Transport(format!("HTTP {} from {}", status, url)));
    }
    if body.children.is_empty() {
        return Err(unexpected("empty body"));
    }
    Ok(body.children.remove(0))
}

/// Map a SOAP fault to a [`Fault`] by the type of its detail
fn fault_from(fault: &Element) -> Fault {
    let message = fault
        .child("faultstring")
        .map(|f| f.text().to_string())
        .unwrap_or_default();
    let detail = fault.child("detail").and_then(|d| d.children.first());
    let kind = detail
        .map(|d| {
            d.xsi_type()
                .unwrap_or_else(|| d.name.trim_end_matches("Fault"))
                .to_string()
        })
        .unwrap_or_else(|| "ServerFault".to_string());

    match kind.as_str() {
        "NotAuthenticated" => Fault::NotAuthenticated,
        "InvalidLogin" => Fault::InvalidLogin,
        "DuplicateName" => Fault::DuplicateName(
            detail
                .and_then(|d| d.child("name"))
                .map(|n| n.text().to_string())
                .unwrap_or(message),
        ),
        k if k.starts_with("InvalidDevice") || k == "InvalidController" => {
            Fault::InvalidDeviceConfig(message)
        }
        _ => Fault::Server {
            kind: kind.clone(),
            message,
        },
    }
}

#[async_trait]
impl ControlPlane for SoapControlPlane {
    async fn login(&self, login: &Login) -> Result<(), Fault> {
        // A fresh client per login drops the cookie of the expired session
        let client = Client::builder()
            .danger_accept_invalid_certs(login.insecure)
            .cookie_store(true)
            .timeout(self.config.request_timeout)
            .build()
            .map_err(transport)?;

        let content = call(&client, &login.url, &encode::retrieve_service_content()).await?;
        let service = ServiceContent::from_response(&content)?;
        let body = encode::login(&service.session_manager, &login.user, &login.password);
        call(&client, &login.url, &body).await?;

        debug!(url = %login.url, user = %login.user, "SOAP login");
        *self.connection.write().await = Some(Arc::new(Connection {
            client,
            url: login.url.clone(),
            service,
        }));
        Ok(())
    }

    async fn current_time(&self) -> Result<DateTime<Utc>, Fault> {
        let response = self.invoke(&encode::current_time()).await?;
        let value = response
            .child("returnval")
            .map(Element::text)
            .ok_or_else(|| unexpected("CurrentTime returned nothing"))?;
        DateTime::parse_from_rfc3339(value)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| unexpected(format!("bad server time '{}': {}", value, e)))
    }

    async fn default_datacenter(&self) -> Result<Datacenter, Fault> {
        let root = self.connection().await?.service.root_folder.clone();
        let datacenters: Vec<_> = self
            .children(&root)
            .await?
            .into_iter()
            .filter(|r| r.kind == "Datacenter")
            .collect();

        match datacenters.as_slice() {
            [reference] => {
                let name = self.property(reference, "name").await?.text;
                Ok(Datacenter {
                    reference: reference.clone(),
                    inventory_path: format!("/{}", name),
                    name,
                })
            }
            [] => Err(Fault::NotFound {
                kind: "datacenter",
                path: "*".to_string(),
            }),
            _ => Err(Fault::Ambiguous {
                kind: "datacenter",
                path: "*".to_string(),
            }),
        }
    }

    async fn vm_folder(&self, datacenter: &Datacenter) -> Result<Folder, Fault> {
        let reference = self
            .reference_property(&datacenter.reference, "vmFolder")
            .await?;
        Ok(Folder {
            reference,
            inventory_path: format!("{}/vm", datacenter.inventory_path),
        })
    }

    async fn folder(&self, datacenter: &Datacenter, path: &str) -> Result<Folder, Fault> {
        let found = self
            .resolve(datacenter, "vm", path, &["Folder"], "folder")
            .await?;
        Ok(Folder {
            reference: found.reference,
            inventory_path: found.inventory_path,
        })
    }

    async fn network(&self, datacenter: &Datacenter, path: &str) -> Result<Network, Fault> {
        let found = self
            .resolve(
                datacenter,
                "network",
                path,
                &["Network", "DistributedVirtualPortgroup"],
                "network",
            )
            .await?;
        Ok(Network {
            reference: found.reference,
            name: found.name,
            inventory_path: found.inventory_path,
        })
    }

    async fn ethernet_card_backing(&self, network: &Network) -> Result<EthernetBacking, Fault> {
        if network.reference.kind != "DistributedVirtualPortgroup" {
            return Ok(EthernetBacking::Network {
                device_name: network.name.clone(),
                network: network.reference.clone(),
            });
        }

        let portgroup_key = self.property(&network.reference, "key").await?.text;
        let switch = self
            .reference_property(&network.reference, "config.distributedVirtualSwitch")
            .await?;
        let switch_uuid = self.property(&switch, "uuid").await?.text;
        Ok(EthernetBacking::DistributedPort {
            switch_uuid,
            portgroup_key,
        })
    }

    async fn datastore(&self, datacenter: &Datacenter, path: &str) -> Result<Datastore, Fault> {
        let found = self
            .resolve(datacenter, "datastore", path, &["Datastore"], "datastore")
            .await?;
        Ok(Datastore {
            reference: found.reference,
            name: found.name,
            inventory_path: found.inventory_path,
        })
    }

    async fn cluster(&self, datacenter: &Datacenter, path: &str) -> Result<Cluster, Fault> {
        let found = self
            .resolve(
                datacenter,
                "host",
                path,
                &["ClusterComputeResource"],
                "cluster",
            )
            .await?;
        Ok(Cluster {
            reference: found.reference,
            inventory_path: found.inventory_path,
        })
    }

    async fn resource_pool(&self, cluster: &Cluster) -> Result<ResourcePool, Fault> {
        let reference = self
            .reference_property(&cluster.reference, "resourcePool")
            .await?;
        Ok(ResourcePool {
            reference,
            inventory_path: format!("{}/Resources", cluster.inventory_path),
        })
    }

    async fn virtual_machine(
        &self,
        datacenter: &Datacenter,
        path: &str,
    ) -> Result<VirtualMachine, Fault> {
        let found = self
            .resolve(
                datacenter,
                "vm",
                path,
                &["VirtualMachine"],
                "virtual machine",
            )
            .await?;
        Ok(VirtualMachine {
            reference: found.reference,
            name: found.name,
            inventory_path: found.inventory_path,
        })
    }

    async fn create_vm(
        &self,
        folder: &Folder,
        spec: &VirtualMachineConfigSpec,
        pool: &ResourcePool,
    ) -> Result<Task, Fault> {
        let body = encode::create_vm_task(&folder.reference, spec, &pool.reference);
        let response = self.invoke(&body).await?;
        let reference = response
            .child("returnval")
            .and_then(Element::moref)
            .ok_or_else(|| unexpected("CreateVM_Task returned no task"))?;
        Ok(Task { reference })
    }

    async fn wait_for_task(&self, task: &Task) -> Result<(), Fault> {
        let poll = async {
            loop {
                if let Some(result) = self.task_state(task).await? {
                    return result;
                }
                tokio::time::sleep(self.config.task_poll_interval).await;
            }
        };

        match tokio::time::timeout(self.config.task_timeout, poll).await {
            Ok(result) => result,
            Err(_) => {
                warn!(task = %task.reference, "Gave up waiting for task");
                Err(Fault::TaskFailed {
                    task: task.reference.value.clone(),
                    message: format!(
                        "still running after {}s",
                        self.config.task_timeout.as_secs()
                    ),
                })
            }
        }
    }
}
