//! VM creation on vCenter

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use vmkite_lib::vsphere::{Session, SoapControlPlane};
use vmkite_lib::StructuredLogger;

use super::IntentArgs;
use crate::config::VmkiteConfig;
use crate::output::{print_json, print_success, OutputFormat};

#[derive(Serialize)]
struct CreateOutput<'a> {
    name: &'a str,
    path: &'a str,
    reference: String,
    datacenter: Option<&'a str>,
}

/// Create the VM a job intent describes on the configured vCenter
pub async fn create_vm(
    config: &VmkiteConfig,
    args: IntentArgs,
    logger: &StructuredLogger,
    format: OutputFormat,
) -> Result<()> {
    let intent = args.complete_intent()?;
    let template = config.vm_template()?;
    let vsphere = config.vsphere()?;

    let name = args
        .name
        .clone()
        .unwrap_or_else(|| format!("vmkite-{}", Utc::now().format("%Y%m%d%H%M%S")));
    let params = template.params_for(&intent, name, config.buildkite_agent_token.clone());

    let plane = Arc::new(SoapControlPlane::new(vsphere.soap_config()));
    let session = Session::connect_with_config(
        plane,
        &vsphere.connection_params(),
        vsphere.session_config(),
    )
    .await?;

    let result = session.create_vm(&params).await;
    let datacenter = session.datacenter().map(|dc| dc.name.clone());
    session.close().await;

    let vm = match result {
        Ok(vm) => vm,
        Err(e) => {
            logger.log_vm_created(&params, Err(e.to_string().as_str()));
            return Err(e).context(format!("failed to create {}", params.name));
        }
    };
    logger.log_vm_created(&params, Ok(vm.inventory_path.as_str()));

    match format {
        OutputFormat::Json => print_json(&CreateOutput {
            name: &vm.name,
            path: &vm.inventory_path,
            reference: vm.reference.to_string(),
            datacenter: datacenter.as_deref(),
        })?,
        OutputFormat::Table => print_success(&format!(
            "Created {} at {} ({})",
            vm.name, vm.inventory_path, vm.reference
        )),
    }

    Ok(())
}
