//! Pending job CLI commands

use anyhow::Result;
use serde::Serialize;
use tabled::Tabled;
use vmkite_lib::buildkite::BuildkiteClient;
use vmkite_lib::{vm_name_for, StructuredLogger};

use crate::output::{print_table, print_warning, OutputFormat};

/// Row for the pending jobs table
#[derive(Tabled, Serialize)]
struct JobRow {
    #[tabled(rename = "Job")]
    job_id: String,
    #[tabled(rename = "Pipeline")]
    pipeline: String,
    #[tabled(rename = "Build")]
    build_number: String,
    #[tabled(rename = "VMDK")]
    vmdk: String,
    #[tabled(rename = "Guest ID")]
    guest_id: String,
    #[tabled(rename = "VM Name")]
    vm_name: String,
}

/// List jobs in active builds that ask for a VM
pub async fn list_jobs(
    client: &BuildkiteClient,
    logger: &StructuredLogger,
    format: OutputFormat,
) -> Result<()> {
    let jobs = client.pending_jobs().await?;

    for job in &jobs {
        logger.log_job_discovered(job);
    }

    if jobs.is_empty() {
        if let OutputFormat::Table = format {
            print_warning(&format!(
                "No scheduled or running jobs in {} ask for a VM",
                client.org()
            ));
            return Ok(());
        }
    }

    let rows: Vec<JobRow> = jobs
        .iter()
        .map(|job| JobRow {
            job_id: job.id.clone(),
            pipeline: job.pipeline.clone(),
            build_number: job.build_number.clone(),
            vmdk: job.intent.disk_image.clone(),
            guest_id: job.intent.guest_identity.clone(),
            vm_name: vm_name_for(job),
        })
        .collect();

    print_table(&rows, format);
    Ok(())
}
