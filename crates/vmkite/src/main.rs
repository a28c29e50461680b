//! vmkite - macOS build-agent VMs on vSphere for Buildkite jobs
//!
//! Lists Buildkite jobs that ask for a VM through their agent query rules,
//! checks whether a job has finished, plans VM creation against a
//! declarative vSphere inventory and creates VMs on vCenter.

mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{create, jobs, plan, status, IntentArgs};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vmkite_lib::buildkite::BuildkiteClient;
use vmkite_lib::StructuredLogger;

const VMKITE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// vmkite CLI
#[derive(Parser)]
#[command(name = "vmkite")]
#[command(author, version, long_about = None)]
#[command(about = "Provisions macOS build-agent VMs on vSphere for Buildkite jobs")]
pub struct Cli {
    /// Configuration file (TOML); VMKITE_* environment variables override it
    #[arg(long, short, env = "VMKITE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List scheduled and running jobs that ask for a VM
    Jobs,

    /// Check whether a job has finished
    Status {
        /// Pipeline slug
        #[arg(long)]
        pipeline: String,

        /// Build number
        #[arg(long)]
        build: String,

        /// Job ID
        #[arg(long)]
        job: String,
    },

    /// Show the VM creation request a job would produce
    Plan {
        /// Inventory file describing datacenters, networks, datastores and clusters
        #[arg(long)]
        inventory: PathBuf,

        #[command(flatten)]
        intent: IntentArgs,
    },

    /// Create a VM on the configured vCenter
    Create {
        #[command(flatten)]
        intent: IntentArgs,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so command output stays machine-readable
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json().with_writer(std::io::stderr))
        .init();

    let config = config::VmkiteConfig::load(cli.config.as_deref())?;
    let logger = StructuredLogger::new(config.endpoint_label());
    let org = config
        .buildkite
        .as_ref()
        .map(|b| b.org.clone())
        .unwrap_or_default();
    logger.log_startup(VMKITE_VERSION, &org);

    match cli.command {
        Commands::Jobs => {
            let client = BuildkiteClient::new(config.buildkite()?)?;
            jobs::list_jobs(&client, &logger, cli.format).await?;
        }
        Commands::Status {
            pipeline,
            build,
            job,
        } => {
            let client = BuildkiteClient::new(config.buildkite()?)?;
            status::show_status(&client, &pipeline, &build, &job, cli.format).await?;
        }
        Commands::Plan { inventory, intent } => {
            let request = plan::PlanRequest { inventory, intent };
            info!(inventory = %request.inventory.display(), "Planning VM");
            plan::plan_vm(&config, request, &logger, cli.format).await?;
        }
        Commands::Create { intent } => {
            info!(endpoint = %config.endpoint_label(), "Creating VM");
            create::create_vm(&config, intent, &logger, cli.format).await?;
        }
    }

    logger.log_shutdown("completed", None);
    Ok(())
}
