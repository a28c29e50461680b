//! CLI command implementations

pub mod create;
pub mod jobs;
pub mod plan;
pub mod status;

use anyhow::{bail, Result};
use clap::Args;
use vmkite_lib::metadata::{self, GUEST_ID_KEY, VMDK_KEY};
use vmkite_lib::ProvisioningIntent;

/// What to provision, shared by `plan` and `create`
#[derive(Args, Debug, Clone, Default)]
pub struct IntentArgs {
    /// Agent query rule (key=value); may be repeated
    #[arg(long = "rule", conflicts_with_all = ["vmdk", "guest_id"])]
    pub rules: Vec<String>,

    /// Source disk path on the source datastore
    #[arg(long)]
    pub vmdk: Option<String>,

    /// vSphere guest OS identifier
    #[arg(long)]
    pub guest_id: Option<String>,

    /// VM name
    #[arg(long)]
    pub name: Option<String>,
}

impl IntentArgs {
    /// Agent query rules take precedence over the explicit flags
    pub fn intent(&self) -> ProvisioningIntent {
        if self.rules.is_empty() {
            ProvisioningIntent {
                disk_image: self.vmdk.clone().unwrap_or_default(),
                guest_identity: self.guest_id.clone().unwrap_or_default(),
            }
        } else {
            metadata::decode(self.rules.as_slice())
        }
    }

    /// The intent, or an error naming both keys when it is incomplete
    pub fn complete_intent(&self) -> Result<ProvisioningIntent> {
        let intent = self.intent();
        if !intent.is_complete() {
            bail!(
                "no VM requested: both {} and {} must be set",
                VMDK_KEY,
                GUEST_ID_KEY
            );
        }
        Ok(intent)
    }
}
