//! Provisioning intent carried in Buildkite agent query rules
//!
//! A job asks for a VM by adding rules such as `vmkite-vmdk=/images/macos.vmdk`
//! and `vmkite-guestid=darwin19_64Guest` to its agent query rules. Anything
//! that does not look like one of those rules is ignored, so other consumers
//! of the same rules keep working.

use crate::models::ProvisioningIntent;

/// Rule key for the source disk image path
pub const VMDK_KEY: &str = "vmkite-vmdk";

/// Rule key for the vSphere guest identifier
pub const GUEST_ID_KEY: &str = "vmkite-guestid";

/// Decode provisioning intent from agent query rules.
///
/// Only the first `=` splits key from value. When a key repeats, the last
/// occurrence wins.
pub fn decode<S: AsRef<str>>(rules: &[S]) -> ProvisioningIntent {
    let mut intent = ProvisioningIntent::default();

    for rule in rules {
        let Some((key, value)) = rule.as_ref().split_once('=') else {
            continue;
        };
        match key {
            VMDK_KEY => intent.disk_image = value.to_string(),
            GUEST_ID_KEY => intent.guest_identity = value.to_string(),
            _ => {}
        }
    }

    intent
}
