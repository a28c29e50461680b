//! vmkite configuration

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use vmkite_lib::buildkite::BuildkiteConfig;
use vmkite_lib::vsphere::{ConnectionParams, SessionConfig, SoapConfig};
use vmkite_lib::VmTemplate;

const ENV_PREFIX: &str = "VMKITE";

/// vmkite configuration
#[derive(Debug, Clone, Deserialize)]
pub struct VmkiteConfig {
    /// Buildkite REST API access, needed by `jobs` and `status`
    #[serde(default)]
    pub buildkite: Option<BuildkiteConfig>,

    /// vCenter to create VMs on, needed by `create`
    #[serde(default)]
    pub vsphere: Option<VsphereSettings>,

    /// Deployment-wide VM settings, needed by `plan` and `create`
    #[serde(default)]
    pub vm: Option<VmTemplate>,

    /// Token the guest's Buildkite agent registers with
    #[serde(default)]
    pub buildkite_agent_token: String,
}

/// vCenter connection settings
#[derive(Clone, Deserialize)]
pub struct VsphereSettings {
    pub host: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub insecure: bool,
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Give up on a CreateVM task after this long
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,
}

impl std::fmt::Debug for VsphereSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VsphereSettings")
            .field("host", &self.host)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("insecure", &self.insecure)
            .field("keepalive_interval_secs", &self.keepalive_interval_secs)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("task_timeout_secs", &self.task_timeout_secs)
            .finish()
    }
}

fn default_keepalive_interval() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    60
}

fn default_task_timeout() -> u64 {
    600
}

impl VsphereSettings {
    pub fn connection_params(&self) -> ConnectionParams {
        ConnectionParams {
            host: self.host.clone(),
            user: self.user.clone(),
            password: self.password.clone(),
            insecure: self.insecure,
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            keepalive_interval: Duration::from_secs(self.keepalive_interval_secs),
        }
    }

    pub fn soap_config(&self) -> SoapConfig {
        SoapConfig {
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            task_timeout: Duration::from_secs(self.task_timeout_secs),
            ..SoapConfig::default()
        }
    }
}

impl VmkiteConfig {
    /// Load configuration from an optional file overlaid with `VMKITE_*`
    /// environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_env(path, None)
    }

    /// Load with an explicit environment instead of the process environment
    fn load_with_env(path: Option<&Path>, env: Option<HashMap<String, String>>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()
            .context("failed to read configuration")?;

        config
            .try_deserialize()
            .context("invalid configuration")
    }

    pub fn buildkite(&self) -> Result<BuildkiteConfig> {
        self.buildkite
            .clone()
            .context("missing [buildkite] configuration (org and api_token)")
    }

    pub fn vsphere(&self) -> Result<&VsphereSettings> {
        self.vsphere
            .as_ref()
            .context("missing [vsphere] configuration (host, user, password)")
    }

    pub fn vm_template(&self) -> Result<&VmTemplate> {
        self.vm
            .as_ref()
            .context(
                "missing [vm] configuration \
                 (cluster_path, datastore_name, network_label, src_disk_datastore)",
            )
    }

    /// Label identifying the vCenter in structured logs
    pub fn endpoint_label(&self) -> String {
        self.vsphere
            .as_ref()
            .map(|v| v.host.clone())
            .unwrap_or_else(|| "unconfigured".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn env(pairs: &[(&str, &str)]) -> Option<HashMap<String, String>> {
        Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_load_from_file() {
        let file = write_config(
            r#"
buildkite_agent_token = "agent-token"

[buildkite]
org = "acme"
api_token = "bk-token"

[vsphere]
host = "vcenter.example.com"
user = "vmkite@vsphere.local"
password = "hunter2"
insecure = true

[vm]
cluster_path = "macOS"
datastore_name = "vm-store"
network_label = "VM Network"
src_disk_datastore = "images"

[vm.guest_info]
region = "syd"
"#,
        );

        let config = VmkiteConfig::load_with_env(Some(file.path()), env(&[])).unwrap();

        let buildkite = config.buildkite().unwrap();
        assert_eq!(buildkite.org, "acme");
        assert_eq!(buildkite.endpoint, "https://api.buildkite.com/v2/");
        assert_eq!(buildkite.per_page, 100);
        assert_eq!(buildkite.max_pages, 10);

        let vsphere = config.vsphere.as_ref().unwrap();
        assert_eq!(vsphere.keepalive_interval_secs, 30);
        assert_eq!(
            vsphere.connection_params().sdk_url().unwrap().as_str(),
            "https://vcenter.example.com/sdk"
        );
        assert_eq!(
            vsphere.session_config().keepalive_interval,
            Duration::from_secs(30)
        );
        let soap = vsphere.soap_config();
        assert_eq!(soap.request_timeout, Duration::from_secs(60));
        assert_eq!(soap.task_timeout, Duration::from_secs(600));

        let vm = config.vm_template().unwrap();
        assert_eq!(vm.memory_mb, 4096);
        assert_eq!(vm.num_cpus, 2);
        assert_eq!(vm.guest_info.get("region").map(String::as_str), Some("syd"));
        assert_eq!(config.buildkite_agent_token, "agent-token");
    }

    #[test]
    fn test_environment_overrides_file() {
        let file = write_config(
            r#"
[buildkite]
org = "acme"
api_token = "bk-token"
"#,
        );

        let config = VmkiteConfig::load_with_env(
            Some(file.path()),
            env(&[
                ("VMKITE_BUILDKITE__ORG", "other-org"),
                ("VMKITE_BUILDKITE__PER_PAGE", "20"),
                ("VMKITE_BUILDKITE_AGENT_TOKEN", "from-env"),
            ]),
        )
        .unwrap();

        let buildkite = config.buildkite().unwrap();
        assert_eq!(buildkite.org, "other-org");
        assert_eq!(buildkite.api_token, "bk-token");
        assert_eq!(buildkite.per_page, 20);
        assert_eq!(config.buildkite_agent_token, "from-env");
    }

    #[test]
    fn test_missing_sections() {
        let config = VmkiteConfig::load_with_env(None, env(&[])).unwrap();

        assert!(config.buildkite().is_err());
        assert!(config.vm_template().is_err());
        let err = config.vsphere().unwrap_err().to_string();
        assert!(err.contains("[vsphere]"), "got {}", err);
        assert_eq!(config.endpoint_label(), "unconfigured");
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vmkite.toml");

        assert!(VmkiteConfig::load_with_env(Some(&path), env(&[])).is_err());
    }

    #[test]
    fn test_settings_debug_redacts_password() {
        let settings = VsphereSettings {
            host: "vcenter".to_string(),
            user: "vmkite".to_string(),
            password: "hunter2".to_string(),
            insecure: false,
            keepalive_interval_secs: 30,
            request_timeout_secs: 60,
            task_timeout_secs: 600,
        };
        assert!(!format!("{:?}", settings).contains("hunter2"));
    }
}
