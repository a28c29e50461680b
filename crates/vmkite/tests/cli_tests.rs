//! CLI integration tests

use std::io::Write;
use std::process::{Command, Output};
use tempfile::{Builder, NamedTempFile};

fn vmkite(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_vmkite"))
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .expect("Failed to execute command")
}

fn toml_file(contents: &str) -> NamedTempFile {
    let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

fn config_file() -> NamedTempFile {
    toml_file(
        r#"
buildkite_agent_token = "agent-token"

[vm]
cluster_path = "macOS"
datastore_name = "vm-store"
network_label = "VM Network"
src_disk_datastore = "images"
memory_mb = 8192
"#,
    )
}

fn inventory_file() -> NamedTempFile {
    toml_file(
        r#"
user = "vmkite"
password = "secret"

[[datacenters]]
name = "dc1"
networks = ["VM Network"]
datastores = ["images", "vm-store"]
clusters = ["macOS"]
folders = ["ci"]
"#,
    )
}

/// Test that the CLI shows help
#[test]
fn test_cli_help() {
    let output = vmkite(&["--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI help should succeed");
    assert!(stdout.contains("macOS build-agent VMs"), "Should show about");
    assert!(stdout.contains("jobs"), "Should show jobs command");
    assert!(stdout.contains("status"), "Should show status command");
    assert!(stdout.contains("plan"), "Should show plan command");
    assert!(stdout.contains("create"), "Should show create command");
}

/// Test that the CLI shows version
#[test]
fn test_cli_version() {
    let output = vmkite(&["--version"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI version should succeed");
    assert!(stdout.contains("vmkite"), "Should show binary name");
}

/// Test status command help
#[test]
fn test_status_help() {
    let output = vmkite(&["status", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Status help should succeed");
    assert!(stdout.contains("--pipeline"), "Should show pipeline option");
    assert!(stdout.contains("--build"), "Should show build option");
    assert!(stdout.contains("--job"), "Should show job option");
}

/// Test plan command help
#[test]
fn test_plan_help() {
    let output = vmkite(&["plan", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Plan help should succeed");
    assert!(stdout.contains("--inventory"), "Should show inventory option");
    assert!(stdout.contains("--rule"), "Should show rule option");
    assert!(stdout.contains("--guest-id"), "Should show guest-id option");
}

/// Test create command help
#[test]
fn test_create_help() {
    let output = vmkite(&["create", "--help"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "Create help should succeed");
    assert!(stdout.contains("--rule"), "Should show rule option");
    assert!(stdout.contains("--vmdk"), "Should show vmdk option");
    assert!(!stdout.contains("--inventory"), "Should not take an inventory");
}

/// Test that jobs needs Buildkite credentials
#[test]
fn test_jobs_without_buildkite_config() {
    let config = config_file();
    let output = vmkite(&["--config", config.path().to_str().unwrap(), "jobs"]);
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(!output.status.success(), "Jobs should fail without credentials");
    assert!(stderr.contains("[buildkite]"), "Should name the missing section");
}

/// Test a JSON plan built from agent query rules
#[test]
fn test_plan_from_rules() {
    let config = config_file();
    let inventory = inventory_file();
    let output = vmkite(&[
        "--config",
        config.path().to_str().unwrap(),
        "--format",
        "json",
        "plan",
        "--inventory",
        inventory.path().to_str().unwrap(),
        "--rule",
        "vmkite-vmdk=/vol/base.vmdk",
        "--rule",
        "vmkite-guestid=darwin19_64Guest",
        "--name",
        "vmkite-test",
    ]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(
        output.status.success(),
        "Plan should succeed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let plan: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(plan["path"], "/dc1/vm/vmkite-test");
    assert_eq!(plan["resource_pool"], "/dc1/host/macOS/Resources");

    let spec = &plan["spec"];
    assert_eq!(spec["guest_id"], "darwin19_64Guest");
    assert_eq!(spec["memory_mb"], 8192);
    assert_eq!(spec["nested_hv_enabled"], true);
    assert_eq!(spec["device_change"].as_array().unwrap().len(), 4);

    let extra_config = spec["extra_config"].as_array().unwrap();
    assert_eq!(extra_config.len(), 4);
    assert_eq!(extra_config[0]["value"], "*******oken");
    assert_eq!(extra_config[2]["value"], "/vol/base.vmdk");
}

/// Test that an incomplete intent is rejected
#[test]
fn test_plan_requires_both_rules() {
    let config = config_file();
    let inventory = inventory_file();
    let output = vmkite(&[
        "--config",
        config.path().to_str().unwrap(),
        "plan",
        "--inventory",
        inventory.path().to_str().unwrap(),
        "--vmdk",
        "/vol/base.vmdk",
    ]);
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(!output.status.success(), "Plan should fail");
    assert!(stderr.contains("vmkite-guestid"), "Should name the missing rule");
}

/// Test that lookup failures surface
#[test]
fn test_plan_missing_cluster() {
    let config = toml_file(
        r#"
[vm]
cluster_path = "linux"
datastore_name = "vm-store"
network_label = "VM Network"
src_disk_datastore = "images"
"#,
    );
    let inventory = inventory_file();
    let output = vmkite(&[
        "--config",
        config.path().to_str().unwrap(),
        "plan",
        "--inventory",
        inventory.path().to_str().unwrap(),
        "--vmdk",
        "/vol/base.vmdk",
        "--guest-id",
        "darwin19_64Guest",
    ]);
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(!output.status.success(), "Plan should fail");
    assert!(
        stderr.contains("cluster 'linux' not found"),
        "Should report the missing cluster"
    );
}

/// Test that create needs a vCenter
#[test]
fn test_create_without_vsphere_config() {
    let config = config_file();
    let output = vmkite(&[
        "--config",
        config.path().to_str().unwrap(),
        "create",
        "--vmdk",
        "/vol/base.vmdk",
        "--guest-id",
        "darwin19_64Guest",
    ]);
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(!output.status.success(), "Create should fail");
    assert!(stderr.contains("[vsphere]"), "Should name the missing section");
}

/// Test that an unreachable vCenter fails at connect
#[test]
fn test_create_unreachable_vcenter() {
    let config = toml_file(
        r#"
[vsphere]
host = "http://127.0.0.1:1"
user = "vmkite"
password = "secret"

[vm]
cluster_path = "macOS"
datastore_name = "vm-store"
network_label = "VM Network"
src_disk_datastore = "images"
"#,
    );
    let output = vmkite(&[
        "--config",
        config.path().to_str().unwrap(),
        "create",
        "--rule",
        "vmkite-vmdk=/vol/base.vmdk",
        "--rule",
        "vmkite-guestid=darwin19_64Guest",
    ]);
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(!output.status.success(), "Create should fail");
    assert!(
        stderr.contains("failed to connect to http://127.0.0.1:1/sdk"),
        "Should report the connect failure: {}",
        stderr
    );
}

/// Test job status against a stand-in Buildkite API
#[test]
fn test_status_reports_job_state() {
    let mut server = mockito::Server::new();
    let mock = server
        .mock("GET", "/organizations/acme/pipelines/macos-app/builds/42")
        .match_header("authorization", "Bearer bk-token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{"number":42,"state":"failed","pipeline":{"slug":"macos-app"},
                "jobs":[{"id":"job-1","state":"failed"},{"id":"job-2","state":"running"}]}"#,
        )
        .create();

    let config = toml_file(&format!(
        r#"
[buildkite]
org = "acme"
api_token = "bk-token"
endpoint = "{}"
"#,
        server.url()
    ));
    let output = vmkite(&[
        "--config",
        config.path().to_str().unwrap(),
        "--format",
        "json",
        "status",
        "--pipeline",
        "macos-app",
        "--build",
        "42",
        "--job",
        "job-1",
    ]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(
        output.status.success(),
        "Status should succeed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    mock.assert();

    let status: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(status["finished"], true);
    assert_eq!(status["state"], "failed");
    assert_eq!(status["job_id"], "job-1");
}
