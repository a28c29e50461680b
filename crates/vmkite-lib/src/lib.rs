//! Library for provisioning macOS build-agent VMs
//!
//! This crate provides the core functionality for:
//! - Decoding provisioning intent from Buildkite agent query rules
//! - Discovering pending jobs and checking whether they finished
//! - Keeping an authenticated vSphere session alive
//! - Building and submitting VM creation requests

pub mod buildkite;
pub mod metadata;
pub mod models;
pub mod observability;
pub mod vsphere;

pub use models::*;
pub use observability::StructuredLogger;
