//! Job source backed by the Buildkite REST API
//!
//! This module provides:
//! - Listing scheduled and running jobs that carry provisioning intent
//! - Checking whether a previously seen job has finished

mod client;


pub use client::{
    is_job_finished, pending_jobs_from_builds, Build, BuildJob, BuildkiteClient, BuildkiteConfig,
    BuildkiteError, Pipeline, ACTIVE_STATES,
};
