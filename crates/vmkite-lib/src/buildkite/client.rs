//! Buildkite REST client for discovering jobs that need a VM

use crate::metadata;
use crate::models::Job;
use reqwest::header::{HeaderMap, LINK};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Build and job states that still need (or are using) an agent
pub const ACTIVE_STATES: [&str; 2] = ["scheduled", "running"];

/// Errors from the Buildkite API
#[derive(Debug, thiserror::Error)]
pub enum BuildkiteError {
    #[error("invalid Buildkite URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Buildkite request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Buildkite API error ({status}): {body}")]
    Api { status: u16, body: String },
}

/// Configuration for the Buildkite client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildkiteConfig {
    /// Organization slug
    pub org: String,
    /// REST API access token
    pub api_token: String,
    /// API base URL
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Page size for build listings
    #[serde(default = "default_per_page")]
    pub per_page: u32,
    /// Upper bound on build pages followed per listing
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
}

fn default_endpoint() -> String {
    "https://api.buildkite.com/v2/".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_per_page() -> u32 {
    100
}

fn default_max_pages() -> u32 {
    10
}

impl BuildkiteConfig {
    pub fn new(org: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            org: org.into(),
            api_token: api_token.into(),
            endpoint: default_endpoint(),
            request_timeout_secs: default_request_timeout_secs(),
            per_page: default_per_page(),
            max_pages: default_max_pages(),
        }
    }
}

// API response types, limited to the fields vmkite reads

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub number: u64,
    #[serde(default)]
    pub state: Option<String>,
    pub pipeline: Pipeline,
    #[serde(default)]
    pub jobs: Vec<BuildJob>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub slug: String,
}

/// A job within a build. Waiter and block steps come back without an id
/// or agent query rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildJob {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub agent_query_rules: Vec<String>,
}

/// Flatten builds into the jobs that carry complete provisioning intent,
/// preserving the order the API returned them in
pub fn pending_jobs_from_builds(builds: &[Build]) -> Vec<Job> {
    builds
        .iter()
        .flat_map(|build| {
            build.jobs.iter().filter_map(move |job| {
                let id = job.id.as_ref()?;
                let intent = metadata::decode(&job.agent_query_rules);
                if !intent.is_complete() {
                    return None;
                }
                Some(Job {
                    id: id.clone(),
                    build_number: build.number.to_string(),
                    pipeline: build.pipeline.slug.clone(),
                    intent,
                })
            })
        })
        .collect()
}

/// Whether `job_id` has left the active states in a freshly fetched build.
///
/// A job missing from the build is reported as not finished.
pub fn is_job_finished(build: &Build, job_id: &str) -> bool {
    match build
        .jobs
        .iter()
        .find(|job| job.id.as_deref() == Some(job_id))
    {
        Some(job) => !job
            .state
            .as_deref()
            .map(|state| ACTIVE_STATES.contains(&state))
            .unwrap_or(false),
        None => {
            debug!(job_id = %job_id, build = build.number, "Job not found in build");
            false
        }
    }
}

/// Buildkite API client scoped to one organization
pub struct BuildkiteClient {
    client: Client,
    base_url: Url,
    org: String,
    api_token: String,
    per_page: u32,
    max_pages: u32,
}

impl BuildkiteClient {
    /// Create a new client
    pub fn new(config: BuildkiteConfig) -> Result<Self, BuildkiteError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        // Url::join drops the last path segment unless the base ends in '/'
        let mut endpoint = config.endpoint;
        if !endpoint.ends_with('/') {
            endpoint.push('/');
        }
        let base_url = Url::parse(&endpoint)?;

        Ok(Self {
            client,
            base_url,
            org: config.org,
            api_token: config.api_token,
            per_page: config.per_page,
            max_pages: config.max_pages,
        })
    }

    /// Organization slug
    pub fn org(&self) -> &str {
        &self.org
    }

    /// List jobs in scheduled or running builds that ask for a VM.
    ///
    /// Follows `Link: rel="next"` headers for up to `max_pages` pages.
    pub async fn pending_jobs(&self) -> Result<Vec<Job>, BuildkiteError> {
        debug!(org = %self.org, "Listing active builds");
        let mut url = self
            .base_url
            .join(&format!("organizations/{}/builds", self.org))?;
        url.query_pairs_mut()
            .append_pair("state[]", ACTIVE_STATES[0])
            .append_pair("state[]", ACTIVE_STATES[1])
            .append_pair("per_page", &self.per_page.to_string());

        let mut builds: Vec<Build> = Vec::new();
        let mut next = Some(url);
        let mut pages = 0;
        while let Some(url) = next.take() {
            if pages == self.max_pages {
                warn!(
                    org = %self.org,
                    pages = pages,
                    "Stopped following build pages at the page limit"
                );
                break;
            }
            let response = self.send(url).await?;
            next = next_page(response.headers())?;
            let page: Vec<Build> = response.json().await?;
            builds.extend(page);
            pages += 1;
        }

        let jobs = pending_jobs_from_builds(&builds);
        debug!(
            builds = builds.len(),
            pages = pages,
            jobs = jobs.len(),
            "Collected jobs with provisioning intent"
        );
        Ok(jobs)
    }

    /// Fetch a single build
    pub async fn build(&self, pipeline: &str, number: &str) -> Result<Build, BuildkiteError> {
        debug!(org = %self.org, pipeline = %pipeline, build = %number, "Fetching build");
        let path = format!(
            "organizations/{}/pipelines/{}/builds/{}",
            self.org, pipeline, number
        );
        self.get(&path).await
    }

    /// Check whether a job has left the scheduled/running states
    pub async fn is_finished(&self, job: &Job) -> Result<bool, BuildkiteError> {
        let build = self.build(&job.pipeline, &job.build_number).await?;
        Ok(is_job_finished(&build, &job.id))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, BuildkiteError> {
        let url = self.base_url.join(path)?;
        Ok(self.send(url).await?.json().await?)
    }

    async fn send(&self, url: Url) -> Result<Response, BuildkiteError> {
        let response = self
            .client
            .get(url)
            .bearer_auth(&self.api_token)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(BuildkiteError::Api { status, body });
        }

        Ok(response)
    }
}

/// URL of the next page from a `Link` header, if any
fn next_page(headers: &HeaderMap) -> Result<Option<Url>, BuildkiteError> {
    let link = match headers.get(LINK).and_then(|v| v.to_str().ok()) {
        Some(link) => link,
        None => return Ok(None),
    };
    match next_link(link) {
        Some(next) => Ok(Some(Url::parse(next)?)),
        None => Ok(None),
    }
}

/// Target of the `rel="next"` entry of a `Link` header value
pub(super) fn next_link(header: &str) -> Option<&str> {
    header.split(',').find_map(|entry| {
        let mut parts = entry.split(';');
        let target = parts.next()?.trim();
        let is_next = parts.any(|param| {
            let param = param.trim();
            param == "rel=\"next\"" || param == "rel=next"
        });
        if !is_next {
            return None;
        }
        target.strip_prefix('<')?.strip_suffix('>')
    })
}
