//! Job status CLI command

use anyhow::Result;
use serde::Serialize;
use vmkite_lib::buildkite::{is_job_finished, BuildkiteClient};

use crate::output::{color_status, print_info, print_json, print_success, OutputFormat};

#[derive(Serialize)]
struct JobStatus<'a> {
    pipeline: &'a str,
    build_number: &'a str,
    job_id: &'a str,
    state: Option<&'a str>,
    finished: bool,
}

/// Report whether a job has left the scheduled/running states
pub async fn show_status(
    client: &BuildkiteClient,
    pipeline: &str,
    build_number: &str,
    job_id: &str,
    format: OutputFormat,
) -> Result<()> {
    let build = client.build(pipeline, build_number).await?;
    let finished = is_job_finished(&build, job_id);
    let state = build
        .jobs
        .iter()
        .find(|job| job.id.as_deref() == Some(job_id))
        .and_then(|job| job.state.as_deref());

    match format {
        OutputFormat::Json => print_json(&JobStatus {
            pipeline,
            build_number,
            job_id,
            state,
            finished,
        })?,
        OutputFormat::Table => {
            let label = format!("{}/{} job {}", pipeline, build_number, job_id);
            match state {
                None if !finished => {
                    print_info(&format!("{} was not found in the build", label))
                }
                state => {
                    let state = color_status(state.unwrap_or("finished"));
                    if finished {
                        print_success(&format!("{} is {}", label, state));
                    } else {
                        print_info(&format!("{} is still {}", label, state));
                    }
                }
            }
        }
    }

    Ok(())
}
