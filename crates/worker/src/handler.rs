//! Runs one job end to end against the configured ComfyUI server.
//!
//! validate -> wait for the server -> upload inputs -> monitor execution
//! -> read history -> collect artifacts -> assemble the result.

use genjob_comfyui::api::ComfyUIApi;
use genjob_comfyui::client::ComfyUIClient;
use genjob_comfyui::collector::collect_artifacts;
use genjob_comfyui::history::extract_manifest;
use genjob_comfyui::monitor::ExecutionMonitor;
use genjob_comfyui::readiness::wait_until_ready;
use genjob_comfyui::upload::upload_images;
use genjob_core::job::validate_input;
use genjob_core::output::{assemble, JobOutput};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::JobError;

/// A job document as handed over by the dispatch host.
#[derive(Debug, Clone, Deserialize)]
pub struct JobRequest {
    #[serde(default)]
    pub id: Option<String>,
    /// Raw job input, validated by [`handle_job`].
    #[serde(default)]
    pub input: serde_json::Value,
}

/// Run one job and always produce a caller-facing result.
pub async fn handle_job(
    config: &WorkerConfig,
    input: &serde_json::Value,
    cancel: &CancellationToken,
) -> JobOutput {
    match run_job(config, input, cancel).await {
        Ok(output) => output,
        Err(e) => {
            tracing::error!(error = %e, "Job failed");
            e.into()
        }
    }
}

async fn run_job(
    config: &WorkerConfig,
    input: &serde_json::Value,
    cancel: &CancellationToken,
) -> Result<JobOutput, JobError> {
    let job = validate_input(input)?;

    let client = ComfyUIClient::from_host(&config.comfy_host);
    let api = ComfyUIApi::new(client.api_url().to_string());

    wait_until_ready(&api, &config.probe)
        .await
        .map_err(|_| JobError::EngineUnreachable {
            host: config.comfy_host.clone(),
        })?;

    if !job.images.is_empty() {
        let report = upload_images(&api, &job.images).await;
        if !report.is_success() {
            return Err(JobError::Upload(report.failures));
        }
    }

    let report = ExecutionMonitor::new(&client, &api, &config.monitor)
        .run(&job.workflow, cancel)
        .await?;
    let prompt_id = report.handle.prompt_id;
    let mut errors = report.errors;

    tracing::info!(prompt_id = %prompt_id, "Fetching history");
    let history = api.get_history(&prompt_id).await.map_err(JobError::History)?;
    let Some(manifest) = extract_manifest(&history, &prompt_id)? else {
        return Err(JobError::PromptNotFound { prompt_id, errors });
    };

    let mut warnings = Vec::new();
    if manifest.is_empty() {
        let msg = format!("No outputs found in history for prompt {prompt_id}.");
        tracing::warn!("{msg}");
        warnings.push(msg);
    }

    let collection = collect_artifacts(&api, &manifest).await;
    errors.extend(collection.errors);
    warnings.extend(collection.unhandled);

    let output = assemble(collection.artifacts, errors, warnings, config.refresh_worker);
    match &output {
        JobOutput::Completed(done) => {
            tracing::info!(prompt_id = %prompt_id, images = done.images.len(), "Job completed");
        }
        JobOutput::Failed(failed) => {
            tracing::warn!(prompt_id = %prompt_id, details = ?failed.details, "Job completed with errors");
        }
    }
    Ok(output)
}
