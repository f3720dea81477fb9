use genjob_comfyui::api::ComfyUIApiError;
use genjob_comfyui::history::HistoryError;
use genjob_comfyui::monitor::MonitorError;
use genjob_core::job::ValidationError;
use genjob_core::output::JobOutput;

/// Everything that can end a job before results are assembled.
///
/// Converts into the caller-facing [`JobOutput`] failure shape via
/// `From`, so the handler can use `?` throughout and render once.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// The job payload was rejected before any engine call.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The readiness probe budget ran out.
    #[error("ComfyUI server ({host}) not reachable after multiple retries.")]
    EngineUnreachable { host: String },

    /// At least one input image could not be staged.
    #[error("Failed to upload one or more input images")]
    Upload(Vec<String>),

    /// Connecting, submitting or watching failed.
    #[error(transparent)]
    Monitor(#[from] MonitorError),

    /// The history request failed.
    #[error("HTTP communication error with ComfyUI: {0}")]
    History(#[source] ComfyUIApiError),

    /// The history entry could not be parsed.
    #[error(transparent)]
    HistoryMalformed(#[from] HistoryError),

    /// Execution finished but the engine has no record of the prompt.
    #[error("Prompt ID {prompt_id} not found in history after execution.")]
    PromptNotFound {
        prompt_id: String,
        /// Errors already recorded while watching.
        errors: Vec<String>,
    },
}

impl From<JobError> for JobOutput {
    fn from(err: JobError) -> Self {
        match err {
            JobError::Upload(details) => JobOutput::failure_with_details(
                "Failed to upload one or more input images",
                details,
            ),
            JobError::Monitor(monitor) => monitor_failure(monitor),
            JobError::PromptNotFound { prompt_id, errors } if !errors.is_empty() => {
                let mut details = errors;
                details.push(format!(
                    "Prompt ID {prompt_id} not found in history after execution."
                ));
                JobOutput::failure_with_details(
                    "Job processing failed, prompt ID not found in history.",
                    details,
                )
            }
            other => JobOutput::failure(other.to_string()),
        }
    }
}

/// Render a monitoring failure the way callers have always seen it.
fn monitor_failure(err: MonitorError) -> JobOutput {
    let message = match &err {
        MonitorError::Submit(ComfyUIApiError::Rejected(message)) => message.clone(),
        MonitorError::Submit(ComfyUIApiError::MalformedResponse(message)) => message.clone(),
        MonitorError::Submit(e) => format!("Error queuing workflow: {e}"),
        MonitorError::ChannelUnavailable(_)
        | MonitorError::ChannelLost { .. }
        | MonitorError::EngineUnreachable { .. } => {
            format!("WebSocket communication error: {err}")
        }
        MonitorError::Cancelled { .. } | MonitorError::ProtocolViolation(_) => err.to_string(),
    };
    JobOutput::failure(message)
}
