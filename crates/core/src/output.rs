//! Caller-facing job results.
//!
//! [`JobOutput`] serializes to the JSON shape the dispatch host expects.
//! [`assemble`] decides between success, success-without-images and
//! failure once the engine work is done.

use serde::{Deserialize, Serialize};

/// Encoding tag written on every returned artifact.
pub const ARTIFACT_ENCODING_BASE64: &str = "base64";

/// Top-level error string used when a run ends with no artifacts but
/// recorded errors.
pub const MSG_JOB_FAILED: &str = "Job processing failed";

/// One produced image, inline as base64.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultArtifact {
    pub filename: String,
    /// Always [`ARTIFACT_ENCODING_BASE64`].
    #[serde(rename = "type")]
    pub encoding: String,
    pub data: String,
}

impl ResultArtifact {
    /// Wrap already-encoded base64 data.
    pub fn base64(filename: impl Into<String>, data: String) -> Self {
        Self {
            filename: filename.into(),
            encoding: ARTIFACT_ENCODING_BASE64.to_string(),
            data,
        }
    }
}

/// Status string of a completed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Success,
    SuccessNoImages,
}

/// A job that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedOutput {
    pub status: CompletionStatus,
    /// Base64 data of the first artifact, kept for older callers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Every artifact the run produced.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ResultArtifact>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub refresh_worker: bool,
}

/// A job that failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedOutput {
    pub error: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
}

/// The value returned to the dispatch host for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JobOutput {
    Completed(CompletedOutput),
    Failed(FailedOutput),
}

impl JobOutput {
    /// Build a failure with no detail lines.
    pub fn failure(error: impl Into<String>) -> Self {
        Self::failure_with_details(error, Vec::new())
    }

    /// Build a failure carrying per-item detail lines.
    pub fn failure_with_details(error: impl Into<String>, details: Vec<String>) -> Self {
        Self::Failed(FailedOutput {
            error: error.into(),
            details,
        })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

/// Combine artifacts and accumulated messages into the final output.
///
/// * `errors`   - problems recorded during the run (execution errors,
///   failed fetches, missing filenames).
/// * `warnings` - informational notices that never fail a job on their
///   own (e.g. unhandled node output keys).
///
/// With at least one artifact the job succeeds and both lists are
/// attached as warnings. With none, recorded errors fail the job;
/// otherwise it is a successful run that produced no images.
pub fn assemble(
    artifacts: Vec<ResultArtifact>,
    errors: Vec<String>,
    warnings: Vec<String>,
    refresh_worker: bool,
) -> JobOutput {
    if let Some(first) = artifacts.first() {
        let message = Some(first.data.clone());
        let mut all_warnings = errors;
        all_warnings.extend(warnings);
        return JobOutput::Completed(CompletedOutput {
            status: CompletionStatus::Success,
            message,
            images: artifacts,
            warnings: all_warnings,
            refresh_worker,
        });
    }

    if !errors.is_empty() {
        return JobOutput::failure_with_details(MSG_JOB_FAILED, errors);
    }

    JobOutput::Completed(CompletedOutput {
        status: CompletionStatus::SuccessNoImages,
        message: None,
        images: Vec::new(),
        warnings,
        refresh_worker,
    })
}
