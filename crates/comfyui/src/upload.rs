//! Staging of job input images on the engine.
//!
//! Every image is attempted even after an earlier one fails, so the
//! caller receives the complete list of problems in one report.

use genjob_core::job::ImagePayload;

use crate::api::{ComfyUIApi, ComfyUIApiError};

/// Outcome of uploading a batch of input images.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    /// Names that were stored successfully, in input order.
    pub uploaded: Vec<String>,
    /// One message per image that could not be stored.
    pub failures: Vec<String>,
}

impl UploadReport {
    /// `true` when every image was stored.
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Upload `images` one at a time, collecting per-image failures.
pub async fn upload_images(api: &ComfyUIApi, images: &[ImagePayload]) -> UploadReport {
    let mut report = UploadReport::default();
    if images.is_empty() {
        tracing::debug!("No input images to upload");
        return report;
    }

    tracing::info!(count = images.len(), "Uploading input images");

    for payload in images {
        let bytes = match payload.decode() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(name = %payload.name, error = %e, "Failed to decode input image");
                report
                    .failures
                    .push(format!("Error decoding base64 for {}: {e}", payload.name));
                continue;
            }
        };

        match api.upload_image(&payload.name, bytes).await {
            Ok(()) => {
                tracing::info!(name = %payload.name, "Uploaded input image");
                report.uploaded.push(payload.name.clone());
            }
            Err(ComfyUIApiError::Request(e)) if e.is_timeout() => {
                tracing::error!(name = %payload.name, "Timed out uploading input image");
                report.failures.push(format!("Timeout uploading {}", payload.name));
            }
            Err(e) => {
                tracing::error!(name = %payload.name, error = %e, "Failed to upload input image");
                report
                    .failures
                    .push(format!("Error uploading {}: {e}", payload.name));
            }
        }
    }

    if report.is_success() {
        tracing::info!(count = report.uploaded.len(), "Input image upload complete");
    } else {
        tracing::warn!(
            uploaded = report.uploaded.len(),
            failed = report.failures.len(),
            "Input image upload finished with errors",
        );
    }

    report
}
