//! HTTP client for the ComfyUI REST endpoints.
//!
//! Every call goes through [`ComfyUIApi::dispatch`] with an explicit
//! timeout sized to its latency class: seconds for metadata, tens of
//! seconds for image transfer.

use std::time::Duration;

use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use crate::history::ImageReference;
use crate::rejection::{checkpoints_from_object_info, describe_rejection};

/// `GET /` readiness probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// `POST /upload/image`.
pub const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Submission, history and queue management.
pub const METADATA_TIMEOUT: Duration = Duration::from_secs(30);

/// `GET /object_info` introspection.
pub const OBJECT_INFO_TIMEOUT: Duration = Duration::from_secs(10);

/// `GET /view` image download.
pub const VIEW_TIMEOUT: Duration = Duration::from_secs(60);

/// REST client bound to one ComfyUI server.
#[derive(Debug, Clone)]
pub struct ComfyUIApi {
    http: reqwest::Client,
    base_url: String,
}

/// A queued prompt and the client ID its events are addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionHandle {
    pub prompt_id: String,
    pub client_id: String,
}

/// Errors from the REST layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// Network failure, timeout, or an unreadable body.
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// A non-2xx answer other than a workflow rejection.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError { status: u16, body: String },

    /// `POST /prompt` answered `400`; carries the rendered diagnostics.
    #[error("{0}")]
    Rejected(String),

    /// A 2xx answer without the expected fields.
    #[error("Unexpected response from ComfyUI: {0}")]
    MalformedResponse(String),
}

impl ComfyUIApi {
    /// * `base_url` - e.g. `http://host:8188`, without a trailing slash.
    pub fn new(base_url: String) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    /// Share an existing connection pool.
    pub fn with_client(http: reqwest::Client, base_url: String) -> Self {
        Self { http, base_url }
    }

    pub fn api_url(&self) -> &str {
        &self.base_url
    }

    /// Status code of a single `GET /`.
    pub async fn probe(&self) -> Result<StatusCode, ComfyUIApiError> {
        let response = self
            .dispatch(self.http.get(self.endpoint("/")), PROBE_TIMEOUT)
            .await?;
        Ok(response.status())
    }

    /// Store an input image under `name`, replacing any earlier upload.
    pub async fn upload_image(&self, name: &str, bytes: Vec<u8>) -> Result<(), ComfyUIApiError> {
        let image = reqwest::multipart::Part::bytes(bytes)
            .file_name(name.to_string())
            .mime_str("image/png")?;
        let form = reqwest::multipart::Form::new()
            .part("image", image)
            .text("overwrite", "true");

        let request = self.http.post(self.endpoint("/upload/image")).multipart(form);
        expect_success(self.dispatch(request, UPLOAD_TIMEOUT).await?).await?;
        Ok(())
    }

    /// Queue `workflow` under `client_id`.
    ///
    /// A `400` becomes [`ComfyUIApiError::Rejected`] with per-node
    /// diagnostics. When the failure points at a missing model, the
    /// installed checkpoints are looked up and appended.
    pub async fn submit_workflow(
        &self,
        workflow: &Value,
        client_id: &str,
    ) -> Result<SubmissionHandle, ComfyUIApiError> {
        let request = self
            .http
            .post(self.endpoint("/prompt"))
            .json(&json!({ "prompt": workflow, "client_id": client_id }));
        let response = self.dispatch(request, METADATA_TIMEOUT).await?;

        if response.status() == StatusCode::BAD_REQUEST {
            let body = response.text().await?;
            tracing::warn!(body = %body, "ComfyUI rejected the workflow");
            return Err(ComfyUIApiError::Rejected(self.explain_rejection(&body).await));
        }

        let queued: Value = read_json(response).await?;
        match queued.get("prompt_id").and_then(Value::as_str) {
            Some(prompt_id) if !prompt_id.is_empty() => Ok(SubmissionHandle {
                prompt_id: prompt_id.to_string(),
                client_id: client_id.to_string(),
            }),
            _ => Err(ComfyUIApiError::MalformedResponse(format!(
                "Missing 'prompt_id' in queue response: {queued}"
            ))),
        }
    }

    /// Checkpoint file names offered by `CheckpointLoaderSimple`.
    pub async fn available_checkpoints(&self) -> Result<Vec<String>, ComfyUIApiError> {
        let request = self.http.get(self.endpoint("/object_info"));
        let info: Value = read_json(self.dispatch(request, OBJECT_INFO_TIMEOUT).await?).await?;
        Ok(checkpoints_from_object_info(&info))
    }

    /// Remove a pending prompt from the queue.
    pub async fn cancel_execution(&self, prompt_id: &str) -> Result<(), ComfyUIApiError> {
        let request = self
            .http
            .post(self.endpoint("/queue"))
            .json(&json!({ "delete": [prompt_id] }));
        expect_success(self.dispatch(request, METADATA_TIMEOUT).await?).await?;
        Ok(())
    }

    /// Stop whatever the engine is executing right now.
    pub async fn interrupt(&self) -> Result<(), ComfyUIApiError> {
        let request = self.http.post(self.endpoint("/interrupt"));
        expect_success(self.dispatch(request, METADATA_TIMEOUT).await?).await?;
        Ok(())
    }

    /// Raw `GET /history/{prompt_id}` document, keyed by prompt ID.
    pub async fn get_history(&self, prompt_id: &str) -> Result<Value, ComfyUIApiError> {
        let request = self.http.get(self.endpoint(&format!("/history/{prompt_id}")));
        read_json(self.dispatch(request, METADATA_TIMEOUT).await?).await
    }

    /// Bytes of a generated image, looked up by filename, subfolder and type.
    pub async fn view_image(
        &self,
        filename: &str,
        image: &ImageReference,
    ) -> Result<Vec<u8>, ComfyUIApiError> {
        let request = self.http.get(self.endpoint("/view")).query(&[
            ("filename", filename),
            ("subfolder", image.subfolder.as_str()),
            ("type", image.kind.as_deref().unwrap_or_default()),
        ]);
        let response = expect_success(self.dispatch(request, VIEW_TIMEOUT).await?).await?;
        Ok(response.bytes().await?.to_vec())
    }

    // ---- private helpers ----

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn dispatch(
        &self,
        request: RequestBuilder,
        timeout: Duration,
    ) -> Result<Response, ComfyUIApiError> {
        Ok(request.timeout(timeout).send().await?)
    }

    /// Render a `400` body, consulting `/object_info` only when a
    /// checkpoint listing would help.
    async fn explain_rejection(&self, body: &str) -> String {
        let rejection = describe_rejection(body);
        if rejection.model_hint.is_none() {
            return rejection.render(None);
        }

        match self.available_checkpoints().await {
            Ok(checkpoints) => rejection.render(Some(checkpoints.as_slice())),
            Err(e) => {
                tracing::warn!(error = %e, "Could not fetch available models");
                rejection.render(None)
            }
        }
    }
}

/// Turn a non-2xx response into [`ComfyUIApiError::ApiError`].
async fn expect_success(response: Response) -> Result<Response, ComfyUIApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<unreadable body>".to_string());
    Err(ComfyUIApiError::ApiError {
        status: status.as_u16(),
        body,
    })
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, ComfyUIApiError> {
    Ok(expect_success(response).await?.json::<T>().await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_join_base_url() {
        let api = ComfyUIApi::new("http://127.0.0.1:8188".into());
        assert_eq!(api.endpoint("/"), "http://127.0.0.1:8188/");
        assert_eq!(api.endpoint("/history/p1"), "http://127.0.0.1:8188/history/p1");
        assert_eq!(api.api_url(), "http://127.0.0.1:8188");
    }

    #[tokio::test]
    async fn unreachable_server_is_request_error() {
        let api = ComfyUIApi::new("http://127.0.0.1:9".into());
        assert!(matches!(api.probe().await, Err(ComfyUIApiError::Request(_))));
        assert!(matches!(
            api.get_history("p1").await,
            Err(ComfyUIApiError::Request(_))
        ));
    }
}
