//! Retrieval of generated images listed in an output manifest.
//!
//! Collection never aborts part-way: a bad or missing artifact is
//! recorded and the remaining ones are still fetched.

use base64::Engine as _;
use genjob_core::output::ResultArtifact;

use crate::api::ComfyUIApi;
use crate::history::OutputManifest;

/// Everything gathered from one manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Collection {
    /// Fetched images in manifest order.
    pub artifacts: Vec<ResultArtifact>,
    /// Images that were listed but could not be returned.
    pub errors: Vec<String>,
    /// Output kinds the worker does not return.
    pub unhandled: Vec<String>,
}

/// Fetch every non-temporary image in `manifest` and encode it as base64.
pub async fn collect_artifacts(api: &ComfyUIApi, manifest: &OutputManifest) -> Collection {
    let mut collection = Collection::default();
    tracing::info!(nodes = manifest.len(), "Processing output nodes");

    for (node_id, output) in manifest {
        if !output.images.is_empty() {
            tracing::debug!(node_id = %node_id, count = output.images.len(), "Node produced images");
        }

        for image in &output.images {
            if image.is_temp() {
                tracing::debug!(node_id = %node_id, filename = ?image.filename, "Skipping temp image");
                continue;
            }

            let Some(filename) = image.filename.as_deref().filter(|f| !f.is_empty()) else {
                let msg = format!("Skipping image in node {node_id} due to missing filename: {image:?}");
                tracing::warn!("{msg}");
                collection.errors.push(msg);
                continue;
            };

            match api.view_image(filename, image).await {
                Ok(bytes) => {
                    let data = base64::engine::general_purpose::STANDARD.encode(&bytes);
                    tracing::info!(filename = %filename, bytes = bytes.len(), "Encoded image as base64");
                    collection.artifacts.push(ResultArtifact::base64(filename, data));
                }
                Err(e) => {
                    tracing::error!(filename = %filename, error = %e, "Error fetching image data");
                    collection.errors.push(format!(
                        "Failed to fetch image data for {filename} from /view endpoint."
                    ));
                }
            }
        }

        if !output.other.is_empty() {
            let keys: Vec<&str> = output.other.keys().map(String::as_str).collect();
            let msg = format!("Node {node_id} produced unhandled output keys: {keys:?}.");
            tracing::warn!("{msg}");
            collection.unhandled.push(msg);
        }
    }

    collection
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{ImageReference, NodeOutput};

    fn api() -> ComfyUIApi {
        ComfyUIApi::new("http://127.0.0.1:9".into())
    }

    #[tokio::test]
    async fn empty_manifest_collects_nothing() {
        let collection = collect_artifacts(&api(), &OutputManifest::new()).await;
        assert_eq!(collection, Collection::default());
    }

    #[tokio::test]
    async fn temp_and_nameless_images_are_never_fetched() {
        let mut manifest = OutputManifest::new();
        manifest.insert(
            "7".into(),
            NodeOutput {
                images: vec![
                    ImageReference {
                        filename: Some("preview.png".into()),
                        subfolder: String::new(),
                        kind: Some("temp".into()),
                    },
                    ImageReference {
                        filename: None,
                        subfolder: String::new(),
                        kind: Some("output".into()),
                    },
                ],
                other: serde_json::Map::new(),
            },
        );

        let collection = collect_artifacts(&api(), &manifest).await;

        assert!(collection.artifacts.is_empty());
        assert_eq!(collection.errors.len(), 1);
        assert!(collection.errors[0].starts_with("Skipping image in node 7 due to missing filename"));
    }

    #[tokio::test]
    async fn failed_fetch_is_recorded_per_image() {
        let mut manifest = OutputManifest::new();
        manifest.insert(
            "9".into(),
            NodeOutput {
                images: vec![ImageReference {
                    filename: Some("out.png".into()),
                    subfolder: String::new(),
                    kind: Some("output".into()),
                }],
                other: serde_json::Map::new(),
            },
        );

        let collection = collect_artifacts(&api(), &manifest).await;

        assert_eq!(
            collection.errors,
            ["Failed to fetch image data for out.png from /view endpoint."]
        );
    }

    #[tokio::test]
    async fn extra_output_keys_are_reported() {
        let mut other = serde_json::Map::new();
        other.insert("gifs".into(), serde_json::json!([]));
        let mut manifest = OutputManifest::new();
        manifest.insert(
            "12".into(),
            NodeOutput {
                images: Vec::new(),
                other,
            },
        );

        let collection = collect_artifacts(&api(), &manifest).await;

        assert_eq!(
            collection.unhandled,
            [r#"Node 12 produced unhandled output keys: ["gifs"]."#]
        );
        assert!(collection.errors.is_empty());
    }
}
