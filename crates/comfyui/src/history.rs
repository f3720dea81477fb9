//! Output manifest types read from `GET /history/{prompt_id}`.
//!
//! The history document is keyed by prompt ID:
//!
//! ```json
//! {"<prompt_id>": {"outputs": {"9": {"images": [{"filename": "a.png", "subfolder": "", "type": "output"}]}}}}
//! ```

use std::collections::BTreeMap;

use serde::Deserialize;

/// Image type marking a transient preview that must not be returned.
pub const IMAGE_TYPE_TEMP: &str = "temp";

/// Per-node outputs of a finished prompt, ordered by node ID.
pub type OutputManifest = BTreeMap<String, NodeOutput>;

/// Outputs produced by one node.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeOutput {
    /// Images written by the node.
    #[serde(default)]
    pub images: Vec<ImageReference>,
    /// Any other output keys (videos, text, flags...), kept as-is.
    #[serde(flatten)]
    pub other: serde_json::Map<String, serde_json::Value>,
}

/// Location of one generated image on the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ImageReference {
    pub filename: Option<String>,
    #[serde(default)]
    pub subfolder: String,
    /// `output`, `input` or `temp`.
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

impl ImageReference {
    /// `true` for previews the engine discards after the run.
    pub fn is_temp(&self) -> bool {
        self.kind.as_deref() == Some(IMAGE_TYPE_TEMP)
    }
}

#[derive(Debug, Deserialize)]
struct PromptHistory {
    #[serde(default)]
    outputs: OutputManifest,
}

/// Errors raised while reading a history document.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    /// The entry for the prompt did not have the expected shape.
    #[error("Malformed history entry for prompt {prompt_id}: {source}")]
    Malformed {
        prompt_id: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Pull the output manifest for `prompt_id` out of a history document.
///
/// Returns `Ok(None)` when the prompt is not in the document at all,
/// which is distinct from an entry with no outputs (an empty manifest).
pub fn extract_manifest(
    history: &serde_json::Value,
    prompt_id: &str,
) -> Result<Option<OutputManifest>, HistoryError> {
    let Some(entry) = history.get(prompt_id) else {
        return Ok(None);
    };

    let parsed = PromptHistory::deserialize(entry).map_err(|source| HistoryError::Malformed {
        prompt_id: prompt_id.to_string(),
        source,
    })?;

    Ok(Some(parsed.outputs))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn missing_prompt_is_none() {
        let history = json!({"other": {"outputs": {}}});
        assert!(extract_manifest(&history, "p1").unwrap().is_none());
        assert!(extract_manifest(&json!({}), "p1").unwrap().is_none());
    }

    #[test]
    fn entry_without_outputs_is_empty_manifest() {
        let history = json!({"p1": {"status": {"completed": true}}});
        let manifest = extract_manifest(&history, "p1").unwrap().unwrap();
        assert!(manifest.is_empty());
    }

    #[test]
    fn images_and_other_keys_are_separated() {
        let history = json!({"p1": {"outputs": {
            "9": {
                "images": [
                    {"filename": "out.png", "subfolder": "run", "type": "output"},
                    {"filename": "prev.png", "subfolder": "", "type": "temp"}
                ],
                "animated": [false]
            },
            "12": {"text": ["hello"]}
        }}});

        let manifest = extract_manifest(&history, "p1").unwrap().unwrap();
        assert_eq!(manifest.len(), 2);

        let node = &manifest["9"];
        assert_eq!(node.images.len(), 2);
        assert_eq!(node.images[0].filename.as_deref(), Some("out.png"));
        assert_eq!(node.images[0].subfolder, "run");
        assert!(!node.images[0].is_temp());
        assert!(node.images[1].is_temp());
        assert_eq!(node.other.keys().collect::<Vec<_>>(), ["animated"]);

        let text_node = &manifest["12"];
        assert!(text_node.images.is_empty());
        assert!(text_node.other.contains_key("text"));
    }

    #[test]
    fn image_without_filename_still_parses() {
        let history = json!({"p1": {"outputs": {"3": {"images": [{"type": "output"}]}}}});
        let manifest = extract_manifest(&history, "p1").unwrap().unwrap();
        assert!(manifest["3"].images[0].filename.is_none());
        assert_eq!(manifest["3"].images[0].subfolder, "");
    }

    #[test]
    fn malformed_images_list_is_an_error() {
        let history = json!({"p1": {"outputs": {"3": {"images": "nope"}}}});
        assert!(matches!(
            extract_manifest(&history, "p1"),
            Err(HistoryError::Malformed { .. })
        ));
    }
}
