//! Parsing of ComfyUI workflow-validation failures.
//!
//! When `POST /prompt` answers `400`, the body describes why the graph
//! was refused:
//!
//! ```json
//! {
//!   "error": {"type": "prompt_outputs_failed_validation", "message": "..."},
//!   "node_errors": {"5": {"value_not_in_list": "ckpt_name not in list"}}
//! }
//! ```
//!
//! Newer engines nest per-node failures as
//! `{"errors": [{"type", "message", "details"}], "class_type": ...}`;
//! both shapes are understood. The result is a single human-readable
//! message, optionally extended with the checkpoints the engine has
//! installed (see [`Rejection::render`]).

/// Error type marking a graph whose outputs failed validation.
pub const TYPE_OUTPUTS_FAILED_VALIDATION: &str = "prompt_outputs_failed_validation";

const DEFAULT_HEADLINE: &str = "Workflow validation failed";
const MODEL_HINT: &str = "This usually means a required model or parameter is not available.";
const NO_CHECKPOINTS: &str =
    "No checkpoint models appear to be available. Please check your model installation.";

/// Why the checkpoint list should be appended to a rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelHint {
    /// The engine flagged the graph as failing output validation.
    OutputsFailedValidation,
    /// A node complained that its `ckpt_name` is not in the allowed list.
    CheckpointNotInList,
}

/// A parsed `400` response from `POST /prompt`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Headline plus per-node details.
    pub message: String,
    /// Set when listing available checkpoints would help the caller.
    pub model_hint: Option<ModelHint>,
}

impl Rejection {
    /// Final message, extended with the available checkpoints when a
    /// hint applies. `None` means the list could not be fetched.
    pub fn render(&self, checkpoints: Option<&[String]>) -> String {
        let listing = match checkpoints {
            Some(names) if !names.is_empty() => {
                format!("Available checkpoint models: {}", names.join(", "))
            }
            _ => NO_CHECKPOINTS.to_string(),
        };

        match self.model_hint {
            None => self.message.clone(),
            Some(ModelHint::OutputsFailedValidation) => {
                format!("{}\n\n{MODEL_HINT}\n{listing}", self.message)
            }
            Some(ModelHint::CheckpointNotInList) => format!("{}\n\n{listing}", self.message),
        }
    }
}

/// Parse the body of a `400` response.
pub fn describe_rejection(body: &str) -> Rejection {
    let parsed = serde_json::from_str::<serde_json::Value>(body).ok();
    let Some(data) = parsed.as_ref().and_then(|v| v.as_object()) else {
        return Rejection {
            message: format!(
                "ComfyUI validation failed (could not parse error response): {body}"
            ),
            model_hint: None,
        };
    };

    let mut headline = match data.get("error") {
        Some(serde_json::Value::Object(info)) => {
            if info.get("type").and_then(|t| t.as_str()) == Some(TYPE_OUTPUTS_FAILED_VALIDATION) {
                DEFAULT_HEADLINE.to_string()
            } else {
                info.get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or(DEFAULT_HEADLINE)
                    .to_string()
            }
        }
        Some(serde_json::Value::String(text)) => text.clone(),
        Some(other) if !other.is_null() => other.to_string(),
        _ => DEFAULT_HEADLINE.to_string(),
    };

    let details = match data.get("node_errors") {
        Some(serde_json::Value::Object(nodes)) => nodes
            .iter()
            .flat_map(|(node_id, error)| node_error_lines(node_id, error))
            .collect(),
        _ => Vec::new(),
    };

    let outputs_failed =
        data.get("type").and_then(|t| t.as_str()) == Some(TYPE_OUTPUTS_FAILED_VALIDATION);
    if outputs_failed {
        headline = data
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or(DEFAULT_HEADLINE)
            .to_string();
    }

    let model_hint = if outputs_failed {
        Some(ModelHint::OutputsFailedValidation)
    } else if details
        .iter()
        .any(|d| d.contains("not in list") && d.contains("ckpt_name"))
    {
        Some(ModelHint::CheckpointNotInList)
    } else {
        None
    };

    let message = if !details.is_empty() {
        let bullets: Vec<String> = details.iter().map(|d| format!("• {d}")).collect();
        format!("{headline}:\n{}", bullets.join("\n"))
    } else if outputs_failed {
        headline
    } else {
        format!("{headline}. Raw response: {body}")
    };

    Rejection {
        message,
        model_hint,
    }
}

/// Render one `node_errors` entry as detail lines.
fn node_error_lines(node_id: &str, error: &serde_json::Value) -> Vec<String> {
    let Some(entries) = error.as_object() else {
        return vec![format!("Node {node_id}: {}", display_value(error))];
    };

    if let Some(serde_json::Value::Array(errors)) = entries.get("errors") {
        return errors
            .iter()
            .map(|e| {
                let kind = e.get("type").and_then(|v| v.as_str()).unwrap_or("error");
                let message = e.get("message").and_then(|v| v.as_str()).unwrap_or("");
                match e.get("details").and_then(|v| v.as_str()) {
                    Some(details) if !details.is_empty() => {
                        format!("Node {node_id} ({kind}): {message}: {details}")
                    }
                    _ => format!("Node {node_id} ({kind}): {message}"),
                }
            })
            .collect();
    }

    entries
        .iter()
        .map(|(kind, message)| format!("Node {node_id} ({kind}): {}", display_value(message)))
        .collect()
}

pub(crate) fn display_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Extract checkpoint names from an `/object_info` document.
///
/// Reads `CheckpointLoaderSimple.input.required.ckpt_name[0]`, which the
/// engine populates with the list of installed checkpoint files.
pub fn checkpoints_from_object_info(info: &serde_json::Value) -> Vec<String> {
    info.pointer("/CheckpointLoaderSimple/input/required/ckpt_name/0")
        .and_then(|v| v.as_array())
        .map(|names| {
            names
                .iter()
                .filter_map(|n| n.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}
