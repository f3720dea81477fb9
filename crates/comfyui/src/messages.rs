//! Events pushed by ComfyUI over the `/ws` channel.
//!
//! Every text frame has the shape `{"type": "<kind>", "data": {...}}`.
//! Only the kinds the execution monitor acts on or reports get their own
//! variant; everything else is kept as [`ComfyUIMessage::Other`] with its
//! kind so it can still be logged.

use serde::Deserialize;

use crate::rejection::display_value;

/// A decoded push event.
#[derive(Debug, Clone, PartialEq)]
pub enum ComfyUIMessage {
    /// Queue depth broadcast.
    Status { queue_remaining: Option<i32> },
    /// The engine picked up a prompt.
    ExecutionStart { prompt_id: String },
    /// A node began executing, or the prompt finished (`node == None`).
    Executing(ExecutingData),
    /// Step progress inside a long-running node.
    Progress { value: u64, max: u64 },
    /// A node failed.
    ExecutionError(ErrorData),
    /// Any well-formed event of another kind.
    Other(String),
}

impl ComfyUIMessage {
    /// `true` when this is the end-of-execution marker for `prompt_id`.
    pub fn is_terminal_for(&self, prompt_id: &str) -> bool {
        matches!(
            self,
            Self::Executing(data) if data.node.is_none() && data.prompt_id.as_deref() == Some(prompt_id)
        )
    }

    /// Wire name of the event kind.
    pub fn kind(&self) -> &str {
        match self {
            Self::Status { .. } => "status",
            Self::ExecutionStart { .. } => "execution_start",
            Self::Executing(_) => "executing",
            Self::Progress { .. } => "progress",
            Self::ExecutionError(_) => "execution_error",
            Self::Other(kind) => kind,
        }
    }
}

/// Payload of an `executing` event.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExecutingData {
    pub node: Option<String>,
    #[serde(default)]
    pub prompt_id: Option<String>,
}

/// Payload of an `execution_error` event.
///
/// Only `prompt_id` is required. The descriptive fields are kept as raw
/// JSON so an odd type (a numeric node ID, a `null` node type) never stops
/// the failure from being recognised.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ErrorData {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: Option<serde_json::Value>,
    #[serde(default)]
    pub node_type: Option<serde_json::Value>,
    #[serde(default)]
    pub exception_message: Option<serde_json::Value>,
    #[serde(default)]
    pub exception_type: Option<serde_json::Value>,
}

impl ErrorData {
    /// One-line description naming the failing node.
    pub fn describe(&self) -> String {
        format!(
            "Node Type: {}, Node ID: {}, Message: {}",
            field_text(&self.node_type),
            field_text(&self.node_id),
            field_text(&self.exception_message)
        )
    }
}

/// Strings verbatim, other JSON as written, absent or `null` as `unknown`.
fn field_text(value: &Option<serde_json::Value>) -> String {
    match value {
        None | Some(serde_json::Value::Null) => "unknown".to_string(),
        Some(value) => display_value(value),
    }
}

#[derive(Deserialize)]
struct Frame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Deserialize)]
struct StatusPayload {
    #[serde(default)]
    status: Option<QueueInfo>,
}

#[derive(Deserialize)]
struct QueueInfo {
    #[serde(default)]
    exec_info: Option<ExecInfo>,
}

#[derive(Deserialize)]
struct ExecInfo {
    queue_remaining: Option<i32>,
}

#[derive(Deserialize)]
struct PromptPayload {
    prompt_id: String,
}

#[derive(Deserialize)]
struct ProgressPayload {
    value: u64,
    max: u64,
}

/// Decode one text frame.
///
/// Fails on invalid JSON, a missing `type`, or a `data` payload that does
/// not fit a recognised kind. Unrecognised kinds are not errors.
pub fn parse_message(text: &str) -> Result<ComfyUIMessage, serde_json::Error> {
    let Frame { kind, data } = serde_json::from_str(text)?;

    Ok(match kind.as_str() {
        "status" => {
            let payload: StatusPayload = serde_json::from_value(data)?;
            ComfyUIMessage::Status {
                queue_remaining: payload
                    .status
                    .and_then(|s| s.exec_info)
                    .and_then(|e| e.queue_remaining),
            }
        }
        "execution_start" => {
            let PromptPayload { prompt_id } = serde_json::from_value(data)?;
            ComfyUIMessage::ExecutionStart { prompt_id }
        }
        "executing" => ComfyUIMessage::Executing(serde_json::from_value(data)?),
        "progress" => {
            let ProgressPayload { value, max } = serde_json::from_value(data)?;
            ComfyUIMessage::Progress { value, max }
        }
        "execution_error" => ComfyUIMessage::ExecutionError(serde_json::from_value(data)?),
        _ => ComfyUIMessage::Other(kind),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_decode_to_their_kind() {
        let frames = [
            (r#"{"type":"status","data":{"status":{"exec_info":{"queue_remaining":2}},"sid":"s"}}"#, "status"),
            (r#"{"type":"execution_start","data":{"prompt_id":"p1","timestamp":1}}"#, "execution_start"),
            (r#"{"type":"executing","data":{"node":"4","prompt_id":"p1"}}"#, "executing"),
            (r#"{"type":"progress","data":{"value":3,"max":20,"node":"3"}}"#, "progress"),
            (r#"{"type":"execution_cached","data":{"nodes":[],"prompt_id":"p1"}}"#, "execution_cached"),
            (r#"{"type":"crystools.monitor","data":{"cpu_utilization":3}}"#, "crystools.monitor"),
        ];

        for (frame, kind) in frames {
            let msg = parse_message(frame).unwrap_or_else(|e| panic!("{frame}: {e}"));
            assert_eq!(msg.kind(), kind, "{frame}");
        }
    }

    #[test]
    fn status_queue_depth_is_optional() {
        let full = parse_message(r#"{"type":"status","data":{"status":{"exec_info":{"queue_remaining":2}}}}"#);
        assert_eq!(full.unwrap(), ComfyUIMessage::Status { queue_remaining: Some(2) });

        let bare = parse_message(r#"{"type":"status","data":{}}"#);
        assert_eq!(bare.unwrap(), ComfyUIMessage::Status { queue_remaining: None });
    }

    #[test]
    fn terminal_marker_matches_only_its_prompt() {
        let done = parse_message(r#"{"type":"executing","data":{"node":null,"prompt_id":"p1"}}"#).unwrap();
        assert!(done.is_terminal_for("p1"));
        assert!(!done.is_terminal_for("p2"));

        let running = parse_message(r#"{"type":"executing","data":{"node":"9","prompt_id":"p1"}}"#).unwrap();
        assert!(!running.is_terminal_for("p1"));

        let anonymous = parse_message(r#"{"type":"executing","data":{"node":null}}"#).unwrap();
        assert!(!anonymous.is_terminal_for("p1"));
    }

    #[test]
    fn execution_error_describes_node() {
        let msg = parse_message(
            r#"{"type":"execution_error","data":{"prompt_id":"p1","node_id":"5","node_type":"KSampler","exception_message":"out of memory","exception_type":"RuntimeError","traceback":[]}}"#,
        )
        .unwrap();

        match msg {
            ComfyUIMessage::ExecutionError(data) => {
                assert_eq!(data.exception_type, Some(serde_json::json!("RuntimeError")));
                assert_eq!(data.describe(), "Node Type: KSampler, Node ID: 5, Message: out of memory");
            }
            other => panic!("Expected ExecutionError, got {other:?}"),
        }
    }

    #[test]
    fn execution_error_tolerates_loosely_typed_details() {
        let msg = parse_message(
            r#"{"type":"execution_error","data":{"prompt_id":"p1","node_id":5,"node_type":null,"exception_message":"oom"}}"#,
        )
        .unwrap();

        match msg {
            ComfyUIMessage::ExecutionError(data) => {
                assert_eq!(data.prompt_id, "p1");
                assert_eq!(data.describe(), "Node Type: unknown, Node ID: 5, Message: oom");
            }
            other => panic!("Expected ExecutionError, got {other:?}"),
        }
    }

    #[test]
    fn malformed_frames_are_errors() {
        for frame in [
            "not json at all",
            r#"{"data":{}}"#,
            r#"{"type":"execution_error","data":{"node_id":"5"}}"#,
            r#"{"type":"progress","data":{"value":"three"}}"#,
        ] {
            assert!(parse_message(frame).is_err(), "{frame}");
        }
    }
}
