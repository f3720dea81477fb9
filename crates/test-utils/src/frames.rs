//! Builders for the JSON events a ComfyUI server pushes over WebSocket.

use serde_json::json;

use crate::engine::WsStep;

/// Queue status broadcast.
pub fn status(queue_remaining: i32) -> String {
    json!({
        "type": "status",
        "data": {"status": {"exec_info": {"queue_remaining": queue_remaining}}, "sid": "fake"}
    })
    .to_string()
}

/// A node started executing.
pub fn executing(prompt_id: &str, node: &str) -> String {
    json!({"type": "executing", "data": {"node": node, "prompt_id": prompt_id}}).to_string()
}

/// End-of-execution marker (`node: null`) for a prompt.
pub fn executing_done(prompt_id: &str) -> String {
    json!({"type": "executing", "data": {"node": null, "prompt_id": prompt_id}}).to_string()
}

pub fn progress(value: i32, max: i32) -> String {
    json!({"type": "progress", "data": {"value": value, "max": max}}).to_string()
}

pub fn execution_error(prompt_id: &str, node_id: &str, node_type: &str, message: &str) -> String {
    json!({
        "type": "execution_error",
        "data": {
            "prompt_id": prompt_id,
            "node_id": node_id,
            "node_type": node_type,
            "exception_message": message,
            "exception_type": "RuntimeError"
        }
    })
    .to_string()
}

/// A session that reports completion of `prompt_id` and stays open.
pub fn completes(prompt_id: &str) -> Vec<WsStep> {
    vec![
        WsStep::Send(status(1)),
        WsStep::Send(executing(prompt_id, "3")),
        WsStep::Send(progress(1, 1)),
        WsStep::Send(executing_done(prompt_id)),
    ]
}
