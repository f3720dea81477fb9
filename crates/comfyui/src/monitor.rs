//! Execution monitoring for a single submitted workflow.
//!
//! [`ExecutionMonitor::run`] drives one job through an explicit state
//! machine:
//!
//! ```text
//! Connecting -> Submitting -> Watching <-> Reconnecting
//!                   |            |              |
//!                   v            v              v
//!                 Failed     Completed        Failed
//! ```
//!
//! The push channel is opened *before* the workflow is queued so that no
//! event for the new prompt can be missed. While watching, every read is
//! bounded by a timeout; a timeout is not an error, it only gives the
//! loop a chance to notice cancellation. The channel is closed on every
//! path out of the machine.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::api::{ComfyUIApi, ComfyUIApiError, SubmissionHandle};
use crate::client::{ChannelRead, ComfyUIClient, ComfyUIClientError, ComfyUIConnection};
use crate::messages::ComfyUIMessage;
use crate::reconnect::{reconnect, ReconnectConfig, ReconnectError};

/// Per-job monitoring parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorSettings {
    /// Upper bound on a single WebSocket read.
    pub receive_timeout: Duration,
    /// Reconnection bounds used when the channel drops.
    pub reconnect: ReconnectConfig,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            receive_timeout: Duration::from_secs(10),
            reconnect: ReconnectConfig::default(),
        }
    }
}

/// What the monitor observed once execution stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorReport {
    pub handle: SubmissionHandle,
    /// Execution errors reported by the engine for this prompt.
    pub errors: Vec<String>,
    /// How many times the channel had to be re-established.
    pub reconnects: u32,
}

/// Errors that end monitoring without reaching history retrieval.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    /// The initial WebSocket connection could not be opened.
    #[error("Failed to open websocket: {0}")]
    ChannelUnavailable(#[source] ComfyUIClientError),

    /// The workflow was not accepted.
    #[error(transparent)]
    Submit(#[from] ComfyUIApiError),

    /// The channel dropped and every reconnect attempt failed.
    #[error("Websocket lost while waiting for prompt {prompt_id}: {source}")]
    ChannelLost {
        prompt_id: String,
        #[source]
        source: ReconnectError,
    },

    /// The channel dropped and the engine stopped answering HTTP.
    #[error("ComfyUI became unreachable while waiting for prompt {prompt_id}: {reason}")]
    EngineUnreachable { prompt_id: String, reason: String },

    /// The job was cancelled before execution finished.
    #[error("Job cancelled")]
    Cancelled { prompt_id: Option<String> },

    /// The state machine stopped without a terminal outcome.
    #[error("Workflow monitoring loop exited without confirmation of completion or error ({0})")]
    ProtocolViolation(String),
}

/// How one watched event affects the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Keep watching.
    Continue,
    /// The engine finished executing the prompt.
    Finished,
    /// The engine reported a failure for the prompt.
    FinishedWithError(String),
}

/// Classify an event relative to the prompt being watched.
///
/// Events for other prompts never end the run.
pub fn classify(msg: &ComfyUIMessage, prompt_id: &str) -> Transition {
    match msg {
        _ if msg.is_terminal_for(prompt_id) => Transition::Finished,
        ComfyUIMessage::ExecutionError(data) if data.prompt_id == prompt_id => {
            Transition::FinishedWithError(format!("Workflow execution error: {}", data.describe()))
        }
        _ => Transition::Continue,
    }
}

/// States of one monitoring run.
enum MonitorState {
    Connecting,
    Submitting(ComfyUIConnection),
    Watching(ComfyUIConnection, SubmissionHandle),
    Reconnecting(SubmissionHandle, String),
    Completed(MonitorReport),
    Failed(MonitorError),
}

impl MonitorState {
    fn is_final(&self) -> bool {
        matches!(self, Self::Completed(_) | Self::Failed(_))
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Submitting(_) => "submitting",
            Self::Watching(..) => "watching",
            Self::Reconnecting(..) => "reconnecting",
            Self::Completed(_) => "completed",
            Self::Failed(_) => "failed",
        }
    }
}

/// Mutable bookkeeping shared across steps of one run.
struct RunContext<'w> {
    client_id: String,
    workflow: &'w serde_json::Value,
    reconnects: u32,
}

/// Connects, submits and watches one workflow until it finishes.
pub struct ExecutionMonitor<'a> {
    client: &'a ComfyUIClient,
    api: &'a ComfyUIApi,
    settings: &'a MonitorSettings,
}

/// Map the state the loop stopped in to the run's outcome.
///
/// Only `Completed` and `Failed` carry an outcome. Any other state means
/// the loop ended without a terminal or error event.
fn settle(state: MonitorState) -> Result<MonitorReport, MonitorError> {
    match state {
        MonitorState::Completed(report) => Ok(report),
        MonitorState::Failed(err) => Err(err),
        other => {
            tracing::error!(state = other.name(), "Monitor halted without a terminal event");
            Err(MonitorError::ProtocolViolation(format!(
                "halted in {} state",
                other.name()
            )))
        }
    }
}

impl<'a> ExecutionMonitor<'a> {
    pub fn new(client: &'a ComfyUIClient, api: &'a ComfyUIApi, settings: &'a MonitorSettings) -> Self {
        Self {
            client,
            api,
            settings,
        }
    }

    /// Run the workflow to a terminal state.
    ///
    /// A fresh client ID (UUID v4) is generated for the run and reused
    /// for every reconnect.
    pub async fn run(
        &self,
        workflow: &serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<MonitorReport, MonitorError> {
        let mut ctx = RunContext {
            client_id: uuid::Uuid::new_v4().to_string(),
            workflow,
            reconnects: 0,
        };

        let mut state = MonitorState::Connecting;
        while !state.is_final() {
            state = self.step(state, &mut ctx, cancel).await;
        }

        settle(state)
    }

    /// Advance the machine by one transition.
    async fn step(
        &self,
        state: MonitorState,
        ctx: &mut RunContext<'_>,
        cancel: &CancellationToken,
    ) -> MonitorState {
        match state {
            MonitorState::Connecting => match self.client.connect(&ctx.client_id).await {
                Ok(conn) => MonitorState::Submitting(conn),
                Err(e) => {
                    tracing::error!(error = %e, "Could not open websocket");
                    MonitorState::Failed(MonitorError::ChannelUnavailable(e))
                }
            },

            MonitorState::Submitting(conn) => {
                if cancel.is_cancelled() {
                    conn.close().await;
                    return MonitorState::Failed(MonitorError::Cancelled { prompt_id: None });
                }
                match self.api.submit_workflow(ctx.workflow, &ctx.client_id).await {
                    Ok(handle) => {
                        tracing::info!(prompt_id = %handle.prompt_id, "Queued workflow");
                        MonitorState::Watching(conn, handle)
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Error queuing workflow");
                        conn.close().await;
                        MonitorState::Failed(MonitorError::Submit(e))
                    }
                }
            }

            MonitorState::Watching(mut conn, handle) => {
                if cancel.is_cancelled() {
                    conn.close().await;
                    self.abandon(&handle).await;
                    return MonitorState::Failed(MonitorError::Cancelled {
                        prompt_id: Some(handle.prompt_id),
                    });
                }

                match conn.recv(self.settings.receive_timeout).await {
                    ChannelRead::Idle => {
                        tracing::debug!(prompt_id = %handle.prompt_id, "Websocket receive timed out, still waiting");
                        MonitorState::Watching(conn, handle)
                    }
                    ChannelRead::Malformed(_) => MonitorState::Watching(conn, handle),
                    ChannelRead::Message(msg) => match classify(&msg, &handle.prompt_id) {
                        Transition::Continue => {
                            log_event(&msg);
                            MonitorState::Watching(conn, handle)
                        }
                        Transition::Finished => {
                            tracing::info!(prompt_id = %handle.prompt_id, "Execution finished");
                            conn.close().await;
                            MonitorState::Completed(MonitorReport {
                                handle,
                                errors: Vec::new(),
                                reconnects: ctx.reconnects,
                            })
                        }
                        Transition::FinishedWithError(error) => {
                            tracing::error!(prompt_id = %handle.prompt_id, error = %error, "Execution error received");
                            conn.close().await;
                            MonitorState::Completed(MonitorReport {
                                handle,
                                errors: vec![error],
                                reconnects: ctx.reconnects,
                            })
                        }
                    },
                    ChannelRead::Closed(reason) => MonitorState::Reconnecting(handle, reason),
                }
            }

            MonitorState::Reconnecting(handle, reason) => {
                let result = reconnect(
                    self.client,
                    self.api,
                    &ctx.client_id,
                    &self.settings.reconnect,
                    &reason,
                    cancel,
                )
                .await;

                match result {
                    Ok(conn) => {
                        ctx.reconnects += 1;
                        tracing::info!(prompt_id = %handle.prompt_id, "Resuming message listening after reconnect");
                        MonitorState::Watching(conn, handle)
                    }
                    Err(ReconnectError::EngineUnreachable { reason }) => {
                        MonitorState::Failed(MonitorError::EngineUnreachable {
                            prompt_id: handle.prompt_id,
                            reason,
                        })
                    }
                    Err(ReconnectError::Cancelled) => {
                        self.abandon(&handle).await;
                        MonitorState::Failed(MonitorError::Cancelled {
                            prompt_id: Some(handle.prompt_id),
                        })
                    }
                    Err(source) => MonitorState::Failed(MonitorError::ChannelLost {
                        prompt_id: handle.prompt_id,
                        source,
                    }),
                }
            }

            terminal @ (MonitorState::Completed(_) | MonitorState::Failed(_)) => terminal,
        }
    }

    /// Best-effort removal of a cancelled prompt from the engine.
    async fn abandon(&self, handle: &SubmissionHandle) {
        tracing::warn!(prompt_id = %handle.prompt_id, "Cancelling prompt on ComfyUI");
        if let Err(e) = self.api.cancel_execution(&handle.prompt_id).await {
            tracing::warn!(prompt_id = %handle.prompt_id, error = %e, "Failed to dequeue prompt");
        }
        if let Err(e) = self.api.interrupt().await {
            tracing::warn!(prompt_id = %handle.prompt_id, error = %e, "Failed to interrupt execution");
        }
    }
}

/// Log an event that does not change the run's state.
fn log_event(msg: &ComfyUIMessage) {
    match msg {
        ComfyUIMessage::Status {
            queue_remaining: Some(remaining),
        } => tracing::info!(queue_remaining = remaining, "ComfyUI queue status"),
        ComfyUIMessage::ExecutionStart { prompt_id } => {
            tracing::info!(prompt_id = %prompt_id, "Execution started");
        }
        ComfyUIMessage::Executing(data) => {
            tracing::debug!(node = ?data.node, prompt_id = ?data.prompt_id, "Executing node");
        }
        ComfyUIMessage::Progress { value, max } => {
            tracing::debug!(value, max, "Generation progress");
        }
        ComfyUIMessage::ExecutionError(data) => {
            tracing::debug!(prompt_id = %data.prompt_id, "Ignoring execution error for another prompt");
        }
        other => tracing::trace!(kind = %other.kind(), "Ignoring ComfyUI message"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::parse_message;

    fn msg(json: &str) -> ComfyUIMessage {
        parse_message(json).unwrap()
    }

    #[test]
    fn terminal_marker_for_own_prompt_finishes() {
        let m = msg(r#"{"type":"executing","data":{"node":null,"prompt_id":"p1"}}"#);
        assert_eq!(classify(&m, "p1"), Transition::Finished);
    }

    #[test]
    fn terminal_marker_for_other_prompt_continues() {
        let m = msg(r#"{"type":"executing","data":{"node":null,"prompt_id":"p2"}}"#);
        assert_eq!(classify(&m, "p1"), Transition::Continue);
    }

    #[test]
    fn node_execution_continues() {
        let m = msg(r#"{"type":"executing","data":{"node":"3","prompt_id":"p1"}}"#);
        assert_eq!(classify(&m, "p1"), Transition::Continue);
    }

    #[test]
    fn status_continues() {
        let m = msg(r#"{"type":"status","data":{"status":{"exec_info":{"queue_remaining":1}}}}"#);
        assert_eq!(classify(&m, "p1"), Transition::Continue);
    }

    #[test]
    fn execution_error_for_own_prompt_carries_node_details() {
        let m = msg(
            r#"{"type":"execution_error","data":{"prompt_id":"p1","node_id":"5","node_type":"VAEDecode","exception_message":"boom"}}"#,
        );
        assert_eq!(
            classify(&m, "p1"),
            Transition::FinishedWithError(
                "Workflow execution error: Node Type: VAEDecode, Node ID: 5, Message: boom".into()
            )
        );
    }

    #[test]
    fn execution_error_with_numeric_node_id_still_fails() {
        let m = msg(
            r#"{"type":"execution_error","data":{"prompt_id":"p1","node_id":5,"node_type":null,"exception_message":"oom"}}"#,
        );
        assert_eq!(
            classify(&m, "p1"),
            Transition::FinishedWithError(
                "Workflow execution error: Node Type: unknown, Node ID: 5, Message: oom".into()
            )
        );
    }

    #[test]
    fn execution_error_for_other_prompt_continues() {
        let m = msg(r#"{"type":"execution_error","data":{"prompt_id":"p9","node_id":"5"}}"#);
        assert_eq!(classify(&m, "p1"), Transition::Continue);
    }

    #[test]
    fn settling_a_non_final_state_is_a_protocol_violation() {
        match settle(MonitorState::Connecting) {
            Err(MonitorError::ProtocolViolation(msg)) => assert_eq!(msg, "halted in connecting state"),
            other => panic!("Expected ProtocolViolation, got {other:?}"),
        }
    }

    #[test]
    fn settling_final_states_returns_their_outcome() {
        let report = MonitorReport {
            handle: SubmissionHandle {
                prompt_id: "p1".into(),
                client_id: "c1".into(),
            },
            errors: vec!["boom".into()],
            reconnects: 1,
        };
        match settle(MonitorState::Completed(report.clone())) {
            Ok(done) => assert_eq!(done, report),
            other => panic!("Expected report, got {other:?}"),
        }
        assert!(matches!(
            settle(MonitorState::Failed(MonitorError::Cancelled { prompt_id: None })),
            Err(MonitorError::Cancelled { prompt_id: None })
        ));
    }

    #[test]
    fn state_names_and_finality() {
        assert!(!MonitorState::Connecting.is_final());
        assert_eq!(MonitorState::Connecting.name(), "connecting");
        let failed = MonitorState::Failed(MonitorError::ProtocolViolation("x".into()));
        assert!(failed.is_final());
        assert_eq!(failed.name(), "failed");
    }

    #[test]
    fn default_settings_bound_reads() {
        let settings = MonitorSettings::default();
        assert_eq!(settings.receive_timeout, Duration::from_secs(10));
        assert_eq!(settings.reconnect, ReconnectConfig::default());
    }
}
