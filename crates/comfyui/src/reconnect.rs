//! Bounded reconnection of a dropped ComfyUI WebSocket.
//!
//! When the push channel closes mid-job, the monitor calls
//! [`reconnect`]. Each attempt first checks that the HTTP server is
//! still up: if it is not, reopening the socket is pointless and the
//! protocol gives up at once. Otherwise a fresh connection is opened
//! under the same client ID, waiting a fixed delay between failures.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::api::ComfyUIApi;
use crate::client::{ComfyUIClient, ComfyUIConnection};
use crate::readiness::{probe_once, Reachability};

/// Tunable parameters for reconnection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Number of connection attempts before giving up.
    pub max_attempts: u32,
    /// Pause between failed attempts.
    pub delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(3),
        }
    }
}

/// Why reconnection failed.
#[derive(Debug, thiserror::Error)]
pub enum ReconnectError {
    /// The HTTP probe failed, so the whole engine is down.
    #[error("ComfyUI HTTP unreachable during websocket reconnect: {reason}")]
    EngineUnreachable { reason: String },

    /// Every attempt failed while the engine itself was reachable.
    #[error("Connection closed and failed to reconnect after {attempts} attempts. Last error: {last_error}")]
    Exhausted { attempts: u32, last_error: String },

    /// The job was cancelled while reconnecting.
    #[error("Reconnect cancelled")]
    Cancelled,
}

/// Steps of the reconnection protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReconnectState {
    /// Check HTTP reachability before attempt `n`.
    Probing(u32),
    /// Open a fresh socket for attempt `n`.
    Connecting(u32),
    /// Attempt `n` failed; pause before the next one.
    Waiting(u32),
}

/// Re-establish the push channel for `client_id`.
///
/// `initial_error` describes how the previous connection ended and is
/// reported if no attempt ever runs.
pub async fn reconnect(
    client: &ComfyUIClient,
    api: &ComfyUIApi,
    client_id: &str,
    config: &ReconnectConfig,
    initial_error: &str,
    cancel: &CancellationToken,
) -> Result<ComfyUIConnection, ReconnectError> {
    tracing::warn!(
        client_id = %client_id,
        error = %initial_error,
        "Websocket connection closed unexpectedly, attempting to reconnect",
    );

    let mut last_error = initial_error.to_string();
    let mut state = ReconnectState::Probing(1);

    loop {
        state = match state {
            ReconnectState::Probing(attempt) => {
                if attempt > config.max_attempts {
                    break;
                }
                match probe_once(api).await {
                    Reachability::Reachable => ReconnectState::Connecting(attempt),
                    Reachability::Unreachable(reason) => {
                        tracing::error!(
                            client_id = %client_id,
                            reason = %reason,
                            "ComfyUI HTTP unreachable, aborting websocket reconnect",
                        );
                        return Err(ReconnectError::EngineUnreachable { reason });
                    }
                }
            }
            ReconnectState::Connecting(attempt) => {
                tracing::info!(
                    client_id = %client_id,
                    attempt,
                    max_attempts = config.max_attempts,
                    "Reconnecting to ComfyUI",
                );

                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!(client_id = %client_id, "Reconnect cancelled");
                        return Err(ReconnectError::Cancelled);
                    }
                    result = client.connect(client_id) => match result {
                        Ok(conn) => {
                            tracing::info!(client_id = %client_id, attempt, "Websocket reconnected");
                            return Ok(conn);
                        }
                        Err(e) => {
                            tracing::warn!(
                                client_id = %client_id,
                                error = %e,
                                "Reconnect attempt {attempt} failed",
                            );
                            last_error = e.to_string();
                            ReconnectState::Waiting(attempt)
                        }
                    }
                }
            }
            ReconnectState::Waiting(attempt) => {
                if attempt >= config.max_attempts {
                    break;
                }
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ReconnectError::Cancelled),
                    _ = tokio::time::sleep(config.delay) => {}
                }
                ReconnectState::Probing(attempt + 1)
            }
        };
    }

    tracing::error!(
        client_id = %client_id,
        attempts = config.max_attempts,
        "Failed to reconnect websocket after connection closed",
    );
    Err(ReconnectError::Exhausted {
        attempts: config.max_attempts,
        last_error,
    })
}
