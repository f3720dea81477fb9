//! WebSocket client for connecting to a ComfyUI instance.
//!
//! [`ComfyUIClient`] holds the connection configuration for a single
//! ComfyUI instance. Call [`ComfyUIClient::connect`] to establish a
//! live [`ComfyUIConnection`] over WebSocket, then read events from it
//! with [`ComfyUIConnection::recv`].

use std::time::Duration;

use futures::StreamExt;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::messages::{parse_message, ComfyUIMessage};

/// Upper bound on the WebSocket handshake.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration handle for a ComfyUI instance.
///
/// Stores the WebSocket and HTTP API URLs needed to communicate with
/// one ComfyUI server.
#[derive(Debug, Clone)]
pub struct ComfyUIClient {
    ws_url: String,
    api_url: String,
}

/// A live WebSocket connection to a ComfyUI instance.
pub struct ComfyUIConnection {
    /// Client ID sent during the WebSocket handshake.
    pub client_id: String,
    ws_stream: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

/// Outcome of one bounded read from the connection.
#[derive(Debug)]
pub enum ChannelRead {
    /// A parsed ComfyUI message.
    Message(ComfyUIMessage),
    /// A text frame that could not be decoded.
    Malformed(String),
    /// Nothing arrived within the read timeout.
    Idle,
    /// The connection ended; the string says how.
    Closed(String),
}

impl ComfyUIClient {
    /// Create a new client targeting a specific ComfyUI instance.
    ///
    /// * `ws_url`  - WebSocket base URL, e.g. `ws://host:8188`.
    /// * `api_url` - HTTP base URL, e.g. `http://host:8188`.
    pub fn new(ws_url: String, api_url: String) -> Self {
        Self { ws_url, api_url }
    }

    /// Build both URLs from a bare `host:port`.
    pub fn from_host(host: &str) -> Self {
        Self::new(format!("ws://{host}"), format!("http://{host}"))
    }

    /// WebSocket base URL (e.g. `ws://host:8188`).
    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// HTTP API base URL (e.g. `http://host:8188`).
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Connect to the ComfyUI WebSocket endpoint.
    ///
    /// `client_id` is appended as a query parameter so that ComfyUI
    /// addresses the events of prompts submitted under that ID to this
    /// connection. Reconnects reuse the same ID.
    pub async fn connect(&self, client_id: &str) -> Result<ComfyUIConnection, ComfyUIClientError> {
        let url = format!("{}/ws?clientId={}", self.ws_url, client_id);

        let (ws_stream, _response) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str()))
            .await
            .map_err(|_| {
                ComfyUIClientError::Connection(format!(
                    "Timed out connecting to ComfyUI at {}",
                    self.ws_url
                ))
            })?
            .map_err(|e| {
                ComfyUIClientError::Connection(format!(
                    "Failed to connect to ComfyUI at {}: {e}",
                    self.ws_url
                ))
            })?;

        tracing::info!(client_id = %client_id, "Connected to ComfyUI at {}", self.ws_url);

        Ok(ComfyUIConnection {
            client_id: client_id.to_string(),
            ws_stream,
        })
    }
}

impl ComfyUIConnection {
    /// Wait up to `timeout` for the next meaningful frame.
    ///
    /// Binary frames (preview images) and control frames are skipped
    /// without resetting the timeout.
    pub async fn recv(&mut self, timeout: Duration) -> ChannelRead {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let next = match tokio::time::timeout_at(deadline, self.ws_stream.next()).await {
                Ok(next) => next,
                Err(_) => return ChannelRead::Idle,
            };

            match next {
                Some(Ok(Message::Text(text))) => {
                    return match parse_message(&text) {
                        Ok(msg) => ChannelRead::Message(msg),
                        Err(e) => {
                            tracing::warn!(
                                client_id = %self.client_id,
                                error = %e,
                                raw_message = %text,
                                "Failed to parse ComfyUI message",
                            );
                            ChannelRead::Malformed(text.to_string())
                        }
                    };
                }
                Some(Ok(Message::Binary(_))) => {
                    tracing::trace!(client_id = %self.client_id, "Ignoring binary message (preview image)");
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {
                    // Handled automatically by tungstenite.
                }
                Some(Ok(Message::Close(frame))) => {
                    return ChannelRead::Closed(format!("closed by server ({frame:?})"));
                }
                Some(Err(e)) => return ChannelRead::Closed(format!("receive error: {e}")),
                None => return ChannelRead::Closed("stream exhausted".to_string()),
            }
        }
    }

    /// Close the connection, ignoring errors from an already-dead socket.
    pub async fn close(mut self) {
        tracing::debug!(client_id = %self.client_id, "Closing websocket connection");
        let _ = self.ws_stream.close(None).await;
    }
}

/// Errors that can occur when working with the WebSocket client.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIClientError {
    /// Failed to establish the WebSocket connection.
    #[error("Connection error: {0}")]
    Connection(String),
}
