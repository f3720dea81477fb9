//! ComfyUI WebSocket and REST client library.
//!
//! Provides typed message parsing, WebSocket connection management,
//! HTTP API wrappers, readiness probing, reconnection logic and the
//! execution monitor that drives one workflow from submission to its
//! terminal event. Output retrieval lives in [`history`] and
//! [`collector`].

pub mod api;
pub mod client;
pub mod collector;
pub mod history;
pub mod messages;
pub mod monitor;
pub mod readiness;
pub mod reconnect;
pub mod rejection;
pub mod upload;
