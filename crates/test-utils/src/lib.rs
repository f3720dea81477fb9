//! Shared test utilities for genjob integration tests.
//!
//! This crate provides:
//! - [`FakeEngine`]: a scriptable stand-in for a ComfyUI server, served
//!   over real HTTP and WebSocket on `127.0.0.1`
//! - [`frames`]: builders for the JSON events a ComfyUI server pushes
//!
//! # Example
//!
//! ```rust,ignore
//! let engine = FakeEngine::start().await;
//! engine.push_ws_session(vec![WsStep::Send(frames::executing_done("p1"))]);
//! let client = ComfyUIClient::from_host(&engine.host());
//! ```

pub mod engine;
pub mod frames;

pub use engine::*;
