//! Single-job ComfyUI worker.
//!
//! [`handler::handle_job`] takes a raw job input and returns the JSON
//! result for the dispatch host. Configuration comes from the
//! environment through [`config::WorkerConfig`].

pub mod config;
pub mod error;
pub mod handler;
