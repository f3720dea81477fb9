//! Engine-independent job types.
//!
//! Validation of incoming job payloads and the result shape returned to
//! the dispatch host. This crate performs no I/O.

pub mod job;
pub mod output;
