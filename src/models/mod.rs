//! Core data models for the offload pipeline.
//!
//! Events come in from the host, tasks live inside the upload pool, history
//! rows belong to the host database and batches live inside the share
//! aggregator. Everything serializes as JSON via `serde`.

pub mod event;
pub mod history;
pub mod remote;
pub mod share;
pub mod task;
