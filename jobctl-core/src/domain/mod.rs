//! Core domain types
//!
//! This module contains the structures exchanged between the creator, the
//! watcher and the external systems. The creator consumes `JobRequest`s and
//! produces `WorkloadDescriptor`s; the watcher produces `ProgressSample`s and
//! a single `JobOutcome` per job.

pub mod outcome;
pub mod progress;
pub mod request;
pub mod workload;
