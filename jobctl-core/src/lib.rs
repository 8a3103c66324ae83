//! Jobctl Core
//!
//! Core types and pure logic shared by the job creator and the job watcher.
//!
//! This crate contains:
//! - Domain types: job requests, workload descriptors, progress samples, outcomes
//! - The translator turning a job request into a workload descriptor
//! - The stall detector evaluating a window of progress samples
//! - Retry policy and resource quantity helpers
//!
//! Nothing in here performs I/O; the service crates own every network call.

pub mod domain;
pub mod error;
pub mod quantity;
pub mod retry;
pub mod stall;
pub mod translate;

pub use error::{ObservationLost, ValidationError};
pub use retry::RetryPolicy;
pub use stall::{StallDetector, StallReason, Verdict};
pub use translate::{SecretKeyRef, Translator, TranslatorConfig, WatcherSettings};
