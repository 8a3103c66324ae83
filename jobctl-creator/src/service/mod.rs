//! Service Module
//!
//! Business logic layer for the creator.
//! Services orchestrate between repositories and contain domain logic.

pub mod intake;
pub mod submitter;

// Re-export for convenience
pub use intake::{Disposition, RequestIntake};
pub use submitter::{SubmitResult, Submitter};
