//! Error taxonomy shared across services

use thiserror::Error;

/// A job request that can never be turned into a workload
///
/// Non-retriable: the creator routes the message to the dead-letter path.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid job request: {field}: {reason}")]
pub struct ValidationError {
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Shorthand for a required field that is absent or empty
    pub fn missing(field: impl Into<String>) -> Self {
        Self::new(field, "is required")
    }
}

/// The observation channel to the cluster has been unavailable for too long
///
/// The job's real state is unknown. This is never converted into a verdict;
/// the watcher keeps observing from its last known state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("observation lost after {attempts} consecutive failures: {last_error}")]
pub struct ObservationLost {
    pub attempts: u32,
    pub last_error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::missing("workload.image");
        assert_eq!(
            err.to_string(),
            "invalid job request: workload.image: is required"
        );
    }
}
