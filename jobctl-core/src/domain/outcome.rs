//! Job outcome domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Terminal record for one job
///
/// Created exactly once when the watcher reaches a terminal state and never
/// mutated after the results store has acknowledged it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub job_id: String,
    pub run_id: Option<String>,
    pub status: OutcomeStatus,
    pub exit_code: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
    pub status_message: Option<String>,
    pub stacktrace: Option<String>,
    #[serde(default)]
    pub output_files: Vec<String>,
}

/// Terminal job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutcomeStatus {
    Succeeded,
    Failed,
    /// Killed by the watcher after a confirmed stall
    StalledKilled,
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutcomeStatus::Succeeded => write!(f, "succeeded"),
            OutcomeStatus::Failed => write!(f, "failed"),
            OutcomeStatus::StalledKilled => write!(f, "stalled-killed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_format() {
        assert_eq!(
            serde_json::to_string(&OutcomeStatus::StalledKilled).unwrap(),
            "\"stalled-killed\""
        );
        assert_eq!(
            serde_json::from_str::<OutcomeStatus>("\"succeeded\"").unwrap(),
            OutcomeStatus::Succeeded
        );
    }
}
