//! Log post-processing
//!
//! Turns the tail of the primary container's log into outcome details: the
//! raised error and its traceback when the job failed, and the job's own
//! result line when it exited cleanly.

use serde::Deserialize;

const ERROR_MARKER: &str = "Error:";
const TRACEBACK_MARKER: &str = "Traceback (most recent call last):";

/// Error line and stacktrace found in a failed job's log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureDetails {
    /// The raised error, or the last log line when no error line exists
    pub message: Option<String>,
    pub stacktrace: Option<String>,
}

/// Finds the most recent raised error and its traceback
///
/// Scans backwards for the last line containing `Error:`, then keeps
/// collecting earlier lines up to and including the traceback header. Without
/// an error line the last line becomes the message and there is no
/// stacktrace.
pub fn extract_failure(lines: &[String]) -> FailureDetails {
    let Some(error_index) = lines.iter().rposition(|line| line.contains(ERROR_MARKER)) else {
        return FailureDetails {
            message: lines.last().cloned(),
            stacktrace: None,
        };
    };

    let start = lines[..=error_index]
        .iter()
        .rposition(|line| line.contains(TRACEBACK_MARKER))
        .unwrap_or(0);

    let stacktrace: String = lines[start..=error_index]
        .iter()
        .map(|line| format!("{}\n", line))
        .collect();

    FailureDetails {
        message: Some(lines[error_index].clone()),
        stacktrace: Some(stacktrace),
    }
}

/// Result line a job prints as its final log output
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct JobOutput {
    pub status: String,
    #[serde(default)]
    pub status_message: Option<String>,
    #[serde(default)]
    pub output_files: Vec<String>,
    #[serde(default)]
    pub stacktrace: Option<String>,
}

impl JobOutput {
    /// Whether the job reported itself as successful
    pub fn is_successful(&self) -> bool {
        self.status.eq_ignore_ascii_case("successful")
    }
}

/// Parses the last non-empty log line as the job's result line
///
/// Returns `None` when there is no such line, or it is not a JSON object
/// carrying a `status`. Structured log records are not result lines.
pub fn parse_job_output(lines: &[String]) -> Option<JobOutput> {
    let last = lines.iter().rev().find(|line| !line.trim().is_empty())?;
    serde_json::from_str(last.trim()).ok()
}
