//! Progress observation types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One timestamped observation of the primary container
///
/// Immutable once recorded. Samples for one job are strictly time-ordered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSample {
    pub timestamp: DateTime<Utc>,
    pub container_running: bool,
    /// When the primary container started, once known
    pub started_at: Option<DateTime<Utc>>,
    /// Most recent evidence of progress according to the activity policy
    pub last_activity: Option<DateTime<Utc>>,
    /// Set once the container has terminated
    pub exit_code: Option<i32>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ProgressSample {
    pub fn is_terminal(&self) -> bool {
        self.exit_code.is_some()
    }
}

/// What counts as "activity" for stall detection
///
/// Chosen per deployment and passed to the watcher as a string:
/// `logs`, `heartbeat:<marker>` or `cpu:<millicores>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum ActivityPolicy {
    /// Any new log line from the primary container
    #[default]
    LogOutput,
    /// A log line containing the marker
    Heartbeat { marker: String },
    /// CPU usage strictly above the floor
    CpuFloor { millicores: u64 },
}

impl fmt::Display for ActivityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActivityPolicy::LogOutput => write!(f, "logs"),
            ActivityPolicy::Heartbeat { marker } => write!(f, "heartbeat:{}", marker),
            ActivityPolicy::CpuFloor { millicores } => write!(f, "cpu:{}", millicores),
        }
    }
}

impl FromStr for ActivityPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "logs" {
            return Ok(Self::LogOutput);
        }

        match s.split_once(':') {
            Some(("heartbeat", marker)) if !marker.is_empty() => Ok(Self::Heartbeat {
                marker: marker.to_string(),
            }),
            Some(("cpu", floor)) => floor
                .parse::<u64>()
                .map(|millicores| Self::CpuFloor { millicores })
                .map_err(|_| format!("invalid cpu floor '{}'", floor)),
            _ => Err(format!(
                "unknown activity policy '{}' (expected logs, heartbeat:<marker> or cpu:<millicores>)",
                s
            )),
        }
    }
}
