//! Stall detection
//!
//! A pure evaluation over a window of progress samples. The detector keeps no
//! state between calls; confirmation over time is the watcher's concern.

use chrono::TimeDelta;
use std::time::Duration;

use crate::domain::progress::ProgressSample;

/// Result of evaluating a sample window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Healthy,
    Stalled(StallReason),
}

impl Verdict {
    pub fn is_stalled(&self) -> bool {
        matches!(self, Verdict::Stalled(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallReason {
    /// No activity for longer than the inactivity threshold
    Inactive { idle: TimeDelta },
    /// Running for longer than the hard runtime limit
    RuntimeExceeded { runtime: TimeDelta },
}

/// Stall detector configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StallDetector {
    inactivity_threshold: TimeDelta,
    max_runtime: Option<TimeDelta>,
}

impl StallDetector {
    /// Creates a detector
    ///
    /// # Arguments
    /// * `inactivity_threshold` - Longest tolerated gap since the last activity
    /// * `max_runtime` - Optional hard limit on how long the container may run
    pub fn new(inactivity_threshold: Duration, max_runtime: Option<Duration>) -> Self {
        Self {
            inactivity_threshold: to_delta(inactivity_threshold),
            max_runtime: max_runtime.map(to_delta),
        }
    }

    /// Evaluates a window of samples, oldest first
    ///
    /// Only a running container can be stalled. The reference point for
    /// inactivity is the newest activity seen anywhere in the window, falling
    /// back to the container start time.
    pub fn evaluate(&self, window: &[ProgressSample]) -> Verdict {
        let Some(latest) = window.last() else {
            return Verdict::Healthy;
        };

        if !latest.container_running || latest.is_terminal() {
            return Verdict::Healthy;
        }

        let started_at = window.iter().rev().find_map(|s| s.started_at);

        if let (Some(limit), Some(started)) = (self.max_runtime, started_at) {
            let runtime = latest.timestamp - started;
            if runtime > limit {
                return Verdict::Stalled(StallReason::RuntimeExceeded { runtime });
            }
        }

        let last_activity = window
            .iter()
            .filter_map(|s| s.last_activity)
            .max()
            .or(started_at);

        match last_activity {
            Some(reference) => {
                let idle = latest.timestamp - reference;
                if idle > self.inactivity_threshold {
                    Verdict::Stalled(StallReason::Inactive { idle })
                } else {
                    Verdict::Healthy
                }
            }
            None => Verdict::Healthy,
        }
    }
}

fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn running(now: i64, last_activity: i64) -> ProgressSample {
        ProgressSample {
            timestamp: at(now),
            container_running: true,
            started_at: Some(at(0)),
            last_activity: Some(at(last_activity)),
            exit_code: None,
            finished_at: None,
        }
    }

    fn detector() -> StallDetector {
        StallDetector::new(Duration::from_secs(300), None)
    }

    #[test]
    fn test_empty_window_is_healthy() {
        assert_eq!(detector().evaluate(&[]), Verdict::Healthy);
    }

    #[test]
    fn test_recent_activity_is_healthy() {
        let window = vec![running(100, 90), running(200, 190), running(400, 350)];
        assert_eq!(detector().evaluate(&window), Verdict::Healthy);
    }

    #[test]
    fn test_inactivity_beyond_threshold_is_stalled() {
        let window: Vec<_> = (0..=8).map(|i| running(i * 50, 0)).collect();
        let verdict = detector().evaluate(&window);
        assert_eq!(
            verdict,
            Verdict::Stalled(StallReason::Inactive {
                idle: TimeDelta::seconds(400)
            })
        );
    }

    #[test]
    fn test_exactly_at_threshold_is_healthy() {
        let window = vec![running(300, 0)];
        assert_eq!(detector().evaluate(&window), Verdict::Healthy);
    }

    #[test]
    fn test_exited_container_is_never_stalled() {
        let mut sample = running(1000, 0);
        sample.container_running = false;
        sample.exit_code = Some(0);
        assert_eq!(detector().evaluate(&[sample]), Verdict::Healthy);
    }

    #[test]
    fn test_newest_activity_in_window_wins() {
        // The latest sample carries an older activity timestamp than an
        // earlier sample; the window as a whole still shows recent activity.
        let window = vec![running(390, 380), running(400, 0)];
        assert_eq!(detector().evaluate(&window), Verdict::Healthy);
    }

    #[test]
    fn test_falls_back_to_start_time() {
        let mut sample = running(301, 0);
        sample.last_activity = None;
        assert!(detector().evaluate(&[sample]).is_stalled());
    }

    #[test]
    fn test_runtime_limit() {
        let detector = StallDetector::new(
            Duration::from_secs(300),
            Some(Duration::from_secs(3600)),
        );
        let window = vec![running(3601, 3600)];
        assert_eq!(
            detector.evaluate(&window),
            Verdict::Stalled(StallReason::RuntimeExceeded {
                runtime: TimeDelta::seconds(3601)
            })
        );
    }
}
