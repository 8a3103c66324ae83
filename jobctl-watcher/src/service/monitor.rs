//! Progress monitor
//!
//! Polls the primary container once per interval and turns each observation
//! into a [`ProgressSample`]. Activity evidence is folded into a monotone
//! last-activity timestamp according to the configured [`ActivityPolicy`].
//!
//! Failed observation calls are retried with backoff. Once the consecutive
//! failures reach the ceiling every further failure is surfaced as
//! [`ObservationLost`]; the stream keeps going either way.

use async_stream::stream;
use chrono::{DateTime, Utc};
use futures::Stream;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use jobctl_core::domain::progress::{ActivityPolicy, ProgressSample};
use jobctl_core::{ObservationLost, RetryPolicy};

use crate::repository::PodRepository;

/// Upper bound on lines scanned per poll when looking for heartbeats
const HEARTBEAT_SCAN_LINES: i64 = 1000;

/// Source of wall-clock time for sample timestamps
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Activity evidence gathered so far
#[derive(Debug, Default)]
struct ActivityTracker {
    last_activity: Option<DateTime<Utc>>,
    /// Timestamp of the newest log line already looked at
    log_cursor: Option<DateTime<Utc>>,
}

impl ActivityTracker {
    fn record(&mut self, at: DateTime<Utc>) {
        self.last_activity = self.last_activity.max(Some(at));
    }

    /// The container start counts as the first activity
    fn seed(&mut self, started_at: Option<DateTime<Utc>>) {
        if self.last_activity.is_none() {
            self.last_activity = started_at;
        }
        if self.log_cursor.is_none() {
            self.log_cursor = started_at;
        }
    }
}

/// Observes one container and produces progress samples
pub struct ProgressMonitor {
    pods: Arc<dyn PodRepository>,
    clock: Arc<dyn Clock>,
    policy: ActivityPolicy,
    interval: Duration,
    retry: RetryPolicy,
}

impl ProgressMonitor {
    /// Creates a monitor
    ///
    /// `retry.max_attempts` is the observation ceiling.
    pub fn new(
        pods: Arc<dyn PodRepository>,
        clock: Arc<dyn Clock>,
        policy: ActivityPolicy,
        interval: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            pods,
            clock,
            policy,
            interval,
            retry,
        }
    }

    /// Lazy sample stream
    ///
    /// Ends after the first terminal sample or when `cancel` fires. One
    /// observation is in flight at a time.
    pub fn samples(
        &self,
        cancel: CancellationToken,
    ) -> impl Stream<Item = Result<ProgressSample, ObservationLost>> + Send + '_ {
        stream! {
            let mut tracker = ActivityTracker::default();
            let mut failures: u32 = 0;

            loop {
                let delay = match self.observe(&mut tracker).await {
                    Ok(sample) => {
                        failures = 0;
                        let terminal = sample.is_terminal();
                        yield Ok(sample);
                        if terminal {
                            break;
                        }
                        self.interval
                    }
                    Err(e) => {
                        failures += 1;
                        warn!("Observation failed ({} in a row): {:#}", failures, e);
                        if failures >= self.retry.max_attempts {
                            yield Err(ObservationLost {
                                attempts: failures,
                                last_error: format!("{:#}", e),
                            });
                        }
                        self.retry.delay_for(failures)
                    }
                };

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    async fn observe(&self, tracker: &mut ActivityTracker) -> anyhow::Result<ProgressSample> {
        let state = self.pods.container_state().await?;
        let now = self.clock.now();

        let Some(state) = state else {
            debug!("Container has no status yet");
            return Ok(ProgressSample {
                timestamp: now,
                container_running: false,
                started_at: None,
                last_activity: tracker.last_activity,
                exit_code: None,
                finished_at: None,
            });
        };

        tracker.seed(state.started_at);
        if state.running {
            self.collect_activity(tracker, now).await?;
        }

        Ok(ProgressSample {
            timestamp: now,
            container_running: state.running,
            started_at: state.started_at,
            last_activity: tracker.last_activity,
            exit_code: state.exit_code,
            finished_at: state.finished_at,
        })
    }

    async fn collect_activity(
        &self,
        tracker: &mut ActivityTracker,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        match &self.policy {
            ActivityPolicy::LogOutput => {
                let lines = self.pods.read_logs(tracker.log_cursor, Some(1)).await?;
                let newest = lines
                    .iter()
                    .filter_map(|line| line.timestamp)
                    .filter(|ts| Some(*ts) > tracker.log_cursor)
                    .max();
                if let Some(ts) = newest {
                    tracker.log_cursor = Some(ts);
                    tracker.record(ts);
                }
            }
            ActivityPolicy::Heartbeat { marker } => {
                let lines = self
                    .pods
                    .read_logs(tracker.log_cursor, Some(HEARTBEAT_SCAN_LINES))
                    .await?;
                let cursor = tracker.log_cursor;
                let fresh: Vec<_> = lines
                    .iter()
                    .filter(|line| line.timestamp.is_some() && line.timestamp > cursor)
                    .collect();

                if let Some(ts) = fresh.iter().filter_map(|line| line.timestamp).max() {
                    tracker.log_cursor = Some(ts);
                }
                if let Some(ts) = fresh
                    .iter()
                    .filter(|line| line.text.contains(marker.as_str()))
                    .filter_map(|line| line.timestamp)
                    .max()
                {
                    tracker.record(ts);
                }
            }
            ActivityPolicy::CpuFloor { millicores } => {
                let usage = self.pods.cpu_millicores().await?;
                if usage.is_some_and(|usage| usage > *millicores) {
                    tracker.record(now);
                }
            }
        }
        Ok(())
    }
}
