//! Watcher control loop
//!
//! Drives one job from its first sample to a stored outcome:
//!
//! ```text
//! Starting -> Running <-> Stalled -> Terminating -> Failed (stalled-killed)
//!                 \                                   ^
//!                  +--> Succeeded / Failed (exit code)+
//! ```
//!
//! Stalls must persist for the confirmation period before the container is
//! killed. Observation loss never changes the state. A shutdown request stops
//! supervision without reporting anything.

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use jobctl_core::domain::outcome::{JobOutcome, OutcomeStatus};
use jobctl_core::domain::progress::ProgressSample;
use jobctl_core::{RetryPolicy, StallDetector, StallReason, Verdict};

use crate::repository::PodRepository;
use crate::service::logs;
use crate::service::{Clock, ProgressMonitor, ReportResult, Reporter};

/// Samples kept for stall evaluation
const WINDOW_SIZE: usize = 16;

/// Log lines read for failure details and the job output line
const DIAGNOSTIC_LINES: i64 = 50;

/// Lifecycle phase of the supervised job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Starting,
    Running,
    Stalled,
    Terminating,
    Succeeded,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Starting => "starting",
            Phase::Running => "running",
            Phase::Stalled => "stalled",
            Phase::Terminating => "terminating",
            Phase::Succeeded => "succeeded",
            Phase::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy)]
enum State {
    Starting,
    Running,
    Stalled { since: Instant, reason: StallReason },
    Terminating { deadline: Instant, reason: StallReason },
}

impl State {
    fn phase(&self) -> Phase {
        match self {
            State::Starting => Phase::Starting,
            State::Running => Phase::Running,
            State::Stalled { .. } => Phase::Stalled,
            State::Terminating { .. } => Phase::Terminating,
        }
    }
}

/// How observation ended
enum Ending {
    Exited {
        sample: ProgressSample,
        killed: Option<StallReason>,
    },
    TerminationTimedOut {
        reason: StallReason,
        started_at: Option<DateTime<Utc>>,
    },
    Cancelled,
}

/// Identity of the supervised job, copied into its outcome
#[derive(Debug, Clone)]
pub struct JobIdentity {
    pub job_id: String,
    pub run_id: Option<String>,
}

/// Stall handling settings
#[derive(Debug, Clone, Copy)]
pub struct StallPolicy {
    pub detector: StallDetector,
    /// How long a stall verdict must persist before the kill
    pub confirmation: Duration,
    /// How long a killed container gets to exit
    pub termination_timeout: Duration,
}

/// What a finished run did
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// `None` if supervision was stopped before a verdict
    pub outcome: Option<JobOutcome>,
    pub acknowledged: bool,
    /// Every phase entered, in order
    pub phases: Vec<Phase>,
}

pub struct Supervisor {
    identity: JobIdentity,
    pods: Arc<dyn PodRepository>,
    monitor: ProgressMonitor,
    reporter: Reporter,
    clock: Arc<dyn Clock>,
    stall: StallPolicy,
}

impl Supervisor {
    pub fn new(
        identity: JobIdentity,
        pods: Arc<dyn PodRepository>,
        monitor: ProgressMonitor,
        reporter: Reporter,
        clock: Arc<dyn Clock>,
        stall: StallPolicy,
    ) -> Self {
        Self {
            identity,
            pods,
            monitor,
            reporter,
            clock,
            stall,
        }
    }

    /// Supervises the job until its outcome is stored or `cancel` fires
    ///
    /// Returns an error when the outcome could not be stored, so the process
    /// exits non-zero.
    pub async fn run(&self, cancel: CancellationToken) -> Result<RunSummary> {
        let job_id = &self.identity.job_id;
        let mut phases = vec![Phase::Starting];
        info!("Supervising job {}", job_id);

        let (outcome, delete_pod) = match self.observe(&cancel, &mut phases).await {
            Ending::Cancelled => {
                info!("Job {}: stopped before a verdict, nothing reported", job_id);
                return Ok(RunSummary {
                    outcome: None,
                    acknowledged: false,
                    phases,
                });
            }
            Ending::Exited { sample, killed } => (self.exit_outcome(&sample, killed).await, false),
            Ending::TerminationTimedOut { reason, started_at } => {
                (self.killed_outcome(reason, started_at, None, None), true)
            }
        };

        let terminal = match outcome.status {
            OutcomeStatus::Succeeded => Phase::Succeeded,
            OutcomeStatus::Failed | OutcomeStatus::StalledKilled => Phase::Failed,
        };
        self.enter(&mut phases, terminal);
        info!(
            "Job {} finished as {} (exit code {:?})",
            job_id, outcome.status, outcome.exit_code
        );

        match self.reporter.report(&outcome, &cancel).await {
            ReportResult::Acknowledged => {
                if delete_pod {
                    warn!("Job {}: container ignored termination, deleting pod", job_id);
                    if let Err(e) = self.pods.delete_pod().await {
                        error!("Failed to delete pod of job {}: {:#}", job_id, e);
                    }
                }
                Ok(RunSummary {
                    outcome: Some(outcome),
                    acknowledged: true,
                    phases,
                })
            }
            ReportResult::TransientError(reason) if cancel.is_cancelled() => {
                warn!(
                    "Job {}: stopped before the outcome was stored: {}",
                    job_id, reason
                );
                Ok(RunSummary {
                    outcome: Some(outcome),
                    acknowledged: false,
                    phases,
                })
            }
            ReportResult::TransientError(reason) => Err(anyhow::anyhow!(
                "Gave up storing the outcome of job {}: {}",
                job_id,
                reason
            )),
            ReportResult::Rejected(reason) => Err(anyhow::anyhow!(
                "Results store rejected the outcome of job {}: {}",
                job_id,
                reason
            )),
        }
    }

    async fn observe(&self, cancel: &CancellationToken, phases: &mut Vec<Phase>) -> Ending {
        let mut samples = Box::pin(self.monitor.samples(cancel.clone()));
        let mut window: VecDeque<ProgressSample> = VecDeque::with_capacity(WINDOW_SIZE);
        let mut state = State::Starting;

        loop {
            let termination = match state {
                State::Terminating { deadline, reason } => Some((deadline, reason)),
                _ => None,
            };

            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ending::Cancelled,
                reason = termination_deadline(termination) => {
                    warn!(
                        "Job {}: container did not exit within {:?} of termination",
                        self.identity.job_id, self.stall.termination_timeout
                    );
                    let started_at = window.iter().rev().find_map(|s| s.started_at);
                    return Ending::TerminationTimedOut { reason, started_at };
                }
                item = samples.next() => item,
            };

            let sample = match item {
                Some(Ok(sample)) => sample,
                Some(Err(lost)) => {
                    warn!(
                        "Job {}: {}; keeping last known state ({})",
                        self.identity.job_id,
                        lost,
                        state.phase()
                    );
                    continue;
                }
                None => return Ending::Cancelled,
            };

            if window.len() == WINDOW_SIZE {
                window.pop_front();
            }
            window.push_back(sample.clone());

            if sample.is_terminal() {
                let killed = match state {
                    State::Terminating { reason, .. } => Some(reason),
                    _ => None,
                };
                return Ending::Exited { sample, killed };
            }

            state = self.advance(state, &sample, &mut window, phases).await;
        }
    }

    /// Applies one non-terminal sample to the state machine
    async fn advance(
        &self,
        mut state: State,
        sample: &ProgressSample,
        window: &mut VecDeque<ProgressSample>,
        phases: &mut Vec<Phase>,
    ) -> State {
        if let State::Starting = state {
            if !sample.container_running {
                return state;
            }
            self.enter(phases, Phase::Running);
            state = State::Running;
        }

        let since = match state {
            State::Running => None,
            State::Stalled { since, .. } => Some(since),
            State::Starting | State::Terminating { .. } => return state,
        };

        match self.stall.detector.evaluate(window.make_contiguous()) {
            Verdict::Healthy => {
                if since.is_some() {
                    info!("Job {}: activity resumed", self.identity.job_id);
                    self.enter(phases, Phase::Running);
                }
                State::Running
            }
            Verdict::Stalled(reason) => {
                let since = match since {
                    Some(since) => since,
                    None => {
                        warn!(
                            "Job {}: looks stalled ({}), confirming for {:?}",
                            self.identity.job_id,
                            describe(reason),
                            self.stall.confirmation
                        );
                        self.enter(phases, Phase::Stalled);
                        Instant::now()
                    }
                };

                if since.elapsed() >= self.stall.confirmation {
                    self.terminate(reason, phases).await
                } else {
                    State::Stalled { since, reason }
                }
            }
        }
    }

    async fn terminate(&self, reason: StallReason, phases: &mut Vec<Phase>) -> State {
        warn!(
            "Job {}: stall confirmed ({}), terminating container",
            self.identity.job_id,
            describe(reason)
        );

        // The deadline covers a failed request as well
        if let Err(e) = self.pods.terminate_container().await {
            error!(
                "Failed to terminate container of job {}: {:#}",
                self.identity.job_id, e
            );
        }

        self.enter(phases, Phase::Terminating);
        State::Terminating {
            deadline: Instant::now() + self.stall.termination_timeout,
            reason,
        }
    }

    fn enter(&self, phases: &mut Vec<Phase>, phase: Phase) {
        let previous = phases.last().copied().unwrap_or(Phase::Starting);
        if phases.last() == Some(&phase) {
            return;
        }
        info!("Job {}: {} -> {}", self.identity.job_id, previous, phase);
        phases.push(phase);
    }

    async fn exit_outcome(&self, sample: &ProgressSample, killed: Option<StallReason>) -> JobOutcome {
        if let Some(reason) = killed {
            return self.killed_outcome(
                reason,
                sample.started_at,
                sample.exit_code,
                sample.finished_at,
            );
        }

        let mut outcome = self.base_outcome(
            OutcomeStatus::Failed,
            sample.started_at,
            sample.exit_code,
            sample.finished_at,
        );
        let lines = self.diagnostic_lines().await;

        if sample.exit_code == Some(0) {
            match logs::parse_job_output(&lines) {
                Some(output) => {
                    if output.is_successful() {
                        outcome.status = OutcomeStatus::Succeeded;
                    }
                    outcome.status_message = output.status_message.filter(|m| !m.is_empty());
                    outcome.stacktrace = output.stacktrace.filter(|s| !s.is_empty());
                    outcome.output_files = output.output_files;
                }
                None => outcome.status = OutcomeStatus::Succeeded,
            }
        } else {
            let details = logs::extract_failure(&lines);
            outcome.status_message = details.message;
            outcome.stacktrace = details.stacktrace;
        }

        outcome
    }

    fn killed_outcome(
        &self,
        reason: StallReason,
        started_at: Option<DateTime<Utc>>,
        exit_code: Option<i32>,
        finished_at: Option<DateTime<Utc>>,
    ) -> JobOutcome {
        let mut outcome =
            self.base_outcome(OutcomeStatus::StalledKilled, started_at, exit_code, finished_at);
        outcome.status_message = Some(describe(reason));
        outcome
    }

    fn base_outcome(
        &self,
        status: OutcomeStatus,
        started_at: Option<DateTime<Utc>>,
        exit_code: Option<i32>,
        finished_at: Option<DateTime<Utc>>,
    ) -> JobOutcome {
        JobOutcome {
            job_id: self.identity.job_id.clone(),
            run_id: self.identity.run_id.clone(),
            status,
            exit_code,
            started_at,
            finished_at: finished_at.unwrap_or_else(|| self.clock.now()),
            status_message: None,
            stacktrace: None,
            output_files: Vec::new(),
        }
    }

    /// Tail of the container log, empty if it cannot be read
    async fn diagnostic_lines(&self) -> Vec<String> {
        let retry = RetryPolicy::new(3, Duration::from_millis(500), Duration::from_secs(2));
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.pods.read_logs(None, Some(DIAGNOSTIC_LINES)).await {
                Ok(lines) => return lines.into_iter().map(|line| line.text).collect(),
                Err(e) if retry.can_retry(attempt) => {
                    warn!("Failed to read job logs (attempt {}): {:#}", attempt, e);
                    tokio::time::sleep(retry.delay_for(attempt)).await;
                }
                Err(e) => {
                    warn!("Reporting without log details: {:#}", e);
                    return Vec::new();
                }
            }
        }
    }
}

async fn termination_deadline(termination: Option<(Instant, StallReason)>) -> StallReason {
    match termination {
        Some((deadline, reason)) => {
            tokio::time::sleep_until(deadline).await;
            reason
        }
        None => std::future::pending().await,
    }
}

fn describe(reason: StallReason) -> String {
    match reason {
        StallReason::Inactive { idle } => {
            format!("no activity for {}s", idle.num_seconds())
        }
        StallReason::RuntimeExceeded { runtime } => {
            format!("running for {}s, over the runtime limit", runtime.num_seconds())
        }
    }
}
