//! Outcome reporter
//!
//! Persists a terminal outcome, retrying transient store failures with
//! backoff. A store that already holds the outcome counts as acknowledged.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use jobctl_core::RetryPolicy;
use jobctl_core::domain::outcome::JobOutcome;

use crate::repository::{OutcomeRepository, StoreAck, StoreError};

/// Result of reporting one outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportResult {
    Acknowledged,
    /// Gave up on a transient failure (attempts exhausted or shutdown)
    TransientError(String),
    /// The store refused the outcome
    Rejected(String),
}

pub struct Reporter {
    outcomes: Arc<dyn OutcomeRepository>,
    retry: RetryPolicy,
}

impl Reporter {
    /// Creates a reporter
    ///
    /// `retry.max_attempts == 0` keeps retrying until cancelled.
    pub fn new(outcomes: Arc<dyn OutcomeRepository>, retry: RetryPolicy) -> Self {
        Self { outcomes, retry }
    }

    pub async fn report(&self, outcome: &JobOutcome, cancel: &CancellationToken) -> ReportResult {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let reason = match self.outcomes.put_outcome(outcome).await {
                Ok(StoreAck::Written) => {
                    info!(
                        "Stored outcome {} for job {} (attempt {})",
                        outcome.status, outcome.job_id, attempt
                    );
                    return ReportResult::Acknowledged;
                }
                Ok(StoreAck::AlreadyRecorded) => {
                    info!("Outcome for job {} was already recorded", outcome.job_id);
                    return ReportResult::Acknowledged;
                }
                Err(StoreError::Rejected { status, message }) => {
                    return ReportResult::Rejected(format!("{} - {}", status, message));
                }
                Err(StoreError::Transient(reason)) => reason,
            };

            if self.retry.max_attempts > 0 && !self.retry.can_retry(attempt) {
                return ReportResult::TransientError(reason);
            }

            let delay = self.retry.delay_for(attempt);
            warn!(
                "Failed to store outcome for job {} (attempt {}): {}; retrying in {:?}",
                outcome.job_id, attempt, reason, delay
            );

            tokio::select! {
                _ = cancel.cancelled() => return ReportResult::TransientError(reason),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::FakeOutcomes;
    use chrono::Utc;
    use jobctl_core::domain::outcome::OutcomeStatus;
    use std::time::Duration;

    fn outcome() -> JobOutcome {
        JobOutcome {
            job_id: "job-1".to_string(),
            run_id: None,
            status: OutcomeStatus::Succeeded,
            exit_code: Some(0),
            started_at: None,
            finished_at: Utc::now(),
            status_message: None,
            stacktrace: None,
            output_files: vec![],
        }
    }

    fn retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_secs(1), Duration::from_secs(8))
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_errors_until_written() {
        let store = Arc::new(FakeOutcomes::default());
        store.fail_with(StoreError::Transient("503".to_string()));
        store.fail_with(StoreError::Transient("timeout".to_string()));

        let reporter = Reporter::new(store.clone(), retry(0));
        let result = reporter.report(&outcome(), &CancellationToken::new()).await;

        assert_eq!(result, ReportResult::Acknowledged);
        assert_eq!(store.calls(), 3);
        assert_eq!(store.written().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_report_is_acknowledged() {
        let store = Arc::new(FakeOutcomes::default());
        let reporter = Reporter::new(store.clone(), retry(0));
        let cancel = CancellationToken::new();

        assert_eq!(
            reporter.report(&outcome(), &cancel).await,
            ReportResult::Acknowledged
        );
        assert_eq!(
            reporter.report(&outcome(), &cancel).await,
            ReportResult::Acknowledged
        );
        assert_eq!(store.written().len(), 1);
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let store = Arc::new(FakeOutcomes::default());
        store.fail_with(StoreError::Rejected {
            status: 422,
            message: "unknown status".to_string(),
        });

        let reporter = Reporter::new(store.clone(), retry(0));
        let result = reporter.report(&outcome(), &CancellationToken::new()).await;

        assert_eq!(
            result,
            ReportResult::Rejected("422 - unknown status".to_string())
        );
        assert_eq!(store.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let store = Arc::new(FakeOutcomes::default());
        for _ in 0..5 {
            store.fail_with(StoreError::Transient("503".to_string()));
        }

        let reporter = Reporter::new(store.clone(), retry(3));
        let result = reporter.report(&outcome(), &CancellationToken::new()).await;

        assert_eq!(result, ReportResult::TransientError("503".to_string()));
        assert_eq!(store.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_retrying() {
        let store = Arc::new(FakeOutcomes::default());
        for _ in 0..100 {
            store.fail_with(StoreError::Transient("503".to_string()));
        }
        let cancel = CancellationToken::new();
        cancel.cancel();

        let reporter = Reporter::new(store.clone(), retry(0));
        let result = reporter.report(&outcome(), &cancel).await;

        assert!(matches!(result, ReportResult::TransientError(_)));
        assert_eq!(store.calls(), 1);
    }
}
