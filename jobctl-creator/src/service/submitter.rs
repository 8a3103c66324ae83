//! Workload submitter
//!
//! Creates the workload for a descriptor unless one with the same idempotency
//! key already exists. Transient cluster errors are retried here with
//! exponential backoff; everything else is surfaced to the caller.

use std::sync::Arc;
use tracing::{info, warn};

use jobctl_core::RetryPolicy;
use jobctl_core::domain::workload::WorkloadDescriptor;

use crate::repository::WorkloadRepository;
use crate::repository::workloads::ClusterError;

/// Classified result of a submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitResult {
    Created,
    /// A workload with the idempotency key already exists; nothing was created
    AlreadyExists,
    /// Non-retriable here; the caller decides on backoff or requeue
    QuotaRejected(String),
    /// Retries were exhausted
    TransientError(String),
    /// The cluster refused the descriptor itself
    Rejected(String),
}

pub struct Submitter {
    workloads: Arc<dyn WorkloadRepository>,
    retry: RetryPolicy,
}

impl Submitter {
    pub fn new(workloads: Arc<dyn WorkloadRepository>, retry: RetryPolicy) -> Self {
        Self { workloads, retry }
    }

    /// Submits a descriptor under an idempotency key
    pub async fn submit(&self, descriptor: &WorkloadDescriptor, idempotency_key: &str) -> SubmitResult {
        let mut attempt = 0;

        loop {
            attempt += 1;

            match self.submit_once(descriptor, idempotency_key).await {
                Ok(result) => {
                    if attempt > 1 {
                        info!(
                            "Submitted workload {} after {} attempt(s)",
                            descriptor.name, attempt
                        );
                    }
                    return result;
                }
                Err(cause) => {
                    if !self.retry.can_retry(attempt) {
                        warn!(
                            "Giving up on workload {} after {} attempts: {}",
                            descriptor.name, attempt, cause
                        );
                        return SubmitResult::TransientError(cause);
                    }

                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        "Transient error submitting workload {} (attempt {}/{}): {}; retrying in {:?}",
                        descriptor.name, attempt, self.retry.max_attempts, cause, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// One lookup-then-create round; `Err` carries a transient cause
    async fn submit_once(
        &self,
        descriptor: &WorkloadDescriptor,
        idempotency_key: &str,
    ) -> Result<SubmitResult, String> {
        match self
            .workloads
            .find_by_key(&descriptor.namespace, idempotency_key)
            .await
        {
            Ok(Some(existing)) => {
                info!(
                    "Workload {} already exists for key {}",
                    existing, idempotency_key
                );
                return Ok(SubmitResult::AlreadyExists);
            }
            Ok(None) => {}
            Err(ClusterError::Transient(cause)) => return Err(cause),
            Err(other) => return Ok(classified(other)),
        }

        match self.workloads.create(descriptor).await {
            Ok(()) => {
                info!(
                    "Created workload {} in namespace {}",
                    descriptor.name, descriptor.namespace
                );
                Ok(SubmitResult::Created)
            }
            // Lost a race with another creator between lookup and create
            Err(ClusterError::AlreadyExists) => Ok(SubmitResult::AlreadyExists),
            Err(ClusterError::Transient(cause)) => Err(cause),
            Err(other) => Ok(classified(other)),
        }
    }
}

fn classified(err: ClusterError) -> SubmitResult {
    match err {
        ClusterError::AlreadyExists => SubmitResult::AlreadyExists,
        ClusterError::QuotaExceeded(reason) => SubmitResult::QuotaRejected(reason),
        ClusterError::Rejected(reason) => SubmitResult::Rejected(reason),
        ClusterError::Transient(cause) => SubmitResult::TransientError(cause),
    }
}
