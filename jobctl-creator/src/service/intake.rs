//! Request intake
//!
//! Decides what happens to one delivered job request: dedup, translate,
//! submit, then acknowledge, leave for redelivery, or dead-letter. The
//! consumer applies the returned [`Disposition`] to the message.

use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use jobctl_core::Translator;
use jobctl_core::domain::request::JobRequest;

use crate::repository::DedupStore;
use crate::repository::dedup::{ClaimOutcome, RequestState};
use crate::service::submitter::{SubmitResult, Submitter};

/// What to do with the source message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Processing is done; acknowledge
    Ack,
    /// Leave unacknowledged so the source redelivers after its own backoff
    Retry(String),
    /// Can never succeed; route to the dead-letter path
    DeadLetter(String),
}

pub struct RequestIntake {
    replica_id: String,
    dedup: Arc<dyn DedupStore>,
    translator: Translator,
    submitter: Submitter,
}

impl RequestIntake {
    pub fn new(
        replica_id: String,
        dedup: Arc<dyn DedupStore>,
        translator: Translator,
        submitter: Submitter,
    ) -> Self {
        Self {
            replica_id,
            dedup,
            translator,
            submitter,
        }
    }

    /// Handles a raw message payload
    pub async fn handle(&self, payload: &[u8]) -> Disposition {
        match serde_json::from_slice::<JobRequest>(payload) {
            Ok(request) => self.process(&request).await,
            Err(e) => {
                warn!("Dead-lettering unparseable job request: {}", e);
                Disposition::DeadLetter(format!("malformed job request: {}", e))
            }
        }
    }

    /// Handles one job request
    pub async fn process(&self, request: &JobRequest) -> Disposition {
        let job_id = request.id.as_str();
        // Unique per attempt so concurrent deliveries never share a claim
        let owner = format!("{}/{}", self.replica_id, Uuid::new_v4());

        match self.dedup.try_claim(job_id, &owner).await {
            Ok(ClaimOutcome::Claimed) => {}
            Ok(ClaimOutcome::Completed(RequestState::Submitted)) => {
                info!("Job {} was already submitted, acknowledging", job_id);
                return Disposition::Ack;
            }
            Ok(ClaimOutcome::Completed(RequestState::DeadLettered)) => {
                // A previous dead-letter publish may not have gone through
                return Disposition::DeadLetter(format!("job {} was already rejected", job_id));
            }
            Ok(ClaimOutcome::HeldElsewhere) => {
                info!("Job {} is being processed by another delivery", job_id);
                return Disposition::Retry("claimed by another delivery".to_string());
            }
            Err(e) => {
                warn!("Dedup store unavailable for job {}: {:#}", job_id, e);
                return Disposition::Retry(format!("dedup store unavailable: {}", e));
            }
        }

        let descriptor = match self.translator.translate(request) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                warn!("Job {} is invalid: {}", job_id, e);
                self.finish(job_id, &owner, RequestState::DeadLettered, None)
                    .await;
                return Disposition::DeadLetter(e.to_string());
            }
        };

        match self
            .submitter
            .submit(&descriptor, &descriptor.idempotency_key)
            .await
        {
            SubmitResult::Created | SubmitResult::AlreadyExists => {
                self.finish(
                    job_id,
                    &owner,
                    RequestState::Submitted,
                    Some(&descriptor.name),
                )
                .await;
                Disposition::Ack
            }
            SubmitResult::QuotaRejected(reason) => {
                info!("Job {} hit the resource quota: {}", job_id, reason);
                self.release(job_id, &owner).await;
                Disposition::Retry(format!("quota exceeded: {}", reason))
            }
            SubmitResult::TransientError(cause) => {
                self.release(job_id, &owner).await;
                Disposition::Retry(cause)
            }
            SubmitResult::Rejected(reason) => {
                warn!("Cluster rejected workload for job {}: {}", job_id, reason);
                self.finish(job_id, &owner, RequestState::DeadLettered, None)
                    .await;
                Disposition::DeadLetter(format!("workload rejected: {}", reason))
            }
        }
    }

    /// Records a terminal state; failures only cost a duplicate check later
    async fn finish(
        &self,
        job_id: &str,
        owner: &str,
        state: RequestState,
        workload_name: Option<&str>,
    ) {
        if let Err(e) = self
            .dedup
            .complete(job_id, owner, state, workload_name)
            .await
        {
            warn!("Failed to record {:?} for job {}: {:#}", state, job_id, e);
        }
    }

    async fn release(&self, job_id: &str, owner: &str) {
        if let Err(e) = self.dedup.release(job_id, owner).await {
            // The lease expires on its own
            warn!("Failed to release claim on job {}: {:#}", job_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryDedupStore;
    use crate::repository::workloads::ClusterError;
    use crate::repository::workloads::fake::FakeWorkloads;
    use jobctl_core::domain::workload::idempotency_key;
    use jobctl_core::{RetryPolicy, TranslatorConfig, WatcherSettings};
    use std::time::Duration;

    struct Harness {
        intake: Arc<RequestIntake>,
        workloads: Arc<FakeWorkloads>,
        dedup: Arc<InMemoryDedupStore>,
    }

    fn harness() -> Harness {
        let workloads = Arc::new(FakeWorkloads::default());
        let dedup = Arc::new(InMemoryDedupStore::new(Duration::from_secs(600)));
        let translator = Translator::new(TranslatorConfig {
            namespace: "jobs".to_string(),
            watcher_image: "job-watcher:1".to_string(),
            service_account: None,
            ttl_seconds_after_finished: Some(21600),
            watcher: WatcherSettings::default(),
        });
        let submitter = Submitter::new(
            workloads.clone(),
            RetryPolicy::new(2, Duration::from_millis(10), Duration::from_millis(10)),
        );

        Harness {
            intake: Arc::new(RequestIntake::new(
                "creator-0".to_string(),
                dedup.clone(),
                translator,
                submitter,
            )),
            workloads,
            dedup,
        }
    }

    const BUSYBOX: &str = r#"{
        "id": "r1",
        "workload": {
            "image": "busybox",
            "command": ["true"],
            "resources": {"requests": {"cpu": "100m", "memory": "32Mi"}}
        }
    }"#;

    #[tokio::test]
    async fn test_valid_request_is_created_and_acked() {
        let h = harness();

        assert_eq!(h.intake.handle(BUSYBOX.as_bytes()).await, Disposition::Ack);
        assert_eq!(h.workloads.created(), 1);
        assert_eq!(h.dedup.state("r1"), Some(RequestState::Submitted));
    }

    #[tokio::test]
    async fn test_redelivery_after_completion_is_acked_without_submit() {
        let h = harness();

        h.intake.handle(BUSYBOX.as_bytes()).await;
        assert_eq!(h.intake.handle(BUSYBOX.as_bytes()).await, Disposition::Ack);
        assert_eq!(h.workloads.create_calls(), 1);
    }

    #[tokio::test]
    async fn test_existing_workload_is_acked() {
        // Workload created by an earlier delivery whose dedup record was lost
        let h = harness();
        h.workloads
            .workloads
            .lock()
            .unwrap()
            .insert(idempotency_key("r1"), "jobctl-existing".to_string());

        assert_eq!(h.intake.handle(BUSYBOX.as_bytes()).await, Disposition::Ack);
        assert_eq!(h.workloads.create_calls(), 0);
        assert_eq!(h.workloads.created(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_duplicates_create_once() {
        let h = harness();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let intake = h.intake.clone();
                tokio::spawn(async move { intake.handle(BUSYBOX.as_bytes()).await })
            })
            .collect();

        for handle in handles {
            let disposition = handle.await.unwrap();
            assert!(matches!(disposition, Disposition::Ack | Disposition::Retry(_)));
        }

        assert_eq!(h.workloads.created(), 1);
        assert_eq!(h.workloads.create_calls(), 1);
    }

    #[tokio::test]
    async fn test_invalid_request_is_dead_lettered() {
        let h = harness();
        let payload = r#"{"id": "r2", "workload": {"image": "busybox"}}"#;

        match h.intake.handle(payload.as_bytes()).await {
            Disposition::DeadLetter(reason) => assert!(reason.contains("workload.command")),
            other => panic!("expected dead letter, got {:?}", other),
        }
        assert_eq!(h.dedup.state("r2"), Some(RequestState::DeadLettered));
        assert_eq!(h.workloads.create_calls(), 0);
    }

    #[tokio::test]
    async fn test_unparseable_payload_is_dead_lettered() {
        let h = harness();
        assert!(matches!(
            h.intake.handle(b"not json").await,
            Disposition::DeadLetter(_)
        ));
    }

    #[tokio::test]
    async fn test_quota_leaves_message_for_redelivery() {
        let h = harness();
        h.workloads
            .fail_creates([ClusterError::QuotaExceeded("exceeded quota".to_string())]);

        assert!(matches!(
            h.intake.handle(BUSYBOX.as_bytes()).await,
            Disposition::Retry(_)
        ));
        assert_eq!(h.dedup.state("r1"), None);

        // The redelivery claims again and succeeds
        assert_eq!(h.intake.handle(BUSYBOX.as_bytes()).await, Disposition::Ack);
        assert_eq!(h.workloads.created(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_exhaustion_leaves_message_for_redelivery() {
        let h = harness();
        h.workloads.fail_creates([
            ClusterError::Transient("timeout".to_string()),
            ClusterError::Transient("timeout".to_string()),
        ]);

        assert_eq!(
            h.intake.handle(BUSYBOX.as_bytes()).await,
            Disposition::Retry("timeout".to_string())
        );
        assert_eq!(h.workloads.created(), 0);
    }

    #[tokio::test]
    async fn test_cluster_rejection_is_dead_lettered() {
        let h = harness();
        h.workloads
            .fail_creates([ClusterError::Rejected("invalid spec".to_string())]);

        assert!(matches!(
            h.intake.handle(BUSYBOX.as_bytes()).await,
            Disposition::DeadLetter(_)
        ));
        // A later redelivery does not try again
        assert!(matches!(
            h.intake.handle(BUSYBOX.as_bytes()).await,
            Disposition::DeadLetter(_)
        ));
        assert_eq!(h.workloads.create_calls(), 1);
    }
}
