//! Dedup record repository
//!
//! Tracks which request identifiers have been processed. Claiming is an
//! atomic compare-and-set so that two concurrent deliveries of the same
//! identifier, in this replica or another, cannot both proceed to submission.
//!
//! Claims are leases: a claim older than the lease belongs to a creator that
//! crashed mid-request and may be taken over.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use std::time::Duration;

/// Terminal states of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// A workload exists for the request
    Submitted,
    /// The request can never succeed and was routed to the dead-letter path
    DeadLettered,
}

impl RequestState {
    fn as_str(&self) -> &'static str {
        match self {
            RequestState::Submitted => "submitted",
            RequestState::DeadLettered => "dead_lettered",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "submitted" => Some(RequestState::Submitted),
            "dead_lettered" => Some(RequestState::DeadLettered),
            _ => None,
        }
    }
}

/// Result of trying to claim a request identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The caller now owns the request
    Claimed,
    /// The request already reached a terminal state
    Completed(RequestState),
    /// Another delivery holds a live claim
    HeldElsewhere,
}

/// Repository trait for the dedup record
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Atomically claims a request identifier
    ///
    /// # Arguments
    /// * `request_id` - The request identifier
    /// * `owner` - Token unique to this processing attempt
    async fn try_claim(&self, request_id: &str, owner: &str) -> Result<ClaimOutcome>;

    /// Marks a claimed request as terminal
    ///
    /// A no-op when the request is already terminal.
    async fn complete(
        &self,
        request_id: &str,
        owner: &str,
        state: RequestState,
        workload_name: Option<&str>,
    ) -> Result<()>;

    /// Gives up a claim so a redelivery can claim again
    async fn release(&self, request_id: &str, owner: &str) -> Result<()>;
}

/// PostgreSQL implementation of DedupStore
pub struct PgDedupStore {
    pool: PgPool,
    lease: chrono::TimeDelta,
}

impl PgDedupStore {
    pub fn new(pool: PgPool, lease: Duration) -> Self {
        Self {
            pool,
            lease: chrono::TimeDelta::from_std(lease).unwrap_or(chrono::TimeDelta::MAX),
        }
    }
}

#[async_trait]
impl DedupStore for PgDedupStore {
    async fn try_claim(&self, request_id: &str, owner: &str) -> Result<ClaimOutcome> {
        let now = Utc::now();
        let expired_before = now - self.lease;

        let claimed: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO job_requests (request_id, state, owner, claimed_at)
            VALUES ($1, 'claimed', $2, $3)
            ON CONFLICT (request_id) DO UPDATE
            SET owner = EXCLUDED.owner, claimed_at = EXCLUDED.claimed_at
            WHERE job_requests.state = 'claimed' AND job_requests.claimed_at < $4
            RETURNING request_id
            "#,
        )
        .bind(request_id)
        .bind(owner)
        .bind(now)
        .bind(expired_before)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to claim request")?;

        if claimed.is_some() {
            return Ok(ClaimOutcome::Claimed);
        }

        let state: Option<(String,)> =
            sqlx::query_as("SELECT state FROM job_requests WHERE request_id = $1")
                .bind(request_id)
                .fetch_optional(&self.pool)
                .await
                .context("Failed to read request state")?;

        // A row that vanished between the two statements was released by its
        // owner; the redelivery will claim it.
        Ok(state
            .and_then(|(s,)| RequestState::parse(&s))
            .map(ClaimOutcome::Completed)
            .unwrap_or(ClaimOutcome::HeldElsewhere))
    }

    async fn complete(
        &self,
        request_id: &str,
        owner: &str,
        state: RequestState,
        workload_name: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE job_requests
            SET state = $3, workload_name = $4, completed_at = $5
            WHERE request_id = $1 AND state = 'claimed' AND owner = $2
            "#,
        )
        .bind(request_id)
        .bind(owner)
        .bind(state.as_str())
        .bind(workload_name)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("Failed to complete request")?;

        if result.rows_affected() == 0 {
            tracing::warn!(
                "Claim on request {} was no longer held by {} when completing",
                request_id,
                owner
            );
        }

        Ok(())
    }

    async fn release(&self, request_id: &str, owner: &str) -> Result<()> {
        sqlx::query(
            "DELETE FROM job_requests WHERE request_id = $1 AND state = 'claimed' AND owner = $2",
        )
        .bind(request_id)
        .bind(owner)
        .execute(&self.pool)
        .await
        .context("Failed to release request")?;

        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::fake::InMemoryDedupStore;
    use super::*;

    #[tokio::test]
    async fn test_second_claim_is_held_elsewhere() {
        let store = InMemoryDedupStore::new(Duration::from_secs(600));

        assert_eq!(store.try_claim("r1", "a").await.unwrap(), ClaimOutcome::Claimed);
        assert_eq!(
            store.try_claim("r1", "b").await.unwrap(),
            ClaimOutcome::HeldElsewhere
        );
    }

    #[tokio::test]
    async fn test_completed_request_reports_state() {
        let store = InMemoryDedupStore::new(Duration::from_secs(600));

        store.try_claim("r1", "a").await.unwrap();
        store
            .complete("r1", "a", RequestState::Submitted, Some("jobctl-abc"))
            .await
            .unwrap();

        assert_eq!(
            store.try_claim("r1", "b").await.unwrap(),
            ClaimOutcome::Completed(RequestState::Submitted)
        );
    }

    #[tokio::test]
    async fn test_release_allows_reclaim() {
        let store = InMemoryDedupStore::new(Duration::from_secs(600));

        store.try_claim("r1", "a").await.unwrap();
        // Releasing someone else's claim does nothing
        store.release("r1", "b").await.unwrap();
        assert_eq!(
            store.try_claim("r1", "c").await.unwrap(),
            ClaimOutcome::HeldElsewhere
        );

        store.release("r1", "a").await.unwrap();
        assert_eq!(store.try_claim("r1", "c").await.unwrap(), ClaimOutcome::Claimed);
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let store = InMemoryDedupStore::new(Duration::ZERO);

        store.try_claim("r1", "crashed").await.unwrap();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(store.try_claim("r1", "b").await.unwrap(), ClaimOutcome::Claimed);

        // The crashed owner can no longer complete
        store
            .complete("r1", "crashed", RequestState::Submitted, None)
            .await
            .unwrap();
        assert_eq!(store.state("r1"), None);
    }

    #[test]
    fn test_state_names() {
        for state in [RequestState::Submitted, RequestState::DeadLettered] {
            assert_eq!(RequestState::parse(state.as_str()), Some(state));
        }
        assert_eq!(RequestState::parse("claimed"), None);
    }
}
