//! Outcomes repository
//!
//! Writes job outcomes to the results API. The API upserts by job
//! identifier, so writing the same outcome twice is harmless.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use thiserror::Error;

use jobctl_core::domain::outcome::JobOutcome;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Successful write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreAck {
    Written,
    /// The store already held an outcome for this job
    AlreadyRecorded,
}

/// Failed write
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Network error, timeout, throttling or server error
    #[error("transient results store error: {0}")]
    Transient(String),

    /// The store refused the outcome; retrying will not help
    #[error("results store rejected the outcome ({status}): {message}")]
    Rejected { status: u16, message: String },
}

/// Repository trait for the results store
#[async_trait]
pub trait OutcomeRepository: Send + Sync {
    /// Stores the outcome of one job
    async fn put_outcome(&self, outcome: &JobOutcome) -> Result<StoreAck, StoreError>;
}

/// HTTP implementation of OutcomeRepository
pub struct HttpOutcomeRepository {
    client: Client,
    base_url: reqwest::Url,
    api_key: Option<String>,
}

impl HttpOutcomeRepository {
    /// Creates a new HTTP outcome repository
    ///
    /// # Arguments
    /// * `base_url` - Base URL of the results API (e.g., "http://results:8080/api")
    /// * `api_key` - Bearer token, if the API requires one
    pub fn new(base_url: &str, api_key: Option<String>) -> anyhow::Result<Self> {
        let base_url = reqwest::Url::parse(base_url)
            .map_err(|e| anyhow::anyhow!("Invalid results API URL '{}': {}", base_url, e))?;

        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;

        Ok(Self {
            client,
            base_url,
            api_key,
        })
    }

    /// `{base}/jobs/{job_id}/outcome`, with the job id escaped as one segment
    pub fn outcome_url(&self, job_id: &str) -> Result<reqwest::Url, StoreError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::Rejected {
                status: 0,
                message: format!("{} cannot be a base URL", self.base_url),
            })?
            .pop_if_empty()
            .extend(["jobs", job_id, "outcome"]);
        Ok(url)
    }
}

#[async_trait]
impl OutcomeRepository for HttpOutcomeRepository {
    async fn put_outcome(&self, outcome: &JobOutcome) -> Result<StoreAck, StoreError> {
        let url = self.outcome_url(&outcome.job_id)?;

        let mut request = self.client.put(url).json(outcome);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| StoreError::Transient(format!("Failed to reach results API: {}", e)))?;

        let status = response.status();
        if status.is_success() || status == StatusCode::CONFLICT {
            return classify_status(status, String::new());
        }

        let body = response.text().await.unwrap_or_default();
        classify_status(status, body)
    }
}

/// Maps a results API status code onto the write result
pub fn classify_status(status: StatusCode, body: String) -> Result<StoreAck, StoreError> {
    if status.is_success() {
        return Ok(StoreAck::Written);
    }

    match status {
        StatusCode::CONFLICT => Ok(StoreAck::AlreadyRecorded),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            Err(StoreError::Transient(format!("{} - {}", status, body)))
        }
        s if s.is_server_error() => Err(StoreError::Transient(format!("{} - {}", status, body))),
        s => Err(StoreError::Rejected {
            status: s.as_u16(),
            message: body,
        }),
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Results store that fails according to a script, then accepts
    #[derive(Default)]
    pub struct FakeOutcomes {
        pub failures: Mutex<VecDeque<StoreError>>,
        pub calls: Mutex<u32>,
        pub written: Mutex<Vec<JobOutcome>>,
    }

    impl FakeOutcomes {
        pub fn fail_with(&self, error: StoreError) {
            self.failures.lock().unwrap().push_back(error);
        }

        pub fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }

        pub fn written(&self) -> Vec<JobOutcome> {
            self.written.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl OutcomeRepository for FakeOutcomes {
        async fn put_outcome(&self, outcome: &JobOutcome) -> Result<StoreAck, StoreError> {
            *self.calls.lock().unwrap() += 1;
            if let Some(error) = self.failures.lock().unwrap().pop_front() {
                return Err(error);
            }

            let mut written = self.written.lock().unwrap();
            if written.iter().any(|o| o.job_id == outcome.job_id) {
                return Ok(StoreAck::AlreadyRecorded);
            }
            written.push(outcome.clone());
            Ok(StoreAck::Written)
        }
    }
}
