//! Workload repository
//!
//! Handles communication with the Kubernetes API for workloads:
//! - Looking a workload up by idempotency key
//! - Creating the Job rendered from a descriptor
//!
//! Every `kube::Error` is classified here so callers only see
//! [`ClusterError`].

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use kube::api::{Api, ListParams, PostParams};
use kube::Client;
use thiserror::Error;

use jobctl_core::domain::workload::{IDEMPOTENCY_KEY_LABEL, WorkloadDescriptor};

use crate::manifest;

/// Classified cluster API failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClusterError {
    #[error("workload already exists")]
    AlreadyExists,

    /// The namespace's resource quota refuses the workload
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The API server refuses the manifest itself; retrying cannot help
    #[error("workload rejected: {0}")]
    Rejected(String),

    #[error("transient cluster error: {0}")]
    Transient(String),
}

impl ClusterError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Repository trait for workload operations against the cluster
#[async_trait]
pub trait WorkloadRepository: Send + Sync {
    /// Finds the workload carrying an idempotency key
    ///
    /// Returns the workload name if one exists.
    async fn find_by_key(
        &self,
        namespace: &str,
        idempotency_key: &str,
    ) -> Result<Option<String>, ClusterError>;

    /// Creates the workload for a descriptor
    async fn create(&self, descriptor: &WorkloadDescriptor) -> Result<(), ClusterError>;
}

/// Kubernetes implementation of WorkloadRepository
pub struct KubeWorkloadRepository {
    client: Client,
}

impl KubeWorkloadRepository {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WorkloadRepository for KubeWorkloadRepository {
    async fn find_by_key(
        &self,
        namespace: &str,
        idempotency_key: &str,
    ) -> Result<Option<String>, ClusterError> {
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default()
            .labels(&format!("{}={}", IDEMPOTENCY_KEY_LABEL, idempotency_key))
            .limit(1);

        let list = jobs.list(&params).await.map_err(classify)?;

        Ok(list.items.into_iter().find_map(|job| job.metadata.name))
    }

    async fn create(&self, descriptor: &WorkloadDescriptor) -> Result<(), ClusterError> {
        let jobs: Api<Job> = Api::namespaced(self.client.clone(), &descriptor.namespace);
        let job = manifest::render_job(descriptor);

        jobs.create(&PostParams::default(), &job)
            .await
            .map(|_| ())
            .map_err(classify)
    }
}

/// Classifies a Kubernetes client error
pub fn classify(err: kube::Error) -> ClusterError {
    match err {
        kube::Error::Api(response) => match response.code {
            409 if response.reason == "AlreadyExists" => ClusterError::AlreadyExists,
            403 if response.message.contains("exceeded quota") => {
                ClusterError::QuotaExceeded(response.message)
            }
            400 | 422 => ClusterError::Rejected(response.message),
            // Conflicts other than AlreadyExists, auth problems, throttling
            // and server errors may all clear up on a later attempt
            _ => ClusterError::Transient(format!(
                "{} ({}): {}",
                response.reason, response.code, response.message
            )),
        },
        other => ClusterError::Transient(other.to_string()),
    }
}
