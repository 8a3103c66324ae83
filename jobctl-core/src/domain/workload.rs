//! Workload descriptor domain types
//!
//! The cluster-ready representation of a job request. It is plain data so
//! translation stays a pure function and can be compared for equality; the
//! creator renders it into a Kubernetes `Job` manifest at submission time.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::domain::request::{ResourceBounds, Taint};

/// Annotation holding the full job request identifier
pub const JOB_ID_ANNOTATION: &str = "jobctl.io/job-id";

/// Annotation holding the optional correlation/run identifier
pub const RUN_ID_ANNOTATION: &str = "jobctl.io/run-id";

/// Label used to find a workload by idempotency key
pub const IDEMPOTENCY_KEY_LABEL: &str = "jobctl.io/idempotency-key";

/// Label shared by every workload this system creates
pub const JOB_SOURCE_LABEL: &str = "jobctl.io/job-source";

/// Value of [`JOB_SOURCE_LABEL`]
pub const JOB_SOURCE: &str = "jobctl";

/// Name of the container running the job itself
pub const PRIMARY_CONTAINER: &str = "main";

/// Name of the companion container supervising the primary one
pub const WATCHER_CONTAINER: &str = "job-watcher";

const KEY_NAMESPACE: Uuid = Uuid::from_u128(0x8f0c_2b1e_4d7a_4c3b_9e51_6a2d_0b7f_13c4);

/// Derives the idempotency key for a request identifier
///
/// Request identifiers are arbitrary strings while label values are limited
/// to 63 characters of a restricted alphabet, so the key is a UUIDv5 of the
/// identifier: stable across redeliveries and always a valid label value.
pub fn idempotency_key(request_id: &str) -> String {
    Uuid::new_v5(&KEY_NAMESPACE, request_id.as_bytes()).to_string()
}

/// Deterministic workload name for an idempotency key
pub fn workload_name(idempotency_key: &str) -> String {
    format!("jobctl-{}", idempotency_key.replace('-', ""))
}

/// Everything needed to create the workload for one job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadDescriptor {
    pub name: String,
    pub namespace: String,
    pub idempotency_key: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub primary: ContainerSpec,
    pub watcher: ContainerSpec,
    pub volumes: Vec<VolumeSpec>,
    pub tolerations: Vec<Taint>,
    pub node_selector: BTreeMap<String, String>,
    pub service_account: Option<String>,
    pub ttl_seconds_after_finished: Option<i32>,
}

impl WorkloadDescriptor {
    /// The request identifier this workload was created for
    pub fn job_id(&self) -> Option<&str> {
        self.annotations.get(JOB_ID_ANNOTATION).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub env: Vec<EnvVarSpec>,
    pub resources: ResourceBounds,
    pub volume_mounts: Vec<VolumeMountSpec>,
}

impl ContainerSpec {
    /// Looks up a literal environment value by name
    pub fn env_value(&self, name: &str) -> Option<&str> {
        self.env.iter().find(|e| e.name == name).and_then(|e| match &e.source {
            EnvSource::Value(v) => Some(v.as_str()),
            _ => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVarSpec {
    pub name: String,
    pub source: EnvSource,
}

impl EnvVarSpec {
    pub fn value(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: EnvSource::Value(value.into()),
        }
    }

    pub fn pod_field(name: impl Into<String>, field_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: EnvSource::PodField(field_path.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvSource {
    Value(String),
    Secret { name: String, key: String },
    /// Downward API field path, e.g. `metadata.name`
    PodField(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub name: String,
    pub source: VolumeSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeSource {
    Claim { claim_name: String, read_only: bool },
    ConfigMap { name: String },
    EmptyDir { size_limit: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMountSpec {
    pub name: String,
    pub mount_path: String,
    pub read_only: bool,
}
