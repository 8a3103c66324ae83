//! Job request domain types
//!
//! The payload delivered by the message source. Most fields default to empty
//! so that a request with a missing field still deserializes and the
//! translator can report exactly which field is missing.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A request to run one batch job
///
/// `id` is globally unique per logical job; redelivery of the same id must
/// never produce a second workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub id: String,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub workload: WorkloadSpec,
}

/// What to run and with which resources
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    #[serde(default)]
    pub image: String,
    /// Entrypoint; the first element is the executable
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub resources: ResourceBounds,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Input locations, mounted read-only
    #[serde(default)]
    pub inputs: Vec<InputMount>,
    /// Configuration mounted into the container
    #[serde(default)]
    pub config_maps: Vec<ConfigMount>,
    #[serde(default)]
    pub output: Option<OutputMount>,
    /// Node taints the job must tolerate (e.g. GPU nodes)
    #[serde(default)]
    pub taints: Vec<Taint>,
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceBounds {
    #[serde(default)]
    pub requests: ResourceList,
    #[serde(default)]
    pub limits: ResourceList,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceList {
    #[serde(default)]
    pub cpu: Option<String>,
    #[serde(default)]
    pub memory: Option<String>,
}

/// An existing persistent volume claim holding job input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputMount {
    pub claim_name: String,
    pub mount_path: String,
}

/// A config map mounted read-only
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigMount {
    pub name: String,
    pub mount_path: String,
}

/// Where the job writes its results
///
/// Without a claim the output lands in an `emptyDir` scratch volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputMount {
    #[serde(default)]
    pub claim_name: Option<String>,
    pub mount_path: String,
    #[serde(default)]
    pub size_limit: Option<String>,
}

/// A node taint, rendered as a pod toleration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Taint {
    pub key: String,
    #[serde(default)]
    pub operator: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub effect: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_request_deserializes() {
        let request: JobRequest = serde_json::from_str(
            r#"{"id": "r1", "workload": {"image": "busybox", "command": ["true"]}}"#,
        )
        .unwrap();

        assert_eq!(request.id, "r1");
        assert_eq!(request.workload.image, "busybox");
        assert_eq!(request.workload.command, vec!["true".to_string()]);
        assert!(request.run_id.is_none());
        assert!(request.workload.resources.requests.cpu.is_none());
    }

    #[test]
    fn test_missing_id_fails() {
        let result = serde_json::from_str::<JobRequest>(r#"{"workload": {}}"#);
        assert!(result.is_err());
    }
}
