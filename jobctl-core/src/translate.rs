//! Job specification translator
//!
//! Maps a [`JobRequest`] onto a [`WorkloadDescriptor`]. Translation is pure
//! and deterministic: the same request and configuration always produce an
//! equal descriptor, which is what makes redelivered requests safe to
//! re-translate before the idempotent submit.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use crate::domain::progress::ActivityPolicy;
use crate::domain::request::{JobRequest, ResourceBounds, ResourceList, Taint};
use crate::domain::workload::{
    self, ContainerSpec, EnvSource, EnvVarSpec, VolumeMountSpec, VolumeSource, VolumeSpec,
    WorkloadDescriptor, IDEMPOTENCY_KEY_LABEL, JOB_ID_ANNOTATION, JOB_SOURCE, JOB_SOURCE_LABEL,
    PRIMARY_CONTAINER, RUN_ID_ANNOTATION, WATCHER_CONTAINER,
};
use crate::error::ValidationError;
use crate::quantity::parse_quantity;

/// Annotation `kubectl logs` and `kubectl exec` use to pick a container
const DEFAULT_CONTAINER_ANNOTATION: &str = "kubectl.kubernetes.io/default-container";

const VALID_EFFECTS: [&str; 3] = ["NoSchedule", "PreferNoSchedule", "NoExecute"];
const VALID_OPERATORS: [&str; 2] = ["Exists", "Equal"];

/// Reference to one key of a Kubernetes Secret
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretKeyRef {
    pub name: String,
    pub key: String,
}

impl std::str::FromStr for SecretKeyRef {
    type Err = String;

    /// Parses `name/key`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((name, key)) if !name.is_empty() && !key.is_empty() => Ok(Self {
                name: name.to_string(),
                key: key.to_string(),
            }),
            _ => Err(format!("expected <secret-name>/<key>, got '{}'", s)),
        }
    }
}

/// Settings handed to the watcher companion through its environment
#[derive(Debug, Clone, PartialEq)]
pub struct WatcherSettings {
    pub results_api_url: String,
    pub results_api_key_secret: Option<SecretKeyRef>,
    pub poll_interval: Duration,
    pub inactivity_threshold: Duration,
    pub stall_confirmation: Duration,
    pub termination_timeout: Duration,
    pub max_runtime: Option<Duration>,
    pub activity_policy: ActivityPolicy,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        Self {
            results_api_url: String::new(),
            results_api_key_secret: None,
            poll_interval: Duration::from_secs(30),
            inactivity_threshold: Duration::from_secs(30 * 60),
            stall_confirmation: Duration::from_secs(120),
            termination_timeout: Duration::from_secs(60),
            max_runtime: Some(Duration::from_secs(6 * 60 * 60)),
            activity_policy: ActivityPolicy::LogOutput,
        }
    }
}

/// Deployment-wide translation settings
#[derive(Debug, Clone, PartialEq)]
pub struct TranslatorConfig {
    pub namespace: String,
    pub watcher_image: String,
    pub service_account: Option<String>,
    pub ttl_seconds_after_finished: Option<i32>,
    pub watcher: WatcherSettings,
}

/// Translates job requests into workload descriptors
#[derive(Debug, Clone)]
pub struct Translator {
    config: TranslatorConfig,
}

impl Translator {
    pub fn new(config: TranslatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TranslatorConfig {
        &self.config
    }

    /// Translates a request
    ///
    /// Fails with the first [`ValidationError`] found; such a request can
    /// never be turned into a workload and must not be retried.
    pub fn translate(&self, request: &JobRequest) -> Result<WorkloadDescriptor, ValidationError> {
        validate(request)?;

        let spec = &request.workload;
        let key = workload::idempotency_key(&request.id);
        let name = workload::workload_name(&key);

        let mut labels = BTreeMap::new();
        labels.insert(IDEMPOTENCY_KEY_LABEL.to_string(), key.clone());
        labels.insert(JOB_SOURCE_LABEL.to_string(), JOB_SOURCE.to_string());

        let mut annotations = BTreeMap::new();
        annotations.insert(JOB_ID_ANNOTATION.to_string(), request.id.clone());
        annotations.insert(
            DEFAULT_CONTAINER_ANNOTATION.to_string(),
            PRIMARY_CONTAINER.to_string(),
        );
        if let Some(run_id) = &request.run_id {
            annotations.insert(RUN_ID_ANNOTATION.to_string(), run_id.clone());
        }

        let mut volumes = Vec::new();
        let mut mounts = Vec::new();

        for (i, input) in spec.inputs.iter().enumerate() {
            let volume = format!("input-{}", i);
            volumes.push(VolumeSpec {
                name: volume.clone(),
                source: VolumeSource::Claim {
                    claim_name: input.claim_name.clone(),
                    read_only: true,
                },
            });
            mounts.push(VolumeMountSpec {
                name: volume,
                mount_path: input.mount_path.clone(),
                read_only: true,
            });
        }

        for (i, config_map) in spec.config_maps.iter().enumerate() {
            let volume = format!("config-{}", i);
            volumes.push(VolumeSpec {
                name: volume.clone(),
                source: VolumeSource::ConfigMap {
                    name: config_map.name.clone(),
                },
            });
            mounts.push(VolumeMountSpec {
                name: volume,
                mount_path: config_map.mount_path.clone(),
                read_only: true,
            });
        }

        if let Some(output) = &spec.output {
            let source = match &output.claim_name {
                Some(claim_name) => VolumeSource::Claim {
                    claim_name: claim_name.clone(),
                    read_only: false,
                },
                None => VolumeSource::EmptyDir {
                    size_limit: output.size_limit.clone(),
                },
            };
            volumes.push(VolumeSpec {
                name: "output".to_string(),
                source,
            });
            mounts.push(VolumeMountSpec {
                name: "output".to_string(),
                mount_path: output.mount_path.clone(),
                read_only: false,
            });
        }

        let mut env: Vec<EnvVarSpec> = spec
            .env
            .iter()
            .filter(|(name, _)| name.as_str() != "PYTHONUNBUFFERED")
            .map(|(name, value)| EnvVarSpec::value(name, value))
            .collect();
        env.push(EnvVarSpec::value("PYTHONUNBUFFERED", "1"));

        let primary = ContainerSpec {
            name: PRIMARY_CONTAINER.to_string(),
            image: spec.image.clone(),
            command: spec.command.clone(),
            args: spec.args.clone(),
            env,
            resources: spec.resources.clone(),
            volume_mounts: mounts,
        };

        Ok(WorkloadDescriptor {
            name,
            namespace: self.config.namespace.clone(),
            idempotency_key: key,
            labels,
            annotations,
            primary,
            watcher: self.watcher_container(request),
            volumes,
            tolerations: spec.taints.clone(),
            node_selector: spec.node_selector.clone(),
            service_account: self.config.service_account.clone(),
            ttl_seconds_after_finished: self.config.ttl_seconds_after_finished,
        })
    }

    fn watcher_container(&self, request: &JobRequest) -> ContainerSpec {
        let settings = &self.config.watcher;

        let mut env = vec![
            EnvVarSpec::value("JOBCTL_JOB_ID", &request.id),
            EnvVarSpec::pod_field("POD_NAME", "metadata.name"),
            EnvVarSpec::pod_field("POD_NAMESPACE", "metadata.namespace"),
            EnvVarSpec::value("CONTAINER_NAME", PRIMARY_CONTAINER),
            EnvVarSpec::value("RESULTS_API_URL", &settings.results_api_url),
            EnvVarSpec::value("POLL_INTERVAL_SECS", secs(settings.poll_interval)),
            EnvVarSpec::value(
                "INACTIVITY_THRESHOLD_SECS",
                secs(settings.inactivity_threshold),
            ),
            EnvVarSpec::value(
                "STALL_CONFIRMATION_SECS",
                secs(settings.stall_confirmation),
            ),
            EnvVarSpec::value(
                "TERMINATION_TIMEOUT_SECS",
                secs(settings.termination_timeout),
            ),
            EnvVarSpec::value("ACTIVITY_POLICY", settings.activity_policy.to_string()),
        ];

        if let Some(run_id) = &request.run_id {
            env.push(EnvVarSpec::value("JOBCTL_RUN_ID", run_id));
        }
        if let Some(max_runtime) = settings.max_runtime {
            env.push(EnvVarSpec::value("MAX_RUNTIME_SECS", secs(max_runtime)));
        }
        if let Some(secret) = &settings.results_api_key_secret {
            env.push(EnvVarSpec {
                name: "RESULTS_API_KEY".to_string(),
                source: EnvSource::Secret {
                    name: secret.name.clone(),
                    key: secret.key.clone(),
                },
            });
        }

        ContainerSpec {
            name: WATCHER_CONTAINER.to_string(),
            image: self.config.watcher_image.clone(),
            command: Vec::new(),
            args: Vec::new(),
            env,
            resources: ResourceBounds {
                requests: ResourceList {
                    cpu: Some("50m".to_string()),
                    memory: Some("64Mi".to_string()),
                },
                limits: ResourceList {
                    cpu: None,
                    memory: Some("128Mi".to_string()),
                },
            },
            volume_mounts: Vec::new(),
        }
    }
}

fn secs(duration: Duration) -> String {
    duration.as_secs().to_string()
}

fn validate(request: &JobRequest) -> Result<(), ValidationError> {
    if request.id.trim().is_empty() {
        return Err(ValidationError::missing("id"));
    }

    let spec = &request.workload;

    if spec.image.trim().is_empty() {
        return Err(ValidationError::missing("workload.image"));
    }
    if spec.image.chars().any(char::is_whitespace) {
        return Err(ValidationError::new(
            "workload.image",
            "must not contain whitespace",
        ));
    }
    if spec.command.is_empty() || spec.command[0].trim().is_empty() {
        return Err(ValidationError::missing("workload.command"));
    }

    validate_resources(&spec.resources)?;

    for name in spec.env.keys() {
        if name.is_empty() || name.contains('=') {
            return Err(ValidationError::new(
                "workload.env",
                format!("'{}' is not a valid variable name", name),
            ));
        }
    }

    let mut paths = HashSet::new();
    let mut check_path = |field: &str, path: &str| -> Result<(), ValidationError> {
        if !path.starts_with('/') {
            return Err(ValidationError::new(
                field,
                format!("mount path '{}' must be absolute", path),
            ));
        }
        if !paths.insert(path.trim_end_matches('/').to_string()) {
            return Err(ValidationError::new(
                field,
                format!("mount path '{}' is used twice", path),
            ));
        }
        Ok(())
    };

    for input in &spec.inputs {
        if input.claim_name.trim().is_empty() {
            return Err(ValidationError::missing("workload.inputs.claim_name"));
        }
        check_path("workload.inputs.mount_path", &input.mount_path)?;
    }
    for config_map in &spec.config_maps {
        if config_map.name.trim().is_empty() {
            return Err(ValidationError::missing("workload.config_maps.name"));
        }
        check_path("workload.config_maps.mount_path", &config_map.mount_path)?;
    }
    if let Some(output) = &spec.output {
        check_path("workload.output.mount_path", &output.mount_path)?;
        if let Some(limit) = &output.size_limit {
            parse_quantity(limit)
                .map_err(|e| ValidationError::new("workload.output.size_limit", e))?;
        }
    }

    spec.taints.iter().try_for_each(validate_taint)
}

fn validate_resources(resources: &ResourceBounds) -> Result<(), ValidationError> {
    let requests = &resources.requests;
    let limits = &resources.limits;

    let cpu = required_quantity("workload.resources.requests.cpu", &requests.cpu)?;
    let memory = required_quantity("workload.resources.requests.memory", &requests.memory)?;

    if let Some(limit) = optional_quantity("workload.resources.limits.cpu", &limits.cpu)? {
        if cpu > limit {
            return Err(ValidationError::new(
                "workload.resources.requests.cpu",
                "exceeds the cpu limit",
            ));
        }
    }
    if let Some(limit) = optional_quantity("workload.resources.limits.memory", &limits.memory)? {
        if memory > limit {
            return Err(ValidationError::new(
                "workload.resources.requests.memory",
                "exceeds the memory limit",
            ));
        }
    }

    Ok(())
}

fn required_quantity(field: &str, raw: &Option<String>) -> Result<f64, ValidationError> {
    optional_quantity(field, raw)?.ok_or_else(|| ValidationError::missing(field))
}

fn optional_quantity(field: &str, raw: &Option<String>) -> Result<Option<f64>, ValidationError> {
    match raw.as_deref() {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => parse_quantity(raw)
            .map(Some)
            .map_err(|e| ValidationError::new(field, e)),
    }
}

fn validate_taint(taint: &Taint) -> Result<(), ValidationError> {
    if taint.key.trim().is_empty() {
        return Err(ValidationError::missing("workload.taints.key"));
    }
    if let Some(effect) = &taint.effect {
        if !VALID_EFFECTS.contains(&effect.as_str()) {
            return Err(ValidationError::new(
                "workload.taints.effect",
                format!("unknown effect '{}'", effect),
            ));
        }
    }
    if let Some(operator) = &taint.operator {
        if !VALID_OPERATORS.contains(&operator.as_str()) {
            return Err(ValidationError::new(
                "workload.taints.operator",
                format!("unknown operator '{}'", operator),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::request::{InputMount, OutputMount, WorkloadSpec};

    fn translator() -> Translator {
        Translator::new(TranslatorConfig {
            namespace: "jobs".to_string(),
            watcher_image: "registry.local/job-watcher:1".to_string(),
            service_account: Some("job-watcher".to_string()),
            ttl_seconds_after_finished: Some(21600),
            watcher: WatcherSettings {
                results_api_url: "http://results.local".to_string(),
                results_api_key_secret: Some(SecretKeyRef {
                    name: "results-api".to_string(),
                    key: "api-key".to_string(),
                }),
                ..WatcherSettings::default()
            },
        })
    }

    fn request() -> JobRequest {
        JobRequest {
            id: "req-42".to_string(),
            run_id: Some("run-7".to_string()),
            workload: WorkloadSpec {
                image: "python:3.12".to_string(),
                command: vec!["python".to_string(), "main.py".to_string()],
                resources: ResourceBounds {
                    requests: ResourceList {
                        cpu: Some("500m".to_string()),
                        memory: Some("1Gi".to_string()),
                    },
                    limits: ResourceList {
                        cpu: Some("2".to_string()),
                        memory: Some("2Gi".to_string()),
                    },
                },
                inputs: vec![InputMount {
                    claim_name: "dataset".to_string(),
                    mount_path: "/data/in".to_string(),
                }],
                output: Some(OutputMount {
                    claim_name: None,
                    mount_path: "/data/out".to_string(),
                    size_limit: Some("10Gi".to_string()),
                }),
                ..WorkloadSpec::default()
            },
        }
    }

    #[test]
    fn test_translation_is_deterministic() {
        let t = translator();
        assert_eq!(t.translate(&request()), t.translate(&request()));
    }

    #[test]
    fn test_descriptor_carries_request_identity() {
        let descriptor = translator().translate(&request()).unwrap();

        assert_eq!(descriptor.job_id(), Some("req-42"));
        assert_eq!(descriptor.annotations[RUN_ID_ANNOTATION], "run-7");
        assert_eq!(
            descriptor.labels[IDEMPOTENCY_KEY_LABEL],
            workload::idempotency_key("req-42")
        );
        assert_eq!(descriptor.idempotency_key, workload::idempotency_key("req-42"));
        assert_eq!(descriptor.namespace, "jobs");
        assert_eq!(descriptor.watcher.env_value("JOBCTL_JOB_ID"), Some("req-42"));
        assert_eq!(descriptor.watcher.env_value("JOBCTL_RUN_ID"), Some("run-7"));
    }

    #[test]
    fn test_volumes_and_mounts() {
        let descriptor = translator().translate(&request()).unwrap();

        assert_eq!(descriptor.volumes.len(), 2);
        assert_eq!(
            descriptor.volumes[0].source,
            VolumeSource::Claim {
                claim_name: "dataset".to_string(),
                read_only: true
            }
        );
        assert_eq!(
            descriptor.volumes[1].source,
            VolumeSource::EmptyDir {
                size_limit: Some("10Gi".to_string())
            }
        );
        assert!(descriptor.primary.volume_mounts[0].read_only);
        assert!(!descriptor.primary.volume_mounts[1].read_only);
    }

    #[test]
    fn test_watcher_env() {
        let descriptor = translator().translate(&request()).unwrap();
        let watcher = &descriptor.watcher;

        assert_eq!(watcher.name, WATCHER_CONTAINER);
        assert_eq!(watcher.env_value("CONTAINER_NAME"), Some(PRIMARY_CONTAINER));
        assert_eq!(watcher.env_value("INACTIVITY_THRESHOLD_SECS"), Some("1800"));
        assert_eq!(watcher.env_value("MAX_RUNTIME_SECS"), Some("21600"));
        assert_eq!(watcher.env_value("ACTIVITY_POLICY"), Some("logs"));

        let key = watcher
            .env
            .iter()
            .find(|e| e.name == "RESULTS_API_KEY")
            .unwrap();
        assert_eq!(
            key.source,
            EnvSource::Secret {
                name: "results-api".to_string(),
                key: "api-key".to_string()
            }
        );
        assert_eq!(
            descriptor.primary.env_value("PYTHONUNBUFFERED"),
            Some("1")
        );
    }

    #[test]
    fn test_missing_required_fields() {
        let t = translator();

        let mut r = request();
        r.workload.image = String::new();
        assert_eq!(t.translate(&r).unwrap_err().field, "workload.image");

        let mut r = request();
        r.workload.command.clear();
        assert_eq!(t.translate(&r).unwrap_err().field, "workload.command");

        let mut r = request();
        r.workload.resources.requests.memory = None;
        assert_eq!(
            t.translate(&r).unwrap_err().field,
            "workload.resources.requests.memory"
        );

        let mut r = request();
        r.id = " ".to_string();
        assert_eq!(t.translate(&r).unwrap_err().field, "id");
    }

    #[test]
    fn test_malformed_fields() {
        let t = translator();

        let mut r = request();
        r.workload.resources.requests.cpu = Some("lots".to_string());
        assert_eq!(
            t.translate(&r).unwrap_err().field,
            "workload.resources.requests.cpu"
        );

        let mut r = request();
        r.workload.resources.requests.memory = Some("4Gi".to_string());
        assert_eq!(
            t.translate(&r).unwrap_err().reason,
            "exceeds the memory limit"
        );

        let mut r = request();
        r.workload.inputs[0].mount_path = "relative/path".to_string();
        assert!(t.translate(&r).is_err());

        let mut r = request();
        r.workload.inputs[0].mount_path = "/data/out".to_string();
        assert!(t.translate(&r).unwrap_err().reason.contains("used twice"));

        let mut r = request();
        r.workload.taints.push(Taint {
            key: "gpu".to_string(),
            operator: Some("Exists".to_string()),
            value: None,
            effect: Some("Sometimes".to_string()),
        });
        assert_eq!(t.translate(&r).unwrap_err().field, "workload.taints.effect");
    }

    #[test]
    fn test_secret_key_ref_parse() {
        let secret: SecretKeyRef = "results-api/api-key".parse().unwrap();
        assert_eq!(secret.name, "results-api");
        assert_eq!(secret.key, "api-key");
        assert!("no-key".parse::<SecretKeyRef>().is_err());
        assert!("/key".parse::<SecretKeyRef>().is_err());
    }
}
