//! Kubernetes manifest rendering
//!
//! Turns a [`WorkloadDescriptor`] into a `batch/v1 Job`. Pure: the cluster
//! call happens in the workload repository.

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Affinity, ConfigMapVolumeSource, Container, EmptyDirVolumeSource, EnvVar, EnvVarSource,
    ObjectFieldSelector, PersistentVolumeClaimVolumeSource, PodAffinityTerm, PodAntiAffinity,
    PodSpec, PodTemplateSpec, ResourceRequirements, SecretKeySelector, Toleration, Volume,
    VolumeMount, WeightedPodAffinityTerm,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use std::collections::BTreeMap;

use jobctl_core::domain::request::{ResourceList, Taint};
use jobctl_core::domain::workload::{
    ContainerSpec, EnvSource, EnvVarSpec, JOB_SOURCE, JOB_SOURCE_LABEL, VolumeSource, VolumeSpec,
    WorkloadDescriptor,
};

const HOSTNAME_TOPOLOGY_KEY: &str = "kubernetes.io/hostname";

/// Renders the Job for a workload descriptor
pub fn render_job(descriptor: &WorkloadDescriptor) -> Job {
    let metadata = ObjectMeta {
        name: Some(descriptor.name.clone()),
        namespace: Some(descriptor.namespace.clone()),
        labels: Some(descriptor.labels.clone()),
        annotations: Some(descriptor.annotations.clone()),
        ..Default::default()
    };

    let pod_spec = PodSpec {
        containers: vec![
            render_container(&descriptor.primary),
            render_container(&descriptor.watcher),
        ],
        restart_policy: Some("Never".to_string()),
        service_account_name: descriptor.service_account.clone(),
        volumes: non_empty(descriptor.volumes.iter().map(render_volume).collect()),
        tolerations: non_empty(descriptor.tolerations.iter().map(render_toleration).collect()),
        node_selector: (!descriptor.node_selector.is_empty())
            .then(|| descriptor.node_selector.clone()),
        affinity: Some(spread_affinity()),
        ..Default::default()
    };

    Job {
        metadata: metadata.clone(),
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            ttl_seconds_after_finished: descriptor.ttl_seconds_after_finished,
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: metadata.labels,
                    annotations: metadata.annotations,
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    (!items.is_empty()).then_some(items)
}

/// Prefer placing jobs from this system on different nodes
fn spread_affinity() -> Affinity {
    let selector = LabelSelector {
        match_labels: Some(BTreeMap::from([(
            JOB_SOURCE_LABEL.to_string(),
            JOB_SOURCE.to_string(),
        )])),
        ..Default::default()
    };

    Affinity {
        pod_anti_affinity: Some(PodAntiAffinity {
            preferred_during_scheduling_ignored_during_execution: Some(vec![
                WeightedPodAffinityTerm {
                    weight: 100,
                    pod_affinity_term: PodAffinityTerm {
                        label_selector: Some(selector),
                        topology_key: HOSTNAME_TOPOLOGY_KEY.to_string(),
                        ..Default::default()
                    },
                },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn render_container(spec: &ContainerSpec) -> Container {
    Container {
        name: spec.name.clone(),
        image: Some(spec.image.clone()),
        command: non_empty(spec.command.clone()),
        args: non_empty(spec.args.clone()),
        env: non_empty(spec.env.iter().map(render_env).collect()),
        resources: Some(ResourceRequirements {
            requests: render_resources(&spec.resources.requests),
            limits: render_resources(&spec.resources.limits),
            ..Default::default()
        }),
        volume_mounts: non_empty(
            spec.volume_mounts
                .iter()
                .map(|m| VolumeMount {
                    name: m.name.clone(),
                    mount_path: m.mount_path.clone(),
                    read_only: Some(m.read_only),
                    ..Default::default()
                })
                .collect(),
        ),
        ..Default::default()
    }
}

fn render_resources(list: &ResourceList) -> Option<BTreeMap<String, Quantity>> {
    let mut out = BTreeMap::new();
    if let Some(cpu) = &list.cpu {
        out.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    if let Some(memory) = &list.memory {
        out.insert("memory".to_string(), Quantity(memory.clone()));
    }
    (!out.is_empty()).then_some(out)
}

fn render_env(var: &EnvVarSpec) -> EnvVar {
    match &var.source {
        EnvSource::Value(value) => EnvVar {
            name: var.name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        },
        EnvSource::Secret { name, key } => EnvVar {
            name: var.name.clone(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: name.clone(),
                    key: key.clone(),
                    optional: Some(false),
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
        EnvSource::PodField(field_path) => EnvVar {
            name: var.name.clone(),
            value_from: Some(EnvVarSource {
                field_ref: Some(ObjectFieldSelector {
                    field_path: field_path.clone(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        },
    }
}

fn render_volume(volume: &VolumeSpec) -> Volume {
    let mut out = Volume {
        name: volume.name.clone(),
        ..Default::default()
    };

    match &volume.source {
        VolumeSource::Claim {
            claim_name,
            read_only,
        } => {
            out.persistent_volume_claim = Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim_name.clone(),
                read_only: Some(*read_only),
            });
        }
        VolumeSource::ConfigMap { name } => {
            out.config_map = Some(ConfigMapVolumeSource {
                name: name.clone(),
                ..Default::default()
            });
        }
        VolumeSource::EmptyDir { size_limit } => {
            out.empty_dir = Some(EmptyDirVolumeSource {
                size_limit: size_limit.clone().map(Quantity),
                ..Default::default()
            });
        }
    }

    out
}

fn render_toleration(taint: &Taint) -> Toleration {
    Toleration {
        key: Some(taint.key.clone()),
        operator: taint.operator.clone(),
        value: taint.value.clone(),
        effect: taint.effect.clone(),
        ..Default::default()
    }
}
