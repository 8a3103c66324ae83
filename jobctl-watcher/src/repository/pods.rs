//! Pod repository
//!
//! Everything the watcher needs from the cluster about its own pod:
//! - The primary container's state
//! - The primary container's log lines
//! - CPU usage from the metrics API
//! - Terminating the primary container and deleting the pod

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use kube::api::{
    ApiResource, AttachParams, DeleteParams, DynamicObject, GroupVersionKind, LogParams,
};
use kube::{Api, Client};

use jobctl_core::quantity::parse_quantity;

/// Primary container state as last reported by the kubelet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerObservation {
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ContainerObservation {
    fn from_status(status: &ContainerStatus) -> Self {
        let state = status.state.as_ref();

        if let Some(terminated) = state.and_then(|s| s.terminated.as_ref()) {
            return Self {
                running: false,
                started_at: terminated.started_at.as_ref().map(|t| t.0),
                exit_code: Some(terminated.exit_code),
                finished_at: terminated.finished_at.as_ref().map(|t| t.0),
            };
        }

        match state.and_then(|s| s.running.as_ref()) {
            Some(running) => Self {
                running: true,
                started_at: running.started_at.as_ref().map(|t| t.0),
                exit_code: None,
                finished_at: None,
            },
            None => Self {
                running: false,
                started_at: None,
                exit_code: None,
                finished_at: None,
            },
        }
    }
}

/// One log line of the primary container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    /// Kubelet timestamp; absent if the line could not be parsed
    pub timestamp: Option<DateTime<Utc>>,
    pub text: String,
}

impl LogLine {
    /// Parses a line fetched with `timestamps=true`
    pub fn parse(raw: &str) -> Self {
        let parsed = raw.split_once(' ').and_then(|(stamp, text)| {
            DateTime::parse_from_rfc3339(stamp)
                .ok()
                .map(|timestamp| (timestamp.with_timezone(&Utc), text))
        });

        match parsed {
            Some((timestamp, text)) => Self {
                timestamp: Some(timestamp),
                text: text.to_string(),
            },
            None => Self {
                timestamp: None,
                text: raw.to_string(),
            },
        }
    }
}

/// Repository trait for the supervised pod
#[async_trait]
pub trait PodRepository: Send + Sync {
    /// Returns the primary container's state, `None` until the kubelet reports it
    async fn container_state(&self) -> Result<Option<ContainerObservation>>;

    /// Reads log lines of the primary container
    ///
    /// # Arguments
    /// * `since` - Only lines at or after this instant
    /// * `tail_lines` - Only the last N lines
    async fn read_logs(
        &self,
        since: Option<DateTime<Utc>>,
        tail_lines: Option<i64>,
    ) -> Result<Vec<LogLine>>;

    /// Current CPU usage of the primary container, `None` while no metrics exist
    async fn cpu_millicores(&self) -> Result<Option<u64>>;

    /// Asks the primary container's main process to exit
    async fn terminate_container(&self) -> Result<()>;

    /// Deletes the whole pod without a grace period
    async fn delete_pod(&self) -> Result<()>;
}

/// Kubernetes implementation of PodRepository
pub struct KubePodRepository {
    pods: Api<Pod>,
    metrics: Api<DynamicObject>,
    pod_name: String,
    container: String,
}

impl KubePodRepository {
    /// Creates a repository bound to one container of one pod
    pub fn new(client: Client, namespace: &str, pod_name: String, container: String) -> Self {
        let gvk = GroupVersionKind::gvk("metrics.k8s.io", "v1beta1", "PodMetrics");
        let resource = ApiResource::from_gvk_with_plural(&gvk, "pods");

        Self {
            pods: Api::namespaced(client.clone(), namespace),
            metrics: Api::namespaced_with(client, namespace, &resource),
            pod_name,
            container,
        }
    }
}

#[async_trait]
impl PodRepository for KubePodRepository {
    async fn container_state(&self) -> Result<Option<ContainerObservation>> {
        let pod = self
            .pods
            .get(&self.pod_name)
            .await
            .with_context(|| format!("Failed to read pod {}", self.pod_name))?;

        let observation = pod
            .status
            .as_ref()
            .and_then(|status| status.container_statuses.as_ref())
            .and_then(|statuses| statuses.iter().find(|s| s.name == self.container))
            .map(ContainerObservation::from_status);

        Ok(observation)
    }

    async fn read_logs(
        &self,
        since: Option<DateTime<Utc>>,
        tail_lines: Option<i64>,
    ) -> Result<Vec<LogLine>> {
        let params = LogParams {
            container: Some(self.container.clone()),
            since_time: since,
            tail_lines,
            timestamps: true,
            ..Default::default()
        };

        let raw = self
            .pods
            .logs(&self.pod_name, &params)
            .await
            .with_context(|| format!("Failed to read logs of {}", self.container))?;

        Ok(raw
            .lines()
            .filter(|line| !line.is_empty())
            .map(LogLine::parse)
            .collect())
    }

    async fn cpu_millicores(&self) -> Result<Option<u64>> {
        let metrics = match self.metrics.get(&self.pod_name).await {
            Ok(metrics) => metrics,
            Err(kube::Error::Api(response)) if response.code == 404 => return Ok(None),
            Err(e) => return Err(e).context("Failed to read pod metrics"),
        };

        let usage = metrics.data["containers"]
            .as_array()
            .and_then(|containers| {
                containers
                    .iter()
                    .find(|c| c["name"].as_str() == Some(self.container.as_str()))
            })
            .and_then(|c| c["usage"]["cpu"].as_str());

        match usage {
            Some(cpu) => {
                let cores = parse_quantity(cpu).map_err(|e| anyhow::anyhow!(e))?;
                Ok(Some((cores * 1000.0).round() as u64))
            }
            None => Ok(None),
        }
    }

    /// Sends SIGTERM to the container's PID 1 through `kill` in a shell
    ///
    /// Needs `sh` and `kill` in the workload image. A PID 1 that installs no
    /// SIGTERM handler ignores the signal, so on such images this does
    /// nothing and the pod is deleted once the termination timeout passes.
    async fn terminate_container(&self) -> Result<()> {
        let params = AttachParams::default()
            .container(self.container.clone())
            .stdout(false)
            .stderr(true);

        let process = self
            .pods
            .exec(&self.pod_name, ["sh", "-c", "kill -TERM 1"], &params)
            .await
            .with_context(|| format!("Failed to exec into {}", self.container))?;

        process
            .join()
            .await
            .map_err(|e| anyhow::anyhow!("Termination command failed: {}", e))
    }

    async fn delete_pod(&self) -> Result<()> {
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            ..Default::default()
        };

        self.pods
            .delete(&self.pod_name, &params)
            .await
            .with_context(|| format!("Failed to delete pod {}", self.pod_name))?;

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory pod driven by a script of container states

    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakePods {
        /// States returned by successive polls; the last one repeats
        pub states: Mutex<VecDeque<Result<Option<ContainerObservation>, String>>>,
        pub logs: Mutex<Vec<LogLine>>,
        pub cpu: Mutex<Option<u64>>,
        /// State reported after `terminate_container`, if the kill works
        pub on_terminate: Mutex<Option<ContainerObservation>>,
        pub terminate_calls: Mutex<u32>,
        pub delete_calls: Mutex<u32>,
    }

    impl FakePods {
        pub fn push_state(&self, state: ContainerObservation) {
            self.states.lock().unwrap().push_back(Ok(Some(state)));
        }

        pub fn push_failure(&self, error: &str) {
            self.states
                .lock()
                .unwrap()
                .push_back(Err(error.to_string()));
        }

        pub fn push_log(&self, timestamp: DateTime<Utc>, text: &str) {
            self.logs.lock().unwrap().push(LogLine {
                timestamp: Some(timestamp),
                text: text.to_string(),
            });
        }

        pub fn terminate_calls(&self) -> u32 {
            *self.terminate_calls.lock().unwrap()
        }

        pub fn delete_calls(&self) -> u32 {
            *self.delete_calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl PodRepository for FakePods {
        async fn container_state(&self) -> Result<Option<ContainerObservation>> {
            let mut states = self.states.lock().unwrap();
            let next = if states.len() > 1 {
                states.pop_front()
            } else {
                states.front().cloned()
            };
            match next {
                Some(Ok(state)) => Ok(state),
                Some(Err(e)) => Err(anyhow::anyhow!(e)),
                None => Ok(None),
            }
        }

        async fn read_logs(
            &self,
            since: Option<DateTime<Utc>>,
            tail_lines: Option<i64>,
        ) -> Result<Vec<LogLine>> {
            let logs = self.logs.lock().unwrap();
            let mut lines: Vec<LogLine> = logs
                .iter()
                .filter(|line| match (since, line.timestamp) {
                    (Some(since), Some(ts)) => ts >= since,
                    _ => true,
                })
                .cloned()
                .collect();
            if let Some(tail) = tail_lines {
                let skip = lines.len().saturating_sub(tail as usize);
                lines.drain(..skip);
            }
            Ok(lines)
        }

        async fn cpu_millicores(&self) -> Result<Option<u64>> {
            Ok(*self.cpu.lock().unwrap())
        }

        async fn terminate_container(&self) -> Result<()> {
            *self.terminate_calls.lock().unwrap() += 1;
            if let Some(state) = self.on_terminate.lock().unwrap().clone() {
                let mut states = self.states.lock().unwrap();
                states.clear();
                states.push_back(Ok(Some(state)));
            }
            Ok(())
        }

        async fn delete_pod(&self) -> Result<()> {
            *self.delete_calls.lock().unwrap() += 1;
            Ok(())
        }
    }
}
