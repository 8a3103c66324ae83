//! Watcher configuration
//!
//! The creator injects every option into the companion container as an
//! environment variable; flags exist for running the watcher by hand against
//! an existing pod.

use clap::Parser;
use std::time::Duration;

use jobctl_core::domain::progress::ActivityPolicy;
use jobctl_core::{RetryPolicy, StallDetector};

/// Watcher configuration
#[derive(Debug, Clone, Parser)]
#[command(name = "jobctl-watcher")]
#[command(about = "Supervises one job container to a terminal outcome", long_about = None)]
pub struct Config {
    /// Identifier of the job request this pod runs
    #[arg(long, env = "JOBCTL_JOB_ID")]
    pub job_id: String,

    #[arg(long, env = "JOBCTL_RUN_ID")]
    pub run_id: Option<String>,

    #[arg(long, env = "POD_NAME")]
    pub pod_name: String,

    #[arg(long, env = "POD_NAMESPACE")]
    pub pod_namespace: String,

    /// Name of the primary container to supervise
    #[arg(long, env = "CONTAINER_NAME", default_value = "main")]
    pub container_name: String,

    /// Results store base URL
    #[arg(long, env = "RESULTS_API_URL")]
    pub results_api_url: String,

    #[arg(long, env = "RESULTS_API_KEY", hide_env_values = true)]
    pub results_api_key: Option<String>,

    #[arg(long, env = "POLL_INTERVAL_SECS", default_value_t = 30)]
    pub poll_interval_secs: u64,

    #[arg(long, env = "INACTIVITY_THRESHOLD_SECS", default_value_t = 1800)]
    pub inactivity_threshold_secs: u64,

    /// How long a stall must persist before the container is killed
    #[arg(long, env = "STALL_CONFIRMATION_SECS", default_value_t = 120)]
    pub stall_confirmation_secs: u64,

    /// How long to wait for a killed container to exit
    #[arg(long, env = "TERMINATION_TIMEOUT_SECS", default_value_t = 60)]
    pub termination_timeout_secs: u64,

    /// Hard runtime limit; 0 disables it
    #[arg(long, env = "MAX_RUNTIME_SECS", default_value_t = 21600)]
    pub max_runtime_secs: u64,

    #[arg(long, env = "ACTIVITY_POLICY", default_value = "logs")]
    pub activity_policy: ActivityPolicy,

    /// Consecutive observation failures before observation counts as lost
    #[arg(long, env = "OBSERVATION_CEILING", default_value_t = 10)]
    pub observation_ceiling: u32,

    /// Attempts to store the outcome; 0 retries until stopped
    #[arg(long, env = "REPORT_MAX_ATTEMPTS", default_value_t = 0)]
    pub report_max_attempts: u32,

    #[arg(long, env = "BACKOFF_INITIAL_MS", default_value_t = 500)]
    pub backoff_initial_ms: u64,

    #[arg(long, env = "BACKOFF_MAX_MS", default_value_t = 30_000)]
    pub backoff_max_ms: u64,
}

impl Config {
    /// Validates the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.job_id.trim().is_empty() {
            anyhow::bail!("job_id cannot be empty");
        }

        if self.pod_name.is_empty() || self.pod_namespace.is_empty() {
            anyhow::bail!("pod_name and pod_namespace cannot be empty");
        }

        if self.container_name.is_empty() {
            anyhow::bail!("container_name cannot be empty");
        }

        if !self.results_api_url.starts_with("http://")
            && !self.results_api_url.starts_with("https://")
        {
            anyhow::bail!("results_api_url must start with http:// or https://");
        }

        if self.poll_interval_secs == 0 {
            anyhow::bail!("poll_interval_secs must be greater than 0");
        }

        if self.inactivity_threshold_secs <= self.poll_interval_secs {
            anyhow::bail!("inactivity_threshold_secs must be greater than poll_interval_secs");
        }

        if self.termination_timeout_secs == 0 {
            anyhow::bail!("termination_timeout_secs must be greater than 0");
        }

        if self.observation_ceiling == 0 {
            anyhow::bail!("observation_ceiling must be greater than 0");
        }

        if self.backoff_initial_ms == 0 || self.backoff_initial_ms > self.backoff_max_ms {
            anyhow::bail!("backoff_initial_ms must be in 1..=backoff_max_ms");
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn stall_confirmation(&self) -> Duration {
        Duration::from_secs(self.stall_confirmation_secs)
    }

    pub fn termination_timeout(&self) -> Duration {
        Duration::from_secs(self.termination_timeout_secs)
    }

    pub fn max_runtime(&self) -> Option<Duration> {
        (self.max_runtime_secs > 0).then(|| Duration::from_secs(self.max_runtime_secs))
    }

    pub fn stall_detector(&self) -> StallDetector {
        StallDetector::new(
            Duration::from_secs(self.inactivity_threshold_secs),
            self.max_runtime(),
        )
    }

    /// Backoff between failed observation calls
    pub fn observation_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.observation_ceiling,
            Duration::from_millis(self.backoff_initial_ms),
            Duration::from_millis(self.backoff_max_ms).min(self.poll_interval()),
        )
    }

    /// Backoff between failed outcome writes
    pub fn report_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.report_max_attempts,
            Duration::from_millis(self.backoff_initial_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }
}
