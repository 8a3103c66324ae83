//! Jobctl Watcher
//!
//! Companion process running inside each job pod. It supervises the primary
//! container until it exits or stalls, then stores the job outcome.
//!
//! Architecture:
//! - Configuration: environment injected by the creator, validated at startup
//! - Repositories: the pod (Kubernetes API) and the results store (HTTP)
//! - Services: progress monitor, outcome reporter, log post-processing
//! - Supervisor: the per-job state machine tying them together

mod config;
mod repository;
mod service;
mod shutdown;
mod supervisor;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::repository::{HttpOutcomeRepository, KubePodRepository, PodRepository};
use crate::service::{Clock, ProgressMonitor, Reporter, SystemClock};
use crate::supervisor::{JobIdentity, StallPolicy, Supervisor};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jobctl_watcher=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting jobctl watcher");

    let config = Config::parse();
    config.validate().context("Invalid configuration")?;
    info!(
        "Watching container {} of pod {}/{} for job {} (activity: {})",
        config.container_name,
        config.pod_namespace,
        config.pod_name,
        config.job_id,
        config.activity_policy
    );

    let shutdown = shutdown::install_shutdown_handler()?;

    let kube_client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let pods: Arc<dyn PodRepository> = Arc::new(KubePodRepository::new(
        kube_client,
        &config.pod_namespace,
        config.pod_name.clone(),
        config.container_name.clone(),
    ));
    let outcomes = Arc::new(HttpOutcomeRepository::new(
        &config.results_api_url,
        config.results_api_key.clone(),
    )?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let monitor = ProgressMonitor::new(
        Arc::clone(&pods),
        Arc::clone(&clock),
        config.activity_policy.clone(),
        config.poll_interval(),
        config.observation_retry(),
    );

    let supervisor = Supervisor::new(
        JobIdentity {
            job_id: config.job_id.clone(),
            run_id: config.run_id.clone(),
        },
        pods,
        monitor,
        Reporter::new(outcomes, config.report_retry()),
        clock,
        StallPolicy {
            detector: config.stall_detector(),
            confirmation: config.stall_confirmation(),
            termination_timeout: config.termination_timeout(),
        },
    );

    match supervisor.run(shutdown).await {
        Ok(summary) => {
            let phases: Vec<String> = summary.phases.iter().map(|p| p.to_string()).collect();
            match (&summary.outcome, summary.acknowledged) {
                (Some(outcome), true) => info!("Outcome {} stored", outcome.status),
                (Some(outcome), false) => info!("Outcome {} left unstored", outcome.status),
                (None, _) => info!("No verdict reached"),
            }
            info!("Watcher done (phases: {})", phases.join(" -> "));
            Ok(())
        }
        Err(e) => {
            error!("Watcher failed: {:#}", e);
            Err(e)
        }
    }
}
