//! Jobctl Creator
//!
//! Consumes job requests from JetStream and turns each one into exactly one
//! Kubernetes Job with a watcher companion container.
//!
//! Architecture:
//! - Configuration: flags or environment, validated at startup
//! - Repositories: dedup record (PostgreSQL) and workloads (Kubernetes)
//! - Services: request intake and workload submitter
//! - Consumer: JetStream pull loop with bounded concurrency
//! - API: liveness and readiness probes

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod api;
pub mod config;
pub mod consumer;
pub mod db;
pub mod manifest;
pub mod repository;
pub mod service;
pub mod shutdown;

use crate::api::Readiness;
use crate::config::Config;
use crate::consumer::RequestConsumer;
use crate::repository::{KubeWorkloadRepository, PgDedupStore};
use crate::service::{RequestIntake, Submitter};
use jobctl_core::Translator;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "jobctl_creator=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting jobctl creator");

    let config = Config::parse();
    config.validate().context("Invalid configuration")?;

    let shutdown = shutdown::install_shutdown_handler()?;

    info!("Connecting to database...");
    let pool = db::create_pool(&config.database_url)
        .await
        .context("Failed to create database pool")?;
    db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;

    let kube_client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    // Pod name when running in the cluster
    let replica_id =
        std::env::var("HOSTNAME").unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());
    info!(
        "Replica {} creating jobs in namespace {}",
        replica_id, config.job_namespace
    );

    let intake = Arc::new(RequestIntake::new(
        replica_id,
        Arc::new(PgDedupStore::new(pool, config.claim_lease())),
        Translator::new(config.translator()),
        Submitter::new(
            Arc::new(KubeWorkloadRepository::new(kube_client)),
            config.submit_retry(),
        ),
    ));

    // Probe server
    let readiness = Readiness::new(config.poll_interval() * 3);
    let app = api::create_router(readiness.clone());
    let listener = tokio::net::TcpListener::bind(&config.health_bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.health_bind_addr))?;
    info!("Probes listening on {}", config.health_bind_addr);

    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
    });

    let jetstream = consumer::connect(&config).await?;
    let pull_consumer = consumer::ensure_consumer(&jetstream, &config).await?;

    let result = RequestConsumer::new(intake, jetstream, &config, readiness)
        .run(pull_consumer, shutdown.clone())
        .await;

    if let Err(e) = &result {
        error!("Consumer stopped: {:#}", e);
    }

    // Stop the probe server whichever way the consumer ended
    shutdown.cancel();
    server
        .await
        .context("Probe server task failed")?
        .context("Probe server error")?;

    info!("Creator stopped");
    result
}
