//! JetStream consumer
//!
//! Pulls job requests from a durable pull consumer and hands each one to the
//! request intake, at most `max_in_flight` at a time. The consumer's
//! `max_ack_pending` is set to the same bound so the server never leases out
//! more messages than this replica can work on before the ack wait expires.
//!
//! Redelivery is entirely the server's business: a message that should be
//! retried is simply left unacknowledged.

use anyhow::{Context, Result};
use async_nats::jetstream::{self, AckKind, consumer::PullConsumer};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Interval;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::Readiness;
use crate::config::Config;
use crate::service::{Disposition, RequestIntake};

/// Header carrying the reason a message was dead-lettered
pub const DEAD_LETTER_REASON_HEADER: &str = "Jobctl-Dead-Letter-Reason";

/// Connects to NATS and returns a JetStream context
pub async fn connect(config: &Config) -> Result<jetstream::Context> {
    let options = match (&config.nats_user, &config.nats_password) {
        (Some(user), Some(password)) => {
            async_nats::ConnectOptions::with_user_and_password(user.clone(), password.clone())
        }
        _ => async_nats::ConnectOptions::new(),
    };

    let client = options
        .name("jobctl-creator")
        .connect(config.nats_url.as_str())
        .await
        .with_context(|| format!("Failed to connect to NATS at {}", config.nats_url))?;

    info!("Connected to NATS at {}", config.nats_url);
    Ok(jetstream::new(client))
}

/// Ensures the stream and the durable consumer exist
pub async fn ensure_consumer(
    jetstream: &jetstream::Context,
    config: &Config,
) -> Result<PullConsumer> {
    let stream = jetstream
        .get_or_create_stream(jetstream::stream::Config {
            name: config.job_stream.clone(),
            subjects: vec![config.job_subject.clone(), config.dead_letter_subject.clone()],
            ..Default::default()
        })
        .await
        .with_context(|| format!("Failed to get or create stream {}", config.job_stream))?;

    let consumer = stream
        .get_or_create_consumer(
            &config.consumer_name,
            jetstream::consumer::pull::Config {
                durable_name: Some(config.consumer_name.clone()),
                filter_subject: config.job_subject.clone(),
                ack_policy: jetstream::consumer::AckPolicy::Explicit,
                ack_wait: config.ack_wait(),
                max_deliver: config.max_deliver,
                backoff: config.redelivery_backoff(),
                max_ack_pending: config.max_in_flight as i64,
                ..Default::default()
            },
        )
        .await
        .with_context(|| format!("Failed to get or create consumer {}", config.consumer_name))?;

    info!(
        "Consuming {} from stream {} as {}",
        config.job_subject, config.job_stream, config.consumer_name
    );
    Ok(consumer)
}

/// Consumer loop driving the request intake
pub struct RequestConsumer {
    intake: Arc<RequestIntake>,
    jetstream: jetstream::Context,
    dead_letter_subject: String,
    semaphore: Arc<Semaphore>,
    max_in_flight: usize,
    readiness: Readiness,
    check_in_interval: std::time::Duration,
}

impl RequestConsumer {
    pub fn new(
        intake: Arc<RequestIntake>,
        jetstream: jetstream::Context,
        config: &Config,
        readiness: Readiness,
    ) -> Self {
        Self {
            intake,
            jetstream,
            dead_letter_subject: config.dead_letter_subject.clone(),
            semaphore: Arc::new(Semaphore::new(config.max_in_flight)),
            max_in_flight: config.max_in_flight,
            readiness,
            check_in_interval: config.poll_interval(),
        }
    }

    /// Runs until shutdown is requested or the message stream ends
    ///
    /// In-flight requests are allowed to finish before returning.
    pub async fn run(self, consumer: PullConsumer, shutdown: CancellationToken) -> Result<()> {
        let mut messages = consumer
            .stream()
            .max_messages_per_batch(self.max_in_flight)
            .messages()
            .await
            .context("Failed to open message stream")?;

        let this = Arc::new(self);
        let mut tasks = JoinSet::new();
        let mut check_in = tokio::time::interval(this.check_in_interval);

        info!("Starting request consumer (max in flight: {})", this.max_in_flight);

        let result = 'consume: loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, no longer pulling requests");
                    break 'consume Ok(());
                }
                _ = check_in.tick() => {
                    this.readiness.touch();
                    continue 'consume;
                }
                next = messages.next() => next,
            };

            this.readiness.touch();

            let message = match next {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    warn!("Error receiving message: {}", e);
                    continue;
                }
                None => break Err(anyhow::anyhow!("Message stream ended unexpectedly")),
            };

            let permit =
                match acquire_slot(&this.semaphore, &mut check_in, &this.readiness, &shutdown)
                    .await
                {
                    Ok(Some(permit)) => permit,
                    Ok(None) => {
                        info!("Shutdown requested while every slot was busy");
                        break 'consume Ok(());
                    }
                    Err(e) => break Err(e),
                };

            let consumer = Arc::clone(&this);
            tasks.spawn(async move {
                consumer.dispatch(message).await;
                drop(permit);
            });

            // Reap finished tasks so the set does not grow unbounded
            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    error!("Request task panicked: {}", e);
                }
            }
        };

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Request task panicked: {}", e);
            }
        }

        result
    }

    async fn dispatch(&self, message: jetstream::Message) {
        let delivered = message.info().map(|info| info.delivered).unwrap_or_default();
        debug!(
            "Received message on {} (delivery {})",
            message.subject, delivered
        );

        match self.intake.handle(&message.payload).await {
            Disposition::Ack => {
                if let Err(e) = message.ack().await {
                    // Redelivery will find the request already processed
                    warn!("Failed to acknowledge message: {}", e);
                }
            }
            Disposition::Retry(reason) => {
                info!(
                    "Leaving message unacknowledged for redelivery (delivery {}): {}",
                    delivered, reason
                );
            }
            Disposition::DeadLetter(reason) => self.dead_letter(&message, &reason).await,
        }
    }

    /// Publishes the message to the dead-letter subject, then terminates it
    ///
    /// If the publish fails the message stays unacknowledged and will come
    /// back, so nothing is ever silently dropped.
    async fn dead_letter(&self, message: &jetstream::Message, reason: &str) {
        let mut headers = async_nats::HeaderMap::new();
        headers.insert(DEAD_LETTER_REASON_HEADER, reason);

        let published = match self
            .jetstream
            .publish_with_headers(
                self.dead_letter_subject.clone(),
                headers,
                message.payload.clone(),
            )
            .await
        {
            Ok(ack) => ack.await.map(|_| ()).map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        if let Err(e) = published {
            error!(
                "Failed to publish to dead-letter subject {}: {}",
                self.dead_letter_subject, e
            );
            return;
        }

        warn!(
            "Dead-lettered message to {}: {}",
            self.dead_letter_subject, reason
        );

        if let Err(e) = message.ack_with(AckKind::Term).await {
            warn!("Failed to terminate dead-lettered message: {}", e);
        }
    }
}

/// Waits for a free request slot
///
/// Keeps checking in while every slot is busy. Returns `None` if shutdown is
/// requested first.
async fn acquire_slot(
    semaphore: &Arc<Semaphore>,
    check_in: &mut Interval,
    readiness: &Readiness,
    shutdown: &CancellationToken,
) -> Result<Option<OwnedSemaphorePermit>> {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(None),
            acquired = semaphore.clone().acquire_owned() => {
                return acquired
                    .map(Some)
                    .map_err(|e| anyhow::anyhow!("Concurrency limiter closed: {}", e));
            }
            _ = check_in.tick() => readiness.touch(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_waiting_for_a_slot_keeps_readiness() {
        let semaphore = Arc::new(Semaphore::new(1));
        let busy = semaphore.clone().acquire_owned().await.unwrap();
        let readiness = Readiness::new(Duration::from_secs(90));
        let shutdown = CancellationToken::new();
        let mut check_in = tokio::time::interval(Duration::from_secs(30));

        let waiter = {
            let semaphore = semaphore.clone();
            let readiness = readiness.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                acquire_slot(&semaphore, &mut check_in, &readiness, &shutdown).await
            })
        };

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(readiness.is_ready());
        assert!(!waiter.is_finished());

        drop(busy);
        assert!(waiter.await.unwrap().unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_while_waiting_for_a_slot() {
        let semaphore = Arc::new(Semaphore::new(1));
        let _busy = semaphore.clone().acquire_owned().await.unwrap();
        let readiness = Readiness::new(Duration::from_secs(90));
        let shutdown = CancellationToken::new();
        let mut check_in = tokio::time::interval(Duration::from_secs(30));

        shutdown.cancel();
        let slot = acquire_slot(&semaphore, &mut check_in, &readiness, &shutdown)
            .await
            .unwrap();
        assert!(slot.is_none());
    }
}
