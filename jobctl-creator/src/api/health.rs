//! Health Check API Handlers
//!
//! Liveness and readiness endpoints for the kubelet probes.

use axum::{extract::State, http::StatusCode, response::IntoResponse};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Tracks when the consumer loop last checked in
#[derive(Debug, Clone)]
pub struct Readiness {
    started: Instant,
    /// Milliseconds since `started` of the last check-in, plus one; 0 = never
    last_check_in: Arc<AtomicU64>,
    window: Duration,
}

impl Readiness {
    pub fn new(window: Duration) -> Self {
        Self {
            started: Instant::now(),
            last_check_in: Arc::new(AtomicU64::new(0)),
            window,
        }
    }

    pub fn touch(&self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.last_check_in.store(elapsed + 1, Ordering::Relaxed);
    }

    pub fn is_ready(&self) -> bool {
        match self.last_check_in.load(Ordering::Relaxed) {
            0 => false,
            stamp => {
                let since = self.started.elapsed().as_millis() as u64 + 1 - stamp;
                since <= self.window.as_millis() as u64
            }
        }
    }
}

/// GET /health
/// Liveness endpoint
pub async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

/// GET /ready
/// Ready while the consumer loop keeps checking in
pub async fn readiness_check(State(readiness): State<Readiness>) -> impl IntoResponse {
    if readiness.is_ready() {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}
