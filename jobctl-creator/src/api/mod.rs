//! API Module
//!
//! HTTP surface of the creator. It only serves probes; job requests arrive
//! through the message source.

pub mod health;

use axum::{Router, routing::get};
use tower_http::trace::TraceLayer;

pub use health::Readiness;

/// Create the router with the probe endpoints
pub fn create_router(readiness: Readiness) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/ready", get(health::readiness_check))
        .with_state(readiness)
        .layer(TraceLayer::new_for_http())
}
