//! API Module
//!
//! HTTP API layer for the orchestrator.
//! Each submodule handles endpoints for a specific domain.

pub mod error;
pub mod health;
pub mod pipeline;

use axum::{
    Router,
    routing::{get, post},
};
use mosaic_engine::Orchestrator;
use tower_http::trace::TraceLayer;

/// Create the main API router with all endpoints
pub fn create_router(orchestrator: Orchestrator) -> Router {
    Router::new()
        // Health check
        .route("/health", get(health::health_check))
        // Pipeline endpoints
        .route("/pipeline/bulk", post(pipeline::submit_bulk))
        .route("/pipeline/estimate", post(pipeline::estimate))
        .route("/pipeline/{id}", get(pipeline::get_pipeline))
        .route("/pipeline/{id}/cancel", post(pipeline::cancel_pipeline))
        .route("/pipeline/{id}/flags", post(pipeline::update_flags))
        .route(
            "/pipeline/{id}/step/{step_id}/resolve",
            post(pipeline::resolve_step),
        )
        // Add state and middleware
        .with_state(orchestrator)
        .layer(TraceLayer::new_for_http())
}
