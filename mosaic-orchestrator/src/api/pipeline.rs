//! Pipeline API Handlers
//!
//! HTTP endpoints for bulk pipelines. Handlers are thin: every decision is
//! made by the engine's [`Orchestrator`].

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use mosaic_core::dto::cost::CostEstimate;
use mosaic_core::dto::pipeline::{
    BulkPipelineCreated, CreateBulkPipeline, PipelineView, ResolveStep, UpdateFlags,
};
use mosaic_engine::Orchestrator;
use uuid::Uuid;

use crate::api::error::ApiResult;

/// POST /pipeline/bulk
/// Expand a bulk request and start running it
pub async fn submit_bulk(
    State(orchestrator): State<Orchestrator>,
    Json(req): Json<CreateBulkPipeline>,
) -> ApiResult<(StatusCode, Json<BulkPipelineCreated>)> {
    tracing::info!("Submitting bulk pipeline: {}", req.name);

    let created = orchestrator.submit_bulk_pipeline(req).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// POST /pipeline/estimate
/// Cost of a bulk request without creating it
pub async fn estimate(
    State(orchestrator): State<Orchestrator>,
    Json(req): Json<CreateBulkPipeline>,
) -> ApiResult<Json<CostEstimate>> {
    tracing::debug!("Estimating bulk pipeline: {}", req.name);

    Ok(Json(orchestrator.estimate(&req)?))
}

/// GET /pipeline/{id}
pub async fn get_pipeline(
    State(orchestrator): State<Orchestrator>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<PipelineView>> {
    tracing::debug!("Getting pipeline: {}", id);

    Ok(Json(orchestrator.status(id).await?))
}

/// POST /pipeline/{id}/cancel
pub async fn cancel_pipeline(
    State(orchestrator): State<Orchestrator>,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    tracing::info!("Cancelling pipeline: {}", id);

    orchestrator.cancel(id).await?;
    Ok(StatusCode::ACCEPTED)
}

/// POST /pipeline/{id}/flags
pub async fn update_flags(
    State(orchestrator): State<Orchestrator>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateFlags>,
) -> ApiResult<Json<PipelineView>> {
    Ok(Json(orchestrator.set_flags(id, req).await?))
}

/// POST /pipeline/{id}/step/{step_id}/resolve
/// Operator decision for a step whose submission outcome is unknown
pub async fn resolve_step(
    State(orchestrator): State<Orchestrator>,
    Path((id, step_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<ResolveStep>,
) -> ApiResult<StatusCode> {
    tracing::info!(
        "Resolving step {} of pipeline {}: {:?}",
        step_id,
        id,
        req.resolution
    );

    orchestrator
        .resolve_ambiguous(id, step_id, req.resolution)
        .await?;
    Ok(StatusCode::ACCEPTED)
}
