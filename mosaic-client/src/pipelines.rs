//! Pipeline-related API endpoints

use crate::OrchestratorClient;
use crate::error::Result;
use mosaic_core::dto::cost::CostEstimate;
use mosaic_core::dto::pipeline::{
    AmbiguityResolution, BulkPipelineCreated, CreateBulkPipeline, PipelineView, ResolveStep,
    UpdateFlags,
};
use uuid::Uuid;

impl OrchestratorClient {
    // =============================================================================
    // Bulk Pipelines
    // =============================================================================

    /// Submit a bulk request; the orchestrator starts running it immediately
    pub async fn submit_bulk(&self, req: &CreateBulkPipeline) -> Result<BulkPipelineCreated> {
        let response = self
            .client
            .post(self.url("/pipeline/bulk"))
            .json(req)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Cost of a bulk request without creating it
    pub async fn estimate(&self, req: &CreateBulkPipeline) -> Result<CostEstimate> {
        let response = self
            .client
            .post(self.url("/pipeline/estimate"))
            .json(req)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Aggregate status and per-step view of a pipeline
    pub async fn get_pipeline(&self, pipeline_id: Uuid) -> Result<PipelineView> {
        let response = self
            .client
            .get(self.url(&format!("/pipeline/{}", pipeline_id)))
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Request cancellation; already finished pipelines are left untouched
    pub async fn cancel_pipeline(&self, pipeline_id: Uuid) -> Result<()> {
        let response = self
            .client
            .post(self.url(&format!("/pipeline/{}/cancel", pipeline_id)))
            .send()
            .await?;

        self.handle_empty_response(response).await
    }

    /// Set or clear the favorite/hidden flags
    pub async fn update_flags(&self, pipeline_id: Uuid, flags: &UpdateFlags) -> Result<PipelineView> {
        let response = self
            .client
            .post(self.url(&format!("/pipeline/{}/flags", pipeline_id)))
            .json(flags)
            .send()
            .await?;

        self.handle_response(response).await
    }

    /// Resolve a step left `checkpoint_ambiguous` by a restart
    pub async fn resolve_step(
        &self,
        pipeline_id: Uuid,
        step_id: Uuid,
        resolution: AmbiguityResolution,
    ) -> Result<()> {
        let response = self
            .client
            .post(self.url(&format!(
                "/pipeline/{}/step/{}/resolve",
                pipeline_id, step_id
            )))
            .json(&ResolveStep { resolution })
            .send()
            .await?;

        self.handle_empty_response(response).await
    }
}
