//! In-memory pipeline store

use async_trait::async_trait;
use mosaic_core::domain::pipeline::{Pipeline, PipelineStatus};
use mosaic_core::domain::step::Step;
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

use super::{PipelineStore, StoreError};

/// Store backed by a map, for tests and single-process use without a database
#[derive(Debug, Default)]
pub struct MemoryStore {
    pipelines: RwLock<HashMap<Uuid, Pipeline>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PipelineStore for MemoryStore {
    async fn insert_pipeline(&self, pipeline: &Pipeline) -> Result<(), StoreError> {
        let mut pipelines = self.pipelines.write();
        if pipelines.contains_key(&pipeline.id) {
            return Err(StoreError::Conflict(pipeline.id));
        }
        pipelines.insert(pipeline.id, pipeline.clone());
        Ok(())
    }

    async fn get_pipeline(&self, id: Uuid) -> Result<Option<Pipeline>, StoreError> {
        let mut pipeline = self.pipelines.read().get(&id).cloned();
        if let Some(p) = pipeline.as_mut() {
            p.steps.sort_by_key(|s| s.step_order);
        }
        Ok(pipeline)
    }

    async fn update_step(&self, step: &Step) -> Result<(), StoreError> {
        let mut pipelines = self.pipelines.write();
        let pipeline = pipelines
            .get_mut(&step.pipeline_id)
            .ok_or(StoreError::NotFound(step.pipeline_id))?;

        match pipeline.step_mut(step.id) {
            Some(existing) => *existing = step.clone(),
            None => {
                return Err(StoreError::Backend(format!(
                    "step {} does not belong to pipeline {}",
                    step.id, step.pipeline_id
                )));
            }
        }
        Ok(())
    }

    async fn update_status(&self, id: Uuid, status: PipelineStatus) -> Result<(), StoreError> {
        let mut pipelines = self.pipelines.write();
        let pipeline = pipelines.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        pipeline.status = status;
        Ok(())
    }

    async fn request_cancel(&self, id: Uuid) -> Result<(), StoreError> {
        let mut pipelines = self.pipelines.write();
        let pipeline = pipelines.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        pipeline.cancel_requested = true;
        Ok(())
    }

    async fn set_flags(
        &self,
        id: Uuid,
        favorite: Option<bool>,
        hidden: Option<bool>,
    ) -> Result<(), StoreError> {
        let mut pipelines = self.pipelines.write();
        let pipeline = pipelines.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if let Some(favorite) = favorite {
            pipeline.favorite = favorite;
        }
        if let Some(hidden) = hidden {
            pipeline.hidden = hidden;
        }
        Ok(())
    }

    async fn list_unfinished(&self) -> Result<Vec<Uuid>, StoreError> {
        let pipelines = self.pipelines.read();
        let mut unfinished: Vec<&Pipeline> = pipelines
            .values()
            .filter(|p| !p.status.is_terminal())
            .collect();
        unfinished.sort_by_key(|p| p.created_at);
        Ok(unfinished.into_iter().map(|p| p.id).collect())
    }
}
