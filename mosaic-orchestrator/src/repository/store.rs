//! Postgres-backed pipeline store

use async_trait::async_trait;
use mosaic_core::domain::pipeline::{Pipeline, PipelineStatus};
use mosaic_core::domain::step::Step;
use mosaic_engine::store::{PipelineStore, StoreError};
use sqlx::PgPool;
use uuid::Uuid;

use super::{pipeline_repository, step_repository};

/// [`PipelineStore`] over the `pipelines` and `steps` tables
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

#[async_trait]
impl PipelineStore for PgStore {
    async fn insert_pipeline(&self, pipeline: &Pipeline) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(backend)?;

        pipeline_repository::insert(&mut tx, pipeline)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(db) if db.is_unique_violation() => {
                    StoreError::Conflict(pipeline.id)
                }
                other => backend(other),
            })?;

        for step in &pipeline.steps {
            step_repository::insert(&mut tx, step).await.map_err(backend)?;
        }

        tx.commit().await.map_err(backend)?;

        tracing::debug!(
            "Stored pipeline {} with {} steps",
            pipeline.id,
            pipeline.steps.len()
        );
        Ok(())
    }

    async fn get_pipeline(&self, id: Uuid) -> Result<Option<Pipeline>, StoreError> {
        let Some(mut pipeline) = pipeline_repository::find_by_id(&self.pool, id)
            .await
            .map_err(backend)?
        else {
            return Ok(None);
        };

        let rows = step_repository::list_by_pipeline(&self.pool, id)
            .await
            .map_err(backend)?;
        pipeline.steps = rows
            .into_iter()
            .map(Step::try_from)
            .collect::<Result<_, _>>()
            .map_err(StoreError::Backend)?;

        Ok(Some(pipeline))
    }

    async fn update_step(&self, step: &Step) -> Result<(), StoreError> {
        let updated = step_repository::update(&self.pool, step)
            .await
            .map_err(backend)?;

        if !updated {
            return Err(StoreError::NotFound(step.pipeline_id));
        }
        Ok(())
    }

    async fn update_status(&self, id: Uuid, status: PipelineStatus) -> Result<(), StoreError> {
        let updated = pipeline_repository::update_status(&self.pool, id, status)
            .await
            .map_err(backend)?;

        if !updated {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn request_cancel(&self, id: Uuid) -> Result<(), StoreError> {
        let updated = pipeline_repository::request_cancel(&self.pool, id)
            .await
            .map_err(backend)?;

        if !updated {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn set_flags(
        &self,
        id: Uuid,
        favorite: Option<bool>,
        hidden: Option<bool>,
    ) -> Result<(), StoreError> {
        let updated = pipeline_repository::set_flags(&self.pool, id, favorite, hidden)
            .await
            .map_err(backend)?;

        if !updated {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    async fn list_unfinished(&self) -> Result<Vec<Uuid>, StoreError> {
        pipeline_repository::list_running_ids(&self.pool)
            .await
            .map_err(backend)
    }
}
