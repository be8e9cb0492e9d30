//! Pipeline storage
//!
//! The orchestrator persists pipelines and steps through [`PipelineStore`].
//! The engine ships an in-memory implementation; the orchestrator binary
//! provides a Postgres one.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use mosaic_core::domain::pipeline::{Pipeline, PipelineStatus};
use mosaic_core::domain::step::Step;
use thiserror::Error;
use uuid::Uuid;

/// Storage errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Pipeline not found: {0}")]
    NotFound(Uuid),

    #[error("Pipeline already exists: {0}")]
    Conflict(Uuid),

    /// Failure reported by the storage backend
    #[error("Storage backend error: {0}")]
    Backend(String),
}

/// Persistence for pipelines and their steps
#[async_trait]
pub trait PipelineStore: Send + Sync {
    /// Persists a new pipeline together with all its steps
    async fn insert_pipeline(&self, pipeline: &Pipeline) -> Result<(), StoreError>;

    /// Loads a pipeline with its steps ordered by `step_order`
    async fn get_pipeline(&self, id: Uuid) -> Result<Option<Pipeline>, StoreError>;

    /// Writes every mutable field of a step
    async fn update_step(&self, step: &Step) -> Result<(), StoreError>;

    /// Stores the derived aggregate status
    async fn update_status(&self, id: Uuid, status: PipelineStatus) -> Result<(), StoreError>;

    /// Sets the cancellation flag
    async fn request_cancel(&self, id: Uuid) -> Result<(), StoreError>;

    /// Updates the favorite/hidden flags; `None` leaves a flag unchanged
    async fn set_flags(
        &self,
        id: Uuid,
        favorite: Option<bool>,
        hidden: Option<bool>,
    ) -> Result<(), StoreError>;

    /// Ids of pipelines whose stored status is still running
    async fn list_unfinished(&self) -> Result<Vec<Uuid>, StoreError>;
}
