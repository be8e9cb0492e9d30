//! Error types for the Mosaic engine

use thiserror::Error;
use uuid::Uuid;

use crate::journal::JournalError;
use crate::provider::RegistryError;
use crate::store::StoreError;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by the orchestrator API
///
/// Step-level failures never show up here: they are recorded on the step
/// itself and folded into the pipeline's aggregate status.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Bulk request rejected before any step was created
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Unknown pipeline id
    #[error("Pipeline not found: {0}")]
    PipelineNotFound(Uuid),

    /// Unknown step id within a pipeline
    #[error("Step {step_id} not found in pipeline {pipeline_id}")]
    StepNotFound { pipeline_id: Uuid, step_id: Uuid },

    /// Operation not allowed in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Invalid engine configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Journal(#[from] JournalError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl EngineError {
    /// Whether the caller sent something wrong (as opposed to an internal failure)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Validation(_)
                | Self::PipelineNotFound(_)
                | Self::StepNotFound { .. }
                | Self::InvalidState(_)
        )
    }
}
