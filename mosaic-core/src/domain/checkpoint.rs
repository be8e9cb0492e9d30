//! Checkpoint journal records
//!
//! One append-only stream per step id. The latest record for a step is
//! authoritative when the orchestrator resumes after a restart.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::step::StepError;

/// Life-cycle point recorded in the journal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum CheckpointPhase {
    /// Written immediately before the external submit call
    SubmitStarted,
    /// Written immediately after the provider returned a request id
    Submitted { request_id: String },
    /// Terminal success
    Done { outputs: Vec<String> },
    /// A submitted attempt ended in failure
    Failed { error: StepError },
}

impl CheckpointPhase {
    pub fn name(&self) -> &'static str {
        match self {
            CheckpointPhase::SubmitStarted => "submit_started",
            CheckpointPhase::Submitted { .. } => "submitted",
            CheckpointPhase::Done { .. } => "done",
            CheckpointPhase::Failed { .. } => "failed",
        }
    }
}

/// A single journal record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub step_id: Uuid,
    pub pipeline_id: Uuid,
    pub phase: CheckpointPhase,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl CheckpointRecord {
    pub fn new(pipeline_id: Uuid, step_id: Uuid, phase: CheckpointPhase) -> Self {
        Self {
            step_id,
            pipeline_id,
            phase,
            timestamp: chrono::Utc::now(),
        }
    }
}
