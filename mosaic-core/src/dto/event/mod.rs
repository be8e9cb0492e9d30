//! Progress events broadcast on every step transition

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::step::StepStatus;

/// Step transition notification for the status/UI layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub pipeline_id: Uuid,
    pub step_id: Uuid,
    pub old_status: StepStatus,
    pub new_status: StepStatus,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl ProgressEvent {
    pub fn new(
        pipeline_id: Uuid,
        step_id: Uuid,
        old_status: StepStatus,
        new_status: StepStatus,
    ) -> Self {
        Self {
            pipeline_id,
            step_id,
            old_status,
            new_status,
            timestamp: chrono::Utc::now(),
        }
    }
}
