//! Pipeline domain types

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::domain::step::{Step, StepStatus};

/// Aggregate pipeline status
///
/// Always derived from the step statuses, see [`aggregate_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl PipelineStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PipelineStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Running => "running",
            PipelineStatus::Completed => "completed",
            PipelineStatus::Failed => "failed",
            PipelineStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(PipelineStatus::Running),
            "completed" => Some(PipelineStatus::Completed),
            "failed" => Some(PipelineStatus::Failed),
            "cancelled" => Some(PipelineStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline record
///
/// Owned by the orchestrator while running, read-only once terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: Uuid,
    pub name: String,
    pub steps: Vec<Step>,
    pub status: PipelineStatus,
    pub tags: Vec<String>,
    pub favorite: bool,
    pub hidden: bool,
    pub cancel_requested: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Pipeline {
    /// Creates an empty running pipeline
    pub fn new(name: impl Into<String>, tags: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            steps: Vec::new(),
            status: PipelineStatus::Running,
            tags,
            favorite: false,
            hidden: false,
            cancel_requested: false,
            created_at: chrono::Utc::now(),
        }
    }

    /// Recomputes the aggregate status from the current steps
    pub fn aggregate_status(&self) -> PipelineStatus {
        aggregate_status(self.steps.iter().map(|s| s.status), self.cancel_requested)
    }

    pub fn step(&self, step_id: Uuid) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn step_mut(&mut self, step_id: Uuid) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.id == step_id)
    }

    pub fn step_by_order(&self, step_order: u32) -> Option<&Step> {
        self.steps.iter().find(|s| s.step_order == step_order)
    }
}

/// Derives the pipeline status from its step statuses
///
/// - any step pending/submitting/in-progress → running
/// - at least one step failed → failed
/// - every step completed → completed
/// - otherwise some step was cancelled → cancelled
pub fn aggregate_status(
    statuses: impl IntoIterator<Item = StepStatus>,
    cancel_requested: bool,
) -> PipelineStatus {
    let mut any_failed = false;
    let mut any_cancelled = false;
    let mut all_completed = true;

    for status in statuses {
        match status {
            StepStatus::Pending | StepStatus::Submitting | StepStatus::InProgress => {
                return PipelineStatus::Running;
            }
            StepStatus::Completed => {}
            StepStatus::Failed => {
                any_failed = true;
                all_completed = false;
            }
            StepStatus::Cancelled => {
                any_cancelled = true;
                all_completed = false;
            }
        }
    }

    if any_failed {
        PipelineStatus::Failed
    } else if all_completed {
        PipelineStatus::Completed
    } else if cancel_requested || any_cancelled {
        PipelineStatus::Cancelled
    } else {
        PipelineStatus::Running
    }
}
