//! Step domain types
//!
//! A step is one unit of external-provider work (a single generation call)
//! belonging to a pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Kind of generation a step performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    TransformImage,
    AnimateImage,
    EnhancePrompt,
}

impl StepType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepType::TransformImage => "transform_image",
            StepType::AnimateImage => "animate_image",
            StepType::EnhancePrompt => "enhance_prompt",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transform_image" => Some(StepType::TransformImage),
            "animate_image" => Some(StepType::AnimateImage),
            "enhance_prompt" => Some(StepType::EnhancePrompt),
            _ => None,
        }
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step life-cycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Submitting,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl StepStatus {
    /// Completed, failed and cancelled steps never move again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Completed | StepStatus::Failed | StepStatus::Cancelled
        )
    }

    /// Pending, submitting and in-progress steps still need work
    pub fn is_advancing(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Submitting => "submitting",
            StepStatus::InProgress => "in_progress",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(StepStatus::Pending),
            "submitting" => Some(StepStatus::Submitting),
            "in_progress" => Some(StepStatus::InProgress),
            "completed" => Some(StepStatus::Completed),
            "failed" => Some(StepStatus::Failed),
            "cancelled" => Some(StepStatus::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed failure category attached to a step
///
/// Produced by the error classifier in the engine and persisted with the step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Bad input; never retried
    Validation,
    /// Credentials rejected; never retried
    Auth,
    /// Provider asked us to slow down
    RateLimit,
    TransientNetwork,
    TransientServer,
    /// The step did not reach a terminal provider status in time
    Timeout,
    /// A crash left the submission outcome unknown
    CheckpointAmbiguous,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::Auth => "auth",
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::TransientNetwork => "transient_network",
            ErrorCategory::TransientServer => "transient_server",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::CheckpointAmbiguous => "checkpoint_ambiguous",
            ErrorCategory::Unknown => "unknown",
        }
    }

    /// Fatal categories are never retried automatically
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Validation | ErrorCategory::Auth | ErrorCategory::CheckpointAmbiguous
        )
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last error recorded on a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    pub category: ErrorCategory,
    pub message: String,
}

impl StepError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.category, self.message)
    }
}

/// Reference to one output slot of an earlier step in the same pipeline
///
/// Stage-2 steps of a "both" expansion animate a photo that does not exist yet;
/// the orchestrator resolves this reference once the parent has completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParentRef {
    pub step_order: u32,
    pub output_index: u32,
}

/// Generation parameters for a step
///
/// Everything except `model` is opaque to the orchestrator and forwarded to
/// the provider as part of the submit payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepConfig {
    pub model: String,
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default)]
    pub quality: Option<String>,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default = "default_num_outputs")]
    pub num_outputs: u32,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

fn default_num_outputs() -> u32 {
    1
}

/// Work item record
///
/// Created in bulk by the expander, mutated only by the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: Uuid,
    pub pipeline_id: Uuid,
    pub step_type: StepType,
    pub step_order: u32,
    pub source_image_index: u32,
    pub parent: Option<ParentRef>,
    pub input_asset: Option<String>,
    pub config: StepConfig,
    pub status: StepStatus,
    pub retry_count: u32,
    pub last_error: Option<StepError>,
    pub outputs: Vec<String>,
    pub request_id: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl Step {
    /// Creates a pending step
    pub fn new(
        pipeline_id: Uuid,
        step_type: StepType,
        step_order: u32,
        source_image_index: u32,
        config: StepConfig,
    ) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: Uuid::new_v4(),
            pipeline_id,
            step_type,
            step_order,
            source_image_index,
            parent: None,
            input_asset: None,
            config,
            status: StepStatus::Pending,
            retry_count: 0,
            last_error: None,
            outputs: Vec::new(),
            request_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_input(mut self, asset: impl Into<String>) -> Self {
        self.input_asset = Some(asset.into());
        self
    }

    pub fn with_parent(mut self, parent: ParentRef) -> Self {
        self.parent = Some(parent);
        self
    }

    /// Whether this step is still waiting for its parent's output
    pub fn awaiting_parent(&self) -> bool {
        self.parent.is_some() && self.input_asset.is_none()
    }

    /// Moves the step to a new status, returning the previous one
    pub fn transition(&mut self, status: StepStatus) -> StepStatus {
        let old = self.status;
        self.status = status;
        self.updated_at = chrono::Utc::now();
        old
    }
}
