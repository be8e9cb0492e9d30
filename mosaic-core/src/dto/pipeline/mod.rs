//! Pipeline DTOs for inter-service communication

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::domain::pipeline::{Pipeline, PipelineStatus};
use crate::domain::step::{ParentRef, Step, StepError, StepStatus, StepType};

/// How the transform and animate stages combine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombinationMode {
    /// Transform every source with every prompt
    Photos,
    /// Animate every source directly with every motion prompt
    Videos,
    /// Transform first, then animate every resulting photo
    Both,
}

/// Model settings shared by all steps of a stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationSettings {
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default)]
    pub quality: Option<String>,
    #[serde(default)]
    pub resolution: Option<String>,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

/// Image transformation stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformStage {
    pub model: String,
    pub prompts: Vec<String>,
    /// Images requested per (source, prompt) pair
    #[serde(default = "default_outputs_per_prompt")]
    pub outputs_per_prompt: u32,
    #[serde(default)]
    pub settings: GenerationSettings,
}

fn default_outputs_per_prompt() -> u32 {
    1
}

/// Image-to-video stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnimateStage {
    pub model: String,
    pub prompts: Vec<String>,
    #[serde(default)]
    pub settings: GenerationSettings,
}

/// Declarative bulk generation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateBulkPipeline {
    pub name: String,
    /// Source asset references (URLs or storage keys)
    pub sources: Vec<String>,
    #[serde(default)]
    pub transform: Option<TransformStage>,
    #[serde(default)]
    pub animate: Option<AnimateStage>,
    pub mode: CombinationMode,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Response to a bulk submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkPipelineCreated {
    pub pipeline_id: Uuid,
    pub step_count: usize,
}

/// Operator decision for a step whose submission outcome is unknown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmbiguityResolution {
    /// Submit the step again, accepting a possible duplicate charge
    Resubmit,
    /// Keep the step failed
    Abandon,
}

/// Request body for resolving an ambiguous step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolveStep {
    pub resolution: AmbiguityResolution,
}

/// Request body for updating pipeline flags; absent fields are unchanged
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateFlags {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub favorite: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hidden: Option<bool>,
}

/// Per-step view for status queries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepView {
    pub id: Uuid,
    pub step_type: StepType,
    pub step_order: u32,
    pub source_image_index: u32,
    pub parent: Option<ParentRef>,
    pub model: String,
    pub prompt: String,
    pub status: StepStatus,
    pub retry_count: u32,
    pub last_error: Option<StepError>,
    pub outputs: Vec<String>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl From<&Step> for StepView {
    fn from(step: &Step) -> Self {
        Self {
            id: step.id,
            step_type: step.step_type,
            step_order: step.step_order,
            source_image_index: step.source_image_index,
            parent: step.parent,
            model: step.config.model.clone(),
            prompt: step.config.prompt.clone(),
            status: step.status,
            retry_count: step.retry_count,
            last_error: step.last_error.clone(),
            outputs: step.outputs.clone(),
            updated_at: step.updated_at,
        }
    }
}

/// Pipeline status view: aggregate plus every step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineView {
    pub id: Uuid,
    pub name: String,
    pub status: PipelineStatus,
    pub tags: Vec<String>,
    pub favorite: bool,
    pub hidden: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Number of steps per status
    pub counts: BTreeMap<String, usize>,
    pub steps: Vec<StepView>,
}

impl PipelineView {
    /// Step views grouped by the source asset they descend from
    pub fn by_source(&self) -> BTreeMap<u32, Vec<&StepView>> {
        let mut groups: BTreeMap<u32, Vec<&StepView>> = BTreeMap::new();
        for step in &self.steps {
            groups.entry(step.source_image_index).or_default().push(step);
        }
        groups
    }
}

impl From<&Pipeline> for PipelineView {
    fn from(pipeline: &Pipeline) -> Self {
        let mut counts = BTreeMap::new();
        for step in &pipeline.steps {
            *counts.entry(step.status.as_str().to_string()).or_insert(0) += 1;
        }

        let mut steps: Vec<StepView> = pipeline.steps.iter().map(StepView::from).collect();
        steps.sort_by_key(|s| s.step_order);

        Self {
            id: pipeline.id,
            name: pipeline.name.clone(),
            status: pipeline.aggregate_status(),
            tags: pipeline.tags.clone(),
            favorite: pipeline.favorite,
            hidden: pipeline.hidden,
            created_at: pipeline.created_at,
            counts,
            steps,
        }
    }
}
