//! Bulk request validation
//!
//! Runs before expansion so a rejected request never creates steps.

use mosaic_core::domain::step::StepType;
use mosaic_core::dto::pipeline::{CombinationMode, CreateBulkPipeline};

use crate::error::{EngineError, Result};
use crate::provider::ProviderRegistry;

/// Upper bound for `outputs_per_prompt`
pub const MAX_OUTPUTS_PER_PROMPT: u32 = 8;

/// Validates a bulk request against the model registry
pub fn validate_bulk_request(req: &CreateBulkPipeline, registry: &ProviderRegistry) -> Result<()> {
    if req.name.trim().is_empty() {
        return Err(invalid("Pipeline name cannot be empty"));
    }

    if req.name.len() > 255 {
        return Err(invalid("Pipeline name is too long (max 255 characters)"));
    }

    if req.sources.is_empty() {
        return Err(invalid("At least one source asset is required"));
    }

    if req.sources.iter().any(|s| s.trim().is_empty()) {
        return Err(invalid("Source asset references cannot be empty"));
    }

    let needs_transform = matches!(req.mode, CombinationMode::Photos | CombinationMode::Both);
    let needs_animate = matches!(req.mode, CombinationMode::Videos | CombinationMode::Both);

    if needs_transform {
        let Some(transform) = &req.transform else {
            return Err(invalid("A transform stage is required for this mode"));
        };
        check_prompts("transform", &transform.prompts)?;
        check_model(registry, &transform.model, StepType::TransformImage)?;

        if transform.outputs_per_prompt == 0 || transform.outputs_per_prompt > MAX_OUTPUTS_PER_PROMPT {
            return Err(invalid(&format!(
                "outputs_per_prompt must be between 1 and {MAX_OUTPUTS_PER_PROMPT}"
            )));
        }
    }

    if needs_animate {
        let Some(animate) = &req.animate else {
            return Err(invalid("An animate stage is required for this mode"));
        };
        check_prompts("animate", &animate.prompts)?;
        check_model(registry, &animate.model, StepType::AnimateImage)?;
    }

    Ok(())
}

fn check_prompts(stage: &str, prompts: &[String]) -> Result<()> {
    if prompts.is_empty() {
        return Err(invalid(&format!("The {stage} stage needs at least one prompt")));
    }
    if prompts.iter().any(|p| p.trim().is_empty()) {
        return Err(invalid(&format!("The {stage} stage contains an empty prompt")));
    }
    Ok(())
}

fn check_model(registry: &ProviderRegistry, model: &str, expected: StepType) -> Result<()> {
    let entry = registry
        .model(model)
        .ok_or_else(|| invalid(&format!("Unknown model: {model}")))?;

    if entry.step_type != expected {
        return Err(invalid(&format!(
            "Model {model} performs {} and cannot be used for {expected}",
            entry.step_type
        )));
    }
    Ok(())
}

fn invalid(msg: &str) -> EngineError {
    EngineError::Validation(msg.to_string())
}
