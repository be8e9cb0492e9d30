//! Bulk expander
//!
//! Turns a declarative bulk request into the ordered list of steps the
//! orchestrator executes. Expansion is pure: the same request always yields
//! the same steps (modulo fresh ids and timestamps).
//!
//! Ordering is source-major: every step for source 0 comes before any step
//! for source 1 within a stage. In `both` mode the stage-2 animate steps
//! follow all stage-1 transform steps and point at their parent's output slot.

use mosaic_core::domain::step::{ParentRef, Step, StepConfig, StepType};
use mosaic_core::dto::pipeline::{
    AnimateStage, CombinationMode, CreateBulkPipeline, GenerationSettings, TransformStage,
};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::{EngineError, Result};

/// Expands a bulk request into pending steps for `pipeline_id`
pub fn expand(pipeline_id: Uuid, req: &CreateBulkPipeline) -> Result<Vec<Step>> {
    match req.mode {
        CombinationMode::Photos => {
            let transform = required_transform(req)?;
            Ok(transform_steps(pipeline_id, &req.sources, transform))
        }
        CombinationMode::Videos => {
            let animate = required_animate(req)?;
            Ok(animate_source_steps(pipeline_id, &req.sources, animate))
        }
        CombinationMode::Both => {
            let transform = required_transform(req)?;
            let animate = required_animate(req)?;

            let mut steps = transform_steps(pipeline_id, &req.sources, transform);
            let chained = chained_animate_steps(pipeline_id, &steps, transform, animate);
            steps.extend(chained);
            Ok(steps)
        }
    }
}

/// Number of steps per type the request expands to, without building them
pub fn expected_counts(req: &CreateBulkPipeline) -> BTreeMap<StepType, u64> {
    let sources = req.sources.len() as u64;
    let transform_prompts = req.transform.as_ref().map_or(0, |t| t.prompts.len() as u64);
    let outputs_per_prompt = req
        .transform
        .as_ref()
        .map_or(0, |t| u64::from(t.outputs_per_prompt));
    let motion_prompts = req.animate.as_ref().map_or(0, |a| a.prompts.len() as u64);

    let mut counts = BTreeMap::new();
    match req.mode {
        CombinationMode::Photos => {
            counts.insert(StepType::TransformImage, sources * transform_prompts);
        }
        CombinationMode::Videos => {
            counts.insert(StepType::AnimateImage, sources * motion_prompts);
        }
        CombinationMode::Both => {
            let stage1 = sources * transform_prompts;
            counts.insert(StepType::TransformImage, stage1);
            counts.insert(
                StepType::AnimateImage,
                stage1 * outputs_per_prompt * motion_prompts,
            );
        }
    }
    counts.retain(|_, n| *n > 0);
    counts
}

fn required_transform(req: &CreateBulkPipeline) -> Result<&TransformStage> {
    req.transform.as_ref().ok_or_else(|| {
        EngineError::Validation(format!("mode '{:?}' requires a transform stage", req.mode))
    })
}

fn required_animate(req: &CreateBulkPipeline) -> Result<&AnimateStage> {
    req.animate.as_ref().ok_or_else(|| {
        EngineError::Validation(format!("mode '{:?}' requires an animate stage", req.mode))
    })
}

fn step_config(
    model: &str,
    prompt: &str,
    num_outputs: u32,
    settings: &GenerationSettings,
) -> StepConfig {
    StepConfig {
        model: model.to_string(),
        prompt: prompt.to_string(),
        negative_prompt: settings.negative_prompt.clone(),
        quality: settings.quality.clone(),
        resolution: settings.resolution.clone(),
        num_outputs,
        params: settings.params.clone(),
    }
}

fn transform_steps(pipeline_id: Uuid, sources: &[String], stage: &TransformStage) -> Vec<Step> {
    let mut steps = Vec::with_capacity(sources.len() * stage.prompts.len());
    for (source_index, source) in sources.iter().enumerate() {
        for prompt in &stage.prompts {
            let order = steps.len() as u32;
            let config = step_config(&stage.model, prompt, stage.outputs_per_prompt, &stage.settings);
            steps.push(
                Step::new(
                    pipeline_id,
                    StepType::TransformImage,
                    order,
                    source_index as u32,
                    config,
                )
                .with_input(source.clone()),
            );
        }
    }
    steps
}

fn animate_source_steps(pipeline_id: Uuid, sources: &[String], stage: &AnimateStage) -> Vec<Step> {
    let mut steps = Vec::with_capacity(sources.len() * stage.prompts.len());
    for (source_index, source) in sources.iter().enumerate() {
        for prompt in &stage.prompts {
            let order = steps.len() as u32;
            let config = step_config(&stage.model, prompt, 1, &stage.settings);
            steps.push(
                Step::new(
                    pipeline_id,
                    StepType::AnimateImage,
                    order,
                    source_index as u32,
                    config,
                )
                .with_input(source.clone()),
            );
        }
    }
    steps
}

fn chained_animate_steps(
    pipeline_id: Uuid,
    parents: &[Step],
    transform: &TransformStage,
    animate: &AnimateStage,
) -> Vec<Step> {
    let mut order = parents.len() as u32;
    let mut steps = Vec::with_capacity(
        parents.len() * transform.outputs_per_prompt as usize * animate.prompts.len(),
    );

    for parent in parents {
        for output_index in 0..transform.outputs_per_prompt {
            for prompt in &animate.prompts {
                let config = step_config(&animate.model, prompt, 1, &animate.settings);
                steps.push(
                    Step::new(
                        pipeline_id,
                        StepType::AnimateImage,
                        order,
                        parent.source_image_index,
                        config,
                    )
                    .with_parent(ParentRef {
                        step_order: parent.step_order,
                        output_index,
                    }),
                );
                order += 1;
            }
        }
    }
    steps
}
