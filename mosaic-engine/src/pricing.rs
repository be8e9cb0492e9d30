//! Cost pre-flight

use mosaic_core::domain::step::StepType;
use mosaic_core::dto::cost::CostEstimate;
use mosaic_core::dto::pipeline::CreateBulkPipeline;

use crate::error::{EngineError, Result};
use crate::expander::expected_counts;
use crate::provider::ProviderRegistry;

/// Price lookup per generation
pub trait Pricing: Send + Sync {
    /// Price of one step of `step_type` run on `model`, if known
    fn unit_price(&self, step_type: StepType, model: &str) -> Option<f64>;
}

impl Pricing for ProviderRegistry {
    fn unit_price(&self, step_type: StepType, model: &str) -> Option<f64> {
        self.model(model)
            .filter(|entry| entry.step_type == step_type)
            .map(|entry| entry.unit_price)
    }
}

/// Estimates what a bulk request will cost without creating any step
pub fn estimate_cost(req: &CreateBulkPipeline, pricing: &dyn Pricing) -> Result<CostEstimate> {
    let mut lines = Vec::new();

    for (step_type, count) in expected_counts(req) {
        let model = match step_type {
            StepType::TransformImage => req.transform.as_ref().map(|t| t.model.as_str()),
            StepType::AnimateImage => req.animate.as_ref().map(|a| a.model.as_str()),
            StepType::EnhancePrompt => None,
        }
        .ok_or_else(|| EngineError::Validation(format!("no model configured for {step_type}")))?;

        let price = pricing.unit_price(step_type, model).ok_or_else(|| {
            EngineError::Validation(format!("no price known for {model} ({step_type})"))
        })?;

        lines.push((step_type, count, price));
    }

    Ok(CostEstimate::from_lines(lines))
}
