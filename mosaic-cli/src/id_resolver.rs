//! ID resolver module
//!
//! Resolves a step ID prefix against the steps of a pipeline view, so users
//! can type the first few characters shown by `pipeline status --steps`.

use anyhow::{Result, anyhow};
use mosaic_core::dto::pipeline::PipelineView;
use uuid::Uuid;

/// Resolve a full step UUID or an unambiguous prefix within one pipeline
pub fn resolve_step_id(view: &PipelineView, input: &str) -> Result<Uuid> {
    if let Ok(uuid) = Uuid::parse_str(input) {
        return Ok(uuid);
    }

    let prefix = input.trim().to_lowercase();
    if prefix.is_empty() {
        return Err(anyhow!("Step ID cannot be empty"));
    }

    let matches: Vec<Uuid> = view
        .steps
        .iter()
        .map(|s| s.id)
        .filter(|id| id.to_string().starts_with(&prefix))
        .collect();

    match matches.as_slice() {
        [] => Err(anyhow!(
            "No step in pipeline {} has an ID starting with '{}'",
            view.id,
            prefix
        )),
        [id] => Ok(*id),
        _ => {
            let ids: Vec<String> = matches.iter().map(|id| id.to_string()).collect();
            Err(anyhow!(
                "Ambiguous prefix '{}' matches multiple steps: {}",
                prefix,
                ids.join(", ")
            ))
        }
    }
}
