//! Restart recovery
//!
//! Decides what to do with each stored step when a pipeline run starts,
//! from the step's stored status and its latest journal record.

use mosaic_core::domain::checkpoint::{CheckpointPhase, CheckpointRecord};
use mosaic_core::domain::step::{Step, StepStatus};

/// What a run does with a step before scheduling it
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Recovery {
    /// Already terminal, leave as is
    Keep,
    /// Start over from pending
    Rerun,
    /// A request is known to be in flight: poll it, never resubmit
    ResumePolling(String),
    /// The provider already finished; record the outputs
    Complete(Vec<String>),
    /// A submit call may or may not have reached the provider
    Ambiguous,
}

pub(crate) fn plan_recovery(step: &Step, latest: Option<&CheckpointRecord>) -> Recovery {
    if step.status.is_terminal() {
        return Recovery::Keep;
    }

    let phase = latest.map(|r| &r.phase);
    match phase {
        Some(CheckpointPhase::Done { outputs }) if !outputs.is_empty() => {
            Recovery::Complete(outputs.clone())
        }
        Some(CheckpointPhase::Submitted { request_id }) => {
            Recovery::ResumePolling(request_id.clone())
        }
        Some(CheckpointPhase::SubmitStarted) => match step.status {
            StepStatus::Submitting => Recovery::Ambiguous,
            // The submitted checkpoint failed to write but the store kept the id
            StepStatus::InProgress => in_flight_or_rerun(step),
            _ => Recovery::Rerun,
        },
        Some(CheckpointPhase::Failed { .. }) | Some(CheckpointPhase::Done { .. }) => {
            Recovery::Rerun
        }
        None => in_flight_or_rerun(step),
    }
}

fn in_flight_or_rerun(step: &Step) -> Recovery {
    match (&step.status, &step.request_id) {
        (StepStatus::InProgress, Some(request_id)) => Recovery::ResumePolling(request_id.clone()),
        _ => Recovery::Rerun,
    }
}
