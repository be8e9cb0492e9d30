//! Pipeline orchestrator
//!
//! Public entry point of the engine. Creates pipelines from bulk requests,
//! runs them with bounded concurrency, and answers status, cancel, estimate
//! and resolve requests.
//!
//! A run owns its pipeline's steps: each non-terminal step is moved into one
//! worker task, and the run loop only touches a step again when its task hands
//! it back. Stage-2 steps are parked until their parent settles.

use mosaic_core::domain::checkpoint::{CheckpointPhase, CheckpointRecord};
use mosaic_core::domain::pipeline::{Pipeline, PipelineStatus, aggregate_status};
use mosaic_core::domain::step::{ErrorCategory, Step, StepError, StepStatus};
use mosaic_core::dto::cost::CostEstimate;
use mosaic_core::dto::event::ProgressEvent;
use mosaic_core::dto::pipeline::{
    AmbiguityResolution, BulkPipelineCreated, CreateBulkPipeline, PipelineView, UpdateFlags,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::recovery::{Recovery, plan_recovery};
use super::worker::{Resume, Worker};
use crate::config::EngineConfig;
use crate::cooldown::CooldownManager;
use crate::error::{EngineError, Result};
use crate::expander::expand;
use crate::journal::CheckpointJournal;
use crate::pricing::estimate_cost;
use crate::provider::ProviderRegistry;
use crate::rate_limit::RateLimiter;
use crate::store::PipelineStore;
use crate::validation::validate_bulk_request;

const AMBIGUOUS_MESSAGE: &str =
    "submission outcome unknown after restart; resolve with resubmit or abandon";

/// Handle on an active pipeline run
struct RunHandle {
    cancel: CancellationToken,
    /// Steps handed back to the run by an operator resolution
    requeue: mpsc::UnboundedSender<Step>,
}

/// Bulk generation orchestrator
#[derive(Clone)]
pub struct Orchestrator {
    worker: Arc<Worker>,
    runs: Arc<Mutex<HashMap<Uuid, RunHandle>>>,
}

impl Orchestrator {
    /// Creates an orchestrator from its collaborators
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn PipelineStore>,
        journal: Arc<dyn CheckpointJournal>,
        registry: Arc<ProviderRegistry>,
    ) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            worker: Arc::new(Worker::new(config, store, journal, registry)),
            runs: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.worker.config
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.worker.rate_limiter
    }

    pub fn cooldowns(&self) -> &CooldownManager {
        &self.worker.cooldowns
    }

    /// Receiver for every step transition
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.worker.subscribe()
    }

    /// Whether a run for this pipeline is active in this process
    pub fn is_running(&self, pipeline_id: Uuid) -> bool {
        self.runs.lock().contains_key(&pipeline_id)
    }

    // =========================================================================
    // Pipeline creation
    // =========================================================================

    /// Validates, expands and persists a bulk request without running it
    pub async fn create_pipeline(&self, req: CreateBulkPipeline) -> Result<Pipeline> {
        validate_bulk_request(&req, &self.worker.registry)?;

        let mut pipeline = Pipeline::new(req.name.trim(), req.tags.clone());
        pipeline.steps = expand(pipeline.id, &req)?;
        self.worker.store.insert_pipeline(&pipeline).await?;

        info!(
            "Created pipeline {} ({}) with {} step(s)",
            pipeline.id,
            pipeline.name,
            pipeline.steps.len()
        );
        Ok(pipeline)
    }

    /// Creates a pipeline and starts running it in the background
    pub async fn submit_bulk_pipeline(&self, req: CreateBulkPipeline) -> Result<BulkPipelineCreated> {
        let pipeline = self.create_pipeline(req).await?;
        self.spawn_run(pipeline.id);

        Ok(BulkPipelineCreated {
            pipeline_id: pipeline.id,
            step_count: pipeline.steps.len(),
        })
    }

    /// Cost of a bulk request, computed without creating anything
    pub fn estimate(&self, req: &CreateBulkPipeline) -> Result<CostEstimate> {
        validate_bulk_request(req, &self.worker.registry)?;
        estimate_cost(req, self.worker.registry.as_ref())
    }

    // =========================================================================
    // Queries and control
    // =========================================================================

    /// Aggregate and per-step view of a pipeline
    pub async fn status(&self, pipeline_id: Uuid) -> Result<PipelineView> {
        let pipeline = self.load(pipeline_id).await?;
        Ok(PipelineView::from(&pipeline))
    }

    /// Requests cancellation of a pipeline
    ///
    /// Steps stop at their next life-cycle checkpoint; calls already sent to
    /// a provider complete and their results are discarded.
    pub async fn cancel(&self, pipeline_id: Uuid) -> Result<()> {
        let pipeline = self.load(pipeline_id).await?;
        if pipeline.aggregate_status().is_terminal() {
            debug!("Cancel of pipeline {} ignored, already finished", pipeline_id);
            return Ok(());
        }

        self.worker.store.request_cancel(pipeline_id).await?;

        let active = self.runs.lock().get(&pipeline_id).map(|h| h.cancel.clone());
        match active {
            Some(token) => token.cancel(),
            None => {
                // Nothing drives these steps in this process; settle them here
                let mut statuses = Vec::with_capacity(pipeline.steps.len());
                for mut step in pipeline.steps {
                    if step.status.is_advancing() {
                        self.worker.set_status(&mut step, StepStatus::Cancelled).await;
                    }
                    statuses.push(step.status);
                }
                self.publish_status(pipeline_id, aggregate_status(statuses, true))
                    .await;
            }
        }

        info!("Cancellation requested for pipeline {}", pipeline_id);
        Ok(())
    }

    /// Updates the favorite/hidden flags; these never affect scheduling
    pub async fn set_flags(&self, pipeline_id: Uuid, flags: UpdateFlags) -> Result<PipelineView> {
        self.load(pipeline_id).await?;
        self.worker
            .store
            .set_flags(pipeline_id, flags.favorite, flags.hidden)
            .await?;
        self.status(pipeline_id).await
    }

    /// Starts a run for every pipeline left unfinished by a previous process
    pub async fn resume(&self) -> Result<Vec<Uuid>> {
        let unfinished = self.worker.store.list_unfinished().await?;
        for pipeline_id in &unfinished {
            self.spawn_run(*pipeline_id);
        }

        if !unfinished.is_empty() {
            info!("Resuming {} unfinished pipeline(s)", unfinished.len());
        }
        Ok(unfinished)
    }

    /// Operator decision for a step whose submission outcome is unknown
    ///
    /// `Resubmit` returns the step (and any dependents it failed) to pending
    /// and runs it again, accepting a possible duplicate charge. `Abandon`
    /// keeps it failed and records the decision.
    pub async fn resolve_ambiguous(
        &self,
        pipeline_id: Uuid,
        step_id: Uuid,
        resolution: AmbiguityResolution,
    ) -> Result<()> {
        let pipeline = self.load(pipeline_id).await?;
        let step = pipeline
            .step(step_id)
            .cloned()
            .ok_or(EngineError::StepNotFound {
                pipeline_id,
                step_id,
            })?;

        let ambiguous = step.status == StepStatus::Failed
            && step
                .last_error
                .as_ref()
                .is_some_and(|e| e.category == ErrorCategory::CheckpointAmbiguous);
        if !ambiguous {
            return Err(EngineError::InvalidState(format!(
                "step {step_id} is not awaiting an ambiguity resolution"
            )));
        }

        match resolution {
            AmbiguityResolution::Abandon => self.abandon(step).await,
            AmbiguityResolution::Resubmit => self.resubmit(pipeline, step).await,
        }
    }

    async fn abandon(&self, mut step: Step) -> Result<()> {
        let error = StepError::new(
            ErrorCategory::CheckpointAmbiguous,
            "abandoned by operator after ambiguous submission",
        );
        step.last_error = Some(error.clone());
        self.worker.persist(&step).await;
        self.worker
            .journal
            .append(CheckpointRecord::new(
                step.pipeline_id,
                step.id,
                CheckpointPhase::Failed { error },
            ))
            .await?;

        info!("Operator abandoned ambiguous step {}", step.id);
        Ok(())
    }

    async fn resubmit(&self, pipeline: Pipeline, step: Step) -> Result<()> {
        if pipeline.cancel_requested {
            return Err(EngineError::InvalidState(format!(
                "pipeline {} was cancelled",
                pipeline.id
            )));
        }

        let board = Board::new(pipeline.steps);
        let mut reset = Vec::new();
        let mut queue = VecDeque::from([step.step_order]);
        while let Some(order) = queue.pop_front() {
            let Some(mut target) = board.get(order).cloned() else {
                continue;
            };
            if order != step.step_order && target.status == StepStatus::Completed {
                continue;
            }

            target.last_error = None;
            target.request_id = None;
            if target.parent.is_some() {
                target.input_asset = None;
            }
            self.worker.set_status(&mut target, StepStatus::Pending).await;
            reset.push(target);
            queue.extend(board.children(order));
        }

        self.publish_status(pipeline.id, PipelineStatus::Running).await;
        info!(
            "Operator resubmitted ambiguous step {}, {} step(s) back to pending",
            step.id,
            reset.len()
        );

        let handed_over = {
            let runs = self.runs.lock();
            match runs.get(&pipeline.id) {
                Some(handle) => reset
                    .drain(..)
                    .all(|s| handle.requeue.send(s).is_ok()),
                None => false,
            }
        };

        if !handed_over {
            self.spawn_run(pipeline.id);
        }
        Ok(())
    }

    // =========================================================================
    // Running
    // =========================================================================

    /// Runs a pipeline in the background, logging the outcome
    pub fn spawn_run(&self, pipeline_id: Uuid) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            match this.run(pipeline_id).await {
                Ok(status) => debug!("Background run of pipeline {} ended: {}", pipeline_id, status),
                Err(e) => error!("Run of pipeline {} failed: {}", pipeline_id, e),
            }
        })
    }

    /// Drives every non-terminal step of a pipeline to a terminal status
    ///
    /// Returns the aggregate status when no step can make further progress.
    pub async fn run(&self, pipeline_id: Uuid) -> Result<PipelineStatus> {
        let (cancel, mut requeue) = self.register(pipeline_id)?;
        let result = self.drive_pipeline(pipeline_id, &cancel, &mut requeue).await;
        if result.is_err() {
            self.runs.lock().remove(&pipeline_id);
        }
        result
    }

    fn register(
        &self,
        pipeline_id: Uuid,
    ) -> Result<(CancellationToken, mpsc::UnboundedReceiver<Step>)> {
        let mut runs = self.runs.lock();
        if runs.contains_key(&pipeline_id) {
            return Err(EngineError::InvalidState(format!(
                "pipeline {pipeline_id} is already running"
            )));
        }

        let cancel = CancellationToken::new();
        let (requeue, receiver) = mpsc::unbounded_channel();
        runs.insert(
            pipeline_id,
            RunHandle {
                cancel: cancel.clone(),
                requeue,
            },
        );
        Ok((cancel, receiver))
    }

    async fn drive_pipeline(
        &self,
        pipeline_id: Uuid,
        cancel: &CancellationToken,
        requeue: &mut mpsc::UnboundedReceiver<Step>,
    ) -> Result<PipelineStatus> {
        let pipeline = self.load(pipeline_id).await?;
        if pipeline.cancel_requested {
            cancel.cancel();
        }

        info!("Running pipeline {} with {} step(s)", pipeline_id, pipeline.steps.len());

        let latest = self.worker.journal.latest_for_pipeline(pipeline_id);
        let mut last_status = pipeline.status;
        let mut board = Board::new(pipeline.steps);
        let mut resumes: HashMap<u32, String> = HashMap::new();
        let mut queue: VecDeque<u32> = VecDeque::new();

        for order in board.orders() {
            let Some(step) = board.get_mut(order) else {
                continue;
            };

            match plan_recovery(step, latest.get(&step.id)) {
                Recovery::Keep => continue,
                Recovery::Complete(outputs) => {
                    info!("Recovered completed step {} from checkpoint", step.id);
                    step.outputs = outputs;
                    step.last_error = None;
                    self.worker.set_status(step, StepStatus::Completed).await;
                    continue;
                }
                Recovery::Ambiguous => {
                    warn!(
                        "Submission outcome of step {} unknown, needs operator review",
                        step.id
                    );
                    step.last_error = Some(StepError::new(
                        ErrorCategory::CheckpointAmbiguous,
                        AMBIGUOUS_MESSAGE,
                    ));
                    self.worker.set_status(step, StepStatus::Failed).await;
                    continue;
                }
                Recovery::ResumePolling(request_id) => {
                    step.request_id = Some(request_id.clone());
                    if step.status != StepStatus::InProgress {
                        self.worker.set_status(step, StepStatus::InProgress).await;
                    }
                    resumes.insert(order, request_id);
                }
                Recovery::Rerun => {
                    if step.status != StepStatus::Pending {
                        self.worker.set_status(step, StepStatus::Pending).await;
                    }
                }
            }
            queue.push_back(order);
        }

        let mut tasks: JoinSet<Step> = JoinSet::new();

        loop {
            while let Some(order) = queue.pop_front() {
                match evaluate(&mut board, order, cancel.is_cancelled()) {
                    Action::Skip | Action::Park => {}
                    Action::Spawn => {
                        if let Some(step) = board.get(order).cloned() {
                            let resume = resumes.remove(&order).map_or(Resume::Fresh, Resume::Poll);
                            let worker = Arc::clone(&self.worker);
                            tasks.spawn(worker.drive(step, resume, cancel.clone()));
                        }
                    }
                    Action::Settle(status, error) => {
                        if let Some(step) = board.get_mut(order) {
                            step.last_error = error;
                            self.worker.set_status(step, status).await;
                        }
                        queue.extend(board.children(order));
                    }
                }
            }

            let status = board.aggregate(cancel.is_cancelled());
            if status != last_status {
                self.publish_status(pipeline_id, status).await;
                last_status = status;
            }

            if tasks.is_empty() {
                // Unregister and check for late requeues under the same lock
                // the resolver sends with
                let late = {
                    let mut runs = self.runs.lock();
                    match requeue.try_recv() {
                        Ok(step) => Some(step),
                        Err(_) => {
                            runs.remove(&pipeline_id);
                            None
                        }
                    }
                };
                match late {
                    Some(step) => {
                        queue.push_back(step.step_order);
                        board.replace(step);
                        continue;
                    }
                    None => break,
                }
            }

            tokio::select! {
                joined = tasks.join_next() => match joined {
                    Some(Ok(step)) => {
                        let order = step.step_order;
                        board.replace(step);
                        queue.extend(board.children(order));
                    }
                    Some(Err(e)) => error!("Step task of pipeline {} aborted: {}", pipeline_id, e),
                    None => {}
                },
                Some(step) = requeue.recv() => {
                    queue.push_back(step.step_order);
                    board.replace(step);
                }
            }
        }

        info!("Pipeline {} run finished: {}", pipeline_id, last_status);
        Ok(last_status)
    }

    async fn publish_status(&self, pipeline_id: Uuid, status: PipelineStatus) {
        if let Err(e) = self.worker.store.update_status(pipeline_id, status).await {
            error!("Failed to store status of pipeline {}: {}", pipeline_id, e);
        }
    }

    async fn load(&self, pipeline_id: Uuid) -> Result<Pipeline> {
        self.worker
            .store
            .get_pipeline(pipeline_id)
            .await?
            .ok_or(EngineError::PipelineNotFound(pipeline_id))
    }
}

// =============================================================================
// Run state
// =============================================================================

/// Local copy of a pipeline's steps, keyed by step order
struct Board {
    steps: BTreeMap<u32, Step>,
    children: HashMap<u32, Vec<u32>>,
}

impl Board {
    fn new(steps: Vec<Step>) -> Self {
        let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
        for step in &steps {
            if let Some(parent) = step.parent {
                children
                    .entry(parent.step_order)
                    .or_default()
                    .push(step.step_order);
            }
        }

        Self {
            steps: steps.into_iter().map(|s| (s.step_order, s)).collect(),
            children,
        }
    }

    fn orders(&self) -> Vec<u32> {
        self.steps.keys().copied().collect()
    }

    fn get(&self, order: u32) -> Option<&Step> {
        self.steps.get(&order)
    }

    fn get_mut(&mut self, order: u32) -> Option<&mut Step> {
        self.steps.get_mut(&order)
    }

    fn replace(&mut self, step: Step) {
        self.steps.insert(step.step_order, step);
    }

    fn children(&self, order: u32) -> Vec<u32> {
        self.children.get(&order).cloned().unwrap_or_default()
    }

    fn aggregate(&self, cancel_requested: bool) -> PipelineStatus {
        aggregate_status(self.steps.values().map(|s| s.status), cancel_requested)
    }
}

/// What the run loop does with a step it is looking at
#[derive(Debug, PartialEq)]
enum Action {
    /// Terminal or unknown, nothing to do
    Skip,
    /// Hand the step to a worker task
    Spawn,
    /// Wait for the parent to settle
    Park,
    /// Finish the step without running it
    Settle(StepStatus, Option<StepError>),
}

fn evaluate(board: &mut Board, order: u32, cancelled: bool) -> Action {
    let Some(step) = board.get(order) else {
        return Action::Skip;
    };
    if step.status.is_terminal() {
        return Action::Skip;
    }
    if cancelled {
        return Action::Settle(StepStatus::Cancelled, None);
    }
    let Some(parent_ref) = step.parent.filter(|_| step.input_asset.is_none()) else {
        return Action::Spawn;
    };

    let Some(parent) = board.get(parent_ref.step_order) else {
        return Action::Settle(
            StepStatus::Failed,
            Some(StepError::new(
                ErrorCategory::Validation,
                format!("parent step {} does not exist", parent_ref.step_order),
            )),
        );
    };

    let asset = match parent.status {
        StepStatus::Completed => match parent.outputs.get(parent_ref.output_index as usize) {
            Some(asset) => asset.clone(),
            None => {
                return Action::Settle(
                    StepStatus::Failed,
                    Some(StepError::new(
                        ErrorCategory::Validation,
                        format!(
                            "parent step {} produced {} output(s), slot {} is missing",
                            parent_ref.step_order,
                            parent.outputs.len(),
                            parent_ref.output_index
                        ),
                    )),
                );
            }
        },
        StepStatus::Failed => {
            // Only the parent was submitted ambiguously; its dependents never ran
            let category = match parent.last_error.as_ref().map(|e| e.category) {
                Some(ErrorCategory::CheckpointAmbiguous) | None => ErrorCategory::Unknown,
                Some(category) => category,
            };
            return Action::Settle(
                StepStatus::Failed,
                Some(StepError::new(
                    category,
                    format!("upstream step {} failed", parent_ref.step_order),
                )),
            );
        }
        StepStatus::Cancelled => return Action::Settle(StepStatus::Cancelled, None),
        StepStatus::Pending | StepStatus::Submitting | StepStatus::InProgress => {
            return Action::Park;
        }
    };

    if let Some(step) = board.get_mut(order) {
        step.input_asset = Some(asset);
    }
    Action::Spawn
}

#[cfg(test)]
mod tests {
    use super::*;
    use mosaic_core::domain::step::{ParentRef, StepConfig, StepType};

    fn step(order: u32, parent: Option<u32>) -> Step {
        let mut step = Step::new(
            Uuid::nil(),
            StepType::TransformImage,
            order,
            0,
            StepConfig {
                model: "flux-dev".to_string(),
                prompt: "red dress".to_string(),
                negative_prompt: None,
                quality: None,
                resolution: None,
                num_outputs: 1,
                params: Default::default(),
            },
        );
        if let Some(parent) = parent {
            step.step_type = StepType::AnimateImage;
            step = step.with_parent(ParentRef {
                step_order: parent,
                output_index: 1,
            });
        }
        step
    }

    #[test]
    fn test_child_waits_for_parent() {
        let mut board = Board::new(vec![step(0, None), step(1, Some(0))]);
        assert_eq!(evaluate(&mut board, 0, false), Action::Spawn);
        assert_eq!(evaluate(&mut board, 1, false), Action::Park);
        assert_eq!(board.children(0), vec![1]);
    }

    #[test]
    fn test_child_gets_parent_output() {
        let mut parent = step(0, None);
        parent.status = StepStatus::Completed;
        parent.outputs = vec!["a.png".to_string(), "b.png".to_string()];

        let mut board = Board::new(vec![parent, step(1, Some(0))]);
        assert_eq!(evaluate(&mut board, 1, false), Action::Spawn);
        assert_eq!(board.get(1).unwrap().input_asset.as_deref(), Some("b.png"));
    }

    #[test]
    fn test_missing_output_slot_fails_child() {
        let mut parent = step(0, None);
        parent.status = StepStatus::Completed;
        parent.outputs = vec!["a.png".to_string()];

        let mut board = Board::new(vec![parent, step(1, Some(0))]);
        match evaluate(&mut board, 1, false) {
            Action::Settle(StepStatus::Failed, Some(error)) => {
                assert_eq!(error.category, ErrorCategory::Validation)
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn test_parent_outcome_propagates() {
        let mut parent = step(0, None);
        parent.status = StepStatus::Failed;
        parent.last_error = Some(StepError::new(ErrorCategory::Auth, "bad key"));
        let mut board = Board::new(vec![parent, step(1, Some(0))]);
        match evaluate(&mut board, 1, false) {
            Action::Settle(StepStatus::Failed, Some(error)) => {
                assert_eq!(error.category, ErrorCategory::Auth)
            }
            other => panic!("unexpected action {other:?}"),
        }

        let mut parent = step(0, None);
        parent.status = StepStatus::Cancelled;
        let mut board = Board::new(vec![parent, step(1, Some(0))]);
        assert_eq!(
            evaluate(&mut board, 1, false),
            Action::Settle(StepStatus::Cancelled, None)
        );
    }

    #[test]
    fn test_ambiguous_parent_does_not_make_child_ambiguous() {
        let mut parent = step(0, None);
        parent.status = StepStatus::Failed;
        parent.last_error = Some(StepError::new(
            ErrorCategory::CheckpointAmbiguous,
            "submit outcome unknown",
        ));
        let mut board = Board::new(vec![parent, step(1, Some(0))]);
        match evaluate(&mut board, 1, false) {
            Action::Settle(StepStatus::Failed, Some(error)) => {
                assert_eq!(error.category, ErrorCategory::Unknown);
                assert_eq!(error.message, "upstream step 0 failed");
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn test_cancellation_settles_live_steps() {
        let mut done = step(0, None);
        done.status = StepStatus::Completed;
        let mut board = Board::new(vec![done, step(1, None)]);

        assert_eq!(evaluate(&mut board, 0, true), Action::Skip);
        assert_eq!(
            evaluate(&mut board, 1, true),
            Action::Settle(StepStatus::Cancelled, None)
        );
    }
}
