//! End-to-end pipeline runs against a scripted provider
//!
//! Every test runs on a paused clock so retries, cooldowns and poll
//! intervals elapse instantly.

use async_trait::async_trait;
use mosaic_core::domain::checkpoint::{CheckpointPhase, CheckpointRecord};
use mosaic_core::domain::pipeline::PipelineStatus;
use mosaic_core::domain::step::{ErrorCategory, StepStatus, StepType};
use mosaic_core::dto::pipeline::{
    AmbiguityResolution, AnimateStage, CombinationMode, CreateBulkPipeline, GenerationSettings,
    PipelineView, TransformStage,
};
use mosaic_engine::config::RateLimitConfig;
use mosaic_engine::journal::{CheckpointJournal, MemoryJournal};
use mosaic_engine::provider::{
    ModelCatalog, PollResponse, ProviderClient, ProviderError, ProviderKind, ProviderRegistry,
};
use mosaic_engine::store::{MemoryStore, PipelineStore};
use mosaic_engine::{EngineConfig, EngineError, Orchestrator};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const CATALOG: &str = r#"
[[models]]
id = "flux-dev"
provider = "fal"
step_type = "transform_image"
unit_price = 0.05

[[models]]
id = "kling-1.6"
provider = "fal"
step_type = "animate_image"
unit_price = 0.5

[[models]]
id = "sdxl"
provider = "replicate"
step_type = "transform_image"
unit_price = 0.01
"#;

// =============================================================================
// Scripted provider
// =============================================================================

#[derive(Default)]
struct FakeState {
    submits: Vec<serde_json::Value>,
    polls: Vec<String>,
    submit_errors: VecDeque<ProviderError>,
    poll_failures: VecDeque<(Option<u16>, String)>,
    poll_errors: VecDeque<ProviderError>,
    outputs: HashMap<String, u64>,
    hang: bool,
    next_id: u32,
    submit_delay: Option<Duration>,
    poll_delay: Option<Duration>,
    submits_in_flight: usize,
    max_submits_in_flight: usize,
    polls_in_flight: usize,
    max_polls_in_flight: usize,
}

#[derive(Default)]
struct FakeProvider {
    state: Mutex<FakeState>,
}

impl FakeProvider {
    fn fail_next_submit(&self, status: Option<u16>, message: &str) {
        self.state
            .lock()
            .submit_errors
            .push_back(ProviderError::new(status, message));
    }

    fn fail_next_poll(&self, status: Option<u16>, message: &str) {
        self.state
            .lock()
            .poll_failures
            .push_back((status, message.to_string()));
    }

    /// The poll call itself fails, as opposed to reporting a failed job
    fn fail_next_poll_call(&self, status: Option<u16>, message: &str) {
        self.state
            .lock()
            .poll_errors
            .push_back(ProviderError::new(status, message));
    }

    fn hang(&self) {
        self.state.lock().hang = true;
    }

    fn slow_calls(&self, submit: Duration, poll: Duration) {
        let mut state = self.state.lock();
        state.submit_delay = Some(submit);
        state.poll_delay = Some(poll);
    }

    fn max_in_flight(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.max_submits_in_flight, state.max_polls_in_flight)
    }

    fn submit_count(&self) -> usize {
        self.state.lock().submits.len()
    }

    fn submits(&self) -> Vec<serde_json::Value> {
        self.state.lock().submits.clone()
    }

    fn polls(&self) -> Vec<String> {
        self.state.lock().polls.clone()
    }
}

#[async_trait]
impl ProviderClient for FakeProvider {
    async fn submit(
        &self,
        _model: &str,
        payload: &serde_json::Value,
    ) -> Result<String, ProviderError> {
        let delay = {
            let mut state = self.state.lock();
            state.submits.push(payload.clone());
            state.submits_in_flight += 1;
            state.max_submits_in_flight = state.max_submits_in_flight.max(state.submits_in_flight);
            state.submit_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        state.submits_in_flight -= 1;
        if let Some(err) = state.submit_errors.pop_front() {
            return Err(err);
        }

        state.next_id += 1;
        let request_id = format!("req-{}", state.next_id);
        let outputs = payload["num_outputs"].as_u64().unwrap_or(1);
        state.outputs.insert(request_id.clone(), outputs);
        Ok(request_id)
    }

    async fn poll(&self, _model: &str, request_id: &str) -> Result<PollResponse, ProviderError> {
        let delay = {
            let mut state = self.state.lock();
            state.polls.push(request_id.to_string());
            state.polls_in_flight += 1;
            state.max_polls_in_flight = state.max_polls_in_flight.max(state.polls_in_flight);
            state.poll_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock();
        state.polls_in_flight -= 1;
        if let Some(err) = state.poll_errors.pop_front() {
            return Err(err);
        }
        if state.hang {
            return Ok(PollResponse::running());
        }
        if let Some((status, message)) = state.poll_failures.pop_front() {
            return Ok(PollResponse::failed(status, message));
        }

        let count = state.outputs.get(request_id).copied().unwrap_or(1);
        Ok(PollResponse::completed(
            (0..count)
                .map(|i| format!("https://cdn.test/{request_id}/{i}.png"))
                .collect(),
        ))
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    orchestrator: Orchestrator,
    store: Arc<MemoryStore>,
    journal: Arc<MemoryJournal>,
    provider: Arc<FakeProvider>,
    replicate: Arc<FakeProvider>,
}

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.retry.jitter_fraction = 0.0;
    config
}

fn harness() -> Harness {
    harness_with(test_config())
}

fn harness_with(config: EngineConfig) -> Harness {
    let catalog = ModelCatalog::from_toml_str(CATALOG).unwrap();
    let provider = Arc::new(FakeProvider::default());
    let replicate = Arc::new(FakeProvider::default());

    let mut clients: HashMap<ProviderKind, Arc<dyn ProviderClient>> = HashMap::new();
    clients.insert(ProviderKind::Fal, provider.clone());
    clients.insert(ProviderKind::Replicate, replicate.clone());
    let registry = Arc::new(ProviderRegistry::new(&catalog, clients).unwrap());

    let store = Arc::new(MemoryStore::new());
    let journal = Arc::new(MemoryJournal::new());
    let orchestrator =
        Orchestrator::new(config, store.clone(), journal.clone(), registry).unwrap();

    Harness {
        orchestrator,
        store,
        journal,
        provider,
        replicate,
    }
}

fn photos(sources: usize, prompts: usize) -> CreateBulkPipeline {
    CreateBulkPipeline {
        name: "spring catalog".to_string(),
        sources: (0..sources).map(|i| format!("https://assets.test/src-{i}.png")).collect(),
        transform: Some(TransformStage {
            model: "flux-dev".to_string(),
            prompts: (0..prompts).map(|i| format!("look {i}")).collect(),
            outputs_per_prompt: 1,
            settings: GenerationSettings::default(),
        }),
        animate: None,
        mode: CombinationMode::Photos,
        tags: vec!["spring".to_string()],
    }
}

fn both(outputs_per_prompt: u32) -> CreateBulkPipeline {
    CreateBulkPipeline {
        name: "runway".to_string(),
        sources: vec!["https://assets.test/model.png".to_string()],
        transform: Some(TransformStage {
            model: "flux-dev".to_string(),
            prompts: vec!["linen suit".to_string()],
            outputs_per_prompt,
            settings: GenerationSettings::default(),
        }),
        animate: Some(AnimateStage {
            model: "kling-1.6".to_string(),
            prompts: vec!["slow turn".to_string()],
            settings: GenerationSettings::default(),
        }),
        mode: CombinationMode::Both,
        tags: vec![],
    }
}

/// Polls the store until the pipeline leaves `running`
async fn wait_until_settled(orchestrator: &Orchestrator, pipeline_id: Uuid) -> PipelineView {
    for _ in 0..10_000 {
        let view = orchestrator.status(pipeline_id).await.unwrap();
        if view.status != PipelineStatus::Running && !orchestrator.is_running(pipeline_id) {
            return view;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    panic!("pipeline {pipeline_id} never settled");
}

// =============================================================================
// Runs
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_photos_pipeline_completes() {
    let h = harness();
    let pipeline = h.orchestrator.create_pipeline(photos(2, 2)).await.unwrap();
    assert_eq!(pipeline.steps.len(), 4);

    let status = h.orchestrator.run(pipeline.id).await.unwrap();
    assert_eq!(status, PipelineStatus::Completed);

    let view = h.orchestrator.status(pipeline.id).await.unwrap();
    assert_eq!(view.status, PipelineStatus::Completed);
    assert!(view.steps.iter().all(|s| s.status == StepStatus::Completed));
    assert!(view.steps.iter().all(|s| s.outputs.len() == 1));
    assert_eq!(h.provider.submit_count(), 4);
    assert!(!h.orchestrator.is_running(pipeline.id));
}

#[tokio::test(start_paused = true)]
async fn test_checkpoints_written_in_order() {
    let h = harness();
    let pipeline = h.orchestrator.create_pipeline(photos(1, 1)).await.unwrap();
    h.orchestrator.run(pipeline.id).await.unwrap();

    let phases: Vec<&'static str> = h
        .journal
        .records_for(pipeline.steps[0].id)
        .iter()
        .map(|r| r.phase.name())
        .collect();
    assert_eq!(phases, vec!["submit_started", "submitted", "done"]);
}

#[tokio::test(start_paused = true)]
async fn test_progress_events_follow_step_life_cycle() {
    let h = harness();
    let mut events = h.orchestrator.subscribe();
    let pipeline = h.orchestrator.create_pipeline(photos(1, 1)).await.unwrap();
    h.orchestrator.run(pipeline.id).await.unwrap();

    let mut transitions = Vec::new();
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.pipeline_id, pipeline.id);
        transitions.push((event.old_status, event.new_status));
    }
    assert_eq!(
        transitions,
        vec![
            (StepStatus::Pending, StepStatus::Submitting),
            (StepStatus::Submitting, StepStatus::InProgress),
            (StepStatus::InProgress, StepStatus::Completed),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_children_animate_parent_outputs() {
    let h = harness();
    let pipeline = h.orchestrator.create_pipeline(both(2)).await.unwrap();
    assert_eq!(pipeline.steps.len(), 3);

    let status = h.orchestrator.run(pipeline.id).await.unwrap();
    assert_eq!(status, PipelineStatus::Completed);

    let stored = h.store.get_pipeline(pipeline.id).await.unwrap().unwrap();
    let parent = &stored.steps[0];
    assert_eq!(parent.step_type, StepType::TransformImage);
    assert_eq!(parent.outputs.len(), 2);

    for (slot, child) in stored.steps[1..].iter().enumerate() {
        assert_eq!(child.step_type, StepType::AnimateImage);
        assert_eq!(child.input_asset.as_ref(), Some(&parent.outputs[slot]));
    }

    let animated: Vec<String> = h
        .provider
        .submits()
        .iter()
        .filter(|p| p["prompt"] == "slow turn")
        .filter_map(|p| p["image_url"].as_str().map(str::to_string))
        .collect();
    assert_eq!(animated.len(), 2);
    assert!(animated.iter().all(|url| parent.outputs.contains(url)));
}

#[tokio::test(start_paused = true)]
async fn test_upstream_failure_fails_dependents() {
    let h = harness();
    h.provider.fail_next_submit(Some(400), "prompt rejected by safety filter");

    let pipeline = h.orchestrator.create_pipeline(both(2)).await.unwrap();
    let status = h.orchestrator.run(pipeline.id).await.unwrap();
    assert_eq!(status, PipelineStatus::Failed);

    let view = h.orchestrator.status(pipeline.id).await.unwrap();
    assert!(view.steps.iter().all(|s| s.status == StepStatus::Failed));
    for child in &view.steps[1..] {
        let error = child.last_error.as_ref().unwrap();
        assert_eq!(error.category, ErrorCategory::Validation);
        assert!(error.message.contains("upstream step 0 failed"));
    }
    // Only the parent ever reached the provider
    assert_eq!(h.provider.submit_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transient_errors_are_retried() {
    let h = harness();
    h.provider.fail_next_submit(Some(503), "service unavailable");
    h.provider.fail_next_submit(None, "connection reset by peer");

    let pipeline = h.orchestrator.create_pipeline(photos(1, 1)).await.unwrap();
    let status = h.orchestrator.run(pipeline.id).await.unwrap();
    assert_eq!(status, PipelineStatus::Completed);

    let stored = h.store.get_pipeline(pipeline.id).await.unwrap().unwrap();
    assert_eq!(stored.steps[0].retry_count, 2);
    assert!(stored.steps[0].last_error.is_none());
    assert_eq!(h.provider.submit_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_provider_failure_after_submit_is_retried() {
    let h = harness();
    h.provider.fail_next_poll(Some(502), "upstream worker crashed");

    let pipeline = h.orchestrator.create_pipeline(photos(1, 1)).await.unwrap();
    let status = h.orchestrator.run(pipeline.id).await.unwrap();
    assert_eq!(status, PipelineStatus::Completed);

    let step_id = pipeline.steps[0].id;
    let phases: Vec<&'static str> = h
        .journal
        .records_for(step_id)
        .iter()
        .map(|r| r.phase.name())
        .collect();
    assert_eq!(
        phases,
        vec!["submit_started", "submitted", "failed", "submit_started", "submitted", "done"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_poll_call_errors_are_tolerated() {
    let h = harness();
    h.provider.fail_next_poll_call(None, "connection reset by peer");
    h.provider.fail_next_poll_call(None, "connection reset by peer");

    let pipeline = h.orchestrator.create_pipeline(photos(1, 1)).await.unwrap();
    let status = h.orchestrator.run(pipeline.id).await.unwrap();
    assert_eq!(status, PipelineStatus::Completed);

    // Same request polled again, never resubmitted
    assert_eq!(h.provider.submit_count(), 1);
    assert_eq!(h.provider.polls(), vec!["req-1"; 3]);
    let stored = h.store.get_pipeline(pipeline.id).await.unwrap().unwrap();
    assert_eq!(stored.steps[0].retry_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_poll_errors_past_limit_fail_the_attempt() {
    let mut config = test_config();
    config.max_poll_errors = 2;
    let h = harness_with(config);
    h.provider.fail_next_poll_call(Some(503), "service unavailable");
    h.provider.fail_next_poll_call(Some(503), "service unavailable");

    let pipeline = h.orchestrator.create_pipeline(photos(1, 1)).await.unwrap();
    let status = h.orchestrator.run(pipeline.id).await.unwrap();
    assert_eq!(status, PipelineStatus::Completed);

    let step_id = pipeline.steps[0].id;
    let phases: Vec<&'static str> = h
        .journal
        .records_for(step_id)
        .iter()
        .map(|r| r.phase.name())
        .collect();
    assert_eq!(
        phases,
        vec!["submit_started", "submitted", "failed", "submit_started", "submitted", "done"]
    );
    assert_eq!(h.provider.submit_count(), 2);
    let stored = h.store.get_pipeline(pipeline.id).await.unwrap().unwrap();
    assert_eq!(stored.steps[0].retry_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_fatal_error_is_not_retried() {
    let h = harness();
    h.provider.fail_next_submit(Some(401), "invalid api key");

    let pipeline = h.orchestrator.create_pipeline(photos(1, 1)).await.unwrap();
    let status = h.orchestrator.run(pipeline.id).await.unwrap();
    assert_eq!(status, PipelineStatus::Failed);

    let stored = h.store.get_pipeline(pipeline.id).await.unwrap().unwrap();
    let step = &stored.steps[0];
    assert_eq!(step.status, StepStatus::Failed);
    assert_eq!(step.retry_count, 0);
    assert_eq!(step.last_error.as_ref().unwrap().category, ErrorCategory::Auth);
    assert_eq!(h.provider.submit_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_terminal_submit_failure_is_journaled() {
    let h = harness();
    h.provider.fail_next_submit(Some(400), "invalid image");

    let pipeline = h.orchestrator.create_pipeline(photos(1, 1)).await.unwrap();
    let status = h.orchestrator.run(pipeline.id).await.unwrap();
    assert_eq!(status, PipelineStatus::Failed);

    let step_id = pipeline.steps[0].id;
    let phases: Vec<&'static str> = h
        .journal
        .records_for(step_id)
        .iter()
        .map(|r| r.phase.name())
        .collect();
    assert_eq!(phases, vec!["submit_started", "failed"]);

    match h.journal.latest(step_id).unwrap().phase {
        CheckpointPhase::Failed { error } => {
            assert_eq!(error.category, ErrorCategory::Validation);
            assert_eq!(error.message, "invalid image");
        }
        other => panic!("unexpected latest checkpoint {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_one_failed_step_fails_the_pipeline() {
    let h = harness();
    h.provider.fail_next_submit(Some(422), "unsupported resolution");

    let pipeline = h.orchestrator.create_pipeline(photos(3, 1)).await.unwrap();
    let status = h.orchestrator.run(pipeline.id).await.unwrap();
    assert_eq!(status, PipelineStatus::Failed);

    let view = h.orchestrator.status(pipeline.id).await.unwrap();
    assert_eq!(view.counts.get("completed"), Some(&2));
    assert_eq!(view.counts.get("failed"), Some(&1));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_uses_its_retry_budget() {
    let mut config = test_config();
    config.step_timeout = Duration::from_secs(30);
    config.retry.timeout_attempts = 1;
    let h = harness_with(config);
    h.provider.hang();

    let pipeline = h.orchestrator.create_pipeline(photos(1, 1)).await.unwrap();
    let status = h.orchestrator.run(pipeline.id).await.unwrap();
    assert_eq!(status, PipelineStatus::Failed);

    let stored = h.store.get_pipeline(pipeline.id).await.unwrap().unwrap();
    let step = &stored.steps[0];
    assert_eq!(step.retry_count, 1);
    assert_eq!(step.last_error.as_ref().unwrap().category, ErrorCategory::Timeout);
    assert_eq!(h.provider.submit_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_cooling_model_defers_submission() {
    let mut config = test_config();
    config.cooldown.failure_threshold = 1;
    config.cooldown.duration = Duration::from_secs(90);
    let h = harness_with(config);
    h.provider.fail_next_submit(Some(500), "internal error");

    let pipeline = h.orchestrator.create_pipeline(photos(1, 1)).await.unwrap();
    let started = tokio::time::Instant::now();
    let status = h.orchestrator.run(pipeline.id).await.unwrap();
    assert_eq!(status, PipelineStatus::Completed);
    assert!(started.elapsed() >= Duration::from_secs(90));

    // The deferral did not consume retry budget beyond the failed attempt
    let stored = h.store.get_pipeline(pipeline.id).await.unwrap().unwrap();
    assert_eq!(stored.steps[0].retry_count, 1);
    assert!(!h.orchestrator.cooldowns().is_cooling_down("fal:flux-dev"));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_running_pipeline() {
    let h = harness();
    h.provider.hang();

    let created = h
        .orchestrator
        .submit_bulk_pipeline(photos(2, 1))
        .await
        .unwrap();
    assert_eq!(created.step_count, 2);

    tokio::time::sleep(Duration::from_secs(10)).await;
    h.orchestrator.cancel(created.pipeline_id).await.unwrap();

    let view = wait_until_settled(&h.orchestrator, created.pipeline_id).await;
    assert_eq!(view.status, PipelineStatus::Cancelled);
    assert!(view.steps.iter().all(|s| s.status == StepStatus::Cancelled));

    // Cancelling a finished pipeline is a no-op
    h.orchestrator.cancel(created.pipeline_id).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_submit_records_accepted_request() {
    let h = harness();
    h.provider
        .slow_calls(Duration::from_secs(10), Duration::from_secs(1));

    let created = h
        .orchestrator
        .submit_bulk_pipeline(photos(1, 1))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    h.orchestrator.cancel(created.pipeline_id).await.unwrap();

    let view = wait_until_settled(&h.orchestrator, created.pipeline_id).await;
    assert_eq!(view.status, PipelineStatus::Cancelled);
    assert_eq!(h.provider.submit_count(), 1);
    assert!(h.provider.polls().is_empty());

    // The provider accepted the call, so its id must be on record
    let stored = h
        .store
        .get_pipeline(created.pipeline_id)
        .await
        .unwrap()
        .unwrap();
    let step = &stored.steps[0];
    assert_eq!(step.status, StepStatus::Cancelled);
    assert_eq!(step.request_id.as_deref(), Some("req-1"));
    assert_eq!(
        h.journal.latest(step.id).unwrap().phase,
        CheckpointPhase::Submitted {
            request_id: "req-1".to_string()
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancel_without_active_run() {
    let h = harness();
    let pipeline = h.orchestrator.create_pipeline(photos(2, 1)).await.unwrap();

    h.orchestrator.cancel(pipeline.id).await.unwrap();

    let view = h.orchestrator.status(pipeline.id).await.unwrap();
    assert_eq!(view.status, PipelineStatus::Cancelled);
    assert_eq!(h.provider.submit_count(), 0);
}

// =============================================================================
// Shared limits
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_rate_limit_saturation_delays_submission() {
    let h = harness();
    h.orchestrator.rate_limiter().set_quota(
        "fal",
        RateLimitConfig {
            max_calls: 2,
            window: Duration::from_secs(60),
        },
    );

    let pipeline = h.orchestrator.create_pipeline(photos(3, 1)).await.unwrap();
    let started = tokio::time::Instant::now();
    let status = h.orchestrator.run(pipeline.id).await.unwrap();
    assert_eq!(status, PipelineStatus::Completed);
    assert!(started.elapsed() >= Duration::from_secs(60));

    // Waiting for the window is not a failure
    let stored = h.store.get_pipeline(pipeline.id).await.unwrap().unwrap();
    assert!(stored.steps.iter().all(|s| s.retry_count == 0));
    assert_eq!(h.provider.submit_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_saturated_provider_does_not_hold_submit_slots() {
    let mut config = test_config();
    config.submit_concurrency = 1;
    let h = harness_with(config);
    h.orchestrator.rate_limiter().set_quota(
        "fal",
        RateLimitConfig {
            max_calls: 1,
            window: Duration::from_secs(600),
        },
    );

    let started = tokio::time::Instant::now();
    let on_fal = h
        .orchestrator
        .submit_bulk_pipeline(photos(2, 1))
        .await
        .unwrap();
    let mut request = photos(1, 1);
    if let Some(transform) = request.transform.as_mut() {
        transform.model = "sdxl".to_string();
    }
    let on_replicate = h.orchestrator.submit_bulk_pipeline(request).await.unwrap();

    let view = wait_until_settled(&h.orchestrator, on_replicate.pipeline_id).await;
    assert_eq!(view.status, PipelineStatus::Completed);
    assert!(started.elapsed() < Duration::from_secs(60));
    assert_eq!(h.replicate.submit_count(), 1);

    let view = wait_until_settled(&h.orchestrator, on_fal.pipeline_id).await;
    assert_eq!(view.status, PipelineStatus::Completed);
    assert!(started.elapsed() >= Duration::from_secs(600));
    assert_eq!(h.provider.submit_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_calls_stay_within_pool_sizes() {
    let mut config = test_config();
    config.submit_concurrency = 2;
    config.poll_concurrency = 3;
    let h = harness_with(config);
    h.provider
        .slow_calls(Duration::from_secs(5), Duration::from_secs(3));

    let pipeline = h.orchestrator.create_pipeline(photos(4, 2)).await.unwrap();
    let status = h.orchestrator.run(pipeline.id).await.unwrap();
    assert_eq!(status, PipelineStatus::Completed);
    assert_eq!(h.provider.submit_count(), 8);

    let (submits, polls) = h.provider.max_in_flight();
    assert_eq!(submits, 2);
    assert!((1..=3).contains(&polls));
}

// =============================================================================
// Restart recovery
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_resume_polls_submitted_request() {
    let h = harness();
    let pipeline = h.orchestrator.create_pipeline(photos(1, 1)).await.unwrap();

    // State left behind by a process that died while polling
    let mut step = pipeline.steps[0].clone();
    step.status = StepStatus::InProgress;
    step.request_id = Some("req-before-crash".to_string());
    h.store.update_step(&step).await.unwrap();
    for phase in [
        CheckpointPhase::SubmitStarted,
        CheckpointPhase::Submitted {
            request_id: "req-before-crash".to_string(),
        },
    ] {
        h.journal
            .append(CheckpointRecord::new(pipeline.id, step.id, phase))
            .await
            .unwrap();
    }

    let resumed = h.orchestrator.resume().await.unwrap();
    assert_eq!(resumed, vec![pipeline.id]);

    let view = wait_until_settled(&h.orchestrator, pipeline.id).await;
    assert_eq!(view.status, PipelineStatus::Completed);
    assert_eq!(h.provider.submit_count(), 0);
    assert!(h.provider.polls().iter().all(|id| id == "req-before-crash"));
}

#[tokio::test(start_paused = true)]
async fn test_done_checkpoint_completes_without_calls() {
    let h = harness();
    let pipeline = h.orchestrator.create_pipeline(photos(1, 1)).await.unwrap();

    let mut step = pipeline.steps[0].clone();
    step.status = StepStatus::InProgress;
    h.store.update_step(&step).await.unwrap();
    h.journal
        .append(CheckpointRecord::new(
            pipeline.id,
            step.id,
            CheckpointPhase::Done {
                outputs: vec!["https://cdn.test/recovered.png".to_string()],
            },
        ))
        .await
        .unwrap();

    let status = h.orchestrator.run(pipeline.id).await.unwrap();
    assert_eq!(status, PipelineStatus::Completed);
    assert_eq!(h.provider.submit_count(), 0);
    assert!(h.provider.polls().is_empty());
}

async fn leave_ambiguous_step(h: &Harness) -> (Uuid, Uuid) {
    let pipeline = h.orchestrator.create_pipeline(photos(1, 1)).await.unwrap();
    let mut step = pipeline.steps[0].clone();
    step.status = StepStatus::Submitting;
    h.store.update_step(&step).await.unwrap();
    h.journal
        .append(CheckpointRecord::new(
            pipeline.id,
            step.id,
            CheckpointPhase::SubmitStarted,
        ))
        .await
        .unwrap();

    let status = h.orchestrator.run(pipeline.id).await.unwrap();
    assert_eq!(status, PipelineStatus::Failed);
    (pipeline.id, step.id)
}

#[tokio::test(start_paused = true)]
async fn test_ambiguous_submission_is_surfaced() {
    let h = harness();
    let (pipeline_id, step_id) = leave_ambiguous_step(&h).await;

    let view = h.orchestrator.status(pipeline_id).await.unwrap();
    let step = view.steps.iter().find(|s| s.id == step_id).unwrap();
    assert_eq!(step.status, StepStatus::Failed);
    assert_eq!(
        step.last_error.as_ref().unwrap().category,
        ErrorCategory::CheckpointAmbiguous
    );
    assert_eq!(h.provider.submit_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_resubmit_resolution_runs_step_again() {
    let h = harness();
    let (pipeline_id, step_id) = leave_ambiguous_step(&h).await;

    h.orchestrator
        .resolve_ambiguous(pipeline_id, step_id, AmbiguityResolution::Resubmit)
        .await
        .unwrap();

    let view = wait_until_settled(&h.orchestrator, pipeline_id).await;
    assert_eq!(view.status, PipelineStatus::Completed);
    assert_eq!(h.provider.submit_count(), 1);

    // A completed step cannot be resolved again
    let err = h
        .orchestrator
        .resolve_ambiguous(pipeline_id, step_id, AmbiguityResolution::Resubmit)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidState(_)));
}

#[tokio::test(start_paused = true)]
async fn test_abandon_resolution_keeps_step_failed() {
    let h = harness();
    let (pipeline_id, step_id) = leave_ambiguous_step(&h).await;

    h.orchestrator
        .resolve_ambiguous(pipeline_id, step_id, AmbiguityResolution::Abandon)
        .await
        .unwrap();

    let view = h.orchestrator.status(pipeline_id).await.unwrap();
    assert_eq!(view.status, PipelineStatus::Failed);
    let last = h.journal.latest(step_id).unwrap();
    assert_eq!(last.phase.name(), "failed");
    assert_eq!(h.provider.submit_count(), 0);
}

// =============================================================================
// Requests
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_invalid_request_creates_nothing() {
    let h = harness();
    let mut request = photos(1, 1);
    request.sources.clear();

    let err = h.orchestrator.create_pipeline(request).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    assert!(h.store.list_unfinished().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_estimate_uses_catalog_prices() {
    let h = harness();
    let estimate = h.orchestrator.estimate(&both(2)).unwrap();

    assert_eq!(estimate.per_step_type[&StepType::TransformImage].unit_count, 1);
    assert_eq!(estimate.per_step_type[&StepType::AnimateImage].unit_count, 2);
    assert!((estimate.grand_total - 1.05).abs() < 1e-9);
    assert_eq!(h.provider.submit_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_pipeline() {
    let h = harness();
    let err = h.orchestrator.status(Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, EngineError::PipelineNotFound(_)));
}
