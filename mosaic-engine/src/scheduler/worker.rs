//! Step worker
//!
//! Drives a single step through `pending → submitting → in_progress` to a
//! terminal status, looping back to `pending` while the retry policy allows.
//! Every wait selects on the pipeline's cancellation token; external calls
//! are always awaited to completion and their result discarded if the
//! pipeline was cancelled meanwhile.

use mosaic_core::domain::checkpoint::{CheckpointPhase, CheckpointRecord};
use mosaic_core::domain::step::{ErrorCategory, Step, StepError, StepStatus};
use mosaic_core::dto::event::ProgressEvent;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, broadcast};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::classifier::{Classification, classify, classify_provider_error};
use crate::config::EngineConfig;
use crate::cooldown::{CooldownManager, cooldown_key};
use crate::journal::CheckpointJournal;
use crate::provider::{
    PollStatus, ProviderClient, ProviderError, ProviderKind, ProviderRegistry, build_payload,
};
use crate::rate_limit::RateLimiter;
use crate::retry::{RetryDecision, RetryPolicy};
use crate::store::PipelineStore;

/// Where a step task starts
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Resume {
    /// Submit from scratch
    Fresh,
    /// Poll an existing provider request
    Poll(String),
}

/// Outcome of one submit+poll attempt
#[derive(Debug)]
enum Attempt {
    Completed(Vec<String>),
    Failed {
        error: StepError,
        classification: Classification,
        /// Whether the provider accepted a request during this attempt
        submitted: bool,
    },
    Cancelled,
}

impl Attempt {
    fn from_provider_error(err: &ProviderError, submitted: bool) -> Self {
        let classification = classify_provider_error(err);
        Attempt::Failed {
            error: StepError::new(classification.category, err.message.clone()),
            classification,
            submitted,
        }
    }

    fn failed(category: ErrorCategory, message: impl Into<String>, submitted: bool) -> Self {
        Attempt::Failed {
            error: StepError::new(category, message),
            classification: Classification::new(category),
            submitted,
        }
    }
}

/// Shared execution state for all step tasks
pub(crate) struct Worker {
    pub(crate) config: EngineConfig,
    pub(crate) store: Arc<dyn PipelineStore>,
    pub(crate) journal: Arc<dyn CheckpointJournal>,
    pub(crate) registry: Arc<ProviderRegistry>,
    pub(crate) rate_limiter: Arc<RateLimiter>,
    pub(crate) cooldowns: Arc<CooldownManager>,
    pub(crate) retry: RetryPolicy,
    submit_permits: Semaphore,
    poll_permits: Semaphore,
    events: broadcast::Sender<ProgressEvent>,
}

impl Worker {
    pub(crate) fn new(
        config: EngineConfig,
        store: Arc<dyn PipelineStore>,
        journal: Arc<dyn CheckpointJournal>,
        registry: Arc<ProviderRegistry>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity);
        Self {
            rate_limiter: Arc::new(RateLimiter::new(config.rate_limit)),
            cooldowns: Arc::new(CooldownManager::new(config.cooldown)),
            retry: RetryPolicy::new(config.retry),
            submit_permits: Semaphore::new(config.submit_concurrency),
            poll_permits: Semaphore::new(config.poll_concurrency),
            events,
            config,
            store,
            journal,
            registry,
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Writes the step to the store, logging failures
    pub(crate) async fn persist(&self, step: &Step) {
        if let Err(e) = self.store.update_step(step).await {
            error!("Failed to persist step {}: {}", step.id, e);
        }
    }

    /// Moves a step to `status`, persists it and emits a progress event
    pub(crate) async fn set_status(&self, step: &mut Step, status: StepStatus) {
        let old = step.transition(status);
        self.persist(step).await;

        if old != status {
            // No subscribers is fine
            let _ = self
                .events
                .send(ProgressEvent::new(step.pipeline_id, step.id, old, status));
        }
    }

    /// Appends a checkpoint, logging failures
    async fn checkpoint(&self, step: &Step, phase: CheckpointPhase) -> bool {
        let name = phase.name();
        match self
            .journal
            .append(CheckpointRecord::new(step.pipeline_id, step.id, phase))
            .await
        {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to write {} checkpoint for step {}: {}", name, step.id, e);
                false
            }
        }
    }

    // =========================================================================
    // Step life cycle
    // =========================================================================

    /// Runs a step to a terminal status and hands it back
    pub(crate) async fn drive(
        self: Arc<Self>,
        mut step: Step,
        resume: Resume,
        cancel: CancellationToken,
    ) -> Step {
        let (provider, client) = match self.registry.resolve(&step.config.model) {
            Ok((entry, client)) => (entry.provider, client),
            Err(e) => {
                error!("Cannot run step {}: {}", step.id, e);
                step.last_error = Some(StepError::new(ErrorCategory::Validation, e.to_string()));
                self.set_status(&mut step, StepStatus::Failed).await;
                return step;
            }
        };
        let breaker_key = cooldown_key(provider.as_str(), &step.config.model);

        let mut next = resume;
        loop {
            let attempt = match std::mem::replace(&mut next, Resume::Fresh) {
                Resume::Poll(request_id) => {
                    info!("Resuming poll of {} for step {}", request_id, step.id);
                    self.poll_until_terminal(&step, client.as_ref(), &request_id, &cancel)
                        .await
                }
                Resume::Fresh => {
                    self.attempt(&mut step, provider, client.as_ref(), &breaker_key, &cancel)
                        .await
                }
            };

            match attempt {
                Attempt::Completed(outputs) => {
                    self.checkpoint(
                        &step,
                        CheckpointPhase::Done {
                            outputs: outputs.clone(),
                        },
                    )
                    .await;
                    self.cooldowns.record_success(&breaker_key);

                    step.outputs = outputs;
                    step.last_error = None;
                    self.set_status(&mut step, StepStatus::Completed).await;
                    info!(
                        "Step {} completed with {} output(s)",
                        step.id,
                        step.outputs.len()
                    );
                    return step;
                }
                Attempt::Cancelled => {
                    debug!("Step {} cancelled", step.id);
                    self.set_status(&mut step, StepStatus::Cancelled).await;
                    return step;
                }
                Attempt::Failed {
                    error,
                    classification,
                    submitted,
                } => {
                    let decision = self.retry.decide(step.retry_count, &classification);

                    // Terminal failures are always journaled, retried ones only once submitted
                    if submitted || decision == RetryDecision::Stop {
                        self.checkpoint(
                            &step,
                            CheckpointPhase::Failed {
                                error: error.clone(),
                            },
                        )
                        .await;
                    }
                    if error.category != ErrorCategory::Validation {
                        self.cooldowns.record_failure(&breaker_key);
                    }
                    step.last_error = Some(error.clone());

                    match decision {
                        RetryDecision::RetryAfter(delay) => {
                            step.retry_count += 1;
                            warn!(
                                "Step {} attempt failed ({}), retry {} in {}ms: {}",
                                step.id,
                                error.category,
                                step.retry_count,
                                delay.as_millis(),
                                error.message
                            );
                            self.set_status(&mut step, StepStatus::Pending).await;

                            tokio::select! {
                                _ = cancel.cancelled() => {
                                    self.set_status(&mut step, StepStatus::Cancelled).await;
                                    return step;
                                }
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                        RetryDecision::Stop => {
                            error!(
                                "Step {} failed ({}) after {} retries: {}",
                                step.id,
                                error.category,
                                step.retry_count,
                                error.message
                            );
                            self.set_status(&mut step, StepStatus::Failed).await;
                            return step;
                        }
                    }
                }
            }
        }
    }

    /// One submit followed by polling until terminal
    async fn attempt(
        &self,
        step: &mut Step,
        provider: ProviderKind,
        client: &dyn ProviderClient,
        breaker_key: &str,
        cancel: &CancellationToken,
    ) -> Attempt {
        let rate_key = provider.as_str();
        let permit = loop {
            // A cooling-down model defers the step without using retry budget
            while let Some(remaining) = self.cooldowns.remaining(breaker_key) {
                debug!(
                    "Model {} cooling down for {}ms, deferring step {}",
                    breaker_key,
                    remaining.as_millis(),
                    step.id
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Attempt::Cancelled,
                    _ = tokio::time::sleep(remaining) => {}
                }
            }

            // Admission first: a saturated provider must not hold a submit slot
            if !self.rate_limiter.acquire(rate_key, cancel).await {
                return Attempt::Cancelled;
            }
            if self.cooldowns.is_cooling_down(breaker_key) {
                self.rate_limiter.release(rate_key);
                continue;
            }

            let acquired = tokio::select! {
                _ = cancel.cancelled() => None,
                permit = self.submit_permits.acquire() => permit.ok(),
            };
            match acquired {
                Some(permit) => break permit,
                None => {
                    self.rate_limiter.release(rate_key);
                    return Attempt::Cancelled;
                }
            }
        };

        self.set_status(step, StepStatus::Submitting).await;

        if !self.checkpoint(step, CheckpointPhase::SubmitStarted).await {
            self.rate_limiter.release(rate_key);
            return Attempt::failed(
                ErrorCategory::Unknown,
                "could not record submit checkpoint",
                false,
            );
        }

        if cancel.is_cancelled() {
            self.rate_limiter.release(rate_key);
            return Attempt::Cancelled;
        }

        let payload = build_payload(step);
        let submitted = client.submit(&step.config.model, &payload).await;
        drop(permit);

        let request_id = match submitted {
            Ok(request_id) => request_id,
            Err(_) if cancel.is_cancelled() => return Attempt::Cancelled,
            Err(e) => return Attempt::from_provider_error(&e, false),
        };

        // Accepted work is recorded even when the pipeline was cancelled meanwhile
        self.checkpoint(
            step,
            CheckpointPhase::Submitted {
                request_id: request_id.clone(),
            },
        )
        .await;
        step.request_id = Some(request_id.clone());

        if cancel.is_cancelled() {
            debug!("Step {} cancelled after provider accepted {}", step.id, request_id);
            return Attempt::Cancelled;
        }

        self.set_status(step, StepStatus::InProgress).await;
        debug!("Step {} submitted as {}", step.id, request_id);

        self.poll_until_terminal(step, client, &request_id, cancel)
            .await
    }

    /// Polls on a growing interval until terminal, timeout or cancellation
    async fn poll_until_terminal(
        &self,
        step: &Step,
        client: &dyn ProviderClient,
        request_id: &str,
        cancel: &CancellationToken,
    ) -> Attempt {
        let model = step.config.model.as_str();
        let deadline = Instant::now() + self.config.step_timeout;
        let mut interval = self.config.poll_initial_interval;
        let mut poll_errors = 0u32;

        loop {
            let wake = (Instant::now() + interval).min(deadline);
            tokio::select! {
                _ = cancel.cancelled() => return Attempt::Cancelled,
                _ = tokio::time::sleep_until(wake) => {}
            }

            if Instant::now() >= deadline {
                return Attempt::failed(
                    ErrorCategory::Timeout,
                    format!(
                        "no terminal status after {}s",
                        self.config.step_timeout.as_secs()
                    ),
                    true,
                );
            }

            let response = {
                let permit = tokio::select! {
                    _ = cancel.cancelled() => return Attempt::Cancelled,
                    permit = self.poll_permits.acquire() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return Attempt::Cancelled,
                    },
                };
                let response = client.poll(model, request_id).await;
                drop(permit);
                response
            };

            if cancel.is_cancelled() {
                return Attempt::Cancelled;
            }

            match response {
                Ok(poll) => {
                    poll_errors = 0;
                    match poll.status {
                        PollStatus::Completed if !poll.outputs.is_empty() => {
                            return Attempt::Completed(poll.outputs);
                        }
                        PollStatus::Completed => {
                            return Attempt::failed(
                                ErrorCategory::Unknown,
                                "provider reported completion without outputs",
                                true,
                            );
                        }
                        PollStatus::Failed => {
                            let err = poll.error.map(ProviderError::from).unwrap_or_else(|| {
                                ProviderError::new(None, "provider reported failure without detail")
                            });
                            return Attempt::from_provider_error(&err, true);
                        }
                        PollStatus::Queued | PollStatus::Running => {
                            debug!("Request {} for step {} still {:?}", request_id, step.id, poll.status);
                        }
                    }
                }
                Err(e) => {
                    poll_errors += 1;
                    let classification = classify(e.status, &e.message);
                    if !classification.retryable || poll_errors >= self.config.max_poll_errors {
                        return Attempt::from_provider_error(&e, true);
                    }
                    warn!(
                        "Poll of {} failed ({} in a row), polling again: {}",
                        request_id,
                        poll_errors,
                        e
                    );
                }
            }

            interval = next_poll_interval(interval, self.config.poll_max_interval);
        }
    }
}

fn next_poll_interval(current: Duration, max: Duration) -> Duration {
    current.mul_f64(1.5).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poll_interval_grows_to_cap() {
        let config = EngineConfig::default();
        let max = config.poll_max_interval;

        let mut interval = config.poll_initial_interval;
        assert_eq!(interval, Duration::from_secs(2));
        interval = next_poll_interval(interval, max);
        assert_eq!(interval, Duration::from_secs(3));
        interval = next_poll_interval(interval, max);
        assert_eq!(interval, Duration::from_millis(4500));

        for _ in 0..10 {
            interval = next_poll_interval(interval, max);
        }
        assert_eq!(interval, Duration::from_secs(15));
    }
}
