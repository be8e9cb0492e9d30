//! Retry policy
//!
//! Per-category attempt budgets and exponential backoff with bounded jitter.

use mosaic_core::domain::step::ErrorCategory;
use rand::Rng;
use std::time::Duration;

use crate::classifier::Classification;
use crate::config::RetryConfig;

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after the given delay
    RetryAfter(Duration),
    /// Budget exhausted or category is fatal
    Stop,
}

/// Retry decisions for failed step attempts
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Number of retries allowed for a category
    pub fn budget(&self, category: ErrorCategory) -> u32 {
        match category {
            ErrorCategory::TransientNetwork | ErrorCategory::TransientServer => {
                self.config.transient_attempts
            }
            ErrorCategory::Timeout => self.config.timeout_attempts,
            ErrorCategory::RateLimit => self.config.rate_limit_attempts,
            ErrorCategory::Unknown => self.config.unknown_attempts,
            ErrorCategory::Validation | ErrorCategory::Auth | ErrorCategory::CheckpointAmbiguous => 0,
        }
    }

    /// Whether a step that already retried `retries_used` times may retry again
    pub fn should_retry(&self, category: ErrorCategory, retries_used: u32) -> bool {
        !category.is_fatal() && retries_used < self.budget(category)
    }

    /// Backoff before retry number `attempt` (0-based), without jitter
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.config
            .base_delay
            .saturating_mul(factor)
            .min(self.config.max_delay)
    }

    /// Backoff before retry number `attempt` with jitter applied
    ///
    /// A provider hint replaces the computed delay, clipped to
    /// `max_retry_after`.
    pub fn delay(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        if let Some(hint) = hint {
            return hint.min(self.config.max_retry_after);
        }

        let nominal = self.nominal_delay(attempt);
        let spread = nominal.as_secs_f64() * self.config.jitter_fraction;
        if spread <= 0.0 {
            return nominal;
        }

        let offset = rand::thread_rng().gen_range(-spread..=spread);
        let jittered = (nominal.as_secs_f64() + offset).max(0.0);
        Duration::from_secs_f64(jittered).min(self.config.max_delay)
    }

    /// Decides whether a classified failure gets another attempt
    pub fn decide(&self, retries_used: u32, classification: &Classification) -> RetryDecision {
        if !classification.retryable || !self.should_retry(classification.category, retries_used) {
            return RetryDecision::Stop;
        }
        RetryDecision::RetryAfter(self.delay(retries_used, classification.retry_after))
    }
}
