//! Engine configuration
//!
//! Defines all tunable parameters of the orchestration engine: worker pool
//! widths, poll cadence, step timeout, and the settings of the rate limiter,
//! cooldown manager and retry policy.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{EngineError, Result};

/// Sliding-window admission settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    /// Calls admitted per window and key
    pub max_calls: usize,
    /// Length of the trailing window
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_calls: 60,
            window: Duration::from_secs(60),
        }
    }
}

/// Per-model circuit breaker settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CooldownConfig {
    /// Failures within `window` that open the breaker
    pub failure_threshold: u32,
    pub window: Duration,
    /// How long the breaker stays open
    pub duration: Duration,
}

impl Default for CooldownConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            window: Duration::from_secs(300),
            duration: Duration::from_secs(120),
        }
    }
}

/// Backoff schedule and attempt budgets
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the nominal delay used as the jitter half-width (0.0–1.0)
    pub jitter_fraction: f64,
    /// Upper bound for provider-suggested retry-after hints
    pub max_retry_after: Duration,
    pub transient_attempts: u32,
    pub timeout_attempts: u32,
    pub rate_limit_attempts: u32,
    pub unknown_attempts: u32,
}

impl RetryConfig {
    /// Largest attempt budget over all categories
    pub fn max_attempts(&self) -> u32 {
        self.transient_attempts
            .max(self.timeout_attempts)
            .max(self.rate_limit_attempts)
            .max(self.unknown_attempts)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter_fraction: 0.2,
            max_retry_after: Duration::from_secs(300),
            transient_attempts: 5,
            timeout_attempts: 5,
            rate_limit_attempts: 2,
            unknown_attempts: 2,
        }
    }
}

/// Engine configuration
///
/// All timeouts and intervals are configurable to allow tuning for
/// different providers (fast image models vs slow video models).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Concurrent external submit calls
    pub submit_concurrency: usize,

    /// Concurrent external poll calls
    pub poll_concurrency: usize,

    /// First poll interval after a successful submit
    pub poll_initial_interval: Duration,

    /// Poll interval cap
    pub poll_max_interval: Duration,

    /// Maximum time a submitted step may take to reach a terminal status
    pub step_timeout: Duration,

    /// Consecutive failing poll calls tolerated before the attempt fails
    pub max_poll_errors: u32,

    /// Path of the checkpoint journal file
    pub journal_path: PathBuf,

    /// Capacity of the progress event broadcast channel
    pub event_capacity: usize,

    pub rate_limit: RateLimitConfig,
    pub cooldown: CooldownConfig,
    pub retry: RetryConfig,
}

impl EngineConfig {
    /// Creates configuration from environment variables
    ///
    /// Every variable is optional and falls back to its default:
    /// - MOSAIC_SUBMIT_CONCURRENCY (default: 20)
    /// - MOSAIC_POLL_CONCURRENCY (default: 20)
    /// - MOSAIC_POLL_INITIAL_MS (default: 2000)
    /// - MOSAIC_POLL_MAX_MS (default: 15000)
    /// - MOSAIC_STEP_TIMEOUT (seconds, default: 600)
    /// - MOSAIC_RATE_LIMIT_MAX (default: 60)
    /// - MOSAIC_RATE_LIMIT_WINDOW (seconds, default: 60)
    /// - MOSAIC_COOLDOWN_THRESHOLD (default: 3)
    /// - MOSAIC_COOLDOWN_WINDOW (seconds, default: 300)
    /// - MOSAIC_COOLDOWN_DURATION (seconds, default: 120)
    /// - MOSAIC_RETRY_BASE_MS (default: 1000)
    /// - MOSAIC_RETRY_CAP_MS (default: 60000)
    /// - MOSAIC_RETRY_JITTER (fraction, default: 0.2)
    /// - MOSAIC_JOURNAL_PATH (default: ./mosaic-checkpoints.jsonl)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let rate_limit = RateLimitConfig {
            max_calls: env_parse("MOSAIC_RATE_LIMIT_MAX")
                .unwrap_or(defaults.rate_limit.max_calls),
            window: env_secs("MOSAIC_RATE_LIMIT_WINDOW").unwrap_or(defaults.rate_limit.window),
        };

        let cooldown = CooldownConfig {
            failure_threshold: env_parse("MOSAIC_COOLDOWN_THRESHOLD")
                .unwrap_or(defaults.cooldown.failure_threshold),
            window: env_secs("MOSAIC_COOLDOWN_WINDOW").unwrap_or(defaults.cooldown.window),
            duration: env_secs("MOSAIC_COOLDOWN_DURATION").unwrap_or(defaults.cooldown.duration),
        };

        let retry = RetryConfig {
            base_delay: env_millis("MOSAIC_RETRY_BASE_MS").unwrap_or(defaults.retry.base_delay),
            max_delay: env_millis("MOSAIC_RETRY_CAP_MS").unwrap_or(defaults.retry.max_delay),
            jitter_fraction: env_parse("MOSAIC_RETRY_JITTER")
                .unwrap_or(defaults.retry.jitter_fraction),
            ..defaults.retry
        };

        Self {
            submit_concurrency: env_parse("MOSAIC_SUBMIT_CONCURRENCY")
                .unwrap_or(defaults.submit_concurrency),
            poll_concurrency: env_parse("MOSAIC_POLL_CONCURRENCY")
                .unwrap_or(defaults.poll_concurrency),
            poll_initial_interval: env_millis("MOSAIC_POLL_INITIAL_MS")
                .unwrap_or(defaults.poll_initial_interval),
            poll_max_interval: env_millis("MOSAIC_POLL_MAX_MS")
                .unwrap_or(defaults.poll_max_interval),
            step_timeout: env_secs("MOSAIC_STEP_TIMEOUT").unwrap_or(defaults.step_timeout),
            journal_path: std::env::var("MOSAIC_JOURNAL_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.journal_path),
            rate_limit,
            cooldown,
            retry,
            ..defaults
        }
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<()> {
        if self.submit_concurrency == 0 {
            return Err(invalid("submit_concurrency must be greater than 0"));
        }

        if self.poll_concurrency == 0 {
            return Err(invalid("poll_concurrency must be greater than 0"));
        }

        if self.poll_initial_interval.is_zero() {
            return Err(invalid("poll_initial_interval must be greater than 0"));
        }

        if self.poll_max_interval < self.poll_initial_interval {
            return Err(invalid(
                "poll_max_interval must not be shorter than poll_initial_interval",
            ));
        }

        if self.step_timeout.is_zero() {
            return Err(invalid("step_timeout must be greater than 0"));
        }

        if self.rate_limit.max_calls == 0 || self.rate_limit.window.is_zero() {
            return Err(invalid("rate limit needs a positive call count and window"));
        }

        if self.cooldown.failure_threshold == 0 {
            return Err(invalid("cooldown failure_threshold must be greater than 0"));
        }

        if !(0.0..=1.0).contains(&self.retry.jitter_fraction) {
            return Err(invalid("retry jitter_fraction must be within 0.0..=1.0"));
        }

        if self.retry.max_delay < self.retry.base_delay {
            return Err(invalid("retry max_delay must not be shorter than base_delay"));
        }

        if self.event_capacity == 0 {
            return Err(invalid("event_capacity must be greater than 0"));
        }

        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            submit_concurrency: 20,
            poll_concurrency: 20,
            poll_initial_interval: Duration::from_secs(2),
            poll_max_interval: Duration::from_secs(15),
            step_timeout: Duration::from_secs(600),
            max_poll_errors: 5,
            journal_path: PathBuf::from("mosaic-checkpoints.jsonl"),
            event_capacity: 1024,
            rate_limit: RateLimitConfig::default(),
            cooldown: CooldownConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

fn invalid(msg: &str) -> EngineError {
    EngineError::Config(msg.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse::<T>().ok())
}

fn env_secs(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_secs)
}

fn env_millis(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}
