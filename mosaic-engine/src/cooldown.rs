//! Per-model cooldown (circuit breaker)
//!
//! Tracks failures per provider+model key. `failure_threshold` failures within
//! the trailing `window` open the breaker for `duration`; while open, steps
//! targeting that model stay pending instead of submitting. A success closes
//! the breaker and resets the counters.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::CooldownConfig;

/// Builds the cooldown key for a provider/model pair
pub fn cooldown_key(provider: &str, model: &str) -> String {
    format!("{provider}:{model}")
}

/// Point-in-time view of one key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CooldownSnapshot {
    pub consecutive_failures: u32,
    /// Failures inside the trailing window
    pub recent_failures: usize,
    /// Time left before the breaker closes, if open
    pub remaining: Option<Duration>,
}

#[derive(Debug, Default)]
struct CooldownEntry {
    consecutive_failures: u32,
    recent: VecDeque<Instant>,
    cooldown_until: Option<Instant>,
}

impl CooldownEntry {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.recent.front() {
            if now.saturating_duration_since(oldest) >= window {
                self.recent.pop_front();
            } else {
                break;
            }
        }
    }

    fn remaining(&self, now: Instant) -> Option<Duration> {
        self.cooldown_until
            .filter(|until| *until > now)
            .map(|until| until - now)
    }
}

/// Circuit breaker keyed by provider+model
#[derive(Debug)]
pub struct CooldownManager {
    config: CooldownConfig,
    entries: Mutex<HashMap<String, Arc<Mutex<CooldownEntry>>>>,
}

impl CooldownManager {
    pub fn new(config: CooldownConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entry(&self, key: &str) -> Arc<Mutex<CooldownEntry>> {
        let mut entries = self.entries.lock();
        Arc::clone(entries.entry(key.to_string()).or_default())
    }

    /// Records a failure; returns `true` when this failure opened the breaker
    pub fn record_failure(&self, key: &str) -> bool {
        let entry = self.entry(key);
        let mut entry = entry.lock();
        let now = Instant::now();

        entry.prune(now, self.config.window);
        entry.recent.push_back(now);
        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);

        if entry.recent.len() >= self.config.failure_threshold as usize
            && entry.remaining(now).is_none()
        {
            entry.cooldown_until = Some(now + self.config.duration);
            entry.recent.clear();
            warn!(
                "Model {} cooling down for {}s after {} consecutive failures",
                key,
                self.config.duration.as_secs(),
                entry.consecutive_failures
            );
            return true;
        }

        false
    }

    /// Records a success, closing the breaker and resetting counters
    pub fn record_success(&self, key: &str) {
        let entry = self.entry(key);
        let mut entry = entry.lock();
        if entry.cooldown_until.take().is_some() {
            info!("Model {} cooldown cleared by success", key);
        }
        entry.consecutive_failures = 0;
        entry.recent.clear();
    }

    pub fn is_cooling_down(&self, key: &str) -> bool {
        self.remaining(key).is_some()
    }

    /// Time left in the current cooldown, if any
    pub fn remaining(&self, key: &str) -> Option<Duration> {
        let entry = self.entry(key);
        let entry = entry.lock();
        entry.remaining(Instant::now())
    }

    pub fn snapshot(&self, key: &str) -> CooldownSnapshot {
        let entry = self.entry(key);
        let mut entry = entry.lock();
        let now = Instant::now();
        entry.prune(now, self.config.window);

        CooldownSnapshot {
            consecutive_failures: entry.consecutive_failures,
            recent_failures: entry.recent.len(),
            remaining: entry.remaining(now),
        }
    }
}
