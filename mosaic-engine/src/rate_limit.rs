//! Sliding-window rate limiter
//!
//! Admission control per provider key: at most `max_calls` admissions within
//! any trailing `window`. Saturation delays callers, it never rejects work.
//!
//! Each key owns its own lock, so contention on one provider does not block
//! admission checks for another. Time comes from `tokio::time::Instant` so
//! tests can drive the window with a paused clock.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RateLimitConfig;

/// Point-in-time view of one key's window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStats {
    /// Admissions inside the current window
    pub used: usize,
    pub limit: usize,
    pub remaining: usize,
    /// Time until the next slot frees up (zero when a slot is free)
    pub retry_in: Duration,
    pub window: Duration,
}

#[derive(Debug)]
struct Window {
    quota: RateLimitConfig,
    admissions: VecDeque<Instant>,
}

impl Window {
    fn new(quota: RateLimitConfig) -> Self {
        Self {
            quota,
            admissions: VecDeque::with_capacity(quota.max_calls),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(&oldest) = self.admissions.front() {
            if now.saturating_duration_since(oldest) >= self.quota.window {
                self.admissions.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Computes stats from an already-pruned window
fn stats_of(window: &Window, now: Instant) -> RateLimitStats {
    let used = window.admissions.len();
    let limit = window.quota.max_calls;
    let retry_in = if used < limit {
        Duration::ZERO
    } else {
        // The slot frees when the admission `used - limit` positions from the
        // front leaves the window.
        window
            .admissions
            .get(used - limit)
            .map(|&t| (t + window.quota.window).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    };

    RateLimitStats {
        used,
        limit,
        remaining: limit.saturating_sub(used),
        retry_in,
        window: window.quota.window,
    }
}

/// Per-key sliding-window limiter
#[derive(Debug)]
pub struct RateLimiter {
    default_quota: RateLimitConfig,
    overrides: Mutex<HashMap<String, RateLimitConfig>>,
    windows: Mutex<HashMap<String, Arc<Mutex<Window>>>>,
}

impl RateLimiter {
    pub fn new(default_quota: RateLimitConfig) -> Self {
        Self {
            default_quota,
            overrides: Mutex::new(HashMap::new()),
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Sets a quota for one key, replacing the default
    ///
    /// Existing admissions are kept and counted against the new quota.
    pub fn set_quota(&self, key: &str, quota: RateLimitConfig) {
        self.overrides.lock().insert(key.to_string(), quota);
        if let Some(window) = self.windows.lock().get(key) {
            window.lock().quota = quota;
        }
    }

    fn quota_for(&self, key: &str) -> RateLimitConfig {
        self.overrides
            .lock()
            .get(key)
            .copied()
            .unwrap_or(self.default_quota)
    }

    fn window(&self, key: &str) -> Arc<Mutex<Window>> {
        if let Some(window) = self.windows.lock().get(key) {
            return Arc::clone(window);
        }

        let quota = self.quota_for(key);
        let mut windows = self.windows.lock();
        Arc::clone(
            windows
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(Window::new(quota)))),
        )
    }

    /// Records an admission if the window has room
    pub fn try_acquire(&self, key: &str) -> bool {
        let window = self.window(key);
        let mut window = window.lock();
        let now = Instant::now();
        window.prune(now);

        if window.admissions.len() < window.quota.max_calls {
            window.admissions.push_back(now);
            true
        } else {
            false
        }
    }

    /// Time until `try_acquire` would succeed for `key`
    pub fn time_until_available(&self, key: &str) -> Duration {
        self.stats(key).retry_in
    }

    /// Current usage of `key`, taken from one snapshot of its window
    pub fn stats(&self, key: &str) -> RateLimitStats {
        let window = self.window(key);
        let mut window = window.lock();
        let now = Instant::now();
        window.prune(now);
        stats_of(&window, now)
    }

    /// Waits until admitted or until `cancel` fires
    ///
    /// Returns `false` when cancelled before admission.
    pub async fn acquire(&self, key: &str, cancel: &CancellationToken) -> bool {
        loop {
            if cancel.is_cancelled() {
                return false;
            }

            let wait = {
                let window = self.window(key);
                let mut window = window.lock();
                let now = Instant::now();
                window.prune(now);
                if window.admissions.len() < window.quota.max_calls {
                    window.admissions.push_back(now);
                    return true;
                }
                stats_of(&window, now).retry_in
            };

            debug!("Rate limit for {} saturated, waiting {}ms", key, wait.as_millis());

            // A zero wait can only come from clock granularity; wait a tick.
            let wait = wait.max(Duration::from_millis(1));
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Hands back the most recent admission for `key`
    ///
    /// Used when an admitted call was never made (cancelled between admission
    /// and submit). Best-effort: an empty window is logged and ignored.
    pub fn release(&self, key: &str) {
        let window = self.window(key);
        let mut window = window.lock();
        if window.admissions.pop_back().is_none() {
            warn!("Rate limit release for {} with no recorded admission", key);
        }
    }
}
