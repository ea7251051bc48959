use crate::config::duration_ms;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct RateLimitSnapshot {
    pub history_len: usize,
    /// Remaining penalty window, if one is active.
    pub backoff_remaining: Option<Duration>,
    /// Time since the last recorded request.
    pub since_last_request: Option<Duration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Minimum spacing between two requests for the same key.
    #[serde(rename = "min_interval_ms", with = "duration_ms")]
    pub min_interval: Duration,
    /// Upper bound for a single smoothing wait (penalty windows are not capped).
    #[serde(rename = "max_smoothing_wait_ms", with = "duration_ms")]
    pub max_smoothing_wait: Duration,
    /// How many recent timestamps feed the average-interval check.
    pub smoothing_window: usize,
    /// How many timestamps are retained per key.
    pub history_capacity: usize,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(3),
            max_smoothing_wait: Duration::from_secs(10),
            smoothing_window: 5,
            history_capacity: 20,
        }
    }
}

impl RateLimiterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn with_max_smoothing_wait(mut self, wait: Duration) -> Self {
        self.max_smoothing_wait = wait;
        self
    }

    pub fn with_smoothing_window(mut self, window: usize) -> Self {
        self.smoothing_window = window;
        self
    }

    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.history_capacity = capacity;
        self
    }
}

#[derive(Debug, Default)]
struct RateLimitState {
    last_request: Option<Instant>,
    backoff_until: Option<Instant>,
    /// Newest last.
    history: VecDeque<Instant>,
}

/// Per-key request pacing.
///
/// - Keys are created lazily on first use
/// - Each key is serialized by its own lock; unrelated keys never wait on each other
/// - `acquire` never fails, it only suspends
pub struct RateLimiter {
    cfg: RateLimiterConfig,
    keys: DashMap<String, Arc<Mutex<RateLimitState>>>,
}

impl RateLimiter {
    pub fn new(cfg: RateLimiterConfig) -> Self {
        Self {
            cfg,
            keys: DashMap::new(),
        }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.cfg
    }

    fn slot(&self, key: &str) -> Arc<Mutex<RateLimitState>> {
        if let Some(existing) = self.keys.get(key) {
            return Arc::clone(existing.value());
        }
        let entry = self.keys.entry(key.to_owned()).or_default();
        Arc::clone(entry.value())
    }

    /// Wait until `key` may issue a request, then record it.
    pub async fn acquire(&self, key: &str) {
        let slot = self.slot(key);
        let mut st = slot.lock().await;

        let now = Instant::now();
        if let Some(until) = st.backoff_until {
            if now < until {
                let wait = until - now;
                debug!(key, wait_ms = wait.as_millis() as u64, "penalty window active, waiting");
                tokio::time::sleep(wait).await;
            }
            st.backoff_until = None;
        }

        let wait = self.smoothing_wait(&st, Instant::now());
        if !wait.is_zero() {
            debug!(key, wait_ms = wait.as_millis() as u64, "smoothing request burst");
            tokio::time::sleep(wait).await;
        }

        let stamped = Instant::now();
        st.last_request = Some(stamped);
        st.history.push_back(stamped);
        while st.history.len() > self.cfg.history_capacity.max(1) {
            st.history.pop_front();
        }
    }

    /// Extend the penalty window of `key` to at least `now + duration`.
    pub async fn penalize(&self, key: &str, duration: Duration) {
        let slot = self.slot(key);
        let mut st = slot.lock().await;
        let until = Instant::now() + duration;
        st.backoff_until = Some(match st.backoff_until {
            Some(existing) if existing > until => existing,
            _ => until,
        });
        debug!(key, penalty_ms = duration.as_millis() as u64, "rate limit penalty applied");
    }

    fn smoothing_wait(&self, st: &RateLimitState, now: Instant) -> Duration {
        let min = self.cfg.min_interval;
        let Some(last) = st.last_request else {
            return Duration::ZERO;
        };
        let since_last = now.saturating_duration_since(last);

        // Hard gap to the previous request.
        let mut wait = min.saturating_sub(since_last);

        // Average spacing over the recent window; a burst keeps paying its
        // shortfall until enough time has passed since the last request.
        let window = st.history.len().min(self.cfg.smoothing_window);
        if window >= 2 {
            let newest = st.history[st.history.len() - 1];
            let oldest = st.history[st.history.len() - window];
            let avg = newest.saturating_duration_since(oldest) / (window as u32 - 1);
            if avg < min {
                wait = wait.max((min - avg).saturating_sub(since_last));
            }
        }

        wait.min(self.cfg.max_smoothing_wait)
    }

    /// Recorded request timestamps for `key`, oldest first.
    pub async fn history(&self, key: &str) -> Vec<Instant> {
        match self.keys.get(key).map(|e| Arc::clone(e.value())) {
            Some(slot) => slot.lock().await.history.iter().copied().collect(),
            None => Vec::new(),
        }
    }

    pub async fn snapshot(&self, key: &str) -> RateLimitSnapshot {
        let Some(slot) = self.keys.get(key).map(|e| Arc::clone(e.value())) else {
            return RateLimitSnapshot {
                history_len: 0,
                backoff_remaining: None,
                since_last_request: None,
            };
        };
        let st = slot.lock().await;
        let now = Instant::now();
        RateLimitSnapshot {
            history_len: st.history.len(),
            backoff_remaining: st
                .backoff_until
                .and_then(|until| (until > now).then(|| until - now)),
            since_last_request: st.last_request.map(|t| now.saturating_duration_since(t)),
        }
    }

    pub fn tracked_keys(&self) -> usize {
        self.keys.len()
    }

    pub fn clear(&self) {
        self.keys.clear();
    }
}
