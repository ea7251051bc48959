//! Resilient call executor.
//!
//! Composes the circuit breaker, the per-recipient rate limiter and a bounded
//! retry loop around one outbound async call. One executor is configured per
//! scope and invoked explicitly by callers.

use super::circuit_breaker::{CircuitBreakerConfig, CircuitBreakers};
use super::rate_limiter::{RateLimiter, RateLimiterConfig};
use crate::config::duration_ms;
use crate::types::Recipient;
use crate::{Error, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Well-known call scopes.
pub struct Scope;

impl Scope {
    pub const CHANNEL: &'static str = "channel";
    pub const GENERATION: &'static str = "generation";
}

/// Retry budget and backoff shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt; `RetryAfter` signals do not count.
    pub max_retries: u32,
    #[serde(rename = "initial_delay_ms", with = "duration_ms")]
    pub initial_delay: Duration,
    #[serde(rename = "max_delay_ms", with = "duration_ms")]
    pub max_delay: Duration,
    /// Upper bound of the uniform jitter added to each backoff.
    #[serde(rename = "max_jitter_ms", with = "duration_ms")]
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_jitter: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_max_jitter(mut self, jitter: Duration) -> Self {
        self.max_jitter = jitter;
        self
    }

    /// Delay before retry number `retry` (1-based), before jitter:
    /// `initial_delay * 2^(retry-1)`, capped at `max_delay`.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn backoff(&self, retry: u32) -> Duration {
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        self.base_delay(retry) + jitter
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub scope: String,
    pub retry: RetryPolicy,
    /// Gate calls through the scope's circuit breaker.
    pub circuit_breaker: bool,
    /// Pace calls per recipient through the rate limiter.
    pub rate_limit_recipients: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            scope: "default".to_string(),
            retry: RetryPolicy::default(),
            circuit_breaker: false,
            rate_limit_recipients: false,
        }
    }
}

impl ExecutorConfig {
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            ..Self::default()
        }
    }

    /// Downstream channel calls: paced per recipient, no breaker.
    pub fn channel() -> Self {
        Self {
            scope: Scope::CHANNEL.to_string(),
            retry: RetryPolicy::default().with_max_retries(3),
            circuit_breaker: false,
            rate_limit_recipients: true,
        }
    }

    /// Upstream generation calls: breaker on, no recipient pacing.
    pub fn generation() -> Self {
        Self {
            scope: Scope::GENERATION.to_string(),
            retry: RetryPolicy::default().with_max_retries(2),
            circuit_breaker: true,
            rate_limit_recipients: false,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_circuit_breaker(mut self, enabled: bool) -> Self {
        self.circuit_breaker = enabled;
        self
    }

    pub fn with_rate_limit_recipients(mut self, enabled: bool) -> Self {
        self.rate_limit_recipients = enabled;
        self
    }
}

/// Process-wide resilience state: rate-limit and circuit maps.
///
/// Share one instance (behind `Arc`) between all executors of an engine;
/// separate instances are fully isolated.
pub struct ResilienceState {
    pub rate_limiter: RateLimiter,
    pub breakers: CircuitBreakers,
}

impl ResilienceState {
    pub fn new(rate_limit: RateLimiterConfig, circuit_breaker: CircuitBreakerConfig) -> Self {
        Self {
            rate_limiter: RateLimiter::new(rate_limit),
            breakers: CircuitBreakers::new(circuit_breaker),
        }
    }
}

impl Default for ResilienceState {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default(), CircuitBreakerConfig::default())
    }
}

/// Result of a call that survived the resilience layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome<T> {
    Completed(T),
    /// The callee reported a no-op edit; treated as success.
    Unchanged,
}

impl<T> CallOutcome<T> {
    pub fn completed(self) -> Option<T> {
        match self {
            CallOutcome::Completed(v) => Some(v),
            CallOutcome::Unchanged => None,
        }
    }

    pub fn is_unchanged(&self) -> bool {
        matches!(self, CallOutcome::Unchanged)
    }
}

/// Explicit resilience wrapper for one scope of outbound calls.
#[derive(Clone)]
pub struct ResilientExecutor {
    cfg: ExecutorConfig,
    state: Arc<ResilienceState>,
}

impl ResilientExecutor {
    pub fn new(cfg: ExecutorConfig, state: Arc<ResilienceState>) -> Self {
        Self { cfg, state }
    }

    pub fn scope(&self) -> &str {
        &self.cfg.scope
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.cfg
    }

    pub fn state(&self) -> &Arc<ResilienceState> {
        &self.state
    }

    /// Run `call` under this scope's policy.
    ///
    /// `recipient` keys the rate limiter when recipient pacing is enabled;
    /// calls to different recipients never wait on each other.
    pub async fn execute<T, F, Fut>(
        &self,
        recipient: Option<&Recipient>,
        operation: &'static str,
        mut call: F,
    ) -> Result<CallOutcome<T>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let scope = self.cfg.scope.as_str();
        let breaker = self.cfg.circuit_breaker;

        if breaker {
            self.state.breakers.allow(scope)?;
        }

        let key = recipient
            .filter(|_| self.cfg.rate_limit_recipients)
            .map(|r| r.rate_key(scope));
        if let Some(ref key) = key {
            self.state.rate_limiter.acquire(key).await;
        }

        let mut retries = 0u32;
        loop {
            match call().await {
                Ok(value) => {
                    if breaker {
                        self.state.breakers.record_success(scope);
                    }
                    return Ok(CallOutcome::Completed(value));
                }
                Err(Error::RetryAfter { seconds }) => {
                    let wait = Duration::from_secs(seconds.saturating_add(1));
                    warn!(scope, operation, wait_s = wait.as_secs(), "rate limited by callee, waiting");
                    if let Some(ref key) = key {
                        self.state.rate_limiter.penalize(key, wait).await;
                    }
                    tokio::time::sleep(wait).await;
                }
                Err(Error::NotModified) => {
                    debug!(scope, operation, "content unchanged, treating as success");
                    if breaker {
                        self.state.breakers.record_success(scope);
                    }
                    return Ok(CallOutcome::Unchanged);
                }
                Err(e) if !e.is_retryable() => {
                    error!(scope, operation, error = %e, "non-retryable failure");
                    if breaker {
                        self.state.breakers.release_half_open(scope);
                    }
                    return Err(e);
                }
                Err(e) => {
                    retries += 1;
                    if breaker {
                        self.state.breakers.record_failure(scope);
                    }
                    if retries > self.cfg.retry.max_retries {
                        error!(
                            scope,
                            operation,
                            max_retries = self.cfg.retry.max_retries,
                            error = %e,
                            "max retries exceeded"
                        );
                        return Err(e);
                    }
                    if breaker && self.state.breakers.is_open(scope) {
                        warn!(scope, operation, error = %e, "circuit opened mid-call, giving up");
                        return Err(e);
                    }
                    let delay = self.cfg.retry.backoff(retries);
                    warn!(
                        scope,
                        operation,
                        attempt = retries,
                        max_retries = self.cfg.retry.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_defaults() {
        let p = RetryPolicy::default();
        assert_eq!(p.max_retries, 5);
        assert_eq!(p.initial_delay, Duration::from_secs(1));
        assert_eq!(p.max_jitter, Duration::from_millis(500));
    }

    #[test]
    fn test_base_delay_doubles_and_caps() {
        let p = RetryPolicy::new().with_max_delay(Duration::from_secs(10));
        assert_eq!(p.base_delay(1), Duration::from_secs(1));
        assert_eq!(p.base_delay(2), Duration::from_secs(2));
        assert_eq!(p.base_delay(3), Duration::from_secs(4));
        assert_eq!(p.base_delay(5), Duration::from_secs(10));
        assert_eq!(p.base_delay(40), Duration::from_secs(10));
    }

    #[test]
    fn test_backoff_jitter_range() {
        let p = RetryPolicy::new();
        for _ in 0..50 {
            let d = p.backoff(2);
            assert!(d >= Duration::from_secs(2));
            assert!(d <= Duration::from_millis(2500));
        }
        let no_jitter = p.with_max_jitter(Duration::ZERO);
        assert_eq!(no_jitter.backoff(2), Duration::from_secs(2));
    }

    #[test]
    fn test_scope_presets() {
        let ch = ExecutorConfig::channel();
        assert_eq!(ch.scope, Scope::CHANNEL);
        assert!(ch.rate_limit_recipients);
        assert!(!ch.circuit_breaker);

        let gen = ExecutorConfig::generation();
        assert_eq!(gen.scope, Scope::GENERATION);
        assert!(gen.circuit_breaker);
        assert_eq!(gen.retry.max_retries, 2);
    }

    #[test]
    fn test_call_outcome_helpers() {
        assert_eq!(CallOutcome::Completed(3).completed(), Some(3));
        assert!(CallOutcome::<u8>::Unchanged.is_unchanged());
        assert_eq!(CallOutcome::<u8>::Unchanged.completed(), None);
    }
}
