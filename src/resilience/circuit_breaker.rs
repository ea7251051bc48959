use crate::config::duration_ms;
use crate::{Error, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitPhase {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerSnapshot {
    pub phase: CircuitPhase,
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
    pub failure_count: u32,
    /// Remaining open time in ms, if currently open.
    pub open_remaining_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    #[serde(rename = "cooldown_ms", with = "duration_ms")]
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }
}

/// Per-scope breaker state. The zero value is a closed circuit.
#[derive(Debug, Clone, Default)]
pub struct CircuitState {
    pub failure_count: u32,
    pub is_open: bool,
    pub next_attempt_allowed: Option<Instant>,
    pub last_failure: Option<Instant>,
    /// Set while the single half-open probe is outstanding.
    probe_started: Option<Instant>,
}

/// Circuit breakers keyed by scope.
///
/// - Counts consecutive failures per scope
/// - Opens for a cooldown after the threshold; calls fail fast meanwhile
/// - After the cooldown the next caller becomes the single half-open probe
///   (checked lazily, no background timer)
pub struct CircuitBreakers {
    cfg: CircuitBreakerConfig,
    scopes: DashMap<String, CircuitState>,
}

impl CircuitBreakers {
    pub fn new(cfg: CircuitBreakerConfig) -> Self {
        Self {
            cfg,
            scopes: DashMap::new(),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.cfg
    }

    /// Gate a call in `scope`. Fails with [`Error::CircuitOpen`] while open.
    pub fn allow(&self, scope: &str) -> Result<()> {
        let mut st = self.scopes.entry(scope.to_owned()).or_default();
        let now = Instant::now();

        if let Some(started) = st.probe_started {
            // A probe abandoned by its caller frees the slot after one cooldown.
            if now.saturating_duration_since(started) < self.cfg.cooldown {
                return Err(open_error(scope));
            }
            st.probe_started = None;
        }

        if !st.is_open {
            return Ok(());
        }

        match st.next_attempt_allowed {
            Some(next) if now < next => {
                warn!(scope, "circuit open, blocking request");
                Err(open_error(scope))
            }
            _ => {
                info!(scope, "circuit half-open, testing connectivity");
                st.is_open = false;
                st.probe_started = Some(now);
                Ok(())
            }
        }
    }

    /// True while the circuit rejects calls (open and cooling down).
    pub fn is_open(&self, scope: &str) -> bool {
        self.scopes.get(scope).is_some_and(|st| {
            st.is_open && st.next_attempt_allowed.is_some_and(|next| Instant::now() < next)
        })
    }

    pub fn record_success(&self, scope: &str) {
        if let Some(mut st) = self.scopes.get_mut(scope) {
            if st.probe_started.is_some() {
                info!(scope, "circuit probe succeeded, closing");
            }
            *st = CircuitState::default();
        }
    }

    /// End an outstanding half-open call that neither succeeded nor failed
    /// transiently. The circuit stays closed with its failure count kept, so
    /// the next transient failure reopens it.
    pub fn release_half_open(&self, scope: &str) {
        if let Some(mut st) = self.scopes.get_mut(scope) {
            if st.probe_started.take().is_some() {
                info!(scope, "half-open call ended with a permanent error, closing");
            }
        }
    }

    pub fn record_failure(&self, scope: &str) {
        let mut st = self.scopes.entry(scope.to_owned()).or_default();
        let now = Instant::now();
        st.failure_count = st.failure_count.saturating_add(1);
        st.last_failure = Some(now);

        let probe_failed = st.probe_started.take().is_some();
        if probe_failed || st.failure_count >= self.cfg.failure_threshold {
            st.failure_count = st.failure_count.max(self.cfg.failure_threshold);
            st.is_open = true;
            st.next_attempt_allowed = Some(now + self.cfg.cooldown);
            error!(
                scope,
                failures = st.failure_count,
                cooldown_ms = self.cfg.cooldown.as_millis() as u64,
                "circuit tripped, pausing requests"
            );
        }
    }

    pub fn phase(&self, scope: &str) -> CircuitPhase {
        match self.scopes.get(scope) {
            None => CircuitPhase::Closed,
            Some(st) => phase_of(&st, Instant::now()),
        }
    }

    pub fn snapshot(&self, scope: &str) -> CircuitBreakerSnapshot {
        let now = Instant::now();
        let (phase, failure_count, open_remaining_ms) = match self.scopes.get(scope) {
            None => (CircuitPhase::Closed, 0, None),
            Some(st) => {
                let remaining = st
                    .next_attempt_allowed
                    .filter(|next| st.is_open && *next > now)
                    .map(|next| (next - now).as_millis() as u64);
                (phase_of(&st, now), st.failure_count, remaining)
            }
        };
        CircuitBreakerSnapshot {
            phase,
            failure_threshold: self.cfg.failure_threshold,
            cooldown_ms: self.cfg.cooldown.as_millis() as u64,
            failure_count,
            open_remaining_ms,
        }
    }

    pub fn reset(&self, scope: &str) {
        self.scopes.remove(scope);
    }
}

fn phase_of(st: &CircuitState, now: Instant) -> CircuitPhase {
    if st.probe_started.is_some() {
        return CircuitPhase::HalfOpen;
    }
    match (st.is_open, st.next_attempt_allowed) {
        (true, Some(next)) if now < next => CircuitPhase::Open,
        (true, _) => CircuitPhase::HalfOpen,
        _ => CircuitPhase::Closed,
    }
}

fn open_error(scope: &str) -> Error {
    Error::CircuitOpen {
        scope: scope.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breakers() -> CircuitBreakers {
        CircuitBreakers::new(CircuitBreakerConfig::default())
    }

    #[test]
    fn test_circuit_breaker_config_builder() {
        let config = CircuitBreakerConfig::new()
            .with_failure_threshold(5)
            .with_cooldown(Duration::from_secs(10));
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.cooldown, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_scope_is_closed() {
        let cb = breakers();
        assert!(cb.allow("generation").is_ok());
        assert_eq!(cb.phase("other"), CircuitPhase::Closed);
        assert_eq!(cb.snapshot("other").failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_third_failure_opens() {
        let cb = breakers();
        cb.record_failure("s");
        cb.record_failure("s");
        assert!(cb.allow("s").is_ok());
        cb.record_failure("s");
        assert_eq!(cb.phase("s"), CircuitPhase::Open);
        assert!(cb.is_open("s"));
        let err = cb.allow("s").unwrap_err();
        assert!(matches!(err, Error::CircuitOpen { ref scope } if scope == "s"));
        assert_eq!(cb.snapshot("s").open_remaining_ms, Some(60_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failures() {
        let cb = breakers();
        cb.record_failure("s");
        cb.record_failure("s");
        cb.record_success("s");
        assert_eq!(cb.snapshot("s").failure_count, 0);
        cb.record_failure("s");
        assert_eq!(cb.phase("s"), CircuitPhase::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_single_probe() {
        let cb = breakers();
        for _ in 0..3 {
            cb.record_failure("s");
        }
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(cb.phase("s"), CircuitPhase::HalfOpen);

        assert!(cb.allow("s").is_ok());
        // Second caller while the probe is outstanding fails fast.
        assert!(cb.allow("s").is_err());

        cb.record_success("s");
        assert_eq!(cb.phase("s"), CircuitPhase::Closed);
        assert_eq!(cb.snapshot("s").failure_count, 0);
        assert!(cb.allow("s").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_reopens() {
        let cb = breakers();
        for _ in 0..3 {
            cb.record_failure("s");
        }
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(cb.allow("s").is_ok());
        cb.record_failure("s");
        assert_eq!(cb.phase("s"), CircuitPhase::Open);
        assert_eq!(cb.snapshot("s").open_remaining_ms, Some(60_000));
        assert!(cb.allow("s").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_probe_expires() {
        let cb = breakers();
        for _ in 0..3 {
            cb.record_failure("s");
        }
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(cb.allow("s").is_ok());
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(cb.allow("s").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_half_open_closes_and_keeps_count() {
        let cb = breakers();
        for _ in 0..3 {
            cb.record_failure("s");
        }
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(cb.allow("s").is_ok());
        cb.release_half_open("s");
        assert_eq!(cb.phase("s"), CircuitPhase::Closed);
        assert_eq!(cb.snapshot("s").failure_count, 3);
        assert!(cb.allow("s").is_ok());

        // Outside a half-open call it changes nothing.
        cb.release_half_open("other");
        assert_eq!(cb.phase("other"), CircuitPhase::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scopes_are_isolated() {
        let cb = breakers();
        for _ in 0..3 {
            cb.record_failure("generation");
        }
        assert!(cb.allow("generation").is_err());
        assert!(cb.allow("channel").is_ok());
    }
}
