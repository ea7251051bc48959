//! 弹性模块：按键限流、按作用域熔断，以及组合二者的重试执行器。
//!
//! # Resilience Module
//!
//! Protects both the upstream generation service and the downstream channel
//! from overload and transient failure.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`rate_limiter`] | Per-key minimum spacing plus callee-imposed penalty windows |
//! | [`circuit_breaker`] | Per-scope closed / open / half-open state machine |
//! | [`executor`] | Retry loop with backoff and jitter composing the two above |
//!
//! ## Circuit Breaker
//!
//! - **Closed**: calls pass through, consecutive failures are counted
//! - **Open**: threshold reached, calls fail fast with [`crate::Error::CircuitOpen`]
//! - **Half-Open**: cooldown elapsed, exactly one probe call is admitted
//!
//! ## Executor
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use stream_relay::resilience::{ExecutorConfig, ResilienceState, ResilientExecutor};
//! use stream_relay::types::Recipient;
//!
//! # async fn demo() -> stream_relay::Result<()> {
//! let state = Arc::new(ResilienceState::default());
//! let channel = ResilientExecutor::new(ExecutorConfig::channel(), state);
//! let chat = Recipient::new("42");
//!
//! let outcome = channel
//!     .execute(Some(&chat), "send", || async { Ok::<_, stream_relay::Error>("msg-1") })
//!     .await?;
//! # let _ = outcome;
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod executor;
pub mod rate_limiter;

pub use circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitBreakers, CircuitPhase,
};
pub use executor::{
    CallOutcome, ExecutorConfig, ResilienceState, ResilientExecutor, RetryPolicy, Scope,
};
pub use rate_limiter::{RateLimitSnapshot, RateLimiter, RateLimiterConfig};
