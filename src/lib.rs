//! # stream-relay
//!
//! 这是一个弹性的流式投递引擎：把上游生成服务的文本流可靠地投递到有限速、有长度限制的消息渠道。
//!
//! Resilient streaming delivery engine - relays incrementally generated text
//! from an upstream generation service into a rate-limited, size-limited
//! messaging channel.
//!
//! ## Overview
//!
//! The engine sits between two unreliable collaborators. Upstream, a
//! generation source yields text fragments lazily and may fail transiently.
//! Downstream, a chat channel throttles senders, caps message size and speaks
//! its own markup dialect. The engine keeps a live, in-place-updated view of
//! the growing answer, splits it into channel-sized messages, promotes large
//! code blocks to attachments and attaches a navigation affordance once the
//! answer is complete.
//!
//! ## Core Philosophy
//!
//! - **Explicit composition**: resilience is an executor object callers invoke, not a hidden wrapper
//! - **Owned state**: rate-limit and circuit registries live in an injected [`resilience::ResilienceState`]
//! - **Never lose output**: the chunker always produces deliverable text, falling back to escaped plain windows
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use stream_relay::channel::RecordingChannel;
//! use stream_relay::generation::{FragmentsSource, GenerationRequest};
//! use stream_relay::storage::InMemoryArtifactStore;
//! use stream_relay::{EngineConfig, ResilienceState, StreamAccumulator};
//! use stream_relay::types::Recipient;
//!
//! #[tokio::main]
//! async fn main() -> stream_relay::Result<()> {
//!     let mut cfg = EngineConfig::new();
//!     cfg.apply_env()?;
//!     stream_relay::telemetry::init_logging(&cfg.logging)?;
//!
//!     let state = Arc::new(ResilienceState::new(cfg.rate_limit.clone(), cfg.circuit_breaker.clone()));
//!     let accumulator = StreamAccumulator::new(
//!         &cfg,
//!         state,
//!         Arc::new(RecordingChannel::new()),
//!         Arc::new(FragmentsSource::new(["Hello ", "World"])),
//!         Arc::new(InMemoryArtifactStore::new()),
//!     );
//!
//!     let report = accumulator
//!         .run(&GenerationRequest::new("conv-1", "hi"), &Recipient::new("42"), None)
//!         .await?;
//!     println!("delivered {} message(s)", report.messages.len());
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`resilience`] | Rate limiter, circuit breaker and resilient call executor |
//! | [`chunker`] | Structured-text chunking, notation normalization, code promotion |
//! | [`stream`] | Streaming accumulator (flush, reconcile, finalize) |
//! | [`debounce`] | Burst debouncer for multi-part uploads |
//! | [`channel`] | Downstream channel contract and a recording double |
//! | [`generation`] | Upstream generation contract and a replaying double |
//! | [`storage`] | Artifact store contract and an in-memory store |
//! | [`types`] | Messages, segments, assets, attachments |
//! | [`config`] | Layered engine configuration |
//! | [`telemetry`] | `tracing` subscriber setup |

pub mod channel;
pub mod chunker;
pub mod config;
pub mod debounce;
pub mod generation;
pub mod resilience;
pub mod storage;
pub mod stream;
pub mod telemetry;
pub mod types;

// Re-export main types for convenience
pub use chunker::{ChunkOutput, Chunker, ChunkerConfig};
pub use config::EngineConfig;
pub use debounce::{BurstBatch, BurstDebouncer, DebounceConfig};
pub use resilience::{CallOutcome, ExecutorConfig, ResilienceState, ResilientExecutor, Scope};
pub use stream::{StreamAccumulator, StreamConfig, StreamReport};

use futures::Stream;
use std::pin::Pin;

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// A unified pinned, boxed stream that emits `Result<T>`
pub type BoxStream<'a, T> = Pin<Box<dyn Stream<Item = Result<T>> + Send + 'a>>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext, ErrorKind};
