//! 日志模块：基于 tracing-subscriber 的结构化日志初始化。
//!
//! # Logging
//!
//! Every component logs through `tracing` with structured fields (`scope`,
//! `key`, `attempt`, `delay_ms`, `stream_id`, ...). This module only installs
//! a subscriber; embedding applications that already install their own can
//! skip it.
//!
//! | Level | Used for |
//! |-------|----------|
//! | `error` | circuit trips, exhausted retries, chunker fallback |
//! | `warn` | retries, penalties, oversized parts, formatting issues |
//! | `info` | stream lifecycle, half-open probes |
//! | `debug` | rate-limit waits, flush details |

use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset, e.g. `info` or
    /// `stream_relay=debug`.
    pub level: String,
    /// Emit one JSON object per line instead of human-readable text.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl LoggingConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    fn filter(&self) -> Result<EnvFilter> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        EnvFilter::try_new(&self.level).map_err(|e| {
            Error::configuration_with_context(
                format!("Config 'LOG_LEVEL' must be a log filter, got '{}'", self.level),
                ErrorContext::new()
                    .with_details(e.to_string())
                    .with_source("telemetry"),
            )
        })
    }
}

/// Install the global subscriber.
///
/// Returns `Ok(false)` when a global subscriber was already installed.
pub fn init_logging(cfg: &LoggingConfig) -> Result<bool> {
    let registry = tracing_subscriber::registry().with(cfg.filter()?);
    let installed = if cfg.json {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_target(false).with_thread_ids(false))
            .try_init()
    };
    Ok(installed.is_ok())
}
