//! 引擎配置：默认值、YAML/JSON 文件与环境变量三层合并。
//!
//! Engine configuration.
//!
//! Precedence, lowest to highest: built-in defaults, a YAML or JSON file,
//! then environment variables (see [`EngineConfig::apply_env`]).

use crate::chunker::ChunkerConfig;
use crate::debounce::DebounceConfig;
use crate::resilience::circuit_breaker::CircuitBreakerConfig;
use crate::resilience::executor::ExecutorConfig;
use crate::resilience::rate_limiter::RateLimiterConfig;
use crate::stream::{NavigationConfig, StreamConfig};
use crate::telemetry::LoggingConfig;
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Top-level configuration for one engine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Downstream channel calls (send/edit).
    pub channel: ExecutorConfig,
    /// Upstream generation calls.
    pub generation: ExecutorConfig,
    pub rate_limit: RateLimiterConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub chunker: ChunkerConfig,
    pub stream: StreamConfig,
    pub navigation: NavigationConfig,
    pub debounce: DebounceConfig,
    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            channel: ExecutorConfig::channel(),
            generation: ExecutorConfig::generation(),
            rate_limit: RateLimiterConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            chunker: ChunkerConfig::default(),
            stream: StreamConfig::default(),
            navigation: NavigationConfig::default(),
            debounce: DebounceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_yaml_str(source: &str) -> Result<Self> {
        let cfg: EngineConfig = serde_yaml::from_str(source)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json_str(source: &str) -> Result<Self> {
        let cfg: EngineConfig = serde_json::from_str(source)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a `.yaml`/`.yml` or `.json` file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&raw),
            Some("yaml") | Some("yml") => Self::from_yaml_str(&raw),
            other => Err(Error::configuration_with_context(
                "unsupported config file extension",
                ErrorContext::new()
                    .with_details(format!("got {:?}, expected yaml, yml or json", other))
                    .with_source("config_loader"),
            )),
        }
    }

    /// Overlay process environment variables.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Overlay values from an arbitrary key lookup (environment-shaped).
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_env::<usize>(&lookup, "MAX_MESSAGE_LENGTH", "int")? {
            self.chunker.max_message_len = v;
        }
        if let Some(v) = parse_env::<usize>(&lookup, "SAFE_MESSAGE_LENGTH", "int")? {
            self.chunker.safe_message_len = v;
            self.stream.error_text_limit = v;
        }
        if let Some(v) = parse_env::<f64>(&lookup, "MIN_UPDATE_INTERVAL", "float")? {
            self.rate_limit.min_interval = secs_to_duration("MIN_UPDATE_INTERVAL", v)?;
        }
        if let Some(v) = parse_env::<f64>(&lookup, "MAX_UPDATE_INTERVAL", "float")? {
            self.rate_limit.max_smoothing_wait = secs_to_duration("MAX_UPDATE_INTERVAL", v)?;
        }
        if let Some(v) = parse_env::<f64>(&lookup, "INITIAL_RETRY_DELAY", "float")? {
            let d = secs_to_duration("INITIAL_RETRY_DELAY", v)?;
            self.channel.retry.initial_delay = d;
            self.generation.retry.initial_delay = d;
        }
        if let Some(v) = parse_env::<f64>(&lookup, "MAX_RETRY_DELAY", "float")? {
            let d = secs_to_duration("MAX_RETRY_DELAY", v)?;
            self.channel.retry.max_delay = d;
            self.generation.retry.max_delay = d;
        }
        if let Some(v) = parse_env::<u32>(&lookup, "MAX_RETRIES", "int")? {
            self.channel.retry.max_retries = v;
            self.generation.retry.max_retries = v;
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.logging.level = level.to_lowercase();
        }
        if let Some(raw) = lookup("LOG_JSON") {
            self.logging.json = parse_bool(&raw);
        }
        if let Some(raw) = lookup("WEB_BASE_URL") {
            let url = url::Url::parse(&raw).map_err(|e| {
                Error::configuration_with_context(
                    format!("Config 'WEB_BASE_URL' must be url, got '{}'", raw),
                    ErrorContext::new()
                        .with_details(e.to_string())
                        .with_source("config_env"),
                )
            })?;
            self.navigation.web_base_url = Some(url);
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        let c = &self.chunker;
        if c.max_message_len == 0 || c.safe_message_len == 0 {
            return Err(invalid("message lengths must be positive"));
        }
        if c.safe_message_len > c.max_message_len {
            return Err(invalid(format!(
                "safe_message_len ({}) exceeds max_message_len ({})",
                c.safe_message_len, c.max_message_len
            )));
        }
        if c.code_budget("") == 0 {
            return Err(invalid(format!(
                "max_message_len ({}) leaves no room for code after a {} char safety margin",
                c.max_message_len, c.safety_margin
            )));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(invalid("circuit_breaker.failure_threshold must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::configuration_with_context(msg, ErrorContext::new().with_source("config_validate"))
}

fn parse_env<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    type_name: &str,
) -> Result<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            Error::configuration_with_context(
                format!("Config '{}' must be {}, got '{}'", key, type_name, raw),
                ErrorContext::new().with_source("config_env"),
            )
        }),
    }
}

fn secs_to_duration(key: &str, secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs).map_err(|_| {
        Error::configuration_with_context(
            format!("Config '{}' must be a non-negative number of seconds, got '{}'", key, secs),
            ErrorContext::new().with_source("config_env"),
        )
    })
}

fn parse_bool(raw: &str) -> bool {
    matches!(raw.to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}

/// Serde helper: `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
