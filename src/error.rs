use thiserror::Error;

/// Structured error context for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorContext {
    /// Call scope the error was raised in (e.g., "channel", "generation")
    pub scope: Option<String>,
    /// Recipient or rate-limit key involved, if any
    pub key: Option<String>,
    /// Additional free-form details (e.g., upstream status, expected type)
    pub details: Option<String>,
    /// Component that produced the error (e.g., "resilient_executor", "config")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

/// Coarse classification of failures, used by the executor and by callers
/// that render user-visible errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    TransientUpstream,
    RateLimited,
    NoOp,
    PermanentUpstream,
    CircuitOpen,
    Formatting,
    Configuration,
    Io,
}

/// Unified error type for the delivery engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Network or 5xx-class failure from the generation service or the channel.
    #[error("Transient upstream error: {message}{}", format_context(.context))]
    Transient {
        message: String,
        context: ErrorContext,
    },

    /// Explicit "retry after N seconds" signal from the callee.
    #[error("Rate limited: retry after {seconds}s")]
    RetryAfter { seconds: u64 },

    /// The channel rejected an edit because the content did not change.
    #[error("Message is not modified")]
    NotModified,

    /// Malformed request or other failure that retrying cannot fix.
    #[error("Permanent upstream error: {message}{}", format_context(.context))]
    Permanent {
        message: String,
        context: ErrorContext,
    },

    #[error("Service {scope} is temporarily unavailable")]
    CircuitOpen { scope: String },

    /// Internal chunker failure. Recovered locally, never returned by the chunker.
    #[error("Formatting error: {message}")]
    Formatting { message: String },

    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref scope) = ctx.scope {
        parts.push(format!("scope: {}", scope));
    }
    if let Some(ref key) = ctx.key {
        parts.push(format!("key: {}", key));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    pub fn transient(msg: impl Into<String>) -> Self {
        Error::Transient {
            message: msg.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn transient_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Transient {
            message: msg.into(),
            context,
        }
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Error::Permanent {
            message: msg.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn permanent_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Permanent {
            message: msg.into(),
            context,
        }
    }

    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    pub fn formatting(msg: impl Into<String>) -> Self {
        Error::Formatting {
            message: msg.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Transient { .. } => ErrorKind::TransientUpstream,
            Error::RetryAfter { .. } => ErrorKind::RateLimited,
            Error::NotModified => ErrorKind::NoOp,
            Error::Permanent { .. } => ErrorKind::PermanentUpstream,
            Error::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Error::Formatting { .. } => ErrorKind::Formatting,
            Error::Configuration { .. } | Error::Yaml(_) | Error::Serialization(_) => {
                ErrorKind::Configuration
            }
            Error::Io(_) => ErrorKind::Io,
        }
    }

    /// Whether the executor may spend a retry slot on this error.
    ///
    /// `RetryAfter` is retried too, but outside the retry budget.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient { .. } | Error::Io(_))
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Transient { context, .. }
            | Error::Permanent { context, .. }
            | Error::Configuration { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Render as a user-visible `"Error: ..."` line capped at `limit` chars
    /// (a `"..."` suffix is appended when truncated).
    pub fn user_message(&self, limit: usize) -> String {
        truncate_with_ellipsis(&format!("Error: {}", self), limit)
    }
}

/// Truncate to `limit` chars, appending `"..."` when anything was cut.
pub fn truncate_with_ellipsis(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let mut out: String = text.chars().take(limit).collect();
    out.push_str("...");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(Error::transient("x").kind(), ErrorKind::TransientUpstream);
        assert_eq!(Error::RetryAfter { seconds: 3 }.kind(), ErrorKind::RateLimited);
        assert_eq!(Error::NotModified.kind(), ErrorKind::NoOp);
        assert_eq!(Error::permanent("bad").kind(), ErrorKind::PermanentUpstream);
        assert_eq!(
            Error::CircuitOpen {
                scope: "generation".into()
            }
            .kind(),
            ErrorKind::CircuitOpen
        );
    }

    #[test]
    fn test_only_transient_errors_are_retryable() {
        assert!(Error::transient("net").is_retryable());
        assert!(!Error::permanent("bad request").is_retryable());
        assert!(!Error::RetryAfter { seconds: 1 }.is_retryable());
        assert!(!Error::NotModified.is_retryable());
    }

    #[test]
    fn test_display_includes_context() {
        let err = Error::transient_with_context(
            "connection reset",
            ErrorContext::new()
                .with_scope("channel")
                .with_source("resilient_executor"),
        );
        assert_eq!(
            err.to_string(),
            "Transient upstream error: connection reset (scope: channel, source: resilient_executor)"
        );
    }

    #[test]
    fn test_circuit_open_message() {
        let err = Error::CircuitOpen {
            scope: "generation".into(),
        };
        assert_eq!(err.to_string(), "Service generation is temporarily unavailable");
    }

    #[test]
    fn test_user_message_truncation() {
        let err = Error::transient("x".repeat(100));
        let msg = err.user_message(20);
        assert_eq!(msg.chars().count(), 23);
        assert!(msg.starts_with("Error: "));
        assert!(msg.ends_with("..."));

        let short = Error::NotModified.user_message(4000);
        assert_eq!(short, "Error: Message is not modified");
    }
}
