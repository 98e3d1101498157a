use crate::error_class::{Disposition, ErrorClass};
use crate::orchestrator::AttemptRecord;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Structured error context for configuration and runtime failures.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorContext {
    /// Configuration key that caused the error (e.g. `"circuit_breaker.targets.openai:gpt"`)
    pub field_path: Option<String>,
    /// Additional context about the error (e.g. expected range, actual value)
    pub details: Option<String>,
    /// Component that raised the error (e.g. `"config_validator"`, `"rate_limiter"`)
    pub source: Option<String>,
    /// Target name (`provider:model`) the error relates to, if any
    pub target: Option<String>,
    /// Logical request id, if any
    pub request_id: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
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

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }
}

/// Transport-independent failure kinds surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The limiter rejected the request; carries `retry_after`.
    AdmissionDenied,
    /// The breaker rejected the call without attempting it.
    CircuitOpen,
    /// Timeout, connection failure, provider 5xx or provider rate limit.
    Transient,
    /// Malformed request, provider auth failure, quota hard-stop.
    NonRetryable,
    /// Every target in the chain failed or was skipped.
    Exhausted,
    /// Caller-initiated cancellation.
    Cancelled,
    /// The overall request timeout elapsed during the chain walk.
    DeadlineExceeded,
    /// Invalid configuration.
    Configuration,
    /// Anything else (store failures, poisoned state, serialization).
    Internal,
}

impl ErrorKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::AdmissionDenied => "admission_denied",
            Self::CircuitOpen => "circuit_open",
            Self::Transient => "transient",
            Self::NonRetryable => "non_retryable",
            Self::Exhausted => "exhausted",
            Self::Cancelled => "cancelled",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Configuration => "configuration",
            Self::Internal => "internal",
        }
    }
}

/// Unified error type for the resilience core.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Admission denied for '{key}'{}", format_retry_after(.retry_after))]
    AdmissionDenied {
        key: String,
        retry_after: Option<Duration>,
    },

    #[error("Circuit open for '{target}'{}", format_retry_after(.retry_after))]
    CircuitOpen {
        target: String,
        retry_after: Option<Duration>,
    },

    #[error("Provider error ({class}){}: {message}", format_status(.status))]
    Provider {
        class: ErrorClass,
        message: String,
        status: Option<u16>,
        retry_after: Option<Duration>,
    },

    #[error("Call to '{target}' timed out after {}ms", .after.as_millis())]
    Timeout { target: String, after: Duration },

    #[error("Non-retryable failure on '{target}' ({class}): {message}")]
    NonRetryable {
        target: String,
        class: ErrorClass,
        message: String,
        attempts: Vec<AttemptRecord>,
    },

    #[error("Fallback chain exhausted after {} attempts ({})", .attempts.len(), summarize(.attempts))]
    Exhausted {
        attempts: Vec<AttemptRecord>,
        retry_after: Option<Duration>,
    },

    #[error("Request cancelled after {} attempts", .attempts.len())]
    Cancelled { attempts: Vec<AttemptRecord> },

    #[error("Request deadline of {}ms exceeded after {} attempts", .after.as_millis(), .attempts.len())]
    DeadlineExceeded {
        after: Duration,
        attempts: Vec<AttemptRecord>,
    },

    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Runtime error: {message}{}", format_context(.context))]
    Runtime {
        message: String,
        context: ErrorContext,
    },

    #[error("Shared store error ({store}): {message}")]
    Store { store: String, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if let Some(ref target) = ctx.target {
        parts.push(format!("target: {}", target));
    }
    if let Some(ref id) = ctx.request_id {
        parts.push(format!("request: {}", id));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

fn format_retry_after(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(", retry after {}ms", d.as_millis()),
        None => String::new(),
    }
}

fn format_status(status: &Option<u16>) -> String {
    match status {
        Some(s) => format!(" HTTP {}", s),
        None => String::new(),
    }
}

fn summarize(attempts: &[AttemptRecord]) -> String {
    attempts
        .iter()
        .map(|a| format!("{}#{}:{}", a.target, a.attempt, a.outcome.tag()))
        .collect::<Vec<_>>()
        .join(", ")
}

impl Error {
    /// A provider failure with an explicit class.
    pub fn provider(class: ErrorClass, message: impl Into<String>) -> Self {
        Error::Provider {
            class,
            message: message.into(),
            status: None,
            retry_after: None,
        }
    }

    /// A provider failure classified from an HTTP(-equivalent) status code.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Error::Provider {
            class: ErrorClass::from_http_status(status),
            message: message.into(),
            status: Some(status),
            retry_after: None,
        }
    }

    /// A provider failure classified heuristically from its message.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        Error::Provider {
            class: ErrorClass::from_message(&message),
            message,
            status: None,
            retry_after: None,
        }
    }

    /// A transient provider failure of unknown cause.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::provider(ErrorClass::ServerError, message)
    }

    pub fn timeout(target: impl Into<String>, after: Duration) -> Self {
        Error::Timeout {
            target: target.into(),
            after,
        }
    }

    /// Attach a provider-supplied retry hint (e.g. a `Retry-After` header).
    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        if let Error::Provider {
            ref mut retry_after,
            ..
        } = self
        {
            *retry_after = Some(delay);
        }
        self
    }

    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    pub fn runtime_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Runtime {
            message: msg.into(),
            context,
        }
    }

    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::runtime_with_context(msg, ErrorContext::new())
    }

    pub fn store(store: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Store {
            store: store.into(),
            message: message.into(),
        }
    }

    /// Failure class of a single failed attempt, if the error describes one.
    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            Error::Provider { class, .. } | Error::NonRetryable { class, .. } => Some(*class),
            Error::Timeout { .. } => Some(ErrorClass::Timeout),
            Error::Io(_) => Some(ErrorClass::Connection),
            Error::Cancelled { .. } => Some(ErrorClass::Cancelled),
            _ => None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::AdmissionDenied { .. } => ErrorKind::AdmissionDenied,
            Error::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Error::Provider { class, .. } => match class.disposition() {
                Disposition::Retry | Disposition::Fallback => ErrorKind::Transient,
                Disposition::Abort => ErrorKind::NonRetryable,
                Disposition::Cancelled => ErrorKind::Cancelled,
            },
            Error::Timeout { .. } | Error::Io(_) => ErrorKind::Transient,
            Error::NonRetryable { .. } => ErrorKind::NonRetryable,
            Error::Exhausted { .. } => ErrorKind::Exhausted,
            Error::Cancelled { .. } => ErrorKind::Cancelled,
            Error::DeadlineExceeded { .. } => ErrorKind::DeadlineExceeded,
            Error::Configuration { .. } | Error::Yaml(_) => ErrorKind::Configuration,
            Error::Runtime { .. } | Error::Store { .. } | Error::Serialization(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Suggested wait before the caller tries again, when one is known.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::AdmissionDenied { retry_after, .. }
            | Error::CircuitOpen { retry_after, .. }
            | Error::Provider { retry_after, .. }
            | Error::Exhausted { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Ordered attempt history for errors that end a chain walk.
    pub fn attempts(&self) -> &[AttemptRecord] {
        match self {
            Error::NonRetryable { attempts, .. }
            | Error::Exhausted { attempts, .. }
            | Error::Cancelled { attempts }
            | Error::DeadlineExceeded { attempts, .. } => attempts,
            _ => &[],
        }
    }

    /// Distinct target names in the order they were tried or skipped.
    pub fn targets_tried(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for a in self.attempts() {
            let name = a.target.to_string();
            if out.last() != Some(&name) {
                out.push(name);
            }
        }
        out
    }

    /// Whether a UI should offer the user a retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::AdmissionDenied
                | ErrorKind::CircuitOpen
                | ErrorKind::Transient
                | ErrorKind::Exhausted
                | ErrorKind::DeadlineExceeded
        )
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Configuration { context, .. } | Error::Runtime { context, .. } => Some(context),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_kind_follows_class() {
        assert_eq!(Error::from_status(503, "down").kind(), ErrorKind::Transient);
        assert_eq!(Error::from_status(400, "bad").kind(), ErrorKind::NonRetryable);
        assert_eq!(Error::from_status(404, "gone").kind(), ErrorKind::Transient);
        assert_eq!(
            Error::provider(ErrorClass::Cancelled, "stop").kind(),
            ErrorKind::Cancelled
        );
    }

    #[test]
    fn test_retry_after_is_attached_to_provider_errors_only() {
        let e = Error::from_status(429, "slow down").with_retry_after(Duration::from_secs(2));
        assert_eq!(e.retry_after(), Some(Duration::from_secs(2)));

        let t = Error::timeout("openai:gpt", Duration::from_secs(1))
            .with_retry_after(Duration::from_secs(2));
        assert_eq!(t.retry_after(), None);
        assert_eq!(t.class(), Some(ErrorClass::Timeout));
    }

    #[test]
    fn test_context_display() {
        let e = Error::configuration_with_context(
            "capacity must be positive",
            ErrorContext::new()
                .with_field_path("limiter.scopes.global.max_burst")
                .with_source("config_validator"),
        );
        let s = e.to_string();
        assert!(s.contains("field: limiter.scopes.global.max_burst"));
        assert!(s.contains("source: config_validator"));
        assert_eq!(e.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_admission_denied_display_includes_retry_after() {
        let e = Error::AdmissionDenied {
            key: "user:42".into(),
            retry_after: Some(Duration::from_millis(1500)),
        };
        assert!(e.to_string().contains("retry after 1500ms"));
        assert!(e.is_retryable());
    }
}
