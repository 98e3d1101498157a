//! Failure classification for provider calls.
//!
//! Every failed attempt is tagged with an [`ErrorClass`]. The class decides what the
//! orchestrator does next: retry the same target, fall back to the next target in the
//! chain, or abort the whole chain because every target would fail the same way.
//!
//! ## Classes
//!
//! | Code  | Class               | Retry | Fallback | Notes                                    |
//! |-------|---------------------|-------|----------|------------------------------------------|
//! | E1001 | `invalid_request`   | no    | no       | malformed input fails on every target    |
//! | E1002 | `authentication`    | no    | no       | bad credentials at the provider          |
//! | E1003 | `permission_denied` | no    | no       |                                          |
//! | E1004 | `not_found`         | no    | yes      | model missing on this provider only      |
//! | E1005 | `request_too_large` | no    | no       | context window / payload limit           |
//! | E2001 | `rate_limited`      | yes   | yes      | provider-side throttling                 |
//! | E2002 | `quota_exhausted`   | no    | no       | billing hard-stop                        |
//! | E3001 | `server_error`      | yes   | yes      |                                          |
//! | E3002 | `overloaded`        | yes   | yes      |                                          |
//! | E3003 | `timeout`           | yes   | yes      | outcome at the provider is unknown       |
//! | E3004 | `connection`        | yes   | yes      |                                          |
//! | E4002 | `cancelled`         | no    | no       | caller cancelled                         |
//! | E9999 | `unknown`           | yes   | yes      | unclassified failures are assumed transient |
//!
//! ```rust
//! use ai_lib_resilience::error_class::{Disposition, ErrorClass};
//!
//! let class = ErrorClass::from_http_status(503);
//! assert_eq!(class, ErrorClass::Overloaded);
//! assert_eq!(class.disposition(), Disposition::Retry);
//! assert_eq!(ErrorClass::InvalidRequest.disposition(), Disposition::Abort);
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// What the orchestrator should do with a failure of a given class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Transient: retry the same target while budget remains, then fall back.
    Retry,
    /// Skip the rest of this target's budget but try the next target.
    Fallback,
    /// Stop the whole chain; later targets would fail identically.
    Abort,
    /// The caller gave up.
    Cancelled,
}

/// Fine-grained failure tag attached to an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    InvalidRequest,
    Authentication,
    PermissionDenied,
    NotFound,
    RequestTooLarge,
    RateLimited,
    QuotaExhausted,
    ServerError,
    Overloaded,
    Timeout,
    Connection,
    Cancelled,
    Unknown,
}

/// A standalone 4xx/5xx status code inside a message.
static STATUS_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|[^0-9])([45][0-9]{2})(?:[^0-9]|$)").expect("status pattern is a valid regex")
});

impl ErrorClass {
    /// Canonical code string (e.g. `"E3003"`).
    #[inline]
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "E1001",
            Self::Authentication => "E1002",
            Self::PermissionDenied => "E1003",
            Self::NotFound => "E1004",
            Self::RequestTooLarge => "E1005",
            Self::RateLimited => "E2001",
            Self::QuotaExhausted => "E2002",
            Self::ServerError => "E3001",
            Self::Overloaded => "E3002",
            Self::Timeout => "E3003",
            Self::Connection => "E3004",
            Self::Cancelled => "E4002",
            Self::Unknown => "E9999",
        }
    }

    /// Snake-case tag used in events and attempt records.
    #[inline]
    pub fn name(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::Authentication => "authentication",
            Self::PermissionDenied => "permission_denied",
            Self::NotFound => "not_found",
            Self::RequestTooLarge => "request_too_large",
            Self::RateLimited => "rate_limited",
            Self::QuotaExhausted => "quota_exhausted",
            Self::ServerError => "server_error",
            Self::Overloaded => "overloaded",
            Self::Timeout => "timeout",
            Self::Connection => "connection",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        }
    }

    #[inline]
    pub fn disposition(&self) -> Disposition {
        match self {
            Self::RateLimited
            | Self::ServerError
            | Self::Overloaded
            | Self::Timeout
            | Self::Connection
            | Self::Unknown => Disposition::Retry,
            Self::NotFound => Disposition::Fallback,
            Self::InvalidRequest
            | Self::Authentication
            | Self::PermissionDenied
            | Self::RequestTooLarge
            | Self::QuotaExhausted => Disposition::Abort,
            Self::Cancelled => Disposition::Cancelled,
        }
    }

    /// Whether the same target may be called again.
    #[inline]
    pub fn retryable(&self) -> bool {
        self.disposition() == Disposition::Retry
    }

    /// Whether the next target in the chain may be tried.
    #[inline]
    pub fn fallbackable(&self) -> bool {
        matches!(self.disposition(), Disposition::Retry | Disposition::Fallback)
    }

    /// Whether a failure of this class is recorded against the target's circuit.
    ///
    /// Caller cancellation says nothing about the target's health.
    #[inline]
    pub fn counts_against_target(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }

    /// Maps a provider error code/type string.
    ///
    /// Accepts the snake-case names above plus common provider aliases such as
    /// `"invalid_api_key"`, `"context_length_exceeded"` or `"overloaded_error"`.
    pub fn from_provider_code(provider_code: &str) -> Option<Self> {
        let class = match provider_code {
            "invalid_request" | "invalid_request_error" => Self::InvalidRequest,
            "authentication" | "authentication_error" | "invalid_api_key" => Self::Authentication,
            "permission_denied" | "permission_error" => Self::PermissionDenied,
            "not_found" | "model_not_found" | "model_decommissioned" => Self::NotFound,
            "request_too_large" | "context_length_exceeded" => Self::RequestTooLarge,
            "rate_limited" | "rate_limit_exceeded" | "rate_limit_error" => Self::RateLimited,
            "quota_exhausted" | "insufficient_quota" | "billing_hard_limit_reached" => {
                Self::QuotaExhausted
            }
            "server_error" | "api_error" => Self::ServerError,
            "overloaded" | "overloaded_error" => Self::Overloaded,
            "timeout" => Self::Timeout,
            "connection" | "connection_error" => Self::Connection,
            "cancelled" => Self::Cancelled,
            _ => return None,
        };
        Some(class)
    }

    /// Maps an HTTP(-equivalent) status code.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            400 | 422 => Self::InvalidRequest,
            401 => Self::Authentication,
            402 => Self::QuotaExhausted,
            403 => Self::PermissionDenied,
            404 => Self::NotFound,
            408 | 504 => Self::Timeout,
            413 => Self::RequestTooLarge,
            429 => Self::RateLimited,
            499 => Self::Cancelled,
            502 | 503 | 529 => Self::Overloaded,
            500..=599 => Self::ServerError,
            _ => Self::Unknown,
        }
    }

    /// Best-effort classification of a free-form error message.
    ///
    /// An embedded HTTP status wins over keywords; messages that match nothing are
    /// treated as transient.
    pub fn from_message(message: &str) -> Self {
        if let Some(status) = STATUS_PATTERN
            .captures(message)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<u16>().ok())
        {
            let class = Self::from_http_status(status);
            if class != Self::Unknown {
                return class;
            }
        }

        let m = message.to_lowercase();
        if m.contains("context length") || m.contains("token limit") || m.contains("too large") {
            Self::RequestTooLarge
        } else if m.contains("rate limit") || m.contains("too many requests") {
            Self::RateLimited
        } else if m.contains("quota") || m.contains("billing") {
            Self::QuotaExhausted
        } else if m.contains("authentication") || m.contains("api key") || m.contains("unauthorized")
        {
            Self::Authentication
        } else if m.contains("timed out") || m.contains("timeout") {
            Self::Timeout
        } else if m.contains("connection") || m.contains("connect error") || m.contains("dns") {
            Self::Connection
        } else if m.contains("overloaded") || m.contains("unavailable") {
            Self::Overloaded
        } else if m.contains("cancelled") || m.contains("canceled") {
            Self::Cancelled
        } else if m.contains("invalid") || m.contains("malformed") {
            Self::InvalidRequest
        } else {
            Self::Unknown
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
