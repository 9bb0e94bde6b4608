//! Error taxonomy shared across the crate.
//!
//! Every failure that crosses a component boundary is classified into an
//! [`ErrorKind`] so that callers can decide between local recovery (retry,
//! fallback, re-prompt) and surfacing the failure to the session timeline.
//! The concrete error type is [`MeshError`], which pairs a kind with a
//! human-readable message and an optional source.
//!
//! Classification drives three recovery policies:
//!
//! - **Transport errors** (`TransportLost`, and timeouts) are retried by the
//!   MCP client with exponential backoff before being surfaced.
//! - **Retryable LLM errors** (`RateLimit`, `ServerError`, `BadGateway`,
//!   `ServiceUnavailable`, `GatewayTimeout`) advance the fallback chain.
//! - **Non-retryable kinds** (`Unauthorized`, `SchemaViolation`,
//!   `ContextLength`) are surfaced immediately.

use std::fmt;

/// Classification of every failure the runtime can produce.
///
/// The variants mirror the wire-level and provider-level failures observed in
/// practice; `Unknown` is the catch-all for anything that resists
/// classification and is retried a bounded number of times before becoming
/// fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The underlying transport (child process, HTTP stream) died mid-flight.
    TransportLost,
    /// The remote peer violated the JSON-RPC / MCP protocol.
    ProtocolError,
    /// A tool call exceeded its per-call deadline.
    ToolTimeout,
    /// The MCP server executed the tool and reported an application error.
    ToolError,
    /// Arguments or generated output failed JSON-schema validation.
    SchemaViolation,
    /// An LLM call exceeded its per-call deadline.
    LlmTimeout,
    /// Provider returned HTTP 429.
    RateLimit,
    /// Provider returned HTTP 500.
    ServerError,
    /// Provider returned HTTP 502.
    BadGateway,
    /// Provider returned HTTP 504.
    GatewayTimeout,
    /// Provider returned HTTP 503.
    ServiceUnavailable,
    /// Provider rejected the credentials (HTTP 401/403).
    Unauthorized,
    /// The request exceeded the model's context window.
    ContextLength,
    /// The run was cancelled through its [`CancellationToken`](tokio_util::sync::CancellationToken).
    Cancelled,
    /// The agent loop reached `max_turns` without terminating naturally.
    TurnLimit,
    /// The orchestrator refinement loop reached `max_iterations`.
    IterationCap,
    /// Unclassifiable failure.
    Unknown,
}

impl ErrorKind {
    /// Stable snake_case identifier used in event payloads and log lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TransportLost => "transport_lost",
            ErrorKind::ProtocolError => "protocol_error",
            ErrorKind::ToolTimeout => "tool_timeout",
            ErrorKind::ToolError => "tool_error",
            ErrorKind::SchemaViolation => "schema_violation",
            ErrorKind::LlmTimeout => "llm_timeout",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::ServerError => "server_error",
            ErrorKind::BadGateway => "bad_gateway",
            ErrorKind::GatewayTimeout => "gateway_timeout",
            ErrorKind::ServiceUnavailable => "service_unavailable",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::ContextLength => "context_length",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::TurnLimit => "turn_limit",
            ErrorKind::IterationCap => "iteration_cap",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Whether the fallback chain should advance to the next model on this kind.
    ///
    /// `LlmTimeout` is deliberately included: a hung provider is
    /// indistinguishable from an overloaded one, and the next model in the
    /// chain may well answer.
    pub fn is_retryable_llm(&self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimit
                | ErrorKind::ServerError
                | ErrorKind::BadGateway
                | ErrorKind::ServiceUnavailable
                | ErrorKind::GatewayTimeout
                | ErrorKind::LlmTimeout
        )
    }

    /// Whether the MCP client should re-create the driver and retry.
    pub fn is_retryable_transport(&self) -> bool {
        matches!(self, ErrorKind::TransportLost)
    }

    /// Classify an HTTP status code from an LLM provider.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            401 | 403 => ErrorKind::Unauthorized,
            429 => ErrorKind::RateLimit,
            500 => ErrorKind::ServerError,
            502 => ErrorKind::BadGateway,
            503 => ErrorKind::ServiceUnavailable,
            504 => ErrorKind::GatewayTimeout,
            _ => ErrorKind::Unknown,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Concrete error type used throughout the crate.
///
/// The `message` is safe to show in log lines; user-facing surfaces should
/// prefer [`MeshError::user_message`], which hides wire-level detail.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct MeshError {
    /// Classified failure kind.
    pub kind: ErrorKind,
    /// Detailed message for logs and event payloads.
    pub message: String,
    /// Underlying error, when one exists.
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl MeshError {
    /// Build an error from a kind and message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Build an error that wraps an underlying cause.
    pub fn with_source(
        kind: ErrorKind,
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Shorthand for a [`ErrorKind::Cancelled`] error.
    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "operation cancelled")
    }

    /// A short, user-safe description.
    ///
    /// Wire payloads, stack traces, and provider error bodies stay on the
    /// event; this string is what terminal events embed as `message`.
    pub fn user_message(&self) -> String {
        match self.kind {
            ErrorKind::Cancelled => "The run was cancelled.".to_string(),
            ErrorKind::TurnLimit => "The agent reached its turn limit.".to_string(),
            ErrorKind::IterationCap => {
                "The orchestrator reached its refinement limit.".to_string()
            }
            ErrorKind::Unauthorized => {
                "The language-model provider rejected the configured credentials.".to_string()
            }
            ErrorKind::ContextLength => {
                "The conversation no longer fits the model's context window.".to_string()
            }
            _ => format!("The run failed ({}).", self.kind),
        }
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        MeshError::with_source(ErrorKind::ProtocolError, "invalid JSON", err)
    }
}

impl From<std::io::Error> for MeshError {
    fn from(err: std::io::Error) -> Self {
        MeshError::with_source(ErrorKind::Unknown, "I/O error", err)
    }
}
