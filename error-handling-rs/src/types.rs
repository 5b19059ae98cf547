//! # Standardized Error Types
//!
//! The closed failure taxonomy used uniformly by the client, the health
//! monitor, the fallback handler and the orchestrator.

use std::fmt;

use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

/// A type alias for Result with the error type defaulting to [`ToolError`]
pub type Result<T, E = ToolError> = std::result::Result<T, E>;

/// Classified failure categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A remote call or acquisition exceeded its deadline
    Timeout,
    /// The dependency could not be reached or refused service
    ConnectionRefused,
    /// Credentials were rejected
    AuthenticationFailure,
    /// The dependency asked us to slow down
    RateLimited,
    /// The response did not have the expected shape
    MalformedResponse,
    /// The dependency is overloaded or out of capacity
    ResourceExhausted,
    /// No pooled connection became free in time
    PoolExhausted,
    /// The operation is not part of the local registry
    UnsupportedOperation,
    /// An argument was missing or had the wrong type
    InvalidArgument,
    /// Anything that could not be classified
    Unknown,
}

impl ErrorKind {
    /// Every kind, in declaration order
    pub const ALL: [ErrorKind; 10] = [
        ErrorKind::Timeout,
        ErrorKind::ConnectionRefused,
        ErrorKind::AuthenticationFailure,
        ErrorKind::RateLimited,
        ErrorKind::MalformedResponse,
        ErrorKind::ResourceExhausted,
        ErrorKind::PoolExhausted,
        ErrorKind::UnsupportedOperation,
        ErrorKind::InvalidArgument,
        ErrorKind::Unknown,
    ];

    /// Kinds retried locally by the client before surfacing
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout | ErrorKind::ConnectionRefused | ErrorKind::RateLimited
        )
    }

    /// Caller mistakes: never retried and never a reason to fail over
    pub fn is_local_validation(self) -> bool {
        matches!(
            self,
            ErrorKind::UnsupportedOperation | ErrorKind::InvalidArgument
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::ConnectionRefused => "connection_refused",
            ErrorKind::AuthenticationFailure => "authentication_failure",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::MalformedResponse => "malformed_response",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::PoolExhausted => "pool_exhausted",
            ErrorKind::UnsupportedOperation => "unsupported_operation",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The failure type returned by every orchestration component
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolError {
    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Authentication failure: {0}")]
    AuthenticationFailure(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Connection pool exhausted for {server_id} after waiting {waited_ms}ms")]
    PoolExhausted { server_id: String, waited_ms: u64 },

    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("Invalid argument '{field}': {reason}")]
    InvalidArgument { field: String, reason: String },

    /// The call was short-circuited by an open breaker and never attempted
    #[error("Circuit open for component {component}")]
    CircuitOpen { component: String },

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl ToolError {
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        ToolError::Timeout(msg.into())
    }

    pub fn connection_refused<S: Into<String>>(msg: S) -> Self {
        ToolError::ConnectionRefused(msg.into())
    }

    pub fn authentication<S: Into<String>>(msg: S) -> Self {
        ToolError::AuthenticationFailure(msg.into())
    }

    pub fn rate_limited<S: Into<String>>(msg: S) -> Self {
        ToolError::RateLimited(msg.into())
    }

    pub fn malformed<S: Into<String>>(msg: S) -> Self {
        ToolError::MalformedResponse(msg.into())
    }

    pub fn resource_exhausted<S: Into<String>>(msg: S) -> Self {
        ToolError::ResourceExhausted(msg.into())
    }

    pub fn pool_exhausted<S: Into<String>>(server_id: S, waited_ms: u64) -> Self {
        ToolError::PoolExhausted {
            server_id: server_id.into(),
            waited_ms,
        }
    }

    pub fn unsupported<S: Into<String>>(operation: S) -> Self {
        ToolError::UnsupportedOperation(operation.into())
    }

    pub fn invalid_argument<F: Into<String>, R: Into<String>>(field: F, reason: R) -> Self {
        ToolError::InvalidArgument {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn circuit_open<S: Into<String>>(component: S) -> Self {
        ToolError::CircuitOpen {
            component: component.into(),
        }
    }

    pub fn unknown<S: Into<String>>(msg: S) -> Self {
        ToolError::Unknown(msg.into())
    }

    /// Build an error of the given kind from free text
    pub fn from_kind<S: Into<String>>(kind: ErrorKind, msg: S) -> Self {
        let msg = msg.into();
        match kind {
            ErrorKind::Timeout => ToolError::Timeout(msg),
            ErrorKind::ConnectionRefused => ToolError::ConnectionRefused(msg),
            ErrorKind::AuthenticationFailure => ToolError::AuthenticationFailure(msg),
            ErrorKind::RateLimited => ToolError::RateLimited(msg),
            ErrorKind::MalformedResponse => ToolError::MalformedResponse(msg),
            ErrorKind::ResourceExhausted => ToolError::ResourceExhausted(msg),
            ErrorKind::PoolExhausted => ToolError::PoolExhausted {
                server_id: msg,
                waited_ms: 0,
            },
            ErrorKind::UnsupportedOperation => ToolError::UnsupportedOperation(msg),
            ErrorKind::InvalidArgument => ToolError::InvalidArgument {
                field: "unknown".to_string(),
                reason: msg,
            },
            ErrorKind::Unknown => ToolError::Unknown(msg),
        }
    }

    /// Map a non-success HTTP status onto the taxonomy
    pub fn from_http_status<S: Into<String>>(status: u16, msg: S) -> Self {
        let msg = msg.into();
        match status {
            401 | 403 => ToolError::AuthenticationFailure(msg),
            429 => ToolError::RateLimited(msg),
            408 | 504 => ToolError::Timeout(msg),
            502 | 503 => ToolError::ResourceExhausted(msg),
            _ => ToolError::Unknown(format!("HTTP {}: {}", status, msg)),
        }
    }

    /// The classified kind of this failure
    pub fn kind(&self) -> ErrorKind {
        match self {
            ToolError::Timeout(_) => ErrorKind::Timeout,
            ToolError::ConnectionRefused(_) | ToolError::CircuitOpen { .. } => {
                ErrorKind::ConnectionRefused
            }
            ToolError::AuthenticationFailure(_) => ErrorKind::AuthenticationFailure,
            ToolError::RateLimited(_) => ErrorKind::RateLimited,
            ToolError::MalformedResponse(_) => ErrorKind::MalformedResponse,
            ToolError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            ToolError::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            ToolError::UnsupportedOperation(_) => ErrorKind::UnsupportedOperation,
            ToolError::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            ToolError::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// Whether the client should retry this failure locally
    pub fn is_transient(&self) -> bool {
        !self.is_short_circuit() && self.kind().is_transient()
    }

    pub fn is_local_validation(&self) -> bool {
        self.kind().is_local_validation()
    }

    /// True when the breaker refused the call without attempting it
    pub fn is_short_circuit(&self) -> bool {
        matches!(self, ToolError::CircuitOpen { .. })
    }

    /// Whether the failure should count against a component's breaker
    pub fn counts_toward_breaker(&self) -> bool {
        !self.is_short_circuit() && !self.is_local_validation()
    }
}

impl Serialize for ToolError {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("ToolError", 2)?;
        state.serialize_field("kind", &self.kind())?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}

impl From<reqwest::Error> for ToolError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ToolError::Timeout(err.to_string())
        } else if err.is_connect() {
            ToolError::ConnectionRefused(err.to_string())
        } else if err.is_decode() {
            ToolError::MalformedResponse(err.to_string())
        } else if let Some(status) = err.status() {
            ToolError::from_http_status(status.as_u16(), err.to_string())
        } else {
            ToolError::Unknown(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ToolError {
    fn from(err: serde_json::Error) -> Self {
        ToolError::MalformedResponse(err.to_string())
    }
}
