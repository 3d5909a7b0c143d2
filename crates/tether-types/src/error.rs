//! Caller-visible error types for Tether calls.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Payload a peer sends back when the requested function is not registered.
pub const NOT_FOUND_PAYLOAD: &str = "Function not found";

/// Structured error raised by a handler and delivered to the caller.
///
/// Handlers return a `Fault` instead of an opaque error object so the kind and
/// message always survive the trip across the boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fault {
    /// Machine-readable error kind (e.g. `"invalid_args"`).
    pub kind: String,
    /// Human-readable message.
    pub message: String,
    /// Optional structured details.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
}

impl Fault {
    /// Create a fault with no details.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            details: serde_json::Value::Null,
        }
    }

    /// Attach structured details.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    /// Shorthand for a handler that received arguments it cannot use.
    pub fn invalid_args(message: impl Into<String>) -> Self {
        Self::new("invalid_args", message)
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for Fault {}

/// Why a call issued through an endpoint did not produce a result.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CallError {
    /// No response arrived within the call's timeout.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The peer has no handler registered under this name.
    #[error("Function not found: {0}")]
    NotFound(String),

    /// The peer's handler failed.
    #[error("Handler failed: {0}")]
    Handler(Fault),

    /// The channel failed or closed; the endpoint is torn down.
    #[error("connection error")]
    Connection,

    /// An unexpected failure inside the endpoint itself.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CallError {
    /// Whether this error came from the call's own timer.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// The handler fault, if the peer rejected the call with one.
    pub fn fault(&self) -> Option<&Fault> {
        match self {
            Self::Handler(fault) => Some(fault),
            _ => None,
        }
    }
}

impl From<Fault> for CallError {
    fn from(fault: Fault) -> Self {
        Self::Handler(fault)
    }
}

/// Alias for results of remote calls.
pub type CallResult<T> = Result<T, CallError>;
