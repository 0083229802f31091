//! Domain-specific error types following panic-free policy.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{SessionId, SessionState};

/// Category of a failure, as reported to clients.
///
/// Every layer's error type maps onto one of these so the transport can
/// report a stable `kind` regardless of where the failure originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed submission, path traversal, command not valid in the current state.
    InvalidInput,
    /// Toolchain missing or workspace unwritable when spawning a process.
    SpawnFailed,
    /// Disk quota, workspace size, output cap, or process cap reached.
    ResourceExhausted,
    /// A time limit was reached.
    Timeout,
    /// Unknown or already-terminated session.
    NotFound,
    /// Admission bound reached or the daemon is shutting down.
    Unavailable,
    /// Anything else (channel closed, I/O failure in the daemon itself).
    Internal,
}

impl ErrorKind {
    /// Returns the wire name of this kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidInput => "invalid_input",
            Self::SpawnFailed => "spawn_failed",
            Self::ResourceExhausted => "resource_exhausted",
            Self::Timeout => "timeout",
            Self::NotFound => "not_found",
            Self::Unavailable => "unavailable",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur in domain operations.
#[derive(Error, Debug, Clone)]
pub enum DomainError {
    /// Session not found (never existed, or already terminated)
    #[error("Session not found: {session_id}")]
    SessionNotFound { session_id: SessionId },

    /// Operation not permitted in the session's current state
    #[error("Cannot {operation} while session is {state}")]
    InvalidTransition {
        operation: &'static str,
        state: SessionState,
    },

    /// Invalid field value
    #[error("Invalid {field}: {value} (expected {expected})")]
    InvalidFieldValue {
        field: String,
        value: String,
        expected: String,
    },

    /// Parse error for incoming data
    #[error("Failed to parse {field}: {reason}")]
    ParseError { field: String, reason: String },
}

impl DomainError {
    /// Returns the client-facing category of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SessionNotFound { .. } => ErrorKind::NotFound,
            Self::InvalidTransition { .. }
            | Self::InvalidFieldValue { .. }
            | Self::ParseError { .. } => ErrorKind::InvalidInput,
        }
    }
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_wire_names() {
        let json = serde_json::to_string(&ErrorKind::ResourceExhausted).unwrap();
        assert_eq!(json, "\"resource_exhausted\"");
        assert_eq!(ErrorKind::NotFound.to_string(), "not_found");
    }

    #[test]
    fn test_invalid_transition_display() {
        let err = DomainError::InvalidTransition {
            operation: "run",
            state: SessionState::Created,
        };
        assert_eq!(err.to_string(), "Cannot run while session is created");
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_not_found_kind() {
        let err = DomainError::SessionNotFound {
            session_id: SessionId::new("abc"),
        };
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.to_string().contains("abc"));
    }
}
