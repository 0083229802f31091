//! Output frames emitted by a session toward its subscriber.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{SessionId, SessionState, StateReason};

/// Category of an output frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    Stdout,
    Stderr,
    Diagnostic,
    StateChange,
    ExitStatus,
}

/// How a process ended.
///
/// Exactly one of `code` and `signal` is normally set. Both are `None`
/// only when the wait itself failed.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExitStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    /// Signal name (e.g. "Killed", "Terminated") when killed by a signal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
}

impl ExitStatus {
    /// Creates a status for a normal exit.
    pub fn from_code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    /// Creates a status for a signal-terminated process.
    pub fn from_signal(signal: impl Into<String>) -> Self {
        Self {
            code: None,
            signal: Some(signal.into()),
        }
    }

    /// Returns true for a zero exit code.
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.code, &self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "terminated by signal {signal}"),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// Payload of an output frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameBody {
    /// Bytes produced by the attached process.
    Stdout(Vec<u8>),
    /// Bytes produced on a separate error stream.
    ///
    /// The terminal bridge merges both streams, so attached processes
    /// only ever produce `Stdout`; the kind exists for the wire contract.
    Stderr(Vec<u8>),
    /// Human-readable message from the worker (compiler log, truncation, limits).
    Diagnostic(String),
    /// Lifecycle transition.
    StateChange {
        state: SessionState,
        reason: StateReason,
    },
    /// Exit status of the attached process.
    ExitStatus(ExitStatus),
}

/// One ordered, typed chunk of data from a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFrame {
    pub session_id: SessionId,
    /// Per-session sequence number, strictly increasing from 0.
    pub seq: u64,
    pub body: FrameBody,
}

impl OutputFrame {
    /// Returns the category of this frame.
    #[must_use]
    pub fn kind(&self) -> OutputKind {
        match self.body {
            FrameBody::Stdout(_) => OutputKind::Stdout,
            FrameBody::Stderr(_) => OutputKind::Stderr,
            FrameBody::Diagnostic(_) => OutputKind::Diagnostic,
            FrameBody::StateChange { .. } => OutputKind::StateChange,
            FrameBody::ExitStatus(_) => OutputKind::ExitStatus,
        }
    }

    /// Returns the raw bytes carried by this frame, if any.
    ///
    /// Diagnostics are returned as their UTF-8 bytes.
    #[must_use]
    pub fn bytes(&self) -> Option<&[u8]> {
        match &self.body {
            FrameBody::Stdout(b) | FrameBody::Stderr(b) => Some(b),
            FrameBody::Diagnostic(text) => Some(text.as_bytes()),
            FrameBody::StateChange { .. } | FrameBody::ExitStatus(_) => None,
        }
    }

    /// Returns true if this frame is the final state change of a session.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(&self.body, FrameBody::StateChange { state, .. } if state.is_terminal())
    }
}
