//! Session identity, lifecycle states, and resource limits.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Unique identifier for a compile/run/debug session.
///
/// Wraps a UUID v4 string (e.g., "8e11bfb5-7dc2-432b-9206-928fa5c35731")
/// assigned by the orchestrator when the session is opened. The id also
/// names the session's workspace directory, so it is never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Creates a SessionId from an existing string.
    ///
    /// Note: This does not validate the format. Use [`SessionId::is_well_formed`]
    /// before turning a client-supplied id into a filesystem path.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh random session id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns true if the id is a plain token safe to use as a directory name.
    ///
    /// Only ASCII alphanumerics and `-` are accepted, at most 64 characters.
    #[must_use]
    pub fn is_well_formed(&self) -> bool {
        !self.0.is_empty()
            && self.0.len() <= 64
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Lifecycle State
// ============================================================================

/// Lifecycle state of a session.
///
/// ```text
/// Created ─▶ Compiling ─┬─▶ CompileFailed
///                       └─▶ Ready ─┬─▶ Running ─┬─▶ Exited
///                                  │            └─▶ Debugging
///                                  └─▶ Debugging ─▶ Exited
/// (any) ─▶ Closed
/// ```
///
/// `CompileFailed`, `Exited` and `Closed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Workspace and terminal allocated, nothing submitted yet.
    #[default]
    Created,
    /// The compiler is running.
    Compiling,
    /// The compiler exited nonzero or could not be spawned.
    CompileFailed,
    /// An artifact is built and nothing is attached to the terminal.
    Ready,
    /// The artifact is attached to the terminal.
    Running,
    /// The artifact is attached to the terminal under the debugger.
    Debugging,
    /// The attached program (or debugger) exited.
    Exited,
    /// Closed explicitly, by timeout, by disconnect, or by shutdown.
    Closed,
}

impl SessionState {
    /// Returns true for states that end the session.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::CompileFailed | Self::Exited | Self::Closed)
    }

    /// Returns true if terminal input is accepted in this state.
    #[must_use]
    pub fn accepts_input(&self) -> bool {
        matches!(self, Self::Running | Self::Debugging)
    }

    /// Returns the wire label for this state.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Compiling => "compiling",
            Self::CompileFailed => "compile_failed",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Debugging => "debugging",
            Self::Exited => "exited",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Why a session changed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateReason {
    /// A client command caused the transition.
    Requested,
    /// The attached process exited on its own.
    ProcessExited,
    /// The compiler rejected the submission.
    CompileError,
    /// The compiler, program, or debugger could not be started.
    SpawnFailed,
    /// The idle limit elapsed with no input, commands, or output.
    Timeout,
    /// The per-process wall-clock limit was reached.
    TimeLimit,
    /// The process tree exceeded the process-count limit.
    ProcessLimit,
    /// The transport connection that owned the session went away.
    Disconnected,
    /// The daemon is shutting down.
    Shutdown,
}

impl StateReason {
    /// Returns the wire label for this reason.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::ProcessExited => "process_exited",
            Self::CompileError => "compile_error",
            Self::SpawnFailed => "spawn_failed",
            Self::Timeout => "timeout",
            Self::TimeLimit => "time_limit",
            Self::ProcessLimit => "process_limit",
            Self::Disconnected => "disconnected",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for StateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ============================================================================
// Resource Limits
// ============================================================================

/// Per-session resource bounds.
///
/// `idle_timeout` applies to the session as a whole; the other limits apply
/// to each process the session spawns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    /// Close the session after this long without commands or output.
    pub idle_timeout: Duration,
    /// Kill a process tree that has been alive this long.
    pub wall_clock_timeout: Duration,
    /// Bytes of output forwarded per process before truncation.
    pub max_output_bytes: u64,
    /// Maximum live processes in one process tree.
    pub max_processes: usize,
    /// Maximum total bytes stored in the workspace by submissions.
    pub max_workspace_bytes: u64,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(15 * 60),
            wall_clock_timeout: Duration::from_secs(60),
            max_output_bytes: 1024 * 1024,
            max_processes: 32,
            max_workspace_bytes: 16 * 1024 * 1024,
        }
    }
}

// ============================================================================
// Read-Only View
// ============================================================================

/// Snapshot of a session for listing.
///
/// Contains no handles; safe to serialize and send to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionView {
    pub id: SessionId,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    /// Process id of the attached process, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_pid: Option<u32>,
    /// Number of frames emitted so far.
    pub frames_emitted: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique_and_well_formed() {
        let a = SessionId::generate();
        let b = SessionId::generate();
        assert_ne!(a, b);
        assert!(a.is_well_formed());
    }

    #[test]
    fn test_ill_formed_ids() {
        assert!(!SessionId::new("").is_well_formed());
        assert!(!SessionId::new("../etc").is_well_formed());
        assert!(!SessionId::new("a/b").is_well_formed());
        assert!(!SessionId::new("x".repeat(65)).is_well_formed());
        assert!(SessionId::new("abc-123").is_well_formed());
    }

    #[test]
    fn test_terminal_states() {
        assert!(SessionState::CompileFailed.is_terminal());
        assert!(SessionState::Exited.is_terminal());
        assert!(SessionState::Closed.is_terminal());
        assert!(!SessionState::Created.is_terminal());
        assert!(!SessionState::Ready.is_terminal());
        assert!(!SessionState::Running.is_terminal());
        assert!(!SessionState::Debugging.is_terminal());
    }

    #[test]
    fn test_input_states() {
        assert!(SessionState::Running.accepts_input());
        assert!(SessionState::Debugging.accepts_input());
        assert!(!SessionState::Compiling.accepts_input());
        assert!(!SessionState::Ready.accepts_input());
    }

    #[test]
    fn test_state_serialization_matches_label() {
        for state in [
            SessionState::Created,
            SessionState::CompileFailed,
            SessionState::Debugging,
            SessionState::Closed,
        ] {
            let json = serde_json::to_string(&state).unwrap();
            assert_eq!(json, format!("\"{}\"", state.label()));
        }
    }

    #[test]
    fn test_reason_serialization() {
        let json = serde_json::to_string(&StateReason::TimeLimit).unwrap();
        assert_eq!(json, "\"time_limit\"");
        assert_eq!(StateReason::Timeout.to_string(), "timeout");
    }
}
