//! Session commands, errors, and retirement notices.
//!
//! Commands travel from `SessionHandle` to the session task over an mpsc
//! channel and are applied one at a time, in arrival order. Each carries a
//! oneshot for its reply.

use runcell_core::{
    DomainError, ErrorKind, FileEntry, SessionId, SessionState, SessionView, StateReason, Submission,
};
use thiserror::Error;
use tokio::sync::oneshot;

use super::frames::FrameStream;
use crate::pty::PtyError;
use crate::supervisor::SupervisorError;
use crate::workspace::WorkspaceError;

// ============================================================================
// Session Commands
// ============================================================================

/// Commands sent to a session task.
#[derive(Debug)]
pub enum SessionCommand {
    /// Write the submission and start the compiler.
    ///
    /// Replies once the compiler is running; its result arrives as frames.
    Compile {
        submission: Box<Submission>,
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },

    /// Attach the built program to the terminal.
    Run {
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },

    /// Attach the built program under the debugger.
    Debug {
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },

    /// Bytes for the attached process.
    Input {
        data: Vec<u8>,
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },

    /// Terminal window size change.
    Resize {
        cols: u16,
        rows: u16,
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },

    /// List one workspace directory.
    ListFiles {
        dir: Option<String>,
        respond_to: oneshot::Sender<Result<Vec<FileEntry>, SessionError>>,
    },

    /// Read one workspace file.
    ReadFile {
        path: String,
        respond_to: oneshot::Sender<Result<Vec<u8>, SessionError>>,
    },

    /// Tear the session down. Always succeeds.
    Close {
        reason: StateReason,
        respond_to: oneshot::Sender<()>,
    },

    /// Replace the frame subscriber, replaying buffered frames.
    Subscribe {
        respond_to: oneshot::Sender<FrameStream>,
    },

    /// Read-only snapshot for listings.
    Snapshot {
        respond_to: oneshot::Sender<SessionView>,
    },
}

impl SessionCommand {
    /// Name used in logs and transition errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Compile { .. } => "compile",
            Self::Run { .. } => "run",
            Self::Debug { .. } => "debug",
            Self::Input { .. } => "input",
            Self::Resize { .. } => "resize",
            Self::ListFiles { .. } => "list_files",
            Self::ReadFile { .. } => "read_file",
            Self::Close { .. } => "close",
            Self::Subscribe { .. } => "subscribe",
            Self::Snapshot { .. } => "snapshot",
        }
    }

    /// Returns true for commands that count as session activity.
    pub fn is_activity(&self) -> bool {
        !matches!(self, Self::Subscribe { .. } | Self::Snapshot { .. })
    }
}

// ============================================================================
// Session Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum SessionError {
    /// Rejected by validation or the lifecycle rules.
    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Spawn(#[from] SupervisorError),

    #[error(transparent)]
    Pty(#[from] PtyError),

    /// The session task has ended.
    #[error("session closed: {0}")]
    Closed(SessionId),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Domain(e) => e.kind(),
            Self::Workspace(e) => e.kind(),
            Self::Spawn(e) => e.kind(),
            Self::Pty(_) => ErrorKind::Internal,
            Self::Closed(_) => ErrorKind::NotFound,
        }
    }

    pub(crate) fn transition(operation: &'static str, state: SessionState) -> Self {
        Self::Domain(DomainError::InvalidTransition { operation, state })
    }
}

// ============================================================================
// Retirement
// ============================================================================

/// Sent by a session task once it has reached a terminal state and released
/// every resource it owned.
#[derive(Debug, Clone)]
pub struct Retirement {
    pub session_id: SessionId,
    pub state: SessionState,
    pub reason: StateReason,
}
