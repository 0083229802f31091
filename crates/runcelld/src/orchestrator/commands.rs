//! Orchestrator actor commands, errors, and session requests.
//!
//! This module defines the message types for communicating with the
//! `OrchestratorActor`:
//! - `OrchestratorCommand`: Table operations sent to the actor
//! - `SessionRequest`: Work routed to a single session
//! - `OrchestratorError`: Errors surfaced to callers
//!
//! The actor only manages the session table. Work on a session itself is
//! routed to that session's task through the handle it hands out.

use runcell_core::{ErrorKind, FileEntry, SessionId, StateReason, Submission};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::session::{SessionError, SessionHandle};

// ============================================================================
// Orchestrator Commands
// ============================================================================

/// Commands sent to the orchestrator actor.
#[derive(Debug)]
pub enum OrchestratorCommand {
    /// Claim an admission slot and a fresh session id.
    ///
    /// # Errors
    /// - `OrchestratorError::Unavailable` if the bound is reached or the
    ///   orchestrator is shutting down
    Reserve {
        respond_to: oneshot::Sender<Result<SessionId, OrchestratorError>>,
    },

    /// Attach a started session to its reserved slot.
    Activate {
        session_id: SessionId,
        handle: SessionHandle,
        respond_to: oneshot::Sender<Result<(), OrchestratorError>>,
    },

    /// Give back a slot whose setup failed. Fire-and-forget.
    Release { session_id: SessionId },

    /// Find a session's handle.
    Lookup {
        session_id: SessionId,
        respond_to: oneshot::Sender<Lookup>,
    },

    /// Handles of every live session.
    List {
        respond_to: oneshot::Sender<Vec<SessionHandle>>,
    },

    Stats {
        respond_to: oneshot::Sender<OrchestratorStats>,
    },

    /// Stop admitting sessions and hand back every live one for closing.
    Shutdown {
        respond_to: oneshot::Sender<Vec<SessionHandle>>,
    },
}

/// Result of looking a session up in the table.
#[derive(Debug)]
pub enum Lookup {
    Live(SessionHandle),
    /// Reserved but still being set up.
    Pending,
    /// Terminated recently.
    Retired,
    Unknown,
}

/// Counters reported by the orchestrator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrchestratorStats {
    pub live: usize,
    pub reserved: usize,
    pub max_sessions: usize,
    pub opened_total: u64,
    pub retired_total: u64,
    pub shutting_down: bool,
}

// ============================================================================
// Session Requests
// ============================================================================

/// Work a client asks of one session.
#[derive(Debug)]
pub enum SessionRequest {
    Compile(Submission),
    Run,
    Debug,
    Input(Vec<u8>),
    Resize { cols: u16, rows: u16 },
    /// List a workspace directory; `None` is the workspace root.
    ListFiles { dir: Option<String> },
    ReadFile { path: String },
    Close(StateReason),
}

/// What a session sends back for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionReply {
    Done,
    Files(Vec<FileEntry>),
    Content(Vec<u8>),
}

impl SessionRequest {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Compile(_) => "compile",
            Self::Run => "run",
            Self::Debug => "debug",
            Self::Input(_) => "input",
            Self::Resize { .. } => "resize",
            Self::ListFiles { .. } => "list_files",
            Self::ReadFile { .. } => "read_file",
            Self::Close(_) => "close",
        }
    }
}

// ============================================================================
// Orchestrator Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Admission refused.
    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("session not found: {0}")]
    NotFound(SessionId),

    #[error(transparent)]
    Session(#[from] SessionError),

    /// The actor has stopped.
    #[error("orchestrator channel closed")]
    ChannelClosed,
}

impl OrchestratorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unavailable(_) | Self::ChannelClosed => ErrorKind::Unavailable,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Session(e) => e.kind(),
        }
    }
}
