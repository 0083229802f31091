//! Protocol message types for daemon communication.

use crate::codec::base64_bytes;
use crate::version::ProtocolVersion;
use runcell_core::{
    ErrorKind, ExitStatus, FileEntry, FrameBody, OutputFrame, OutputKind, SessionId, SessionState,
    SessionView, SourceFile, StateReason, Submission,
};
use serde::{Deserialize, Serialize};

/// Message types that can be sent by clients to the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageType {
    /// Client handshake/connection request
    Connect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },

    /// Allocate a session (workspace + terminal)
    OpenSession,

    /// Write a submission and run the compiler
    Compile {
        session_id: SessionId,
        files: Vec<SourceFile>,
        #[serde(default)]
        flags: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        entry: Option<String>,
    },

    /// Attach the built program to the session terminal
    Run { session_id: SessionId },

    /// Attach the built program under the debugger
    Debug { session_id: SessionId },

    /// Raw bytes for the attached process
    Input {
        session_id: SessionId,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },

    /// Terminal window size change
    Resize {
        session_id: SessionId,
        cols: u16,
        rows: u16,
    },

    /// List a directory of the session workspace (root when `dir` is absent)
    ListFiles {
        session_id: SessionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dir: Option<String>,
    },

    /// Read one file of the session workspace
    ReadFile { session_id: SessionId, path: String },

    /// Tear the session down
    Close { session_id: SessionId },

    /// Request the sessions owned by this connection
    ListSessions,

    /// Ping to check connection
    Ping { seq: u64 },

    /// Client disconnecting gracefully
    Disconnect,
}

impl MessageType {
    /// Returns the session a command targets, if any.
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Self::Compile { session_id, .. }
            | Self::Run { session_id }
            | Self::Debug { session_id }
            | Self::Input { session_id, .. }
            | Self::Resize { session_id, .. }
            | Self::ListFiles { session_id, .. }
            | Self::ReadFile { session_id, .. }
            | Self::Close { session_id } => Some(session_id),
            Self::Connect { .. }
            | Self::OpenSession
            | Self::ListSessions
            | Self::Ping { .. }
            | Self::Disconnect => None,
        }
    }
}

/// Messages sent from client to daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMessage {
    pub protocol_version: ProtocolVersion,

    #[serde(flatten)]
    pub message: MessageType,
}

impl ClientMessage {
    /// Creates a new client message with current protocol version.
    pub fn new(message: MessageType) -> Self {
        Self {
            protocol_version: ProtocolVersion::CURRENT,
            message,
        }
    }

    pub fn connect(client_id: Option<String>) -> Self {
        Self::new(MessageType::Connect { client_id })
    }

    pub fn open_session() -> Self {
        Self::new(MessageType::OpenSession)
    }

    /// Creates a compile request from a submission.
    pub fn compile(session_id: SessionId, submission: Submission) -> Self {
        Self::new(MessageType::Compile {
            session_id,
            files: submission.files,
            flags: submission.flags,
            entry: submission.entry,
        })
    }

    pub fn run(session_id: SessionId) -> Self {
        Self::new(MessageType::Run { session_id })
    }

    pub fn debug(session_id: SessionId) -> Self {
        Self::new(MessageType::Debug { session_id })
    }

    pub fn input(session_id: SessionId, data: Vec<u8>) -> Self {
        Self::new(MessageType::Input { session_id, data })
    }

    pub fn resize(session_id: SessionId, cols: u16, rows: u16) -> Self {
        Self::new(MessageType::Resize {
            session_id,
            cols,
            rows,
        })
    }

    pub fn list_files(session_id: SessionId, dir: Option<String>) -> Self {
        Self::new(MessageType::ListFiles { session_id, dir })
    }

    pub fn read_file(session_id: SessionId, path: impl Into<String>) -> Self {
        Self::new(MessageType::ReadFile {
            session_id,
            path: path.into(),
        })
    }

    pub fn close(session_id: SessionId) -> Self {
        Self::new(MessageType::Close { session_id })
    }

    pub fn list_sessions() -> Self {
        Self::new(MessageType::ListSessions)
    }

    pub fn ping(seq: u64) -> Self {
        Self::new(MessageType::Ping { seq })
    }

    pub fn disconnect() -> Self {
        Self::new(MessageType::Disconnect)
    }
}

/// Messages sent from daemon to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonMessage {
    /// Connection accepted
    Connected {
        protocol_version: ProtocolVersion,
        client_id: String,
    },

    /// Connection rejected (version mismatch, too many clients)
    Rejected {
        reason: String,
        /// Daemon's protocol version (for client to upgrade)
        protocol_version: ProtocolVersion,
    },

    /// A session was allocated for this connection
    SessionOpened { session_id: SessionId },

    /// Output, diagnostic, or exit status from a session
    Output {
        session_id: SessionId,
        kind: OutputKind,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_status: Option<ExitStatus>,
    },

    /// Lifecycle transition of a session
    StateChanged {
        session_id: SessionId,
        state: SessionState,
        reason: StateReason,
    },

    /// A command was rejected or failed
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
        kind: ErrorKind,
        message: String,
    },

    /// Sessions owned by the requesting connection
    SessionList { sessions: Vec<SessionView> },

    /// Directory listing of a session workspace, folders first
    FileList {
        session_id: SessionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dir: Option<String>,
        entries: Vec<FileEntry>,
    },

    /// Contents of one workspace file
    FileContent {
        session_id: SessionId,
        path: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },

    /// Pong response to ping
    Pong { seq: u64 },
}

impl DaemonMessage {
    pub fn connected(client_id: String) -> Self {
        Self::Connected {
            protocol_version: ProtocolVersion::CURRENT,
            client_id,
        }
    }

    pub fn rejected(reason: &str) -> Self {
        Self::Rejected {
            reason: reason.to_string(),
            protocol_version: ProtocolVersion::CURRENT,
        }
    }

    pub fn session_opened(session_id: SessionId) -> Self {
        Self::SessionOpened { session_id }
    }

    pub fn error(session_id: Option<SessionId>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Error {
            session_id,
            kind,
            message: message.into(),
        }
    }

    pub fn session_list(sessions: Vec<SessionView>) -> Self {
        Self::SessionList { sessions }
    }

    pub fn file_list(session_id: SessionId, dir: Option<String>, entries: Vec<FileEntry>) -> Self {
        Self::FileList {
            session_id,
            dir,
            entries,
        }
    }

    pub fn file_content(session_id: SessionId, path: String, data: Vec<u8>) -> Self {
        Self::FileContent {
            session_id,
            path,
            data,
        }
    }

    pub fn pong(seq: u64) -> Self {
        Self::Pong { seq }
    }

    /// Converts a session frame into its wire event.
    ///
    /// State changes become `state_changed`; everything else is an `output`
    /// event whose `kind` mirrors the frame kind.
    pub fn from_frame(frame: OutputFrame) -> Self {
        let kind = frame.kind();
        let session_id = frame.session_id;
        match frame.body {
            FrameBody::StateChange { state, reason } => Self::StateChanged {
                session_id,
                state,
                reason,
            },
            FrameBody::Stdout(data) | FrameBody::Stderr(data) => Self::Output {
                session_id,
                kind,
                data,
                exit_status: None,
            },
            FrameBody::Diagnostic(text) => Self::Output {
                session_id,
                kind,
                data: text.into_bytes(),
                exit_status: None,
            },
            FrameBody::ExitStatus(status) => Self::Output {
                session_id,
                kind,
                data: Vec::new(),
                exit_status: Some(status),
            },
        }
    }

    /// Returns true if this event ends a session's stream.
    pub fn is_terminal_state(&self) -> bool {
        matches!(self, Self::StateChanged { state, .. } if state.is_terminal())
    }
}
