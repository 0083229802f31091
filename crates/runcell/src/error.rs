//! Error types for the runcell client.
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use std::io;

use runcell_core::ErrorKind;
use runcell_protocol::CodecError;
use thiserror::Error;

// ============================================================================
// Client Error Type
// ============================================================================

/// Errors raised while talking to the daemon or driving the local terminal.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The daemon socket could not be reached.
    ///
    /// Usually means the daemon is not running; `runcelld start` fixes it.
    #[error("Failed to connect to daemon: {0}")]
    DaemonConnection(String),

    /// Protocol version mismatch with daemon
    #[error("Protocol version mismatch (client: {client_version}, daemon: {daemon_version})")]
    VersionMismatch {
        client_version: String,
        daemon_version: String,
    },

    /// The daemon refused the connection for a reason other than version.
    #[error("Connection rejected: {0}")]
    Rejected(String),

    /// The daemon answered a command with an error event.
    #[error("{kind}: {message}")]
    Daemon { kind: ErrorKind, message: String },

    /// An unexpected or unparseable message.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Daemon closed the connection")]
    Disconnected,

    /// Raw mode or terminal size could not be set up.
    ///
    /// Running `reset` restores a terminal left in a bad state.
    #[error("Terminal error: {0}")]
    Terminal(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to parse message: {0}")]
    Codec(#[from] CodecError),
}

impl ClientError {
    /// Error category when the daemon reported one.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Daemon { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// Convenience Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

// ============================================================================
// Tests
// ============================================================================
