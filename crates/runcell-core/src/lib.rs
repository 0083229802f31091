//! runcell Core - Shared domain types for sandboxed compile/run/debug sessions
//!
//! This crate provides the domain types shared between
//! the daemon (runcelld), the wire protocol, and the client.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod error;
pub mod files;
pub mod frame;
pub mod session;
pub mod submission;

// Re-exports for convenience
pub use error::{DomainError, DomainResult, ErrorKind};
pub use files::{FileEntry, FileKind};
pub use frame::{ExitStatus, FrameBody, OutputFrame, OutputKind};
pub use session::{SessionId, SessionLimits, SessionState, SessionView, StateReason};
pub use submission::{SourceFile, Submission};
