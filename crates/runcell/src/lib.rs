//! runcell client - Library modules
//!
//! This library talks to the runcell daemon over its Unix socket.
//!
//! # Architecture
//!
//! 1. **`DaemonClient`**: connects (with retry), performs the handshake, and
//!    issues session commands, returning once the daemon has answered
//! 2. **`attach`**: hands the local terminal to a running program or
//!    debugger, forwarding keystrokes and window size changes until the
//!    session ends
//! 3. **`daemon`**: locates or starts the daemon process

pub mod attach;
pub mod client;
pub mod daemon;
pub mod error;

// Re-export commonly used types
pub use attach::{attach, AttachMode, AttachOutcome};
pub use client::{ClientConfig, CommandWriter, DaemonClient, EventReader};
pub use error::{ClientError, Result};
