//! runcell Protocol - Wire protocol for daemon communication
//!
//! This crate provides the message types exchanged between clients and the
//! runcell daemon over its local socket, plus the newline-delimited JSON
//! codec both sides use to frame them.

pub mod codec;
pub mod message;
pub mod version;

pub use codec::{decode_line, encode_line, CodecError, MAX_MESSAGE_SIZE};
pub use message::{ClientMessage, DaemonMessage, MessageType};
pub use version::{ProtocolVersion, VersionError};
