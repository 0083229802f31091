//! Session orchestrator using the Actor pattern.
//!
//! The orchestrator admits sessions, tracks them in a table owned by a
//! single actor task, and routes client requests to each session's own task.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐ OrchestratorCommand ┌──────────────────────┐
//! │OrchestratorHandle│────────────────────▶│  OrchestratorActor   │
//! │ (per connection) │    (mpsc channel)   │ HashMap<SessionId,   │
//! └────────┬─────────┘                     │         Slot>        │
//!          │ SessionCommand                └──────────▲───────────┘
//!          ▼                                          │ Retirement
//! ┌──────────────────┐                                │
//! │  SessionMachine  │────────────────────────────────┘
//! │  (one per id)    │
//! └──────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All operations in this module follow the panic-free policy:
//! - No `.unwrap()` or `.expect()` in production code
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

use std::sync::Arc;

use runcell_core::SessionLimits;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

mod actor;
mod commands;
mod handle;

pub use actor::OrchestratorActor;
pub use commands::{
    Lookup, OrchestratorCommand, OrchestratorError, OrchestratorStats, SessionReply,
    SessionRequest,
};
pub use handle::OrchestratorHandle;

use crate::config::DaemonConfig;
use crate::session::SessionContext;

/// Channel buffer size
const COMMAND_BUFFER: usize = 100;

/// Spawns the orchestrator actor configured from `config`.
pub fn spawn_orchestrator(config: &DaemonConfig) -> OrchestratorHandle {
    spawn_with_context(
        Arc::new(SessionContext::from_config(config)),
        config.limits.session_limits(),
        config.admission.max_sessions,
        config.admission.retired_memory,
    )
}

/// Spawns the orchestrator actor around an existing session context.
pub fn spawn_with_context(
    ctx: Arc<SessionContext>,
    limits: SessionLimits,
    max_sessions: usize,
    retired_memory: usize,
) -> OrchestratorHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (retire_tx, retire_rx) = mpsc::unbounded_channel();

    let actor = OrchestratorActor::new(cmd_rx, retire_rx, max_sessions, retired_memory);
    tokio::spawn(actor.run());

    OrchestratorHandle::new(cmd_tx, retire_tx, ctx, limits, CancellationToken::new())
}
