//! runcell Daemon - Session orchestrator for sandboxed compile/run/debug
//!
//! This crate provides the core infrastructure for the runcell daemon:
//! - `workspace` - Per-session directories under a shared root
//! - `pty` - Pseudo-terminal bridge carrying bytes to and from processes
//! - `supervisor` - Process-group spawning, limits, and termination
//! - `session` - One state machine task per session
//! - `orchestrator` - Session table actor, admission, and routing
//! - `server` - Unix socket transport for client connections
//! - `monitor` - Host resource sampling for the daemon itself
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       runcelld daemon                        │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌─────────────────┐  commands  ┌─────────────────────────┐  │
//! │  │  DaemonServer   │───────────▶│   OrchestratorActor     │  │
//! │  │ (Unix Socket)   │            │ (session table owner)   │  │
//! │  └────────┬────────┘            └────────────┬────────────┘  │
//! │           │ frames                           │ routes        │
//! │           ▼                                  ▼               │
//! │  ┌─────────────────┐            ┌─────────────────────────┐  │
//! │  │ConnectionHandler│◀───────────│  SessionMachine (task)  │  │
//! │  │  (per client)   │   output   │  workspace + pty + slot │  │
//! │  └─────────────────┘            └─────────────────────────┘  │
//! │                                                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod config;
pub mod monitor;
pub mod orchestrator;
pub mod pty;
pub mod server;
pub mod session;
pub mod supervisor;
pub mod workspace;
