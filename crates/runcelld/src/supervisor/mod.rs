//! Process supervisor.
//!
//! Spawns compiler, program and debugger processes onto a session's
//! pseudo-terminal, each as the leader of its own process group, and
//! guarantees the whole group is gone once the process is reported exited.
//!
//! # Process tree ownership
//!
//! ```text
//! Supervisor::spawn ─▶ ProcessHandle ──┬── waiter (blocking thread)
//!                                      │     reaps leader, SIGKILLs remnants,
//!                                      │     publishes ProcessOutcome
//!                                      └── watchdog (task)
//!                                            wall-clock deadline,
//!                                            process-count census
//! ```

mod census;
mod watchdog;

use std::env;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use portable_pty::CommandBuilder;
use runcell_core::{ErrorKind, ExitStatus, SessionLimits};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SupervisorConfig;
use crate::pty::{PtyBridge, PtyError};

pub use census::{group_exists, group_members, signal_group};

/// Variables copied from the daemon's environment into every child.
const ALLOWED_ENV_VARS: &[&str] = &["LANG", "LC_ALL"];

/// How long to wait for the group to disappear after SIGKILL.
const KILL_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

/// Polls for killed group members to disappear before reporting exit.
const REMNANT_POLLS: u32 = 50;
const REMNANT_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("executable not found: {0}")]
    ExecutableNotFound(String),

    #[error("workspace unusable: {path}: {reason}")]
    WorkspaceUnusable { path: PathBuf, reason: String },

    #[error("spawn failed: {0}")]
    Spawn(#[from] PtyError),

    #[error("spawned process has no pid")]
    NoPid,
}

impl SupervisorError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::SpawnFailed
    }
}

/// What a process is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    Compiler,
    Program,
    Debugger,
}

impl std::fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Compiler => "compiler",
            Self::Program => "program",
            Self::Debugger => "debugger",
        })
    }
}

/// Why the supervisor killed a process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
    /// `terminate` was called (close, replacement, shutdown).
    Requested,
    /// Wall-clock limit reached.
    TimeLimit,
    /// Process-count limit exceeded.
    ProcessLimit,
}

/// Final result of a supervised process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutcome {
    pub status: ExitStatus,
    pub killed_by: Option<KillReason>,
}

/// A command to run on the session terminal.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub role: ProcessRole,
    /// Bare name resolved on `PATH`, or a path.
    pub program: String,
    pub args: Vec<String>,
}

impl ProcessSpec {
    pub fn new(role: ProcessRole, program: impl Into<String>) -> Self {
        Self {
            role,
            program: program.into(),
            args: Vec::new(),
        }
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// Spawns and supervises processes.
#[derive(Debug, Clone)]
pub struct Supervisor {
    path: String,
    term: String,
    kill_grace: Duration,
    census_interval: Duration,
}

impl Supervisor {
    pub fn new(config: &SupervisorConfig, term: &str) -> Self {
        Self {
            path: config.path.clone(),
            term: term.to_string(),
            kill_grace: config.kill_grace(),
            census_interval: config.census_interval(),
        }
    }

    /// Finds an executable by path or on the configured `PATH`.
    pub fn resolve(&self, program: &str, workspace: &Path) -> Option<PathBuf> {
        if program.contains('/') {
            let candidate = workspace.join(program);
            return is_executable(&candidate).then_some(candidate);
        }
        self.path
            .split(':')
            .filter(|dir| !dir.is_empty())
            .map(|dir| Path::new(dir).join(program))
            .find(|candidate| is_executable(candidate))
    }

    /// Starts `spec` attached to `pty`, with `workspace` as cwd and `HOME`.
    pub fn spawn(
        &self,
        spec: &ProcessSpec,
        workspace: &Path,
        pty: &PtyBridge,
        limits: &SessionLimits,
    ) -> Result<ProcessHandle, SupervisorError> {
        check_workspace(workspace)?;
        let executable = self
            .resolve(&spec.program, workspace)
            .ok_or_else(|| SupervisorError::ExecutableNotFound(spec.program.clone()))?;

        let mut command = CommandBuilder::new(&executable);
        command.args(&spec.args);
        command.cwd(workspace);
        command.env_clear();
        for name in ALLOWED_ENV_VARS {
            if let Some(value) = env::var_os(name) {
                command.env(name, value);
            }
        }
        command.env("PATH", &self.path);
        command.env("HOME", workspace);
        command.env("TERM", &self.term);

        let mut child = pty.spawn(command)?;
        let Some(pid) = child.process_id() else {
            let _ = child.kill();
            return Err(SupervisorError::NoPid);
        };
        // The child called setsid, so it leads its own group.
        let pgid = pid as i32;

        let killed_by: Arc<OnceLock<KillReason>> = Arc::new(OnceLock::new());
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let stop_watchdog = CancellationToken::new();

        let waiter_killed_by = Arc::clone(&killed_by);
        let waiter_stop = stop_watchdog.clone();
        let role = spec.role;
        tokio::task::spawn_blocking(move || {
            let status = match child.wait() {
                Ok(status) => convert_status(&status),
                Err(e) => {
                    warn!(pid, error = %e, "Failed to wait for process");
                    ExitStatus::default()
                }
            };
            // Leader is reaped; nothing else from this group may outlive it.
            signal_group(pgid, libc::SIGKILL);
            for _ in 0..REMNANT_POLLS {
                if !group_exists(pgid) {
                    break;
                }
                std::thread::sleep(REMNANT_POLL_INTERVAL);
            }
            waiter_stop.cancel();
            let outcome = ProcessOutcome {
                status,
                killed_by: waiter_killed_by.get().copied(),
            };
            debug!(pid, role = %role, status = %outcome.status, killed_by = ?outcome.killed_by, "Process exited");
            let _ = outcome_tx.send(Some(outcome));
        });

        watchdog::spawn(watchdog::Watchdog {
            pgid,
            deadline: tokio::time::Instant::now() + limits.wall_clock_timeout,
            max_processes: limits.max_processes,
            census_interval: self.census_interval,
            killed_by: Arc::clone(&killed_by),
            stop: stop_watchdog.clone(),
        });

        info!(
            pid,
            role = %spec.role,
            program = %executable.display(),
            bridge = pty.id(),
            "Process spawned"
        );

        Ok(ProcessHandle {
            pid,
            pgid,
            role: spec.role,
            kill_grace: self.kill_grace,
            killed_by,
            outcome: outcome_rx,
            stop_watchdog,
        })
    }
}

/// A spawned process and its group.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    pgid: i32,
    role: ProcessRole,
    kill_grace: Duration,
    killed_by: Arc<OnceLock<KillReason>>,
    outcome: watch::Receiver<Option<ProcessOutcome>>,
    stop_watchdog: CancellationToken,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn pgid(&self) -> i32 {
        self.pgid
    }

    pub fn role(&self) -> ProcessRole {
        self.role
    }

    /// Returns the outcome if the process has exited.
    pub fn try_wait(&self) -> Option<ProcessOutcome> {
        self.outcome.borrow().clone()
    }

    /// Waits for the process to exit.
    pub async fn wait(&self) -> ProcessOutcome {
        let mut outcome = self.outcome.clone();
        let result = match outcome.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        result.unwrap_or_else(|| self.lost_outcome())
    }

    fn lost_outcome(&self) -> ProcessOutcome {
        ProcessOutcome {
            status: ExitStatus::default(),
            killed_by: self.killed_by.get().copied(),
        }
    }

    /// Terminates the whole process group. Idempotent.
    ///
    /// Sends SIGTERM, escalates to SIGKILL after the grace period, and
    /// returns once the leader has been reaped.
    pub async fn terminate(&self) -> ProcessOutcome {
        if let Some(outcome) = self.try_wait() {
            return outcome;
        }
        let _ = self.killed_by.set(KillReason::Requested);

        signal_group(self.pgid, libc::SIGTERM);
        if let Ok(outcome) = timeout(self.kill_grace, self.wait()).await {
            return outcome;
        }

        debug!(pid = self.pid, "Grace period elapsed, sending SIGKILL");
        signal_group(self.pgid, libc::SIGKILL);
        match timeout(KILL_CONFIRM_TIMEOUT, self.wait()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(pid = self.pid, "Process group survived SIGKILL");
                self.lost_outcome()
            }
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.try_wait().is_none() {
            signal_group(self.pgid, libc::SIGKILL);
        }
        self.stop_watchdog.cancel();
    }
}

fn check_workspace(workspace: &Path) -> Result<(), SupervisorError> {
    let unusable = |reason: String| SupervisorError::WorkspaceUnusable {
        path: workspace.to_path_buf(),
        reason,
    };
    let meta = std::fs::metadata(workspace).map_err(|e| unusable(e.to_string()))?;
    if !meta.is_dir() {
        return Err(unusable("not a directory".to_string()));
    }
    if meta.permissions().readonly() {
        return Err(unusable("read-only".to_string()));
    }
    Ok(())
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn convert_status(status: &portable_pty::ExitStatus) -> ExitStatus {
    match status.signal() {
        Some(signal) => ExitStatus::from_signal(signal),
        None => ExitStatus::from_code(i32::try_from(status.exit_code()).unwrap_or(i32::MAX)),
    }
}
