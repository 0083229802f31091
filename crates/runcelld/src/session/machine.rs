//! The per-session state machine task.
//!
//! One task owns everything a session holds: its workspace, its terminal,
//! and at most one attached process. The loop waits on four sources and
//! handles whichever wakes first:
//!
//! ```text
//!            ┌──────────── commands (handle) ─────────────┐
//!            │  ┌───────── terminal output ─────────────┐ │
//!            │  │  ┌────── process exit ──────────────┐ │ │
//!            │  │  │  ┌─── idle deadline ───────────┐ │ │ │
//!            ▼  ▼  ▼  ▼                             │ │ │ │
//!        SessionMachine::run ──▶ FrameSink ──▶ subscriber
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use runcell_core::{
    FileEntry, FrameBody, SessionId, SessionLimits, SessionState, SessionView, StateReason,
    Submission,
};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, info, trace, warn};

use super::commands::{Retirement, SessionCommand, SessionError};
use super::frames::FrameSink;
use super::{SessionContext, SessionResources};
use crate::pty::{PtyBridge, PtyOutput};
use crate::supervisor::{KillReason, ProcessHandle, ProcessOutcome, ProcessRole, ProcessSpec};
use crate::workspace::WorkspaceError;

/// The process currently attached to the terminal.
struct ActiveProcess {
    handle: ProcessHandle,
    /// Bytes forwarded (or captured) for this process.
    output_bytes: u64,
    truncated: bool,
    /// Compiler output is collected instead of streamed.
    log: Option<Vec<u8>>,
}

impl ActiveProcess {
    fn new(handle: ProcessHandle) -> Self {
        let log = (handle.role() == ProcessRole::Compiler).then(Vec::new);
        Self {
            handle,
            output_bytes: 0,
            truncated: false,
            log,
        }
    }

    fn log_text(&self) -> String {
        let Some(log) = &self.log else {
            return String::new();
        };
        let mut text = String::from_utf8_lossy(log).into_owned();
        if self.truncated {
            if !text.ends_with('\n') && !text.is_empty() {
                text.push('\n');
            }
            text.push_str("[compiler output truncated]\n");
        }
        text
    }
}

enum Wake {
    Command(Option<SessionCommand>),
    Output(Option<Vec<u8>>),
    Exited(ProcessOutcome),
    Idle,
}

pub(super) struct SessionMachine {
    id: SessionId,
    ctx: Arc<SessionContext>,
    limits: SessionLimits,
    state: SessionState,
    state_tx: watch::Sender<SessionState>,
    commands: mpsc::Receiver<SessionCommand>,
    output: PtyOutput,
    output_open: bool,
    pty: PtyBridge,
    workspace: PathBuf,
    active: Option<ActiveProcess>,
    frames: FrameSink,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    idle_deadline: Instant,
    retired: mpsc::UnboundedSender<Retirement>,
}

impl SessionMachine {
    pub fn new(
        id: SessionId,
        resources: SessionResources,
        limits: SessionLimits,
        ctx: Arc<SessionContext>,
        commands: mpsc::Receiver<SessionCommand>,
        state_tx: watch::Sender<SessionState>,
        retired: mpsc::UnboundedSender<Retirement>,
    ) -> Self {
        let now = Utc::now();
        let frames = FrameSink::new(id.clone(), ctx.backlog_frames);
        Self {
            id,
            limits,
            state: SessionState::Created,
            state_tx,
            commands,
            output: resources.output,
            output_open: true,
            pty: resources.pty,
            workspace: resources.workspace,
            active: None,
            frames,
            created_at: now,
            last_activity: now,
            idle_deadline: Instant::now() + limits.idle_timeout,
            retired,
            ctx,
        }
    }

    pub async fn run(mut self) {
        info!(
            session_id = %self.id,
            workspace = %self.workspace.display(),
            bridge = self.pty.id(),
            "Session started"
        );
        self.frames.emit(FrameBody::StateChange {
            state: SessionState::Created,
            reason: StateReason::Requested,
        });

        while !self.state.is_terminal() {
            let wake = tokio::select! {
                command = self.commands.recv() => Wake::Command(command),
                chunk = self.output.recv(), if self.output_open => Wake::Output(chunk),
                outcome = wait_active(self.active.as_ref()) => Wake::Exited(outcome),
                () = sleep_until(self.idle_deadline) => Wake::Idle,
            };

            match wake {
                Wake::Command(Some(command)) => self.handle_command(command).await,
                Wake::Command(None) => {
                    debug!(session_id = %self.id, "All handles dropped, closing session");
                    self.enter_terminal(SessionState::Closed, StateReason::Shutdown)
                        .await;
                }
                Wake::Output(Some(chunk)) => self.on_output(chunk),
                Wake::Output(None) => {
                    trace!(session_id = %self.id, "Terminal output ended");
                    self.output_open = false;
                }
                Wake::Exited(outcome) => self.on_exit(outcome).await,
                Wake::Idle => {
                    info!(
                        session_id = %self.id,
                        idle_secs = self.limits.idle_timeout.as_secs(),
                        "Session idle, closing"
                    );
                    self.enter_terminal(SessionState::Closed, StateReason::Timeout)
                        .await;
                }
            }
        }

        debug!(session_id = %self.id, state = %self.state, "Session task finished");
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    async fn handle_command(&mut self, command: SessionCommand) {
        if command.is_activity() {
            self.touch();
        }
        let name = command.name();
        trace!(session_id = %self.id, command = name, state = %self.state, "Session command");

        let result = match command {
            SessionCommand::Compile {
                submission,
                respond_to,
            } => {
                let result = self.compile(*submission).await;
                reply(respond_to, result)
            }
            SessionCommand::Run { respond_to } => {
                let result = self.run_program().await;
                reply(respond_to, result)
            }
            SessionCommand::Debug { respond_to } => {
                let result = self.debug().await;
                reply(respond_to, result)
            }
            SessionCommand::Input { data, respond_to } => {
                let result = self.input(data);
                reply(respond_to, result)
            }
            SessionCommand::Resize {
                cols,
                rows,
                respond_to,
            } => {
                let result = self.pty.resize(cols, rows).map_err(SessionError::from);
                reply(respond_to, result)
            }
            SessionCommand::ListFiles { dir, respond_to } => {
                let result = self.list_files(dir).await;
                reply(respond_to, result)
            }
            SessionCommand::ReadFile { path, respond_to } => {
                let result = self.read_file(path).await;
                reply(respond_to, result)
            }
            SessionCommand::Close { reason, respond_to } => {
                self.enter_terminal(SessionState::Closed, reason).await;
                let _ = respond_to.send(());
                None
            }
            SessionCommand::Subscribe { respond_to } => {
                debug!(session_id = %self.id, "Subscriber attached");
                let _ = respond_to.send(self.frames.subscribe());
                None
            }
            SessionCommand::Snapshot { respond_to } => {
                let _ = respond_to.send(self.snapshot());
                None
            }
        };

        if let Some(kind) = result {
            debug!(session_id = %self.id, command = name, %kind, "Command rejected");
        }
    }

    async fn compile(&mut self, submission: Submission) -> Result<(), SessionError> {
        if !matches!(self.state, SessionState::Created | SessionState::Ready) {
            return Err(SessionError::transition("compile", self.state));
        }
        let ctx = Arc::clone(&self.ctx);
        let toolchain = &ctx.toolchain;

        submission.validate_flags(toolchain.max_flags, toolchain.max_flag_len)?;
        let units: Vec<String> = submission
            .compile_units(&toolchain.source_extensions)?
            .into_iter()
            .map(str::to_string)
            .collect();

        debug!(
            session_id = %self.id,
            files = submission.files.len(),
            bytes = submission.total_bytes(),
            "Writing submission"
        );
        let Submission { files, flags, .. } = submission;
        let workspace = self.workspace.clone();
        let artifact = workspace.join(&toolchain.artifact_name);
        let max_bytes = self.limits.max_workspace_bytes;
        let writer = Arc::clone(&ctx);
        let session_id = self.id.clone();
        tokio::task::spawn_blocking(move || {
            // A recompile must never leave the previous artifact behind.
            match std::fs::remove_file(&artifact) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(%session_id, error = %e, "Failed to remove previous artifact");
                }
            }
            writer.workspaces.write_submission(&workspace, &files, max_bytes)
        })
        .await
        .map_err(join_error)??;

        let spec = ProcessSpec::new(ProcessRole::Compiler, &toolchain.compiler)
            .args(toolchain.default_flags.iter().cloned())
            .args(flags)
            .args(units)
            .args(["-o".to_string(), toolchain.artifact_name.clone()]);

        self.transition(SessionState::Compiling, StateReason::Requested);
        match ctx
            .supervisor
            .spawn(&spec, &self.workspace, &self.pty, &self.limits)
        {
            Ok(handle) => {
                self.active = Some(ActiveProcess::new(handle));
                Ok(())
            }
            Err(e) => {
                warn!(session_id = %self.id, error = %e, "Compiler failed to start");
                self.frames.emit(FrameBody::Diagnostic(e.to_string()));
                self.enter_terminal(SessionState::CompileFailed, StateReason::SpawnFailed)
                    .await;
                Err(e.into())
            }
        }
    }

    fn list_files(
        &self,
        dir: Option<String>,
    ) -> impl std::future::Future<Output = Result<Vec<FileEntry>, SessionError>> + Send + 'static
    {
        let ctx = Arc::clone(&self.ctx);
        let workspace = self.workspace.clone();
        async move {
            let entries = tokio::task::spawn_blocking(move || {
                ctx.workspaces.list_files(&workspace, dir.as_deref())
            })
            .await
            .map_err(join_error)??;
            Ok(entries)
        }
    }

    fn read_file(
        &self,
        path: String,
    ) -> impl std::future::Future<Output = Result<Vec<u8>, SessionError>> + Send + 'static {
        let ctx = Arc::clone(&self.ctx);
        let workspace = self.workspace.clone();
        async move {
            let data =
                tokio::task::spawn_blocking(move || ctx.workspaces.read_file(&workspace, &path))
                    .await
                    .map_err(join_error)??;
            Ok(data)
        }
    }

    async fn run_program(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Ready {
            return Err(SessionError::transition("run", self.state));
        }
        let spec = ProcessSpec::new(ProcessRole::Program, self.artifact_command());
        self.attach(spec, SessionState::Running).await
    }

    async fn debug(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Ready => {}
            SessionState::Running => {
                info!(session_id = %self.id, "Restarting program under debugger");
                self.detach().await;
            }
            state => return Err(SessionError::transition("debug", state)),
        }
        let toolchain = &self.ctx.toolchain;
        let spec = ProcessSpec::new(ProcessRole::Debugger, &toolchain.debugger)
            .args(toolchain.debugger_args.iter().cloned())
            .args([self.artifact_command()]);
        self.attach(spec, SessionState::Debugging).await
    }

    fn input(&mut self, data: Vec<u8>) -> Result<(), SessionError> {
        if !self.state.accepts_input() {
            return Err(SessionError::transition("send input", self.state));
        }
        if self.active.is_none() {
            debug!(session_id = %self.id, bytes = data.len(), "No process attached, input ignored");
            return Ok(());
        }
        self.pty.write(data)?;
        Ok(())
    }

    fn snapshot(&self) -> SessionView {
        SessionView {
            id: self.id.clone(),
            state: self.state,
            created_at: self.created_at,
            last_activity: self.last_activity,
            active_pid: self.active.as_ref().map(|active| active.handle.pid()),
            frames_emitted: self.frames.emitted(),
        }
    }

    // ------------------------------------------------------------------------
    // Processes
    // ------------------------------------------------------------------------

    fn artifact_command(&self) -> String {
        format!("./{}", self.ctx.toolchain.artifact_name)
    }

    async fn attach(
        &mut self,
        spec: ProcessSpec,
        target: SessionState,
    ) -> Result<(), SessionError> {
        match self
            .ctx
            .supervisor
            .spawn(&spec, &self.workspace, &self.pty, &self.limits)
        {
            Ok(handle) => {
                self.active = Some(ActiveProcess::new(handle));
                self.transition(target, StateReason::Requested);
                Ok(())
            }
            Err(e) => {
                warn!(session_id = %self.id, role = %spec.role, error = %e, "Process failed to start");
                self.frames.emit(FrameBody::Diagnostic(e.to_string()));
                self.enter_terminal(SessionState::Exited, StateReason::SpawnFailed)
                    .await;
                Err(e.into())
            }
        }
    }

    /// Terminates the attached process and drains what it wrote.
    async fn detach(&mut self) {
        if let Some(active) = &self.active {
            active.handle.terminate().await;
        } else {
            return;
        }
        self.settle().await;
        self.active = None;
    }

    /// Drains terminal output until it goes quiet or the settle window ends.
    async fn settle(&mut self) {
        let deadline = Instant::now() + self.ctx.settle_max;
        while self.output_open {
            let quiet = (Instant::now() + self.ctx.settle_quiet).min(deadline);
            match timeout_at(quiet, self.output.recv()).await {
                Ok(Some(chunk)) => self.on_output(chunk),
                Ok(None) => self.output_open = false,
                Err(_) => break,
            }
        }
    }

    fn on_output(&mut self, mut chunk: Vec<u8>) {
        self.touch();
        let max = self.limits.max_output_bytes;
        let Some(active) = self.active.as_mut() else {
            trace!(session_id = %self.id, bytes = chunk.len(), "No process attached, output dropped");
            return;
        };

        let room = usize::try_from(max.saturating_sub(active.output_bytes)).unwrap_or(usize::MAX);
        let overflow = chunk.len() > room;
        chunk.truncate(room);
        active.output_bytes += chunk.len() as u64;
        let first_overflow = overflow && !active.truncated;
        active.truncated |= overflow;

        if let Some(log) = active.log.as_mut() {
            log.extend_from_slice(&chunk);
            return;
        }
        if !chunk.is_empty() {
            self.frames.emit(FrameBody::Stdout(chunk));
        }
        if first_overflow {
            info!(session_id = %self.id, max, "Output cap reached, discarding further output");
            self.frames.emit(FrameBody::Diagnostic(format!(
                "output truncated after {max} bytes"
            )));
        }
    }

    async fn on_exit(&mut self, outcome: ProcessOutcome) {
        self.touch();
        self.settle().await;
        let Some(active) = self.active.take() else {
            return;
        };

        let limit = outcome.killed_by.and_then(|reason| self.limit_reason(reason));
        if let Some((_, message)) = &limit {
            self.frames.emit(FrameBody::Diagnostic(format!(
                "{} {message}",
                active.handle.role()
            )));
        }

        match active.handle.role() {
            ProcessRole::Compiler => self.finish_compile(&active, &outcome, limit).await,
            ProcessRole::Program | ProcessRole::Debugger => {
                self.frames.emit(FrameBody::ExitStatus(outcome.status.clone()));
                let reason = limit.map_or(StateReason::ProcessExited, |(reason, _)| reason);
                self.enter_terminal(SessionState::Exited, reason).await;
            }
        }
    }

    async fn finish_compile(
        &mut self,
        active: &ActiveProcess,
        outcome: &ProcessOutcome,
        limit: Option<(StateReason, String)>,
    ) {
        let log = active.log_text();
        let has_log = !log.trim().is_empty();

        if let Some((reason, _)) = limit {
            if has_log {
                self.frames.emit(FrameBody::Diagnostic(log));
            }
            self.enter_terminal(SessionState::CompileFailed, reason).await;
            return;
        }

        let artifact = self.workspace.join(&self.ctx.toolchain.artifact_name);
        if outcome.status.success() && artifact.is_file() {
            if has_log {
                self.frames.emit(FrameBody::Diagnostic(log));
            }
            info!(session_id = %self.id, "Compile succeeded");
            self.transition(SessionState::Ready, StateReason::ProcessExited);
            return;
        }

        let text = if has_log {
            log
        } else if outcome.status.success() {
            "compiler produced no executable".to_string()
        } else {
            format!("compiler failed with {}", outcome.status)
        };
        info!(session_id = %self.id, status = %outcome.status, "Compile failed");
        self.frames.emit(FrameBody::Diagnostic(text));
        self.enter_terminal(SessionState::CompileFailed, StateReason::CompileError)
            .await;
    }

    fn limit_reason(&self, reason: KillReason) -> Option<(StateReason, String)> {
        match reason {
            KillReason::Requested => None,
            KillReason::TimeLimit => Some((
                StateReason::TimeLimit,
                format!(
                    "exceeded the wall-clock limit of {}s",
                    self.limits.wall_clock_timeout.as_secs_f32()
                ),
            )),
            KillReason::ProcessLimit => Some((
                StateReason::ProcessLimit,
                format!(
                    "exceeded the process limit of {}",
                    self.limits.max_processes
                ),
            )),
        }
    }

    // ------------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------------

    fn touch(&mut self) {
        self.last_activity = Utc::now();
        self.idle_deadline = Instant::now() + self.limits.idle_timeout;
    }

    fn transition(&mut self, state: SessionState, reason: StateReason) {
        debug!(session_id = %self.id, from = %self.state, to = %state, %reason, "Session transition");
        self.state = state;
        self.frames.emit(FrameBody::StateChange { state, reason });
        self.state_tx.send_replace(state);
    }

    /// Releases everything the session holds, then reports the final state.
    async fn enter_terminal(&mut self, state: SessionState, reason: StateReason) {
        if self.state.is_terminal() {
            return;
        }

        if let Some(active) = self.active.take() {
            active.handle.terminate().await;
        }
        self.pty.close();
        let ctx = Arc::clone(&self.ctx);
        let workspace = self.workspace.clone();
        if let Err(e) =
            tokio::task::spawn_blocking(move || ctx.workspaces.destroy(&workspace)).await
        {
            warn!(session_id = %self.id, error = %e, "Workspace cleanup task failed");
        }

        info!(session_id = %self.id, from = %self.state, to = %state, %reason, "Session ended");
        self.state = state;
        self.frames.emit(FrameBody::StateChange { state, reason });
        self.frames.close();
        self.state_tx.send_replace(state);
        let _ = self.retired.send(Retirement {
            session_id: self.id.clone(),
            state,
            reason,
        });
    }
}

async fn wait_active(active: Option<&ActiveProcess>) -> ProcessOutcome {
    match active {
        Some(active) => active.handle.wait().await,
        None => std::future::pending().await,
    }
}

fn join_error(err: tokio::task::JoinError) -> WorkspaceError {
    WorkspaceError::Io(std::io::Error::other(err.to_string()))
}

fn reply<T>(
    respond_to: tokio::sync::oneshot::Sender<Result<T, SessionError>>,
    result: Result<T, SessionError>,
) -> Option<runcell_core::ErrorKind> {
    let kind = result.as_ref().err().map(SessionError::kind);
    let _ = respond_to.send(result);
    kind
}
