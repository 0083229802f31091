//! Sessions.
//!
//! Each session is a state machine running in its own task, owning one
//! workspace, one pseudo-terminal, and at most one attached process.
//! [`SessionHandle`] is the only way to talk to it.

mod commands;
mod frames;
mod handle;
mod machine;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use runcell_core::{SessionId, SessionLimits, SessionState};
use tokio::sync::{mpsc, watch};
use tracing::warn;

use crate::config::{DaemonConfig, ToolchainConfig};
use crate::pty::{PtyBridge, PtyOutput, TerminalOptions};
use crate::supervisor::Supervisor;
use crate::workspace::WorkspaceManager;

pub use commands::{Retirement, SessionCommand, SessionError};
pub use frames::FrameStream;
pub use handle::SessionHandle;

/// Capacity of each session's command channel.
pub const COMMAND_BUFFER: usize = 64;

/// Frames kept for replay while nobody is subscribed.
pub const DEFAULT_BACKLOG_FRAMES: usize = 1024;

/// Everything sessions share: workspace layout, process spawning, and the
/// toolchain they drive.
#[derive(Debug)]
pub struct SessionContext {
    pub workspaces: WorkspaceManager,
    pub supervisor: Supervisor,
    pub toolchain: ToolchainConfig,
    pub terminal: TerminalOptions,
    pub settle_quiet: Duration,
    pub settle_max: Duration,
    pub backlog_frames: usize,
}

impl SessionContext {
    pub fn from_config(config: &DaemonConfig) -> Self {
        Self {
            workspaces: WorkspaceManager::new(&config.workspace, &config.toolchain.artifact_name),
            supervisor: Supervisor::new(&config.supervisor, &config.terminal.term),
            toolchain: config.toolchain.clone(),
            terminal: TerminalOptions::from(&config.terminal),
            settle_quiet: Duration::from_millis(config.terminal.settle_quiet_ms),
            settle_max: Duration::from_millis(config.terminal.settle_max_ms),
            backlog_frames: DEFAULT_BACKLOG_FRAMES,
        }
    }
}

/// The workspace and terminal a session is started with.
#[derive(Debug)]
pub struct SessionResources {
    pub workspace: PathBuf,
    pub pty: PtyBridge,
    pub output: PtyOutput,
}

impl SessionResources {
    /// Creates the workspace and opens the terminal. Blocking.
    ///
    /// On failure nothing is left behind.
    pub fn prepare(ctx: &SessionContext, id: &SessionId) -> Result<Self, SessionError> {
        let workspace = ctx.workspaces.create(id)?;
        match PtyBridge::open(&ctx.terminal) {
            Ok((pty, output)) => Ok(Self {
                workspace,
                pty,
                output,
            }),
            Err(e) => {
                warn!(session_id = %id, error = %e, "Failed to open terminal");
                ctx.workspaces.destroy(&workspace);
                Err(e.into())
            }
        }
    }
}

/// Starts a session task and returns its handle.
///
/// `retired` receives one notice when the session reaches a terminal state.
pub fn spawn_session(
    id: SessionId,
    resources: SessionResources,
    limits: SessionLimits,
    ctx: Arc<SessionContext>,
    retired: mpsc::UnboundedSender<Retirement>,
) -> SessionHandle {
    let (sender, commands) = mpsc::channel(COMMAND_BUFFER);
    let (state_tx, state_rx) = watch::channel(SessionState::Created);
    let machine = machine::SessionMachine::new(
        id.clone(),
        resources,
        limits,
        ctx,
        commands,
        state_tx,
        retired,
    );
    tokio::spawn(machine.run());
    SessionHandle::new(id, sender, state_rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use runcell_core::{
        ErrorKind, FrameBody, OutputFrame, SourceFile, StateReason, Submission,
    };
    use std::path::Path;
    use tempfile::TempDir;
    use tokio::time::timeout;

    /// `sh` stands in for the compiler: `sh build.sh -o a.out`.
    fn test_context(root: &Path) -> Arc<SessionContext> {
        let mut config = DaemonConfig::default();
        config.workspace.root = root.to_path_buf();
        config.terminal.term = "dumb".to_string();
        config.supervisor.kill_grace_ms = 200;
        config.supervisor.census_interval_ms = 50;
        config.toolchain = ToolchainConfig {
            compiler: "sh".to_string(),
            default_flags: Vec::new(),
            source_extensions: vec!["sh".to_string()],
            debugger: "sh".to_string(),
            debugger_args: Vec::new(),
            ..ToolchainConfig::default()
        };
        let ctx = SessionContext::from_config(&config);
        ctx.workspaces.ensure_root().unwrap();
        Arc::new(ctx)
    }

    fn build_script(program: &str) -> Submission {
        let script = format!(
            "cat > \"$2\" <<'EOF'\n#!/bin/sh\n{program}\nEOF\nchmod +x \"$2\"\n"
        );
        Submission::new(vec![SourceFile::new("build.sh", script)])
    }

    struct Harness {
        _root: TempDir,
        handle: SessionHandle,
        retired: mpsc::UnboundedReceiver<Retirement>,
        workspace: PathBuf,
    }

    fn start(limits: SessionLimits) -> Harness {
        let root = TempDir::new().unwrap();
        let ctx = test_context(root.path());
        let id = SessionId::generate();
        let resources = SessionResources::prepare(&ctx, &id).unwrap();
        let workspace = resources.workspace.clone();
        let (tx, retired) = mpsc::unbounded_channel();
        let handle = spawn_session(id, resources, limits, ctx, tx);
        Harness {
            _root: root,
            handle,
            retired,
            workspace,
        }
    }

    async fn collect(mut stream: FrameStream) -> Vec<OutputFrame> {
        let mut frames = Vec::new();
        while let Ok(Some(frame)) = timeout(Duration::from_secs(10), stream.recv()).await {
            frames.push(frame);
        }
        frames
    }

    fn states(frames: &[OutputFrame]) -> Vec<(SessionState, StateReason)> {
        frames
            .iter()
            .filter_map(|f| match f.body {
                FrameBody::StateChange { state, reason } => Some((state, reason)),
                _ => None,
            })
            .collect()
    }

    fn stdout(frames: &[OutputFrame]) -> Vec<u8> {
        frames
            .iter()
            .filter_map(|f| match &f.body {
                FrameBody::Stdout(bytes) => Some(bytes.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    fn diagnostics(frames: &[OutputFrame]) -> Vec<String> {
        frames
            .iter()
            .filter_map(|f| match &f.body {
                FrameBody::Diagnostic(text) => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    async fn wait_for_state(handle: &SessionHandle, want: SessionState) {
        for _ in 0..200 {
            if handle.state() == want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("session never reached {want}, stuck at {}", handle.state());
    }

    #[tokio::test]
    async fn test_compile_run_exit() {
        let mut h = start(SessionLimits::default());
        let stream = h.handle.subscribe().await.unwrap();

        h.handle.compile(build_script("echo hello")).await.unwrap();
        wait_for_state(&h.handle, SessionState::Ready).await;
        h.handle.run().await.unwrap();

        let frames = collect(stream).await;
        assert_eq!(
            states(&frames),
            vec![
                (SessionState::Created, StateReason::Requested),
                (SessionState::Compiling, StateReason::Requested),
                (SessionState::Ready, StateReason::ProcessExited),
                (SessionState::Running, StateReason::Requested),
                (SessionState::Exited, StateReason::ProcessExited),
            ]
        );
        assert!(String::from_utf8_lossy(&stdout(&frames)).contains("hello"));

        let exit = frames
            .iter()
            .find_map(|f| match &f.body {
                FrameBody::ExitStatus(status) => Some(status.clone()),
                _ => None,
            })
            .unwrap();
        assert!(exit.success());

        // Sequence numbers are dense and ordered.
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.seq, i as u64);
        }

        let retirement = h.retired.recv().await.unwrap();
        assert_eq!(retirement.state, SessionState::Exited);
        assert!(!h.workspace.exists());
    }

    #[tokio::test]
    async fn test_compile_failure_reports_log() {
        let mut h = start(SessionLimits::default());
        let stream = h.handle.subscribe().await.unwrap();

        let submission = Submission::new(vec![SourceFile::new(
            "build.sh",
            "echo 'main.cpp:1: error: expected ;'\nexit 1\n",
        )]);
        h.handle.compile(submission).await.unwrap();

        let frames = collect(stream).await;
        assert!(diagnostics(&frames)
            .iter()
            .any(|d| d.contains("expected ;")));
        assert_eq!(
            states(&frames).last(),
            Some(&(SessionState::CompileFailed, StateReason::CompileError))
        );
        assert_eq!(h.retired.recv().await.unwrap().state, SessionState::CompileFailed);
    }

    #[tokio::test]
    async fn test_run_before_compile_is_rejected() {
        let h = start(SessionLimits::default());
        let err = h.handle.run().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        let err = h.handle.input(b"x".to_vec()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert_eq!(h.handle.state(), SessionState::Created);

        // Resize is fine before anything is attached.
        h.handle.resize(120, 40).await.unwrap();
        h.handle.close(StateReason::Requested).await;
    }

    #[tokio::test]
    async fn test_invalid_submission_leaves_state() {
        let h = start(SessionLimits::default());
        let submission = Submission::new(vec![SourceFile::new("../escape.sh", "true")]);
        let err = h.handle.compile(submission).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        let submission = build_script("true").with_flags(vec!["-o/etc/passwd".to_string()]);
        let err = h.handle.compile(submission).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        let escaped = h.workspace.parent().unwrap().join("escaped.d");
        let submission = build_script("true")
            .with_flags(vec!["-MD".to_string(), format!("-MF{}", escaped.display())]);
        let err = h.handle.compile(submission).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        assert!(!escaped.exists());

        assert_eq!(h.handle.state(), SessionState::Created);
        h.handle.close(StateReason::Requested).await;
    }

    #[tokio::test]
    async fn test_workspace_files_readable() {
        let h = start(SessionLimits::default());
        let script = build_script("echo hi");
        let expected = script.files[0].content.clone().into_bytes();

        h.handle.compile(script).await.unwrap();
        wait_for_state(&h.handle, SessionState::Ready).await;

        let entries = h.handle.list_files(None).await.unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.out", "build.sh"]);
        assert_eq!(h.handle.read_file("build.sh".to_string()).await.unwrap(), expected);

        let err = h.handle.read_file("../x".to_string()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
        // Rejected reads leave the session usable.
        assert_eq!(h.handle.state(), SessionState::Ready);
        h.handle.close(StateReason::Requested).await;

        let err = h.handle.list_files(None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_recompile_removes_previous_artifact() {
        let h = start(SessionLimits::default());
        let stream = h.handle.subscribe().await.unwrap();

        h.handle.compile(build_script("echo one")).await.unwrap();
        wait_for_state(&h.handle, SessionState::Ready).await;
        assert!(h.workspace.join("a.out").is_file());

        // This build writes no artifact, so the old one must not survive.
        let noop = Submission::new(vec![SourceFile::new("build.sh", "true\n")]);
        h.handle.compile(noop).await.unwrap();

        let frames = collect(stream).await;
        assert_eq!(
            states(&frames).last(),
            Some(&(SessionState::CompileFailed, StateReason::CompileError))
        );
        assert!(diagnostics(&frames)
            .iter()
            .any(|d| d.contains("produced no executable")));
    }

    #[tokio::test]
    async fn test_missing_compiler_is_spawn_failed() {
        let root = TempDir::new().unwrap();
        let mut config = DaemonConfig::default();
        config.workspace.root = root.path().to_path_buf();
        config.toolchain.compiler = "no-such-compiler-xyz".to_string();
        let ctx = Arc::new(SessionContext::from_config(&config));
        ctx.workspaces.ensure_root().unwrap();

        let id = SessionId::generate();
        let resources = SessionResources::prepare(&ctx, &id).unwrap();
        let (tx, _retired) = mpsc::unbounded_channel();
        let handle = spawn_session(id, resources, SessionLimits::default(), ctx, tx);
        let stream = handle.subscribe().await.unwrap();

        let submission = Submission::new(vec![SourceFile::new("main.cpp", "int main(){}")]);
        let err = handle.compile(submission).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SpawnFailed);

        let frames = collect(stream).await;
        assert_eq!(
            states(&frames).last(),
            Some(&(SessionState::CompileFailed, StateReason::SpawnFailed))
        );
    }

    #[tokio::test]
    async fn test_output_cap_truncates_once() {
        let limits = SessionLimits {
            max_output_bytes: 100,
            ..SessionLimits::default()
        };
        let h = start(limits);
        let stream = h.handle.subscribe().await.unwrap();

        h.handle
            .compile(build_script("i=0; while [ $i -lt 200 ]; do echo 0123456789; i=$((i+1)); done"))
            .await
            .unwrap();
        wait_for_state(&h.handle, SessionState::Ready).await;
        h.handle.run().await.unwrap();

        let frames = collect(stream).await;
        assert_eq!(stdout(&frames).len(), 100);
        let truncations = diagnostics(&frames)
            .iter()
            .filter(|d| d.contains("truncated"))
            .count();
        assert_eq!(truncations, 1);
        assert_eq!(
            states(&frames).last(),
            Some(&(SessionState::Exited, StateReason::ProcessExited))
        );
    }

    #[tokio::test]
    async fn test_input_reaches_program() {
        let h = start(SessionLimits::default());
        let stream = h.handle.subscribe().await.unwrap();

        h.handle
            .compile(build_script("read line; echo \"got:$line\""))
            .await
            .unwrap();
        wait_for_state(&h.handle, SessionState::Ready).await;
        h.handle.run().await.unwrap();
        h.handle.input(b"ping\n".to_vec()).await.unwrap();

        let frames = collect(stream).await;
        assert!(String::from_utf8_lossy(&stdout(&frames)).contains("got:ping"));
    }

    #[tokio::test]
    async fn test_debug_replaces_running_program() {
        let h = start(SessionLimits::default());
        h.handle
            .compile(build_script("echo started; sleep 30"))
            .await
            .unwrap();
        wait_for_state(&h.handle, SessionState::Ready).await;
        h.handle.run().await.unwrap();
        let running_pid = h.handle.snapshot().await.unwrap().active_pid.unwrap();

        h.handle.debug().await.unwrap();
        let view = h.handle.snapshot().await.unwrap();
        assert_eq!(view.state, SessionState::Debugging);
        assert_ne!(view.active_pid, Some(running_pid));
        assert!(crate::supervisor::group_members(running_pid as i32).is_empty());

        h.handle.close(StateReason::Requested).await;
        assert_eq!(h.handle.wait_terminal().await, SessionState::Closed);
    }

    #[tokio::test]
    async fn test_close_kills_tree_and_removes_workspace() {
        let h = start(SessionLimits::default());
        h.handle
            .compile(build_script("sleep 60 & sleep 60 & wait"))
            .await
            .unwrap();
        wait_for_state(&h.handle, SessionState::Ready).await;
        h.handle.run().await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let pid = h.handle.snapshot().await.unwrap().active_pid.unwrap();
        assert!(!crate::supervisor::group_members(pid as i32).is_empty());

        let stream = h.handle.subscribe().await.unwrap();
        h.handle.close(StateReason::Requested).await;

        assert!(crate::supervisor::group_members(pid as i32).is_empty());
        assert!(!h.workspace.exists());

        // The late subscriber got the backlog, then exactly one final state.
        let frames = collect(stream).await;
        let terminal: Vec<_> = states(&frames)
            .into_iter()
            .filter(|(state, _)| state.is_terminal())
            .collect();
        assert_eq!(terminal, vec![(SessionState::Closed, StateReason::Requested)]);

        // Closing again is harmless; everything else reports the session gone.
        h.handle.close(StateReason::Requested).await;
        let err = h.handle.subscribe().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_idle_timeout_closes() {
        let limits = SessionLimits {
            idle_timeout: Duration::from_millis(300),
            ..SessionLimits::default()
        };
        let mut h = start(limits);
        let retirement = timeout(Duration::from_secs(3), h.retired.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(retirement.state, SessionState::Closed);
        assert_eq!(retirement.reason, StateReason::Timeout);
        assert!(!h.workspace.exists());
    }

    #[tokio::test]
    async fn test_wall_clock_limit_reported() {
        let limits = SessionLimits {
            wall_clock_timeout: Duration::from_millis(1500),
            ..SessionLimits::default()
        };
        let h = start(limits);
        let stream = h.handle.subscribe().await.unwrap();
        h.handle.compile(build_script("sleep 30")).await.unwrap();
        wait_for_state(&h.handle, SessionState::Ready).await;
        h.handle.run().await.unwrap();

        let frames = collect(stream).await;
        assert!(diagnostics(&frames)
            .iter()
            .any(|d| d.contains("wall-clock limit")));
        assert_eq!(
            states(&frames).last(),
            Some(&(SessionState::Exited, StateReason::TimeLimit))
        );
    }
}
