//! End-to-end tests against the real C++ toolchain.
//!
//! Each test returns early when `g++` (or `gdb`) is not installed, so the
//! suite stays green on machines without a compiler.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::process::{Command, Stdio};
use std::time::Duration;

use runcell_core::{FrameBody, OutputFrame, SessionState, SourceFile, StateReason, Submission};
use runcelld::config::DaemonConfig;
use runcelld::orchestrator::{spawn_orchestrator, OrchestratorHandle, SessionRequest};
use runcelld::session::FrameStream;
use tempfile::TempDir;
use tokio::time::{timeout_at, Instant};

const WAIT_TIMEOUT: Duration = Duration::from_secs(30);

const HELLO: &str = r#"#include <iostream>
#include <string>

int main() {
    std::string name;
    std::cout << "name? " << std::flush;
    std::getline(std::cin, name);
    std::cout << "hello, " << name << std::endl;
    return 3;
}
"#;

fn installed(tool: &str) -> bool {
    Command::new(tool)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn spawn(root: &TempDir) -> OrchestratorHandle {
    let mut config = DaemonConfig::default();
    config.workspace.root = root.path().to_path_buf();
    config.terminal.term = "dumb".to_string();
    let handle = spawn_orchestrator(&config);
    handle.context().workspaces.ensure_root().unwrap();
    handle
}

async fn read_until(
    stream: &mut FrameStream,
    pred: impl Fn(&OutputFrame) -> bool,
) -> Vec<OutputFrame> {
    let mut frames = Vec::new();
    let deadline = Instant::now() + WAIT_TIMEOUT;
    loop {
        let frame = timeout_at(deadline, stream.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended early");
        let hit = pred(&frame);
        frames.push(frame);
        if hit {
            return frames;
        }
    }
}

fn is_state(frame: &OutputFrame, want: SessionState) -> bool {
    matches!(frame.body, FrameBody::StateChange { state, .. } if state == want)
}

fn text(frames: &[OutputFrame]) -> String {
    let bytes: Vec<u8> = frames
        .iter()
        .filter_map(|f| match &f.body {
            FrameBody::Stdout(data) => Some(data.clone()),
            FrameBody::Diagnostic(text) => Some(text.clone().into_bytes()),
            _ => None,
        })
        .flatten()
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

#[tokio::test]
async fn test_cpp_compile_run_with_input() {
    if !installed("g++") {
        eprintln!("g++ not installed, skipping");
        return;
    }
    let root = TempDir::new().unwrap();
    let orchestrator = spawn(&root);
    let id = orchestrator.open_session().await.unwrap();
    let mut stream = orchestrator.subscribe(&id).await.unwrap();

    let submission = Submission::new(vec![SourceFile::new("main.cpp", HELLO)])
        .with_flags(vec!["-O0".to_string(), "-Wall".to_string()]);
    orchestrator
        .dispatch(&id, SessionRequest::Compile(submission))
        .await
        .unwrap();
    read_until(&mut stream, |f| is_state(f, SessionState::Ready)).await;

    orchestrator.dispatch(&id, SessionRequest::Run).await.unwrap();
    read_until(&mut stream, |f| {
        f.bytes().is_some_and(|b| String::from_utf8_lossy(b).contains("name?"))
    })
    .await;
    orchestrator
        .dispatch(&id, SessionRequest::Input(b"runcell\n".to_vec()))
        .await
        .unwrap();

    let frames = read_until(&mut stream, OutputFrame::is_terminal).await;
    assert!(text(&frames).contains("hello, runcell"));
    assert!(frames
        .iter()
        .any(|f| matches!(&f.body, FrameBody::ExitStatus(s) if s.code == Some(3))));
    assert!(matches!(
        frames.last().map(|f| &f.body),
        Some(FrameBody::StateChange {
            state: SessionState::Exited,
            reason: StateReason::ProcessExited
        })
    ));
}

#[tokio::test]
async fn test_cpp_compile_error_then_retry() {
    if !installed("g++") {
        eprintln!("g++ not installed, skipping");
        return;
    }
    let root = TempDir::new().unwrap();
    let orchestrator = spawn(&root);
    let id = orchestrator.open_session().await.unwrap();
    let mut stream = orchestrator.subscribe(&id).await.unwrap();

    let broken = Submission::new(vec![SourceFile::new(
        "main.cpp",
        "int main() { return undeclared_thing; }\n",
    )]);
    orchestrator
        .dispatch(&id, SessionRequest::Compile(broken))
        .await
        .unwrap();
    let frames = read_until(&mut stream, OutputFrame::is_terminal).await;

    assert!(text(&frames).contains("undeclared_thing"));
    assert!(matches!(
        frames.last().map(|f| &f.body),
        Some(FrameBody::StateChange {
            state: SessionState::CompileFailed,
            reason: StateReason::CompileError
        })
    ));
    assert_eq!(orchestrator.context().workspaces.count(), 0);
}

#[tokio::test]
async fn test_gdb_session_quits_cleanly() {
    if !installed("g++") || !installed("gdb") {
        eprintln!("g++ or gdb not installed, skipping");
        return;
    }
    let root = TempDir::new().unwrap();
    let orchestrator = spawn(&root);
    let id = orchestrator.open_session().await.unwrap();
    let mut stream = orchestrator.subscribe(&id).await.unwrap();

    let submission = Submission::new(vec![SourceFile::new("main.cpp", HELLO)]);
    orchestrator
        .dispatch(&id, SessionRequest::Compile(submission))
        .await
        .unwrap();
    read_until(&mut stream, |f| is_state(f, SessionState::Ready)).await;

    orchestrator.dispatch(&id, SessionRequest::Debug).await.unwrap();
    read_until(&mut stream, |f| is_state(f, SessionState::Debugging)).await;
    read_until(&mut stream, |f| {
        f.bytes().is_some_and(|b| String::from_utf8_lossy(b).contains("(gdb)"))
    })
    .await;

    orchestrator
        .dispatch(&id, SessionRequest::Input(b"quit\n".to_vec()))
        .await
        .unwrap();
    let frames = read_until(&mut stream, OutputFrame::is_terminal).await;
    assert!(matches!(
        frames.last().map(|f| &f.body),
        Some(FrameBody::StateChange {
            state: SessionState::Exited,
            ..
        })
    ));
}
