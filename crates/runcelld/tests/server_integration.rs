//! Integration tests for the Unix socket server.
//!
//! These run a real `DaemonServer` on a temporary socket and talk to it with
//! raw newline-delimited JSON, the way any client would.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::Duration;

use runcell_core::{
    ErrorKind, FileKind, FrameBody, OutputKind, SessionId, SessionState, SourceFile, StateReason,
    Submission,
};
use runcell_protocol::{ClientMessage, DaemonMessage, MessageType, ProtocolVersion};
use runcelld::config::{DaemonConfig, ToolchainConfig};
use runcelld::orchestrator::{spawn_orchestrator, OrchestratorHandle};
use runcelld::server::DaemonServer;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

// ============================================================================
// Constants
// ============================================================================

/// Maximum time to wait for server socket to appear
const SOCKET_WAIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Interval between socket existence checks
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Upper bound on waiting for any single reply
const RECV_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Test Helpers
// ============================================================================

/// Test server context that manages server lifecycle and cleanup.
struct TestServer {
    socket_path: PathBuf,
    orchestrator: OrchestratorHandle,
    cancel_token: CancellationToken,
    _temp_dir: TempDir,
}

impl TestServer {
    async fn spawn() -> Self {
        Self::spawn_with(|_| {}).await
    }

    async fn spawn_with(adjust: impl FnOnce(&mut DaemonConfig)) -> Self {
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        let socket_path = temp_dir.path().join("test.sock");

        let mut config = DaemonConfig::default();
        config.server.socket_path = socket_path.clone();
        config.workspace.root = temp_dir.path().join("workspaces");
        config.terminal.term = "dumb".to_string();
        config.supervisor.kill_grace_ms = 200;
        config.toolchain = ToolchainConfig {
            compiler: "sh".to_string(),
            default_flags: Vec::new(),
            source_extensions: vec!["sh".to_string()],
            debugger: "sh".to_string(),
            debugger_args: Vec::new(),
            ..ToolchainConfig::default()
        };
        adjust(&mut config);

        let orchestrator = spawn_orchestrator(&config);
        orchestrator
            .context()
            .workspaces
            .ensure_root()
            .expect("workspace root");
        let cancel_token = CancellationToken::new();
        let server = DaemonServer::new(&config.server, orchestrator.clone(), cancel_token.clone());

        tokio::spawn(async move {
            let _ = server.run().await;
        });

        let start = Instant::now();
        while start.elapsed() < SOCKET_WAIT_TIMEOUT {
            if socket_path.exists() {
                break;
            }
            sleep(SOCKET_POLL_INTERVAL).await;
        }
        assert!(
            socket_path.exists(),
            "Server socket did not appear within {SOCKET_WAIT_TIMEOUT:?}"
        );

        Self {
            socket_path,
            orchestrator,
            cancel_token,
            _temp_dir: temp_dir,
        }
    }

    async fn connect(&self) -> TestClient {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .expect("connect to server");
        TestClient::new(stream)
    }

    /// Connects and completes the handshake.
    async fn connect_ready(&self) -> TestClient {
        let mut client = self.connect().await;
        client.send(ClientMessage::connect(None)).await;
        match client.recv().await {
            DaemonMessage::Connected { .. } => client,
            other => panic!("Expected Connected, got {other:?}"),
        }
    }

    async fn wait_for_live(&self, want: usize) {
        let deadline = Instant::now() + RECV_TIMEOUT;
        while Instant::now() < deadline {
            if self.orchestrator.stats().await.unwrap().live == want {
                return;
            }
            sleep(SOCKET_POLL_INTERVAL).await;
        }
        panic!("live session count never reached {want}");
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// Test client connection with protocol helpers.
struct TestClient {
    reader: BufReader<tokio::net::unix::OwnedReadHalf>,
    writer: tokio::net::unix::OwnedWriteHalf,
    /// Messages read past while waiting for a specific reply.
    pending: VecDeque<DaemonMessage>,
}

impl TestClient {
    fn new(stream: UnixStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
            pending: VecDeque::new(),
        }
    }

    async fn send(&mut self, msg: ClientMessage) {
        let json = serde_json::to_string(&msg).unwrap();
        self.send_raw(&json).await;
    }

    async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn recv(&mut self) -> DaemonMessage {
        if let Some(msg) = self.pending.pop_front() {
            return msg;
        }
        self.recv_wire().await
    }

    async fn recv_wire(&mut self) -> DaemonMessage {
        let mut line = String::new();
        let n = timeout(RECV_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for daemon message")
            .unwrap();
        assert!(n > 0, "daemon closed the connection");
        serde_json::from_str(&line).unwrap()
    }

    /// Reads messages until one satisfies `pred`, returning everything read.
    async fn recv_until(&mut self, pred: impl Fn(&DaemonMessage) -> bool) -> Vec<DaemonMessage> {
        let mut seen = Vec::new();
        loop {
            let msg = self.recv().await;
            let hit = pred(&msg);
            seen.push(msg);
            if hit {
                return seen;
            }
        }
    }

    /// Opens a session. Events for other sessions that arrive first stay
    /// queued for later `recv` calls.
    async fn open_session(&mut self) -> SessionId {
        self.send(ClientMessage::open_session()).await;
        loop {
            match self.recv_wire().await {
                DaemonMessage::SessionOpened { session_id } => return session_id,
                DaemonMessage::Error { kind, message, .. } => {
                    panic!("open_session failed: {kind}: {message}")
                }
                other => self.pending.push_back(other),
            }
        }
    }

    /// True once the server has closed its end.
    async fn at_eof(&mut self) -> bool {
        let mut line = String::new();
        matches!(
            timeout(RECV_TIMEOUT, self.reader.read_line(&mut line)).await,
            Ok(Ok(0))
        )
    }
}

fn build_script(program: &str) -> Submission {
    let script = format!("cat > \"$2\" <<'EOF'\n#!/bin/sh\n{program}\nEOF\nchmod +x \"$2\"\n");
    Submission::new(vec![SourceFile::new("build.sh", script)])
}

fn reached(msg: &DaemonMessage, want: SessionState) -> bool {
    matches!(msg, DaemonMessage::StateChanged { state, .. } if *state == want)
}

fn stdout_text(messages: &[DaemonMessage]) -> String {
    let bytes: Vec<u8> = messages
        .iter()
        .filter_map(|m| match m {
            DaemonMessage::Output {
                kind: OutputKind::Stdout,
                data,
                ..
            } => Some(data.clone()),
            _ => None,
        })
        .flatten()
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

// ============================================================================
// Handshake
// ============================================================================

#[tokio::test]
async fn test_handshake_assigns_client_id() {
    let server = TestServer::spawn().await;

    let mut client = server.connect().await;
    client
        .send(ClientMessage::connect(Some("tester".to_string())))
        .await;
    match client.recv().await {
        DaemonMessage::Connected {
            client_id,
            protocol_version,
        } => {
            assert_eq!(client_id, "tester");
            assert_eq!(protocol_version, ProtocolVersion::CURRENT);
        }
        other => panic!("Expected Connected, got {other:?}"),
    }

    let mut anonymous = server.connect().await;
    anonymous.send(ClientMessage::connect(None)).await;
    match anonymous.recv().await {
        DaemonMessage::Connected { client_id, .. } => assert!(client_id.starts_with("client-")),
        other => panic!("Expected Connected, got {other:?}"),
    }
}

#[tokio::test]
async fn test_incompatible_version_is_rejected() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    let mut msg = ClientMessage::connect(None);
    msg.protocol_version = ProtocolVersion::new(99, 0);
    client.send(msg).await;

    match client.recv().await {
        DaemonMessage::Rejected {
            protocol_version, ..
        } => assert_eq!(protocol_version, ProtocolVersion::CURRENT),
        other => panic!("Expected Rejected, got {other:?}"),
    }
    assert!(client.at_eof().await);
}

#[tokio::test]
async fn test_first_message_must_be_connect() {
    let server = TestServer::spawn().await;
    let mut client = server.connect().await;

    client.send(ClientMessage::ping(1)).await;
    match client.recv().await {
        DaemonMessage::Error { kind, .. } => assert_eq!(kind, ErrorKind::InvalidInput),
        other => panic!("Expected Error, got {other:?}"),
    }
    assert!(client.at_eof().await);
}

#[tokio::test]
async fn test_too_many_clients_rejected() {
    let server = TestServer::spawn_with(|c| c.server.max_clients = 1).await;
    let _first = server.connect_ready().await;

    let mut second = server.connect().await;
    match second.recv().await {
        DaemonMessage::Rejected { reason, .. } => assert!(reason.contains("Too many clients")),
        other => panic!("Expected Rejected, got {other:?}"),
    }
}

// ============================================================================
// Messages
// ============================================================================

#[tokio::test]
async fn test_ping_pong() {
    let server = TestServer::spawn().await;
    let mut client = server.connect_ready().await;

    for seq in [1, 2, 42] {
        client.send(ClientMessage::ping(seq)).await;
        assert_eq!(client.recv().await, DaemonMessage::Pong { seq });
    }
}

#[tokio::test]
async fn test_malformed_line_does_not_end_connection() {
    let server = TestServer::spawn().await;
    let mut client = server.connect_ready().await;

    client.send_raw("{ this is not json").await;
    match client.recv().await {
        DaemonMessage::Error {
            kind, session_id, ..
        } => {
            assert_eq!(kind, ErrorKind::InvalidInput);
            assert!(session_id.is_none());
        }
        other => panic!("Expected Error, got {other:?}"),
    }

    client.send(ClientMessage::ping(7)).await;
    assert_eq!(client.recv().await, DaemonMessage::Pong { seq: 7 });
}

#[tokio::test]
async fn test_compile_run_events_over_socket() {
    let server = TestServer::spawn().await;
    let mut client = server.connect_ready().await;

    let id = client.open_session().await;
    client
        .send(ClientMessage::compile(
            id.clone(),
            build_script("read name\necho hi-$name"),
        ))
        .await;
    client
        .recv_until(|m| reached(m, SessionState::Ready))
        .await;

    client.send(ClientMessage::run(id.clone())).await;
    client
        .recv_until(|m| reached(m, SessionState::Running))
        .await;
    client
        .send(ClientMessage::input(id.clone(), b"socket\n".to_vec()))
        .await;

    let events = client.recv_until(|m| m.is_terminal_state()).await;
    assert!(stdout_text(&events).contains("hi-socket"));
    assert!(events.iter().any(|m| matches!(
        m,
        DaemonMessage::Output { exit_status: Some(status), .. } if status.success()
    )));
    assert!(events.iter().all(|m| match m {
        DaemonMessage::Output { session_id, .. } | DaemonMessage::StateChanged { session_id, .. } =>
            *session_id == id,
        _ => true,
    }));
}

#[tokio::test]
async fn test_session_events_start_with_created() {
    let server = TestServer::spawn().await;
    let mut client = server.connect_ready().await;

    let id = client.open_session().await;
    match client.recv().await {
        DaemonMessage::StateChanged {
            session_id, state, ..
        } => {
            assert_eq!(session_id, id);
            assert_eq!(state, SessionState::Created);
        }
        other => panic!("Expected StateChanged, got {other:?}"),
    }
}

#[tokio::test]
async fn test_invalid_command_reports_error() {
    let server = TestServer::spawn().await;
    let mut client = server.connect_ready().await;
    let id = client.open_session().await;

    client.send(ClientMessage::run(id.clone())).await;
    let seen = client
        .recv_until(|m| matches!(m, DaemonMessage::Error { .. }))
        .await;
    match seen.last() {
        Some(DaemonMessage::Error {
            session_id, kind, ..
        }) => {
            assert_eq!(session_id.as_ref(), Some(&id));
            assert_eq!(*kind, ErrorKind::InvalidInput);
        }
        other => panic!("Expected Error, got {other:?}"),
    }

    client.send(ClientMessage::ping(3)).await;
    client
        .recv_until(|m| matches!(m, DaemonMessage::Pong { seq: 3 }))
        .await;
}

#[tokio::test]
async fn test_list_sessions_only_shows_own() {
    let server = TestServer::spawn().await;
    let mut alice = server.connect_ready().await;
    let mut bob = server.connect_ready().await;

    let a1 = alice.open_session().await;
    let a2 = alice.open_session().await;
    let b1 = bob.open_session().await;

    alice.send(ClientMessage::list_sessions()).await;
    let seen = alice
        .recv_until(|m| matches!(m, DaemonMessage::SessionList { .. }))
        .await;
    let Some(DaemonMessage::SessionList { sessions }) = seen.last() else {
        panic!("Expected SessionList");
    };
    let ids: Vec<&SessionId> = sessions.iter().map(|v| &v.id).collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&&a1));
    assert!(ids.contains(&&a2));
    assert!(!ids.contains(&&b1));
}

#[tokio::test]
async fn test_other_connections_sessions_are_not_found() {
    let server = TestServer::spawn().await;
    let mut alice = server.connect_ready().await;
    let mut mallory = server.connect_ready().await;

    let id = alice.open_session().await;

    for msg in [
        ClientMessage::run(id.clone()),
        ClientMessage::input(id.clone(), b"x".to_vec()),
        ClientMessage::close(id.clone()),
    ] {
        mallory.send(msg).await;
        match mallory.recv().await {
            DaemonMessage::Error { kind, .. } => assert_eq!(kind, ErrorKind::NotFound),
            other => panic!("Expected Error, got {other:?}"),
        }
    }

    // Alice's session is untouched.
    assert_eq!(server.orchestrator.stats().await.unwrap().live, 1);
}

#[tokio::test]
async fn test_close_then_command_is_not_found() {
    let server = TestServer::spawn().await;
    let mut client = server.connect_ready().await;
    let id = client.open_session().await;

    client.send(ClientMessage::close(id.clone())).await;
    let events = client.recv_until(|m| m.is_terminal_state()).await;
    assert!(matches!(
        events.last(),
        Some(DaemonMessage::StateChanged {
            state: SessionState::Closed,
            ..
        })
    ));

    client.send(ClientMessage::run(id.clone())).await;
    match client.recv().await {
        DaemonMessage::Error { kind, .. } => assert_eq!(kind, ErrorKind::NotFound),
        other => panic!("Expected Error, got {other:?}"),
    }

    // Closing again is not an error; the next reply is the pong.
    client.send(ClientMessage::close(id)).await;
    client.send(ClientMessage::ping(9)).await;
    assert_eq!(client.recv().await, DaemonMessage::Pong { seq: 9 });
}

#[tokio::test]
async fn test_slow_close_does_not_stall_other_sessions() {
    let server = TestServer::spawn_with(|c| c.supervisor.kill_grace_ms = 3000).await;
    let mut client = server.connect_ready().await;

    let slow = client.open_session().await;
    client
        .send(ClientMessage::compile(
            slow.clone(),
            build_script("trap '' TERM HUP\necho armed\nsleep 1000"),
        ))
        .await;
    client
        .recv_until(|m| reached(m, SessionState::Ready))
        .await;
    client.send(ClientMessage::run(slow.clone())).await;
    let mut seen = Vec::new();
    while !stdout_text(&seen).contains("armed") {
        seen.push(client.recv().await);
    }

    let other = client.open_session().await;
    let started = Instant::now();
    client.send(ClientMessage::close(slow.clone())).await;
    client.send(ClientMessage::list_files(other.clone(), None)).await;
    client.send(ClientMessage::ping(11)).await;

    let seen = client
        .recv_until(|m| matches!(m, DaemonMessage::FileList { .. }))
        .await;
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "listing waited {:?} behind the close",
        started.elapsed()
    );
    assert!(
        !seen.iter().any(DaemonMessage::is_terminal_state),
        "close finished before the other session was served"
    );

    // The slow session still ends once its process is killed.
    let rest = client
        .recv_until(|m| {
            matches!(m, DaemonMessage::StateChanged { session_id, state, .. }
                if *session_id == slow && state.is_terminal())
        })
        .await;
    assert!(seen
        .iter()
        .chain(rest.iter())
        .any(|m| matches!(m, DaemonMessage::Pong { seq: 11 })));
}

#[tokio::test]
async fn test_workspace_files_over_socket() {
    let server = TestServer::spawn().await;
    let mut client = server.connect_ready().await;
    let id = client.open_session().await;

    client
        .send(ClientMessage::compile(
            id.clone(),
            build_script("printf 'from the program' > note.txt\necho done\nsleep 1000"),
        ))
        .await;
    client
        .recv_until(|m| reached(m, SessionState::Ready))
        .await;
    client.send(ClientMessage::run(id.clone())).await;
    let mut seen = Vec::new();
    while !stdout_text(&seen).contains("done") {
        seen.push(client.recv().await);
    }

    client.send(ClientMessage::list_files(id.clone(), None)).await;
    let seen = client
        .recv_until(|m| matches!(m, DaemonMessage::FileList { .. }))
        .await;
    let Some(DaemonMessage::FileList {
        session_id,
        dir,
        entries,
    }) = seen.last()
    else {
        panic!("Expected FileList");
    };
    assert_eq!(session_id, &id);
    assert!(dir.is_none());
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["a.out", "build.sh", "note.txt"]);
    assert!(entries.iter().all(|e| e.kind == FileKind::File));

    client
        .send(ClientMessage::read_file(id.clone(), "note.txt"))
        .await;
    let seen = client
        .recv_until(|m| matches!(m, DaemonMessage::FileContent { .. }))
        .await;
    match seen.last() {
        Some(DaemonMessage::FileContent { path, data, .. }) => {
            assert_eq!(path, "note.txt");
            assert_eq!(data, b"from the program");
        }
        other => panic!("Expected FileContent, got {other:?}"),
    }

    client
        .send(ClientMessage::read_file(id.clone(), "/etc/passwd"))
        .await;
    let seen = client
        .recv_until(|m| matches!(m, DaemonMessage::Error { .. }))
        .await;
    match seen.last() {
        Some(DaemonMessage::Error {
            session_id, kind, ..
        }) => {
            assert_eq!(session_id.as_ref(), Some(&id));
            assert_eq!(*kind, ErrorKind::InvalidInput);
        }
        other => panic!("Expected Error, got {other:?}"),
    }
}

// ============================================================================
// Disconnect
// ============================================================================

#[tokio::test]
async fn test_disconnect_closes_owned_sessions() {
    let server = TestServer::spawn().await;
    let mut client = server.connect_ready().await;

    client.open_session().await;
    client.open_session().await;
    server.wait_for_live(2).await;

    client.send(ClientMessage::new(MessageType::Disconnect)).await;
    server.wait_for_live(0).await;
    assert_eq!(server.orchestrator.context().workspaces.count(), 0);
}

#[tokio::test]
async fn test_dropped_connection_closes_owned_sessions() {
    let server = TestServer::spawn().await;
    let mut client = server.connect_ready().await;

    let id = client.open_session().await;
    client
        .send(ClientMessage::compile(id.clone(), build_script("sleep 1000")))
        .await;
    client
        .recv_until(|m| reached(m, SessionState::Ready))
        .await;
    client.send(ClientMessage::run(id.clone())).await;
    client
        .recv_until(|m| reached(m, SessionState::Running))
        .await;

    // Take over the frame stream to watch the session end.
    let mut frames = server.orchestrator.subscribe(&id).await.unwrap();
    drop(client);

    let mut last_state = None;
    while let Ok(Some(frame)) = timeout(RECV_TIMEOUT, frames.recv()).await {
        if let FrameBody::StateChange { state, reason } = frame.body {
            last_state = Some((state, reason));
        }
        if frame.is_terminal() {
            break;
        }
    }
    assert_eq!(
        last_state,
        Some((SessionState::Closed, StateReason::Disconnected))
    );

    server.wait_for_live(0).await;
    assert_eq!(server.orchestrator.context().workspaces.count(), 0);
}

#[tokio::test]
async fn test_socket_removed_on_shutdown() {
    let server = TestServer::spawn().await;
    let path = server.socket_path.clone();
    assert!(path.exists());

    server.cancel_token.cancel();
    let deadline = Instant::now() + SOCKET_WAIT_TIMEOUT;
    while path.exists() && Instant::now() < deadline {
        sleep(SOCKET_POLL_INTERVAL).await;
    }
    assert!(!path.exists());
}
