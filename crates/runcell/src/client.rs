//! Daemon connection client.
//!
//! This module provides the `DaemonClient` which handles:
//! - Connection to the daemon via Unix socket, retrying with exponential backoff
//! - The `connect`/`connected` handshake and version check
//! - Request helpers that read events until the daemon has answered
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use std::collections::VecDeque;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use runcell_core::{FileEntry, SessionId, SessionState, SessionView, Submission};
use runcell_protocol::{decode_line, encode_line, ClientMessage, DaemonMessage, ProtocolVersion};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::error::{ClientError, Result};

/// Socket the daemon listens on unless configured otherwise.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/runcell.sock";

/// Environment variable overriding the socket path.
pub const ENV_SOCKET: &str = "RUNCELL_SOCKET";

// ============================================================================
// Configuration
// ============================================================================

/// Connection behavior for [`DaemonClient`].
///
/// # Example
///
/// ```rust
/// use runcell_client::ClientConfig;
/// use std::time::Duration;
///
/// let config = ClientConfig {
///     socket_path: std::path::PathBuf::from("/tmp/my-runcell.sock"),
///     connect_timeout: Duration::from_secs(1),
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub socket_path: PathBuf,

    /// Sent in the handshake; the daemon assigns one when absent.
    pub client_id: Option<String>,

    /// Give up connecting after this long.
    pub connect_timeout: Duration,

    pub retry_initial_delay: Duration,
    pub retry_max_delay: Duration,

    /// Multiplier for exponential backoff (e.g., 2.0 doubles delay each retry).
    pub retry_multiplier: f64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socket_path: env::var_os(ENV_SOCKET)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH)),
            client_id: None,
            connect_timeout: Duration::from_secs(3),
            retry_initial_delay: Duration::from_millis(50),
            retry_max_delay: Duration::from_millis(800),
            retry_multiplier: 2.0,
        }
    }
}

impl ClientConfig {
    /// Delay after `delay` under exponential backoff, capped at `retry_max_delay`.
    fn next_delay(&self, delay: Duration) -> Duration {
        let next_ms = (delay.as_millis() as f64 * self.retry_multiplier) as u64;
        Duration::from_millis(next_ms).min(self.retry_max_delay)
    }
}

// ============================================================================
// Connection halves
// ============================================================================

/// Read half of a daemon connection.
pub struct EventReader {
    reader: BufReader<OwnedReadHalf>,
    line: String,
}

impl EventReader {
    fn new(reader: OwnedReadHalf) -> Self {
        Self {
            reader: BufReader::new(reader),
            line: String::new(),
        }
    }

    /// Reads the next daemon message.
    ///
    /// Returns `Ok(None)` once the daemon closes the connection.
    pub async fn next(&mut self) -> Result<Option<DaemonMessage>> {
        self.line.clear();
        if self.reader.read_line(&mut self.line).await? == 0 {
            return Ok(None);
        }
        Ok(Some(decode_line(&self.line)?))
    }
}

/// Write half of a daemon connection.
pub struct CommandWriter {
    writer: OwnedWriteHalf,
}

impl CommandWriter {
    /// Sends one message as a JSON line.
    pub async fn send(&mut self, message: &ClientMessage) -> Result<()> {
        let line = encode_line(message)?;
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        debug!(message_type = ?message.message, "Sent message to daemon");
        Ok(())
    }

    pub async fn input(&mut self, session_id: &SessionId, data: Vec<u8>) -> Result<()> {
        self.send(&ClientMessage::input(session_id.clone(), data))
            .await
    }

    pub async fn resize(&mut self, session_id: &SessionId, cols: u16, rows: u16) -> Result<()> {
        self.send(&ClientMessage::resize(session_id.clone(), cols, rows))
            .await
    }

    pub async fn close(&mut self, session_id: &SessionId) -> Result<()> {
        self.send(&ClientMessage::close(session_id.clone())).await
    }
}

// ============================================================================
// Daemon Client
// ============================================================================

/// A connected, handshaken client.
///
/// Request helpers read events until the daemon answers. Events that arrive
/// in the meantime for other purposes are kept and handed out by
/// [`DaemonClient::recv`] in order.
pub struct DaemonClient {
    events: EventReader,
    commands: CommandWriter,
    client_id: String,
    pending: VecDeque<DaemonMessage>,
}

impl DaemonClient {
    /// Connects to the daemon and performs the handshake.
    ///
    /// # Errors
    ///
    /// - `ClientError::DaemonConnection` if the socket cannot be reached
    ///   within `connect_timeout`
    /// - `ClientError::VersionMismatch` or `ClientError::Rejected` if the
    ///   daemon refuses the connection
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        let stream = connect_with_retry(config).await?;
        let (reader, writer) = stream.into_split();
        let mut client = Self {
            events: EventReader::new(reader),
            commands: CommandWriter { writer },
            client_id: String::new(),
            pending: VecDeque::new(),
        };
        client.handshake(config.client_id.clone()).await?;
        Ok(client)
    }

    async fn handshake(&mut self, client_id: Option<String>) -> Result<()> {
        self.commands.send(&ClientMessage::connect(client_id)).await?;

        match self.events.next().await? {
            Some(DaemonMessage::Connected {
                protocol_version,
                client_id,
            }) => {
                if !ProtocolVersion::CURRENT.is_compatible_with(&protocol_version) {
                    return Err(ClientError::VersionMismatch {
                        client_version: ProtocolVersion::CURRENT.to_string(),
                        daemon_version: protocol_version.to_string(),
                    });
                }
                info!(client_id, protocol_version = %protocol_version, "Handshake complete");
                self.client_id = client_id;
                Ok(())
            }
            Some(DaemonMessage::Rejected {
                reason,
                protocol_version,
            }) => {
                if ProtocolVersion::CURRENT.is_compatible_with(&protocol_version) {
                    Err(ClientError::Rejected(reason))
                } else {
                    Err(ClientError::VersionMismatch {
                        client_version: ProtocolVersion::CURRENT.to_string(),
                        daemon_version: protocol_version.to_string(),
                    })
                }
            }
            Some(other) => Err(ClientError::Protocol(format!(
                "Unexpected response to connect: {other:?}"
            ))),
            None => Err(ClientError::Disconnected),
        }
    }

    /// Id the daemon assigned to this connection.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub async fn send(&mut self, message: &ClientMessage) -> Result<()> {
        self.commands.send(message).await
    }

    /// Next daemon message, including any held back by request helpers.
    pub async fn recv(&mut self) -> Result<DaemonMessage> {
        if let Some(message) = self.pending.pop_front() {
            return Ok(message);
        }
        self.events.next().await?.ok_or(ClientError::Disconnected)
    }

    /// Allocates a session owned by this connection.
    pub async fn open_session(&mut self) -> Result<SessionId> {
        self.send(&ClientMessage::open_session()).await?;
        loop {
            match self.read_direct().await? {
                DaemonMessage::SessionOpened { session_id } => {
                    debug!(%session_id, "Session opened");
                    return Ok(session_id);
                }
                DaemonMessage::Error {
                    session_id: None,
                    kind,
                    message,
                } => return Err(ClientError::Daemon { kind, message }),
                other => self.pending.push_back(other),
            }
        }
    }

    /// Compiles a submission and waits for the outcome.
    ///
    /// `on_event` sees every event for the session while waiting, including
    /// compiler diagnostics. Returns `Ready` on success, or the terminal
    /// state the session ended in.
    pub async fn compile(
        &mut self,
        session_id: &SessionId,
        submission: Submission,
        mut on_event: impl FnMut(&DaemonMessage),
    ) -> Result<SessionState> {
        self.send(&ClientMessage::compile(session_id.clone(), submission))
            .await?;
        loop {
            let message = self.recv().await?;
            if let DaemonMessage::Error {
                session_id: Some(id),
                kind,
                message,
            } = &message
            {
                if id == session_id {
                    return Err(ClientError::Daemon {
                        kind: *kind,
                        message: message.clone(),
                    });
                }
            }
            on_event(&message);
            if let DaemonMessage::StateChanged {
                session_id: id,
                state,
                ..
            } = &message
            {
                if id == session_id && (*state == SessionState::Ready || state.is_terminal()) {
                    return Ok(*state);
                }
            }
        }
    }

    /// Sessions owned by this connection.
    pub async fn list_sessions(&mut self) -> Result<Vec<SessionView>> {
        self.send(&ClientMessage::list_sessions()).await?;
        loop {
            match self.read_direct().await? {
                DaemonMessage::SessionList { sessions } => return Ok(sessions),
                other => self.pending.push_back(other),
            }
        }
    }

    /// Lists a directory of a session's workspace; `None` is its root.
    pub async fn list_files(
        &mut self,
        session_id: &SessionId,
        dir: Option<String>,
    ) -> Result<Vec<FileEntry>> {
        self.send(&ClientMessage::list_files(session_id.clone(), dir))
            .await?;
        loop {
            match self.read_direct().await? {
                DaemonMessage::FileList {
                    session_id: id,
                    entries,
                    ..
                } if id == *session_id => return Ok(entries),
                DaemonMessage::Error {
                    session_id: Some(id),
                    kind,
                    message,
                } if id == *session_id => return Err(ClientError::Daemon { kind, message }),
                other => self.pending.push_back(other),
            }
        }
    }

    /// Reads one file of a session's workspace.
    pub async fn read_file(&mut self, session_id: &SessionId, path: &str) -> Result<Vec<u8>> {
        self.send(&ClientMessage::read_file(session_id.clone(), path))
            .await?;
        loop {
            match self.read_direct().await? {
                DaemonMessage::FileContent {
                    session_id: id,
                    data,
                    ..
                } if id == *session_id => return Ok(data),
                DaemonMessage::Error {
                    session_id: Some(id),
                    kind,
                    message,
                } if id == *session_id => return Err(ClientError::Daemon { kind, message }),
                other => self.pending.push_back(other),
            }
        }
    }

    /// Round-trips a ping and returns the latency.
    pub async fn ping(&mut self, seq: u64) -> Result<Duration> {
        let started = Instant::now();
        self.send(&ClientMessage::ping(seq)).await?;
        loop {
            match self.read_direct().await? {
                DaemonMessage::Pong { seq: got } if got == seq => return Ok(started.elapsed()),
                other => self.pending.push_back(other),
            }
        }
    }

    /// Closes a session. The daemon confirms with a terminal `state_changed`.
    pub async fn close(&mut self, session_id: &SessionId) -> Result<()> {
        self.commands.close(session_id).await
    }

    /// Sends `disconnect` and drops the connection.
    pub async fn disconnect(mut self) -> Result<()> {
        self.send(&ClientMessage::disconnect()).await
    }

    /// Splits into independent halves, returning held-back events first.
    pub fn into_split(self) -> (VecDeque<DaemonMessage>, EventReader, CommandWriter) {
        (self.pending, self.events, self.commands)
    }

    /// Reads from the socket, bypassing held-back events.
    async fn read_direct(&mut self) -> Result<DaemonMessage> {
        self.events.next().await?.ok_or(ClientError::Disconnected)
    }
}

/// Connects to the daemon socket with exponential backoff.
///
/// Retries until `connect_timeout` elapses.
async fn connect_with_retry(config: &ClientConfig) -> Result<UnixStream> {
    let deadline = Instant::now() + config.connect_timeout;
    let mut delay = config.retry_initial_delay;
    let mut attempt = 0u32;

    loop {
        attempt = attempt.saturating_add(1);
        debug!(
            attempt,
            socket_path = %config.socket_path.display(),
            "Attempting to connect to daemon"
        );

        let last_error = match UnixStream::connect(&config.socket_path).await {
            Ok(stream) => {
                debug!(attempt, "Connection successful");
                return Ok(stream);
            }
            Err(e) => e,
        };

        if Instant::now() + delay > deadline {
            warn!(
                attempt,
                socket_path = %config.socket_path.display(),
                error = %last_error,
                "Giving up connecting to daemon"
            );
            return Err(ClientError::DaemonConnection(format!(
                "{}: {last_error}",
                config.socket_path.display()
            )));
        }
        sleep(delay).await;
        delay = config.next_delay(delay);
    }
}
