//! Connection handler for individual client connections.
//!
//! Each client connection gets its own `ConnectionHandler` that:
//! - Performs protocol version negotiation
//! - Parses incoming messages
//! - Routes session commands to the orchestrator
//! - Forwards frames from the sessions it opened
//! - Closes those sessions when the client goes away
//!
//! Sessions belong to the connection that opened them; other connections
//! see them as not found. Each owned session has its own dispatcher task, so
//! a slow request (a close waiting out a kill grace period) holds up only
//! later requests for that same session.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Connection errors are logged and result in graceful disconnect

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use runcell_core::{ErrorKind, SessionId, StateReason, Submission};
use runcell_protocol::{
    decode_line, encode_line, ClientMessage, CodecError, DaemonMessage, MessageType,
    ProtocolVersion, MAX_MESSAGE_SIZE,
};

use crate::orchestrator::{OrchestratorError, OrchestratorHandle, SessionReply, SessionRequest};
use crate::session::FrameStream;

/// Shared writer: the handler, its dispatchers and its frame forwarders all
/// write here.
pub type ClientWriter = Arc<Mutex<BufWriter<OwnedWriteHalf>>>;

/// Requests queued per session before the client is told the session is busy.
const DISPATCH_QUEUE: usize = 256;

/// Timeouts applied to one connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    /// Idle connections are dropped after this long without a message.
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

/// Connection handler for a single client.
pub struct ConnectionHandler {
    reader: BufReader<OwnedReadHalf>,
    writer: ClientWriter,
    orchestrator: OrchestratorHandle,
    limits: ConnectionLimits,

    /// Assigned during the handshake
    client_id: Option<String>,

    /// Sessions opened on this connection, with their dispatch queues
    owned: HashMap<SessionId, mpsc::Sender<SessionRequest>>,

    /// One request dispatcher per owned session
    dispatchers: JoinSet<()>,

    /// One frame forwarder per owned session
    forwarders: JoinSet<()>,

    connection_number: u64,
}

impl ConnectionHandler {
    pub fn new(
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        orchestrator: OrchestratorHandle,
        limits: ConnectionLimits,
        connection_number: u64,
    ) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer: Arc::new(Mutex::new(BufWriter::new(writer))),
            orchestrator,
            limits,
            client_id: None,
            owned: HashMap::new(),
            dispatchers: JoinSet::new(),
            forwarders: JoinSet::new(),
            connection_number,
        }
    }

    /// Runs the connection: handshake, message loop, then cleanup.
    ///
    /// Returns the client id assigned during the handshake.
    pub async fn run(mut self) -> Option<String> {
        debug!(connection = self.connection_number, "New client connected");

        match self.handle_handshake().await {
            Ok(()) => {
                info!(client_id = ?self.client_id, "Client handshake completed");
            }
            Err(e) => {
                warn!(
                    connection = self.connection_number,
                    error = %e,
                    "Handshake failed"
                );
                return None;
            }
        }

        if let Err(e) = self.process_messages().await {
            debug!(client_id = ?self.client_id, error = %e, "Connection closed");
        }

        self.close_owned_sessions().await;
        info!(client_id = ?self.client_id, "Client disconnected");
        self.client_id
    }

    /// Expects a `Connect` message with a compatible protocol version.
    async fn handle_handshake(&mut self) -> Result<(), ConnectionError> {
        let msg = match timeout(self.limits.read_timeout, self.read_message()).await {
            Ok(result) => result?,
            Err(_) => return Err(ConnectionError::Timeout),
        };

        let client_version = msg.protocol_version;
        if let Err(e) = ProtocolVersion::check(&client_version) {
            warn!(
                client_version = %client_version,
                server_version = %ProtocolVersion::CURRENT,
                "Protocol version mismatch"
            );
            self.send_message(&DaemonMessage::rejected(&e.to_string()))
                .await?;
            return Err(ConnectionError::VersionMismatch {
                client: client_version,
                server: ProtocolVersion::CURRENT,
            });
        }

        match msg.message {
            MessageType::Connect { client_id } => {
                let assigned_id =
                    client_id.unwrap_or_else(|| format!("client-{}", self.connection_number));
                self.client_id = Some(assigned_id.clone());
                self.send_message(&DaemonMessage::connected(assigned_id))
                    .await
            }
            other => {
                self.send_message(&DaemonMessage::error(
                    None,
                    ErrorKind::InvalidInput,
                    "Expected Connect message for handshake",
                ))
                .await?;
                Err(ConnectionError::UnexpectedMessage(format!("{other:?}")))
            }
        }
    }

    async fn process_messages(&mut self) -> Result<(), ConnectionError> {
        loop {
            let msg = match timeout(self.limits.read_timeout, self.read_message()).await {
                Ok(Ok(msg)) => msg,
                Ok(Err(ConnectionError::Eof)) => {
                    debug!(client_id = ?self.client_id, "Client sent EOF");
                    return Ok(());
                }
                Ok(Err(ConnectionError::Malformed(reason))) => {
                    debug!(client_id = ?self.client_id, %reason, "Malformed message");
                    self.send_message(&DaemonMessage::error(
                        None,
                        ErrorKind::InvalidInput,
                        format!("Malformed message: {reason}"),
                    ))
                    .await?;
                    continue;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    debug!(client_id = ?self.client_id, "Connection timed out");
                    return Err(ConnectionError::Timeout);
                }
            };

            if ProtocolVersion::check(&msg.protocol_version).is_err() {
                self.send_message(&DaemonMessage::error(
                    None,
                    ErrorKind::InvalidInput,
                    format!("Unsupported protocol version {}", msg.protocol_version),
                ))
                .await?;
                continue;
            }

            if !self.handle_message(msg.message).await? {
                return Ok(());
            }
        }
    }

    /// Handles one message. Returns false when the client asked to disconnect.
    async fn handle_message(&mut self, message: MessageType) -> Result<bool, ConnectionError> {
        match message {
            MessageType::Connect { .. } => {
                self.send_message(&DaemonMessage::error(
                    None,
                    ErrorKind::InvalidInput,
                    "Already connected",
                ))
                .await?;
            }

            MessageType::OpenSession => self.handle_open_session().await?,

            MessageType::Compile {
                session_id,
                files,
                flags,
                entry,
            } => {
                let mut submission = Submission::new(files).with_flags(flags);
                if let Some(entry) = entry {
                    submission = submission.with_entry(entry);
                }
                self.route(session_id, SessionRequest::Compile(submission))
                    .await?;
            }
            MessageType::Run { session_id } => {
                self.route(session_id, SessionRequest::Run).await?;
            }
            MessageType::Debug { session_id } => {
                self.route(session_id, SessionRequest::Debug).await?;
            }
            MessageType::Input { session_id, data } => {
                self.route(session_id, SessionRequest::Input(data)).await?;
            }
            MessageType::Resize {
                session_id,
                cols,
                rows,
            } => {
                self.route(session_id, SessionRequest::Resize { cols, rows })
                    .await?;
            }
            MessageType::ListFiles { session_id, dir } => {
                self.route(session_id, SessionRequest::ListFiles { dir })
                    .await?;
            }
            MessageType::ReadFile { session_id, path } => {
                self.route(session_id, SessionRequest::ReadFile { path })
                    .await?;
            }
            MessageType::Close { session_id } => {
                self.route(session_id, SessionRequest::Close(StateReason::Requested))
                    .await?;
            }

            MessageType::ListSessions => {
                let sessions = self
                    .orchestrator
                    .list()
                    .await
                    .into_iter()
                    .filter(|view| self.owned.contains_key(&view.id))
                    .collect();
                self.send_message(&DaemonMessage::session_list(sessions))
                    .await?;
            }

            MessageType::Ping { seq } => {
                self.send_message(&DaemonMessage::pong(seq)).await?;
            }

            MessageType::Disconnect => {
                debug!(client_id = ?self.client_id, "Client requested disconnect");
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn handle_open_session(&mut self) -> Result<(), ConnectionError> {
        let session_id = match self.orchestrator.open_session().await {
            Ok(id) => id,
            Err(e) => return self.send_error(None, &e).await,
        };
        let queue = self.spawn_dispatcher(session_id.clone());
        self.owned.insert(session_id.clone(), queue);
        self.send_message(&DaemonMessage::session_opened(session_id.clone()))
            .await?;

        // Frames emitted before this point are replayed from the backlog.
        match self.orchestrator.subscribe(&session_id).await {
            Ok(stream) => self.spawn_forwarder(session_id, stream),
            Err(e) => self.send_error(Some(session_id), &e).await?,
        }
        Ok(())
    }

    /// Queues a session request on that session's dispatcher.
    ///
    /// Requests for one session are applied in arrival order; requests for
    /// different sessions never wait on each other.
    async fn route(
        &mut self,
        session_id: SessionId,
        request: SessionRequest,
    ) -> Result<(), ConnectionError> {
        let Some(queue) = self.owned.get(&session_id) else {
            let e = OrchestratorError::NotFound(session_id.clone());
            return self.send_error(Some(session_id), &e).await;
        };
        let name = request.name();
        let (kind, message) = match queue.try_send(request) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Full(_)) => (ErrorKind::ResourceExhausted, "session is busy"),
            Err(TrySendError::Closed(_)) => (ErrorKind::Unavailable, "session dispatcher stopped"),
        };
        debug!(
            client_id = ?self.client_id,
            %session_id,
            request = name,
            %kind,
            "Request not queued"
        );
        self.send_message(&DaemonMessage::error(Some(session_id), kind, message))
            .await
    }

    /// Starts the task that applies one session's requests in order.
    fn spawn_dispatcher(&mut self, session_id: SessionId) -> mpsc::Sender<SessionRequest> {
        let (queue, mut requests) = mpsc::channel::<SessionRequest>(DISPATCH_QUEUE);
        let orchestrator = self.orchestrator.clone();
        let writer = Arc::clone(&self.writer);
        let write_timeout = self.limits.write_timeout;
        let client_id = self.client_id.clone();

        self.dispatchers.spawn(async move {
            while let Some(request) = requests.recv().await {
                let name = request.name();
                let echo = match &request {
                    SessionRequest::ListFiles { dir } => dir.clone(),
                    SessionRequest::ReadFile { path } => Some(path.clone()),
                    _ => None,
                };
                let response = match orchestrator.dispatch(&session_id, request).await {
                    Ok(SessionReply::Done) => continue,
                    Ok(SessionReply::Files(entries)) => {
                        DaemonMessage::file_list(session_id.clone(), echo, entries)
                    }
                    Ok(SessionReply::Content(data)) => DaemonMessage::file_content(
                        session_id.clone(),
                        echo.unwrap_or_default(),
                        data,
                    ),
                    Err(e) => {
                        debug!(
                            ?client_id,
                            %session_id,
                            request = name,
                            error = %e,
                            "Request failed"
                        );
                        DaemonMessage::error(Some(session_id.clone()), e.kind(), e.to_string())
                    }
                };
                if let Err(e) = write_message(&writer, write_timeout, &response).await {
                    debug!(%session_id, error = %e, "Dispatcher stopped");
                    return;
                }
            }
        });
        queue
    }

    fn spawn_forwarder(&mut self, session_id: SessionId, mut stream: FrameStream) {
        let writer = Arc::clone(&self.writer);
        let write_timeout = self.limits.write_timeout;
        self.forwarders.spawn(async move {
            while let Some(frame) = stream.recv().await {
                let msg = DaemonMessage::from_frame(frame);
                if let Err(e) = write_message(&writer, write_timeout, &msg).await {
                    debug!(%session_id, error = %e, "Frame forwarding stopped");
                    return;
                }
            }
            debug!(%session_id, "Frame stream ended");
        });
    }

    /// Closes every session this connection opened and stops forwarding.
    ///
    /// Queued requests are dropped. The sessions close concurrently, each
    /// reporting `Disconnected`.
    async fn close_owned_sessions(&mut self) {
        self.dispatchers.abort_all();
        while self.dispatchers.join_next().await.is_some() {}

        let mut closes = JoinSet::new();
        for (session_id, _) in self.owned.drain() {
            let orchestrator = self.orchestrator.clone();
            closes.spawn(async move {
                // Already-terminated sessions close as a no-op.
                let close = SessionRequest::Close(StateReason::Disconnected);
                if let Err(e) = orchestrator.dispatch(&session_id, close).await {
                    debug!(%session_id, error = %e, "Close on disconnect failed");
                }
            });
        }
        while closes.join_next().await.is_some() {}

        self.forwarders.abort_all();
        while self.forwarders.join_next().await.is_some() {}
    }

    /// Reads one newline-terminated message, bounded by `MAX_MESSAGE_SIZE`.
    async fn read_message(&mut self) -> Result<ClientMessage, ConnectionError> {
        let mut line = String::new();
        let mut limited = (&mut self.reader).take(MAX_MESSAGE_SIZE as u64 + 1);
        let bytes_read = limited
            .read_line(&mut line)
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        if bytes_read == 0 {
            return Err(ConnectionError::Eof);
        }
        if line.len() > MAX_MESSAGE_SIZE {
            return Err(ConnectionError::MessageTooLarge {
                size: line.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        let msg: ClientMessage = decode_line(&line).map_err(|e| match e {
            CodecError::TooLarge { size, max } => ConnectionError::MessageTooLarge { size, max },
            CodecError::Malformed(e) => ConnectionError::Malformed(e.to_string()),
        })?;

        debug!(
            client_id = ?self.client_id,
            message_type = ?std::mem::discriminant(&msg.message),
            "Received message"
        );
        Ok(msg)
    }

    async fn send_error(
        &self,
        session_id: Option<SessionId>,
        error: &OrchestratorError,
    ) -> Result<(), ConnectionError> {
        self.send_message(&DaemonMessage::error(
            session_id,
            error.kind(),
            error.to_string(),
        ))
        .await
    }

    async fn send_message(&self, msg: &DaemonMessage) -> Result<(), ConnectionError> {
        write_message(&self.writer, self.limits.write_timeout, msg).await
    }
}

/// Writes one message line under the write timeout.
async fn write_message(
    writer: &ClientWriter,
    write_timeout: Duration,
    msg: &DaemonMessage,
) -> Result<(), ConnectionError> {
    let line = encode_line(msg).map_err(|e| ConnectionError::Malformed(e.to_string()))?;
    let mut writer = writer.lock().await;

    match timeout(write_timeout, async {
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
        Ok::<(), std::io::Error>(())
    })
    .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ConnectionError::Io(e.to_string())),
        Err(_) => Err(ConnectionError::WriteTimeout),
    }
}

/// Errors that can occur during connection handling.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Protocol version mismatch: client {client}, server {server}")]
    VersionMismatch {
        client: ProtocolVersion,
        server: ProtocolVersion,
    },

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection closed")]
    Eof,

    #[error("Read timeout")]
    Timeout,

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_display() {
        let err = ConnectionError::VersionMismatch {
            client: ProtocolVersion::new(2, 0),
            server: ProtocolVersion::new(1, 0),
        };
        assert!(err.to_string().contains("2.0"));
        assert!(err.to_string().contains("1.0"));
    }

    #[test]
    fn test_message_size_error() {
        let err = ConnectionError::MessageTooLarge {
            size: 2_000_000,
            max: MAX_MESSAGE_SIZE,
        };
        assert!(err.to_string().contains("2000000"));
    }
}
