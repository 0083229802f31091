//! Unix socket server for the runcell daemon.
//!
//! The server:
//! - Listens on a Unix socket for client connections
//! - Spawns a ConnectionHandler for each client, up to `max_clients`
//! - Supports graceful shutdown via CancellationToken
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   DaemonServer  │
//! │                 │
//! │  UnixListener   │
//! └───────┬─────────┘
//!         │ accept()
//!         ▼
//! ┌─────────────────┐     ┌────────────────────┐
//! │ConnectionHandler│────▶│ OrchestratorHandle │
//! │   (per client)  │     │                    │
//! └────────┬────────┘     └─────────┬──────────┘
//!          │                        │
//!          │◀──── frame forwarders ─┘
//!          ▼
//!     client socket
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Server errors are logged and allow continued operation

mod connection;

pub use connection::{ClientWriter, ConnectionError, ConnectionHandler, ConnectionLimits};

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use runcell_protocol::{encode_line, DaemonMessage};

use crate::config::ServerConfig;
use crate::orchestrator::OrchestratorHandle;

/// Unix socket server for the runcell daemon.
pub struct DaemonServer {
    socket_path: PathBuf,
    orchestrator: OrchestratorHandle,
    cancel_token: CancellationToken,
    max_clients: usize,
    limits: ConnectionLimits,
    connection_counter: AtomicU64,
    active_clients: Arc<AtomicUsize>,
}

impl DaemonServer {
    pub fn new(
        config: &ServerConfig,
        orchestrator: OrchestratorHandle,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            socket_path: config.socket_path.clone(),
            orchestrator,
            cancel_token,
            max_clients: config.max_clients,
            limits: ConnectionLimits {
                read_timeout: Duration::from_secs(config.read_timeout_secs),
                write_timeout: Duration::from_secs(config.write_timeout_secs),
            },
            connection_counter: AtomicU64::new(0),
            active_clients: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Number of connected clients.
    pub fn client_count(&self) -> usize {
        self.active_clients.load(Ordering::Relaxed)
    }

    /// Runs the server.
    ///
    /// Listens for connections until the cancellation token is triggered.
    /// This method does not return until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind()?;
        info!(socket = %self.socket_path.display(), "Daemon server listening");

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!(clients = self.client_count(), "Server shutdown requested");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => {
                            let conn_num = self.connection_counter.fetch_add(1, Ordering::Relaxed);
                            self.handle_connection(stream, conn_num);
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
        }

        self.cleanup();
        Ok(())
    }

    fn bind(&self) -> Result<UnixListener, ServerError> {
        let setup_error = |e: std::io::Error| ServerError::SocketSetup {
            path: self.socket_path.clone(),
            error: e.to_string(),
        };

        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path).map_err(setup_error)?;
        }
        if let Some(parent) = self.socket_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(setup_error)?;
            }
        }

        let listener = UnixListener::bind(&self.socket_path).map_err(setup_error)?;
        std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))
            .map_err(setup_error)?;
        Ok(listener)
    }

    fn handle_connection(&self, stream: UnixStream, connection_number: u64) {
        let active = Arc::clone(&self.active_clients);
        if active.fetch_add(1, Ordering::SeqCst) >= self.max_clients {
            active.fetch_sub(1, Ordering::SeqCst);
            warn!(
                connection = connection_number,
                max = self.max_clients,
                "Too many clients, rejecting connection"
            );
            tokio::spawn(reject(stream, self.max_clients));
            return;
        }

        let (reader, writer) = stream.into_split();
        let handler = ConnectionHandler::new(
            reader,
            writer,
            self.orchestrator.clone(),
            self.limits,
            connection_number,
        );

        tokio::spawn(async move {
            let client_id = handler.run().await;
            active.fetch_sub(1, Ordering::SeqCst);
            debug!(client_id = ?client_id, "Connection handler finished");
        });
    }

    /// Removes the socket file.
    fn cleanup(&self) {
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(
                    socket = %self.socket_path.display(),
                    error = %e,
                    "Failed to remove socket file"
                );
            }
        }
        info!("Server cleanup complete");
    }
}

/// Tells a client over the limit why it is being dropped.
async fn reject(mut stream: UnixStream, max: usize) {
    let reason = ServerError::TooManyClients { max }.to_string();
    if let Ok(line) = encode_line(&DaemonMessage::rejected(&reason)) {
        let _ = stream.write_all(line.as_bytes()).await;
        let _ = stream.shutdown().await;
    }
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to setup socket at {path}: {error}")]
    SocketSetup { path: PathBuf, error: String },

    #[error("Too many clients (max: {max})")]
    TooManyClients { max: usize },

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_error_display() {
        let err = ServerError::SocketSetup {
            path: PathBuf::from("/tmp/test.sock"),
            error: "permission denied".to_string(),
        };
        assert!(err.to_string().contains("/tmp/test.sock"));
        assert!(err.to_string().contains("permission denied"));
    }

    #[test]
    fn test_max_clients_error() {
        let err = ServerError::TooManyClients { max: 3 };
        assert!(err.to_string().contains('3'));
    }
}
