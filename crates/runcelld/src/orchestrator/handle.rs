//! Client interface for the orchestrator.
//!
//! `OrchestratorHandle` is cheap to clone and shared by every connection.
//! Table changes go through the actor; session setup (workspace, terminal)
//! runs on the caller's task so a slow filesystem never stalls the actor.

use std::sync::Arc;

use runcell_core::{SessionId, SessionLimits, SessionView, StateReason};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::commands::{
    Lookup, OrchestratorCommand, OrchestratorError, OrchestratorStats, SessionReply,
    SessionRequest,
};
use crate::session::{
    spawn_session, FrameStream, Retirement, SessionContext, SessionError, SessionResources,
};

#[derive(Debug, Clone)]
pub struct OrchestratorHandle {
    sender: mpsc::Sender<OrchestratorCommand>,
    retirements: mpsc::UnboundedSender<Retirement>,
    ctx: Arc<SessionContext>,
    limits: SessionLimits,
    fatal: CancellationToken,
}

impl OrchestratorHandle {
    pub(super) fn new(
        sender: mpsc::Sender<OrchestratorCommand>,
        retirements: mpsc::UnboundedSender<Retirement>,
        ctx: Arc<SessionContext>,
        limits: SessionLimits,
        fatal: CancellationToken,
    ) -> Self {
        Self {
            sender,
            retirements,
            ctx,
            limits,
            fatal,
        }
    }

    /// Shared session context (workspace manager, supervisor, toolchain).
    pub fn context(&self) -> &Arc<SessionContext> {
        &self.ctx
    }

    /// Cancelled when the orchestrator hits an error the daemon cannot
    /// continue past, such as losing the workspace root.
    pub fn fatal(&self) -> &CancellationToken {
        &self.fatal
    }

    /// Admits a new session and starts it.
    ///
    /// # Errors
    ///
    /// - `OrchestratorError::Unavailable` if the session bound is reached or
    ///   the orchestrator is shutting down
    /// - `OrchestratorError::Session` if the workspace or terminal could not
    ///   be set up
    pub async fn open_session(&self) -> Result<SessionId, OrchestratorError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(OrchestratorCommand::Reserve { respond_to: tx })
            .await
            .map_err(|_| OrchestratorError::ChannelClosed)?;
        let session_id = rx.await.map_err(|_| OrchestratorError::ChannelClosed)??;

        let ctx = Arc::clone(&self.ctx);
        let id = session_id.clone();
        let prepared =
            tokio::task::spawn_blocking(move || SessionResources::prepare(&ctx, &id)).await;
        let resources = match prepared {
            Ok(Ok(resources)) => resources,
            Ok(Err(e)) => {
                self.release(&session_id).await;
                if matches!(&e, SessionError::Workspace(w) if w.is_fatal()) {
                    error!(error = %e, "Workspace root lost, escalating");
                    self.fatal.cancel();
                } else {
                    warn!(%session_id, error = %e, "Session setup failed");
                }
                return Err(e.into());
            }
            Err(e) => {
                self.release(&session_id).await;
                warn!(%session_id, error = %e, "Session setup task failed");
                return Err(OrchestratorError::Unavailable(format!(
                    "session setup failed: {e}"
                )));
            }
        };

        let handle = spawn_session(
            session_id.clone(),
            resources,
            self.limits,
            Arc::clone(&self.ctx),
            self.retirements.clone(),
        );

        let (tx, rx) = oneshot::channel();
        let activated = match self
            .sender
            .send(OrchestratorCommand::Activate {
                session_id: session_id.clone(),
                handle: handle.clone(),
                respond_to: tx,
            })
            .await
        {
            Ok(()) => rx.await.unwrap_or(Err(OrchestratorError::ChannelClosed)),
            Err(_) => Err(OrchestratorError::ChannelClosed),
        };
        if let Err(e) = activated {
            debug!(%session_id, error = %e, "Activation refused, closing session");
            handle.close(StateReason::Shutdown).await;
            return Err(e);
        }

        Ok(session_id)
    }

    /// Routes a request to a session.
    ///
    /// # Errors
    ///
    /// - `OrchestratorError::NotFound` for unknown or terminated sessions,
    ///   except that closing a recently retired session succeeds
    /// - `OrchestratorError::Session` when the session rejects the request
    pub async fn dispatch(
        &self,
        session_id: &SessionId,
        request: SessionRequest,
    ) -> Result<SessionReply, OrchestratorError> {
        let handle = match self.lookup(session_id).await? {
            Lookup::Live(handle) => handle,
            Lookup::Retired if matches!(request, SessionRequest::Close(_)) => {
                debug!(%session_id, "Close on retired session");
                return Ok(SessionReply::Done);
            }
            Lookup::Retired | Lookup::Pending | Lookup::Unknown => {
                return Err(OrchestratorError::NotFound(session_id.clone()));
            }
        };

        debug!(%session_id, request = request.name(), "Dispatching request");
        match request {
            SessionRequest::Compile(submission) => handle.compile(submission).await?,
            SessionRequest::Run => handle.run().await?,
            SessionRequest::Debug => handle.debug().await?,
            SessionRequest::Input(data) => handle.input(data).await?,
            SessionRequest::Resize { cols, rows } => handle.resize(cols, rows).await?,
            SessionRequest::ListFiles { dir } => {
                return Ok(SessionReply::Files(handle.list_files(dir).await?));
            }
            SessionRequest::ReadFile { path } => {
                return Ok(SessionReply::Content(handle.read_file(path).await?));
            }
            SessionRequest::Close(reason) => handle.close(reason).await,
        }
        Ok(SessionReply::Done)
    }

    /// Starts a frame stream for a session, replacing any earlier one.
    pub async fn subscribe(&self, session_id: &SessionId) -> Result<FrameStream, OrchestratorError> {
        match self.lookup(session_id).await? {
            Lookup::Live(handle) => Ok(handle.subscribe().await?),
            Lookup::Retired | Lookup::Pending | Lookup::Unknown => {
                Err(OrchestratorError::NotFound(session_id.clone()))
            }
        }
    }

    /// Snapshots of every live session, oldest first.
    ///
    /// Returns an empty vector if the actor has stopped.
    pub async fn list(&self) -> Vec<SessionView> {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(OrchestratorCommand::List { respond_to: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }
        let handles = rx.await.unwrap_or_default();

        let mut views = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Some(view) = handle.snapshot().await {
                views.push(view);
            }
        }
        views.sort_by_key(|view| view.created_at);
        views
    }

    pub async fn stats(&self) -> Result<OrchestratorStats, OrchestratorError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(OrchestratorCommand::Stats { respond_to: tx })
            .await
            .map_err(|_| OrchestratorError::ChannelClosed)?;
        rx.await.map_err(|_| OrchestratorError::ChannelClosed)
    }

    /// Stops admission, closes every live session, and waits until all of
    /// them have released their resources. Returns how many were closed.
    pub async fn shutdown(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(OrchestratorCommand::Shutdown { respond_to: tx })
            .await
            .is_err()
        {
            return 0;
        }
        let handles = rx.await.unwrap_or_default();

        let mut closing = JoinSet::new();
        for handle in handles {
            closing.spawn(async move {
                handle.close(StateReason::Shutdown).await;
                handle.wait_terminal().await
            });
        }
        let count = closing.len();
        while closing.join_next().await.is_some() {}

        info!(closed = count, "All sessions closed");
        count
    }

    async fn lookup(&self, session_id: &SessionId) -> Result<Lookup, OrchestratorError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(OrchestratorCommand::Lookup {
                session_id: session_id.clone(),
                respond_to: tx,
            })
            .await
            .map_err(|_| OrchestratorError::ChannelClosed)?;
        rx.await.map_err(|_| OrchestratorError::ChannelClosed)
    }

    async fn release(&self, session_id: &SessionId) {
        let _ = self
            .sender
            .send(OrchestratorCommand::Release {
                session_id: session_id.clone(),
            })
            .await;
    }
}
