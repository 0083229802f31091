//! Cloneable handle to a session task.

use runcell_core::{FileEntry, SessionId, SessionState, SessionView, StateReason, Submission};
use tokio::sync::{mpsc, oneshot, watch};

use super::commands::{SessionCommand, SessionError};
use super::frames::FrameStream;

/// Handle for sending commands to one session.
///
/// Every method is a request/reply over the session's command channel.
/// Once the session has reached a terminal state its task is gone and
/// requests fail with [`SessionError::Closed`].
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: SessionId,
    sender: mpsc::Sender<SessionCommand>,
    state: watch::Receiver<SessionState>,
}

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

impl SessionHandle {
    pub(super) fn new(
        id: SessionId,
        sender: mpsc::Sender<SessionCommand>,
        state: watch::Receiver<SessionState>,
    ) -> Self {
        Self { id, sender, state }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Latest state published by the session task.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub async fn compile(&self, submission: Submission) -> Result<(), SessionError> {
        self.request(|respond_to| SessionCommand::Compile {
            submission: Box::new(submission),
            respond_to,
        })
        .await
    }

    pub async fn run(&self) -> Result<(), SessionError> {
        self.request(|respond_to| SessionCommand::Run { respond_to })
            .await
    }

    pub async fn debug(&self) -> Result<(), SessionError> {
        self.request(|respond_to| SessionCommand::Debug { respond_to })
            .await
    }

    pub async fn input(&self, data: Vec<u8>) -> Result<(), SessionError> {
        self.request(|respond_to| SessionCommand::Input { data, respond_to })
            .await
    }

    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        self.request(|respond_to| SessionCommand::Resize {
            cols,
            rows,
            respond_to,
        })
        .await
    }

    pub async fn list_files(&self, dir: Option<String>) -> Result<Vec<FileEntry>, SessionError> {
        self.request(|respond_to| SessionCommand::ListFiles { dir, respond_to })
            .await
    }

    pub async fn read_file(&self, path: String) -> Result<Vec<u8>, SessionError> {
        self.request(|respond_to| SessionCommand::ReadFile { path, respond_to })
            .await
    }

    /// Closes the session and waits for its cleanup. Never fails.
    pub async fn close(&self, reason: StateReason) {
        let (respond_to, response) = oneshot::channel();
        if self
            .sender
            .send(SessionCommand::Close { reason, respond_to })
            .await
            .is_ok()
        {
            let _ = response.await;
        }
    }

    pub async fn subscribe(&self) -> Result<FrameStream, SessionError> {
        let (respond_to, response) = oneshot::channel();
        self.sender
            .send(SessionCommand::Subscribe { respond_to })
            .await
            .map_err(|_| self.closed())?;
        response.await.map_err(|_| self.closed())
    }

    /// Returns `None` if the session task has ended.
    pub async fn snapshot(&self) -> Option<SessionView> {
        let (respond_to, response) = oneshot::channel();
        self.sender
            .send(SessionCommand::Snapshot { respond_to })
            .await
            .ok()?;
        response.await.ok()
    }

    /// Waits until the session reaches a terminal state.
    pub async fn wait_terminal(&self) -> SessionState {
        let mut state = self.state.clone();
        let reached = state
            .wait_for(SessionState::is_terminal)
            .await
            .map(|current| *current);
        // Task ended without publishing; report the last value seen.
        reached.unwrap_or_else(|_| *state.borrow())
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (respond_to, response) = oneshot::channel();
        self.sender
            .send(build(respond_to))
            .await
            .map_err(|_| self.closed())?;
        response.await.map_err(|_| self.closed())?
    }

    fn closed(&self) -> SessionError {
        SessionError::Closed(self.id.clone())
    }
}
