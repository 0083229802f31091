//! Interactive terminal attach.
//!
//! Starts the built program (or the debugger) in a session and connects the
//! local terminal to it: keystrokes go to the session's pseudo-terminal,
//! output comes back to stdout, and window size changes follow `SIGWINCH`.
//! `Ctrl-]` closes the session and detaches.
//!
//! **Panic-Free Policy:** No `.unwrap()`, `.expect()`, `panic!()`,
//! `unreachable!()`, or `todo!()`.

use std::borrow::Cow;
use std::io::IsTerminal;

use crossterm::terminal::{self, disable_raw_mode, enable_raw_mode};
use runcell_core::{ErrorKind, ExitStatus, OutputKind, SessionId, SessionState, StateReason};
use runcell_protocol::{ClientMessage, DaemonMessage};
use tokio::io::{AsyncReadExt, AsyncWriteExt, Stdout};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::client::{CommandWriter, DaemonClient};
use crate::error::{ClientError, Result};

/// `Ctrl-]`, the conventional telnet escape.
pub const DETACH_KEY: u8 = 0x1d;

/// `Ctrl-D`, sent once when local stdin reaches end of file.
const END_OF_TRANSMISSION: u8 = 0x04;

const STDIN_CHUNK: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachMode {
    Run,
    Debug,
}

/// How an attached session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachOutcome {
    pub state: SessionState,
    pub reason: StateReason,
    /// Set when the attached process reported an exit status.
    pub exit_status: Option<ExitStatus>,
    /// True when the user detached with [`DETACH_KEY`].
    pub detached: bool,
}

impl AttachOutcome {
    /// Process exit code for the CLI: the program's own code when it has
    /// one, 0 after a detach, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self.exit_status.as_ref().and_then(|s| s.code) {
            Some(code) => code,
            None if self.detached => 0,
            None => 1,
        }
    }
}

/// Restores cooked mode when dropped.
struct RawModeGuard;

impl RawModeGuard {
    /// Enables raw mode when stdin is a terminal.
    fn enable() -> Result<Option<Self>> {
        if !std::io::stdin().is_terminal() {
            return Ok(None);
        }
        enable_raw_mode().map_err(|e| ClientError::Terminal(e.to_string()))?;
        Ok(Some(Self))
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

/// Starts `mode` in a compiled session and attaches the local terminal.
///
/// Returns when the session reaches a terminal state. Local stdin is read on
/// a background task that cannot be cancelled, so callers should exit the
/// process once this returns.
pub async fn attach(
    client: DaemonClient,
    session_id: &SessionId,
    mode: AttachMode,
) -> Result<AttachOutcome> {
    let (pending, mut events, mut commands) = client.into_split();

    let raw = RawModeGuard::enable()?;
    let mut screen = Screen::new(session_id.clone(), raw.is_some());

    let start = match mode {
        AttachMode::Run => ClientMessage::run(session_id.clone()),
        AttachMode::Debug => ClientMessage::debug(session_id.clone()),
    };
    commands.send(&start).await?;
    if raw.is_some() {
        send_window_size(&mut commands, session_id).await?;
    }

    for message in pending {
        if let Some(outcome) = screen.render(message).await? {
            return Ok(outcome);
        }
    }

    let mut winch = signal(SignalKind::window_change())?;
    let mut stdin = spawn_stdin_reader();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            message = events.next() => {
                let Some(message) = message? else {
                    return Err(ClientError::Disconnected);
                };
                if let Some(outcome) = screen.render(message).await? {
                    debug!(state = %outcome.state, reason = %outcome.reason, "Session ended");
                    return Ok(outcome);
                }
            }

            chunk = stdin.recv(), if stdin_open => match chunk {
                Some(bytes) => {
                    let (forward, detach) = split_at_detach(&bytes);
                    if !forward.is_empty() {
                        commands.input(session_id, forward.to_vec()).await?;
                    }
                    if detach {
                        debug!(%session_id, "Detach requested, closing session");
                        screen.detached = true;
                        stdin_open = false;
                        commands.close(session_id).await?;
                    }
                }
                None => {
                    stdin_open = false;
                    commands.input(session_id, vec![END_OF_TRANSMISSION]).await?;
                }
            },

            _ = winch.recv() => {
                send_window_size(&mut commands, session_id).await?;
            }
        }
    }
}

async fn send_window_size(commands: &mut CommandWriter, session_id: &SessionId) -> Result<()> {
    match terminal::size() {
        Ok((cols, rows)) => commands.resize(session_id, cols, rows).await,
        Err(e) => {
            warn!(error = %e, "Could not read terminal size");
            Ok(())
        }
    }
}

/// Reads local stdin on a background task. The channel closes at EOF.
fn spawn_stdin_reader() -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = vec![0u8; STDIN_CHUNK];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}

/// Splits a keystroke chunk at the detach key.
///
/// Returns the bytes to forward and whether the key was pressed.
fn split_at_detach(bytes: &[u8]) -> (&[u8], bool) {
    match bytes.iter().position(|&b| b == DETACH_KEY) {
        Some(at) => (&bytes[..at], true),
        None => (bytes, false),
    }
}

/// Adds the carriage return raw mode no longer inserts before `\n`.
fn to_crlf(bytes: &[u8]) -> Cow<'_, [u8]> {
    let lone = bytes
        .iter()
        .enumerate()
        .any(|(i, &b)| b == b'\n' && (i == 0 || bytes[i - 1] != b'\r'));
    if !lone {
        return Cow::Borrowed(bytes);
    }

    let mut out = Vec::with_capacity(bytes.len() + 16);
    let mut prev = 0u8;
    for &b in bytes {
        if b == b'\n' && prev != b'\r' {
            out.push(b'\r');
        }
        out.push(b);
        prev = b;
    }
    Cow::Owned(out)
}

/// Renders one session's events to the local terminal.
struct Screen {
    session_id: SessionId,
    raw: bool,
    stdout: Stdout,
    exit_status: Option<ExitStatus>,
    detached: bool,
}

impl Screen {
    fn new(session_id: SessionId, raw: bool) -> Self {
        Self {
            session_id,
            raw,
            stdout: tokio::io::stdout(),
            exit_status: None,
            detached: false,
        }
    }

    /// Writes an event out. Returns the outcome once the session has ended.
    async fn render(&mut self, message: DaemonMessage) -> Result<Option<AttachOutcome>> {
        match message {
            DaemonMessage::Output {
                session_id,
                kind,
                data,
                exit_status,
            } if session_id == self.session_id => {
                match kind {
                    OutputKind::Stdout | OutputKind::Stderr => self.write_out(&data).await?,
                    OutputKind::Diagnostic => {
                        self.notice(&String::from_utf8_lossy(&data)).await?;
                    }
                    OutputKind::ExitStatus | OutputKind::StateChange => {}
                }
                if let Some(status) = exit_status {
                    self.exit_status = Some(status);
                }
            }

            DaemonMessage::StateChanged {
                session_id,
                state,
                reason,
            } if session_id == self.session_id => {
                debug!(%state, %reason, "Session state changed");
                if state.is_terminal() {
                    return Ok(Some(AttachOutcome {
                        state,
                        reason,
                        exit_status: self.exit_status.take(),
                        detached: self.detached,
                    }));
                }
            }

            DaemonMessage::Error {
                session_id,
                kind,
                message,
            } if session_id.as_ref().map_or(true, |id| *id == self.session_id) => {
                if kind == ErrorKind::NotFound {
                    return Err(ClientError::Daemon { kind, message });
                }
                self.notice(&format!("{kind}: {message}")).await?;
            }

            other => debug!(message = ?other, "Ignoring unrelated daemon message"),
        }
        Ok(None)
    }

    async fn write_out(&mut self, data: &[u8]) -> Result<()> {
        let data = if self.raw { to_crlf(data) } else { Cow::Borrowed(data) };
        self.stdout.write_all(&data).await?;
        self.stdout.flush().await?;
        Ok(())
    }

    /// Prints a daemon notice on its own line.
    async fn notice(&mut self, text: &str) -> Result<()> {
        let line = format!("[runcell] {}\n", text.trim_end());
        self.write_out(line.as_bytes()).await
    }
}
