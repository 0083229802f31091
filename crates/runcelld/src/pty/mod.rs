//! Pseudo-terminal bridge.
//!
//! One bridge per session. The master side is split three ways:
//! - a reader thread pushing output chunks into a bounded channel, so a
//!   slow consumer stalls the reader instead of growing memory
//! - a writer thread draining an input channel into the master
//! - control (`resize`, `close`) held by the owning session
//!
//! The slave side stays open for the bridge's whole life so that successive
//! processes (compiler, program, debugger) can attach to the same terminal.

use std::io::{Read, Write};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize, SlavePty};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::config::TerminalConfig;

/// Output chunks buffered between the reader thread and the session.
const OUTPUT_CHANNEL_CAPACITY: usize = 64;

static NEXT_BRIDGE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("failed to open pseudo-terminal: {0}")]
    Open(String),

    #[error("failed to spawn on pseudo-terminal: {0}")]
    Spawn(String),

    #[error("failed to resize pseudo-terminal: {0}")]
    Resize(String),

    #[error("pseudo-terminal is closed")]
    Closed,
}

/// Terminal options applied when a bridge is opened.
#[derive(Debug, Clone)]
pub struct TerminalOptions {
    pub cols: u16,
    pub rows: u16,
    pub echo: bool,
    pub translate_newlines: bool,
    pub read_chunk_bytes: usize,
}

impl From<&TerminalConfig> for TerminalOptions {
    fn from(config: &TerminalConfig) -> Self {
        Self {
            cols: config.cols,
            rows: config.rows,
            echo: config.echo,
            translate_newlines: config.translate_newlines,
            read_chunk_bytes: config.read_chunk_bytes.max(1),
        }
    }
}

impl Default for TerminalOptions {
    fn default() -> Self {
        Self::from(&TerminalConfig::default())
    }
}

/// Receiving end of the bridge's output.
pub type PtyOutput = mpsc::Receiver<Vec<u8>>;

/// A pseudo-terminal pair owned by one session.
pub struct PtyBridge {
    id: u64,
    master: Option<Box<dyn MasterPty + Send>>,
    slave: Option<Box<dyn SlavePty + Send>>,
    input: Option<mpsc::UnboundedSender<Vec<u8>>>,
    size: PtySize,
}

impl std::fmt::Debug for PtyBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyBridge")
            .field("id", &self.id)
            .field("cols", &self.size.cols)
            .field("rows", &self.size.rows)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PtyBridge {
    /// Opens a pseudo-terminal and starts its reader and writer threads.
    pub fn open(options: &TerminalOptions) -> Result<(Self, PtyOutput), PtyError> {
        let size = PtySize {
            rows: options.rows,
            cols: options.cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        let pair = native_pty_system()
            .openpty(size)
            .map_err(|e| PtyError::Open(e.to_string()))?;

        if let Some(fd) = pair.master.as_raw_fd() {
            set_modes(fd, options.echo, options.translate_newlines)
                .map_err(|e| PtyError::Open(format!("termios: {e}")))?;
        }

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::Open(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::Open(e.to_string()))?;

        let id = NEXT_BRIDGE_ID.fetch_add(1, Ordering::Relaxed);
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let (input_tx, input_rx) = mpsc::unbounded_channel();

        spawn_reader(id, reader, output_tx, options.read_chunk_bytes)?;
        spawn_writer(id, writer, input_rx)?;

        debug!(bridge = id, cols = size.cols, rows = size.rows, "PTY opened");

        Ok((
            Self {
                id,
                master: Some(pair.master),
                slave: Some(pair.slave),
                input: Some(input_tx),
                size,
            },
            output_rx,
        ))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.master.is_none()
    }

    /// Current window size as `(cols, rows)`.
    pub fn size(&self) -> (u16, u16) {
        (self.size.cols, self.size.rows)
    }

    /// Starts a process with the slave as its controlling terminal.
    ///
    /// The child begins a new session, so its process-group id equals its pid.
    pub fn spawn(&self, command: CommandBuilder) -> Result<Box<dyn Child + Send + Sync>, PtyError> {
        let slave = self.slave.as_ref().ok_or(PtyError::Closed)?;
        slave
            .spawn_command(command)
            .map_err(|e| PtyError::Spawn(e.to_string()))
    }

    /// Queues bytes for the attached process, verbatim.
    pub fn write(&self, data: Vec<u8>) -> Result<(), PtyError> {
        let input = self.input.as_ref().ok_or(PtyError::Closed)?;
        input.send(data).map_err(|_| PtyError::Closed)
    }

    /// Applies a new window size.
    pub fn resize(&mut self, cols: u16, rows: u16) -> Result<(), PtyError> {
        let master = self.master.as_ref().ok_or(PtyError::Closed)?;
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        master
            .resize(size)
            .map_err(|e| PtyError::Resize(e.to_string()))?;
        self.size = size;
        trace!(bridge = self.id, cols, rows, "PTY resized");
        Ok(())
    }

    /// Releases both ends and stops the writer. Idempotent.
    ///
    /// The reader thread exits once the last process holding the slave is gone.
    pub fn close(&mut self) {
        if self.master.is_none() {
            return;
        }
        self.input = None;
        self.slave = None;
        self.master = None;
        debug!(bridge = self.id, "PTY closed");
    }
}

impl Drop for PtyBridge {
    fn drop(&mut self) {
        self.close();
    }
}

fn spawn_reader(
    id: u64,
    mut reader: Box<dyn Read + Send>,
    output: mpsc::Sender<Vec<u8>>,
    chunk_bytes: usize,
) -> Result<(), PtyError> {
    thread::Builder::new()
        .name(format!("runcell-pty-read-{id}"))
        .spawn(move || {
            let mut buf = vec![0u8; chunk_bytes];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let chunk = buf.get(..n).map(<[u8]>::to_vec).unwrap_or_default();
                        if output.blocking_send(chunk).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    // EIO once every slave descriptor is closed
                    Err(_) => break,
                }
            }
            trace!(bridge = id, "PTY reader finished");
        })
        .map(|_| ())
        .map_err(|e| PtyError::Open(format!("reader thread: {e}")))
}

fn spawn_writer(
    id: u64,
    mut writer: Box<dyn Write + Send>,
    mut input: mpsc::UnboundedReceiver<Vec<u8>>,
) -> Result<(), PtyError> {
    thread::Builder::new()
        .name(format!("runcell-pty-write-{id}"))
        .spawn(move || {
            while let Some(data) = input.blocking_recv() {
                if let Err(e) = writer.write_all(&data).and_then(|()| writer.flush()) {
                    warn!(bridge = id, error = %e, "PTY write failed");
                    break;
                }
            }
            trace!(bridge = id, "PTY writer finished");
        })
        .map(|_| ())
        .map_err(|e| PtyError::Open(format!("writer thread: {e}")))
}

/// Sets echo and output newline translation on the terminal.
///
/// Mode changes on the master apply to the shared line discipline.
fn set_modes(fd: RawFd, echo: bool, translate_newlines: bool) -> std::io::Result<()> {
    let mut termios = std::mem::MaybeUninit::<libc::termios>::zeroed();
    // SAFETY: fd is a live pty master; termios is a valid out-pointer.
    if unsafe { libc::tcgetattr(fd, termios.as_mut_ptr()) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: tcgetattr succeeded and initialised the struct.
    let mut termios = unsafe { termios.assume_init() };

    if echo {
        termios.c_lflag |= libc::ECHO;
    } else {
        termios.c_lflag &= !libc::ECHO;
    }
    if translate_newlines {
        termios.c_oflag |= libc::ONLCR;
    } else {
        termios.c_oflag &= !libc::ONLCR;
    }

    // SAFETY: termios was produced by tcgetattr above.
    if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &termios) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn collect_until(output: &mut PtyOutput, needle: &[u8]) -> Vec<u8> {
        let mut seen = Vec::new();
        let _ = timeout(Duration::from_secs(5), async {
            while let Some(chunk) = output.recv().await {
                seen.extend_from_slice(&chunk);
                if seen.windows(needle.len()).any(|w| w == needle) {
                    break;
                }
            }
        })
        .await;
        seen
    }

    #[tokio::test]
    async fn test_output_is_verbatim() {
        let (bridge, mut output) = PtyBridge::open(&TerminalOptions::default()).unwrap();
        let mut cmd = CommandBuilder::new("/bin/sh");
        cmd.args(["-c", "printf 'hello\\n'"]);
        let mut child = bridge.spawn(cmd).unwrap();

        let seen = collect_until(&mut output, b"hello\n").await;
        assert!(seen.windows(6).any(|w| w == b"hello\n"), "{seen:?}");
        assert!(!seen.windows(7).any(|w| w == b"hello\r\n"));
        let _ = child.wait();
    }

    #[tokio::test]
    async fn test_input_reaches_process() {
        let options = TerminalOptions {
            echo: false,
            ..TerminalOptions::default()
        };
        let (bridge, mut output) = PtyBridge::open(&options).unwrap();
        let mut cmd = CommandBuilder::new("/bin/sh");
        cmd.args(["-c", "read line; echo \"got:$line\""]);
        let mut child = bridge.spawn(cmd).unwrap();

        bridge.write(b"abc\n".to_vec()).unwrap();
        let seen = collect_until(&mut output, b"got:abc").await;
        assert!(seen.windows(7).any(|w| w == b"got:abc"), "{seen:?}");
        let _ = child.wait();
    }

    #[tokio::test]
    async fn test_resize_and_size() {
        let (mut bridge, _output) = PtyBridge::open(&TerminalOptions::default()).unwrap();
        assert_eq!(bridge.size(), (80, 24));
        bridge.resize(120, 40).unwrap();
        assert_eq!(bridge.size(), (120, 40));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut bridge, mut output) = PtyBridge::open(&TerminalOptions::default()).unwrap();
        bridge.close();
        bridge.close();
        assert!(bridge.is_closed());
        assert!(matches!(bridge.write(b"x".to_vec()), Err(PtyError::Closed)));
        assert!(matches!(bridge.resize(10, 10), Err(PtyError::Closed)));

        // Reader drains to end once nothing holds the slave.
        let end = timeout(Duration::from_secs(5), async {
            while output.recv().await.is_some() {}
        })
        .await;
        assert!(end.is_ok());
    }
}
