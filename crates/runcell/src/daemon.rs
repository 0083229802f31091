//! Daemon process management.
//!
//! Locates the daemon's PID file, checks whether it is running, and starts
//! it in the background when a command needs it.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

/// Directory holding the PID file and daemon log.
pub fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("runcell")
}

/// Returns the path to the daemon PID file.
pub fn pid_file_path() -> PathBuf {
    state_dir().join("runcelld.pid")
}

/// Returns the path to the daemon log used in background mode.
pub fn log_file_path() -> PathBuf {
    state_dir().join("runcelld.log")
}

/// Reads the PID from a PID file, if it exists and parses.
pub fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Checks if a process with the given PID is running.
pub fn is_process_running(pid: u32) -> bool {
    PathBuf::from(format!("/proc/{pid}")).exists()
}

/// Checks if the daemon is currently running.
pub fn is_daemon_running() -> bool {
    read_pid(&pid_file_path()).is_some_and(is_process_running)
}

/// Starts the daemon in the background.
///
/// Spawns `runcelld start -d`, preferring the binary next to the current one.
fn spawn_daemon(socket: &Path) -> std::io::Result<()> {
    let runcelld = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|d| d.join("runcelld")))
        .filter(|p| p.exists())
        .unwrap_or_else(|| PathBuf::from("runcelld"));

    debug!(path = %runcelld.display(), "Starting daemon");

    Command::new(&runcelld)
        .args(["start", "-d", "--socket"])
        .arg(socket)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;

    Ok(())
}

/// Ensures the daemon is running and listening on `socket`, starting it if
/// necessary.
///
/// Returns Err with a message if the daemon could not be started.
pub fn ensure_daemon_running(socket: &Path) -> Result<(), String> {
    if is_daemon_running() && socket.exists() {
        debug!("Daemon already running");
        return Ok(());
    }

    info!("Daemon not running, starting it...");
    spawn_daemon(socket).map_err(|e| format!("Failed to start daemon: {e}"))?;

    // Up to 3 seconds for the socket to appear.
    for i in 0..30 {
        thread::sleep(Duration::from_millis(100));
        if socket.exists() {
            info!(attempts = i + 1, "Daemon started successfully");
            return Ok(());
        }
    }

    Err("Daemon failed to start within 3 seconds".to_string())
}
