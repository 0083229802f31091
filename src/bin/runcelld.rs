//! runcell Daemon - Session orchestrator for sandboxed compile/run/debug
//!
//! This binary runs the session orchestrator behind a Unix socket. Each
//! client connection can open sessions, submit sources, and attach to the
//! resulting program or debugger through a pseudo-terminal.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (foreground)
//! runcelld start
//!
//! # Start the daemon (background/daemonized)
//! runcelld start -d
//!
//! # Stop the daemon
//! runcelld stop
//!
//! # Check daemon status
//! runcelld status
//! ```

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use runcell_client::daemon::{is_process_running, log_file_path, pid_file_path, read_pid};
use runcelld::config::DaemonConfig;
use runcelld::monitor::spawn_monitor_task;
use runcelld::orchestrator::spawn_orchestrator;
use runcelld::server::DaemonServer;

/// runcell daemon - sandboxed compile/run/debug sessions
#[derive(Parser, Debug)]
#[command(name = "runcelld", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,

        /// Configuration file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Socket path, overriding the configuration
        #[arg(long)]
        socket: Option<PathBuf>,
    },
    /// Stop the running daemon
    Stop,
    /// Show daemon status
    Status {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn write_pid() -> Result<()> {
    let path = pid_file_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create state directory")?;
    }
    let mut file = File::create(&path).context("Failed to create PID file")?;
    write!(file, "{}", process::id()).context("Failed to write PID")?;
    Ok(())
}

fn remove_pid_file() {
    let _ = fs::remove_file(pid_file_path());
}

fn is_daemon_running() -> Option<u32> {
    if let Some(pid) = read_pid(&pid_file_path()) {
        if is_process_running(pid) {
            return Some(pid);
        }
        remove_pid_file();
    }
    None
}

fn stop_daemon(pid: u32) -> Result<()> {
    let pid = i32::try_from(pid).context("PID out of range")?;
    // SAFETY: kill(2) with a plain pid and signal has no memory effects.
    let result = unsafe { libc::kill(pid, libc::SIGTERM) };
    if result != 0 {
        bail!("Failed to send SIGTERM to process {pid}");
    }
    Ok(())
}

fn load_config(path: Option<&Path>, socket: Option<PathBuf>) -> Result<DaemonConfig> {
    let mut config = DaemonConfig::load(path).context("Failed to load configuration")?;
    if let Some(socket) = socket {
        config.server.socket_path = socket;
    }
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();

    let command = args.command.unwrap_or(Command::Start {
        daemon: false,
        config: None,
        socket: None,
    });

    match command {
        Command::Start {
            daemon,
            config,
            socket,
        } => {
            if let Some(pid) = is_daemon_running() {
                eprintln!("Daemon is already running (PID {pid})");
                eprintln!("Use 'runcelld stop' to stop it first.");
                process::exit(1);
            }

            // Load before forking so configuration errors reach the terminal.
            let config = load_config(config.as_deref(), socket)?;

            if daemon {
                daemonize()?;
            }

            write_pid()?;

            let result = run_daemon(config);

            remove_pid_file();

            result
        }
        Command::Stop => {
            if let Some(pid) = is_daemon_running() {
                println!("Stopping daemon (PID {pid})...");
                stop_daemon(pid)?;

                // Sessions get their kill grace period before the daemon exits.
                for _ in 0..100 {
                    if !is_process_running(pid) {
                        println!("Daemon stopped.");
                        return Ok(());
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }

                eprintln!("Daemon did not stop within 10 seconds.");
                process::exit(1);
            } else {
                println!("Daemon is not running.");
                Ok(())
            }
        }
        Command::Status { config } => {
            if let Some(pid) = is_daemon_running() {
                println!("Daemon is running (PID {pid})");

                let config = load_config(config.as_deref(), None)?;
                if config.server.socket_path.exists() {
                    println!("Socket: {}", config.server.socket_path.display());
                }
                println!("Workspaces: {}", config.workspace.root.display());
                println!("Max sessions: {}", config.admission.max_sessions);

                Ok(())
            } else {
                println!("Daemon is not running.");
                process::exit(1);
            }
        }
    }
}

fn daemonize() -> Result<()> {
    use daemonize::Daemonize;

    let log_path = log_file_path();

    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = stdout
        .try_clone()
        .context("Failed to create log file for stderr")?;

    Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr)
        .start()
        .context("Failed to daemonize")?;

    Ok(())
}

#[tokio::main]
async fn run_daemon(config: DaemonConfig) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("runcelld=info".parse()?)
                .add_directive("runcell_core=info".parse()?)
                .add_directive("runcell_protocol=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "runcell daemon starting"
    );

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let orchestrator = spawn_orchestrator(&config);
    let workspaces = &orchestrator.context().workspaces;
    workspaces
        .ensure_root()
        .context("Workspace root is unavailable")?;
    if config.workspace.sweep_on_start {
        let swept = workspaces.sweep_orphans();
        if swept > 0 {
            warn!(swept, "Removed workspaces left by a previous run");
        }
    }
    info!(
        max_sessions = config.admission.max_sessions,
        root = %workspaces.root().display(),
        "Session orchestrator started"
    );

    // Losing the workspace root stops the daemon.
    let fatal = orchestrator.fatal().clone();
    let fatal_token = cancel_token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = fatal.cancelled() => {
                error!("Orchestrator hit a fatal error, shutting down");
                fatal_token.cancel();
            }
            _ = fatal_token.cancelled() => {}
        }
    });

    if config.monitor.enabled {
        let _monitor_handle = spawn_monitor_task(
            config.monitor.clone(),
            orchestrator.clone(),
            cancel_token.clone(),
        );
        info!("Resource monitor started");
    }

    let server = DaemonServer::new(&config.server, orchestrator.clone(), cancel_token.clone());
    info!(socket = %server.socket_path().display(), "Starting server");

    let served = server.run().await;
    cancel_token.cancel();

    let closed = orchestrator.shutdown().await;
    info!(closed, "runcell daemon stopped");

    if let Err(e) = served {
        error!(error = %e, "Server error");
        return Err(e.into());
    }
    if orchestrator.fatal().is_cancelled() {
        bail!("Workspace root became unavailable");
    }
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT");
        }
    }

    Ok(())
}
