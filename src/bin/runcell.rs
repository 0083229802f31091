//! runcell - compile, run, and debug programs in a runcell daemon session
//!
//! # Usage
//!
//! ```text
//! runcell compile main.cpp util.cpp --flag=-O2   # compile only, print diagnostics
//! runcell run main.cpp                           # compile, then attach to the program
//! runcell debug main.cpp                         # compile, then attach to gdb
//! runcell ping                                   # check the daemon is answering
//! ```
//!
//! While attached, `Ctrl-]` closes the session and returns.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::process;
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use runcell_client::{attach, daemon, AttachMode, ClientConfig, DaemonClient};
use runcell_core::{OutputKind, SessionState, SourceFile, Submission};
use runcell_protocol::DaemonMessage;

/// Environment variable naming the client log file. Unset means no logging.
const ENV_LOG: &str = "RUNCELL_LOG";

// ============================================================================
// CLI Arguments
// ============================================================================

/// runcell - sandboxed compile/run/debug sessions
#[derive(Parser, Debug)]
#[command(name = "runcell", version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Daemon socket (defaults to $RUNCELL_SOCKET or /tmp/runcell.sock)
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    /// Do not start the daemon when it is not running
    #[arg(long, global = true)]
    no_start: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compile sources and print diagnostics
    Compile(SourceArgs),
    /// Compile sources and run the program with this terminal attached
    Run(SourceArgs),
    /// Compile sources and start the debugger with this terminal attached
    Debug(SourceArgs),
    /// Check that the daemon is answering
    Ping {
        #[arg(short, long, default_value_t = 1)]
        count: u64,
    },
}

#[derive(ClapArgs, Debug)]
struct SourceArgs {
    /// Source files; each is stored under its file name
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Extra compiler flag (repeatable), e.g. --flag=-O2
    #[arg(long = "flag", allow_hyphen_values = true)]
    flags: Vec<String>,

    /// Compile only this file
    #[arg(long)]
    entry: Option<String>,
}

impl SourceArgs {
    fn submission(&self) -> Result<Submission> {
        let mut files = Vec::with_capacity(self.files.len());
        for path in &self.files {
            let name = path
                .file_name()
                .and_then(|n| n.to_str())
                .with_context(|| format!("Not a file name: {}", path.display()))?;
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            files.push(SourceFile::new(name, content));
        }

        let mut submission = Submission::new(files).with_flags(self.flags.clone());
        if let Some(entry) = &self.entry {
            submission = submission.with_entry(entry.clone());
        }
        Ok(submission)
    }
}

// ============================================================================
// Logging Setup
// ============================================================================

/// Logs go to the file named by `RUNCELL_LOG`, never to the terminal.
fn init_logging() {
    let Some(path) = std::env::var_os(ENV_LOG).map(PathBuf::from) else {
        return;
    };
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    let file = match OpenOptions::new().create(true).append(true).open(&path) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("Warning: Failed to open log file {}: {e}", path.display());
            return;
        }
    };

    let filter = EnvFilter::from_default_env().add_directive(
        "runcell_client=info"
            .parse()
            .unwrap_or_else(|_| tracing_subscriber::filter::Directive::from(tracing::Level::INFO)),
    );
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .init();
}

// ============================================================================
// Commands
// ============================================================================

async fn connect(args: &Args) -> Result<DaemonClient> {
    let mut config = ClientConfig::default();
    if let Some(socket) = &args.socket {
        config.socket_path = socket.clone();
    }
    if !args.no_start {
        if let Err(e) = daemon::ensure_daemon_running(&config.socket_path) {
            bail!("Failed to ensure daemon is running: {e}");
        }
    }
    Ok(DaemonClient::connect(&config).await?)
}

/// Prints compiler diagnostics and any output that arrives while compiling.
fn print_event(message: &DaemonMessage) {
    if let DaemonMessage::Output { kind, data, .. } = message {
        let mut stderr = std::io::stderr();
        let _ = match kind {
            OutputKind::Diagnostic => writeln!(stderr, "{}", String::from_utf8_lossy(data).trim_end()),
            OutputKind::Stdout | OutputKind::Stderr => stderr.write_all(data),
            OutputKind::StateChange | OutputKind::ExitStatus => Ok(()),
        };
    }
}

/// Opens a session and compiles. Returns the client and session when the
/// build is ready, or exits with status 1 when it failed.
async fn build(args: &Args, sources: &SourceArgs) -> Result<(DaemonClient, runcell_core::SessionId)> {
    let submission = sources.submission()?;
    let mut client = connect(args).await?;
    let session_id = client.open_session().await?;
    info!(%session_id, files = submission.files.len(), "Compiling");

    let state = client.compile(&session_id, submission, print_event).await?;
    if state != SessionState::Ready {
        eprintln!("Compilation failed.");
        process::exit(1);
    }
    Ok((client, session_id))
}

async fn attach_to(args: &Args, sources: &SourceArgs, mode: AttachMode) -> Result<()> {
    let (client, session_id) = build(args, sources).await?;
    let outcome = attach(client, &session_id, mode).await?;
    info!(state = %outcome.state, reason = %outcome.reason, "Detached");

    if let Some(status) = &outcome.exit_status {
        if !status.success() {
            eprintln!("[runcell] {status}");
        }
    } else if !outcome.detached {
        eprintln!("[runcell] session {} ({})", outcome.state, outcome.reason);
    }
    // A blocked stdin read would hold the runtime open.
    process::exit(outcome.exit_code());
}

async fn ping(args: &Args, count: u64) -> Result<()> {
    let mut client = connect(args).await?;
    for seq in 1..=count {
        let latency = client.ping(seq).await?;
        println!("pong seq={seq} time={:.2}ms", latency.as_secs_f64() * 1000.0);
    }
    client.disconnect().await?;
    Ok(())
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging();

    match &args.command {
        Command::Compile(sources) => {
            let (client, session_id) = build(&args, sources).await?;
            info!(%session_id, "Compiled");
            client.disconnect().await?;
            eprintln!("Compiled successfully.");
            Ok(())
        }
        Command::Run(sources) => attach_to(&args, sources, AttachMode::Run).await,
        Command::Debug(sources) => attach_to(&args, sources, AttachMode::Debug).await,
        Command::Ping { count } => ping(&args, *count).await,
    }
}
