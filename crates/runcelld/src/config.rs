//! Daemon configuration loaded from TOML with environment overrides.
//!
//! Lookup order:
//! 1. An explicit path (`runcelld start --config <path>`)
//! 2. `RUNCELL_CONFIG`
//! 3. `<config_dir>/runcell/config.toml`
//! 4. Built-in defaults
//!
//! After loading, `RUNCELL_SOCKET`, `RUNCELL_WORKSPACE_ROOT` and
//! `RUNCELL_MAX_SESSIONS` override the corresponding fields.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use runcell_core::SessionLimits;
use runcell_protocol::MAX_MESSAGE_SIZE;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Default socket path for the reference transport.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/runcell.sock";

/// Largest file read that still fits one message once base64-encoded.
pub const MAX_READ_BYTES_CEILING: u64 = (MAX_MESSAGE_SIZE as u64 / 4) * 3 - 4096;

pub const ENV_CONFIG: &str = "RUNCELL_CONFIG";
pub const ENV_SOCKET: &str = "RUNCELL_SOCKET";
pub const ENV_WORKSPACE_ROOT: &str = "RUNCELL_WORKSPACE_ROOT";
pub const ENV_MAX_SESSIONS: &str = "RUNCELL_MAX_SESSIONS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid value for {name}: {value}")]
    InvalidEnv { name: &'static str, value: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DaemonConfig {
    pub server: ServerConfig,
    pub admission: AdmissionConfig,
    pub limits: LimitsConfig,
    pub workspace: WorkspaceConfig,
    pub terminal: TerminalConfig,
    pub toolchain: ToolchainConfig,
    pub supervisor: SupervisorConfig,
    pub monitor: MonitorConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub socket_path: PathBuf,
    /// Maximum concurrent client connections.
    pub max_clients: usize,
    /// Idle connections are dropped after this many seconds without a message.
    pub read_timeout_secs: u64,
    pub write_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            max_clients: 64,
            read_timeout_secs: 30 * 60,
            write_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Maximum live sessions, `Created` ones included.
    pub max_sessions: usize,
    /// How many retired session ids are remembered for idempotent close.
    pub retired_memory: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 16,
            retired_memory: 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub idle_timeout_secs: u64,
    pub wall_clock_timeout_secs: u64,
    pub max_output_bytes: u64,
    pub max_processes: usize,
    pub max_workspace_bytes: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        let limits = SessionLimits::default();
        Self {
            idle_timeout_secs: limits.idle_timeout.as_secs(),
            wall_clock_timeout_secs: limits.wall_clock_timeout.as_secs(),
            max_output_bytes: limits.max_output_bytes,
            max_processes: limits.max_processes,
            max_workspace_bytes: limits.max_workspace_bytes,
        }
    }
}

impl LimitsConfig {
    pub fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            wall_clock_timeout: Duration::from_secs(self.wall_clock_timeout_secs),
            max_output_bytes: self.max_output_bytes,
            max_processes: self.max_processes,
            max_workspace_bytes: self.max_workspace_bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub root: PathBuf,
    /// Maximum session directories present under the root at once.
    pub max_workspaces: usize,
    pub max_file_bytes: u64,
    pub max_files: usize,
    pub max_path_depth: usize,
    pub max_name_len: usize,
    /// Largest workspace file a client may read back.
    pub max_read_bytes: u64,
    /// Remove leftover workspaces from a previous run at startup.
    pub sweep_on_start: bool,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: env::temp_dir().join("runcell").join("workspaces"),
            max_workspaces: 64,
            max_file_bytes: 1024 * 1024,
            max_files: 64,
            max_path_depth: 8,
            max_name_len: 255,
            max_read_bytes: 512 * 1024,
            sweep_on_start: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    pub cols: u16,
    pub rows: u16,
    /// Echo input back through the terminal.
    pub echo: bool,
    /// Translate `\n` to `\r\n` on output (ONLCR).
    pub translate_newlines: bool,
    /// `TERM` given to attached processes.
    pub term: String,
    pub read_chunk_bytes: usize,
    /// Output drain after a process exits: stop after this much silence...
    pub settle_quiet_ms: u64,
    /// ...or after this long in total.
    pub settle_max_ms: u64,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            cols: 80,
            rows: 24,
            echo: true,
            translate_newlines: false,
            term: "xterm-256color".to_string(),
            read_chunk_bytes: 4096,
            settle_quiet_ms: 50,
            settle_max_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainConfig {
    pub compiler: String,
    /// Flags placed before client flags on every compile.
    pub default_flags: Vec<String>,
    /// Extensions compiled when a submission names no entry.
    pub source_extensions: Vec<String>,
    /// File name of the build output inside the workspace.
    pub artifact_name: String,
    pub debugger: String,
    pub debugger_args: Vec<String>,
    pub max_flags: usize,
    pub max_flag_len: usize,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            compiler: "g++".to_string(),
            default_flags: vec!["-g".to_string()],
            source_extensions: ["c", "cc", "cpp", "cxx", "c++"]
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            artifact_name: "a.out".to_string(),
            debugger: "gdb".to_string(),
            debugger_args: vec!["-q".to_string()],
            max_flags: 32,
            max_flag_len: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Time between SIGTERM and SIGKILL.
    pub kill_grace_ms: u64,
    /// How often the process-count census runs.
    pub census_interval_ms: u64,
    /// `PATH` given to spawned processes and used to resolve executables.
    pub path: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            kill_grace_ms: 1000,
            census_interval_ms: 250,
            path: "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
        }
    }
}

impl SupervisorConfig {
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn census_interval(&self) -> Duration {
        Duration::from_millis(self.census_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub memory_warn_mb: u64,
    pub cpu_warn_percent: f32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 5,
            memory_warn_mb: 256,
            cpu_warn_percent: 50.0,
        }
    }
}

impl DaemonConfig {
    /// Loads configuration following the lookup order, then applies
    /// environment overrides and validates.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = explicit
            .map(Path::to_path_buf)
            .or_else(|| env::var_os(ENV_CONFIG).map(PathBuf::from))
            .or_else(|| {
                dirs::config_dir()
                    .map(|d| d.join("runcell").join("config.toml"))
                    .filter(|p| p.exists())
            });

        let mut config = match path {
            Some(path) => {
                info!(path = %path.display(), "Loading configuration");
                Self::from_file(&path)?
            }
            None => {
                debug!("No configuration file found, using defaults");
                Self::default()
            }
        };

        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(socket) = env::var_os(ENV_SOCKET) {
            self.server.socket_path = PathBuf::from(socket);
        }
        if let Some(root) = env::var_os(ENV_WORKSPACE_ROOT) {
            self.workspace.root = PathBuf::from(root);
        }
        if let Ok(value) = env::var(ENV_MAX_SESSIONS) {
            self.admission.max_sessions =
                value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                    name: ENV_MAX_SESSIONS,
                    value,
                })?;
        }
        Ok(())
    }

    /// Rejects zero bounds and inconsistent limits.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero: [(&str, u64); 10] = [
            ("admission.max_sessions", self.admission.max_sessions as u64),
            ("limits.idle_timeout_secs", self.limits.idle_timeout_secs),
            ("limits.wall_clock_timeout_secs", self.limits.wall_clock_timeout_secs),
            ("limits.max_output_bytes", self.limits.max_output_bytes),
            ("limits.max_processes", self.limits.max_processes as u64),
            ("workspace.max_workspaces", self.workspace.max_workspaces as u64),
            ("workspace.max_file_bytes", self.workspace.max_file_bytes),
            ("workspace.max_read_bytes", self.workspace.max_read_bytes),
            ("terminal.cols", u64::from(self.terminal.cols)),
            ("terminal.rows", u64::from(self.terminal.rows)),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
        }

        if self.workspace.max_file_bytes > self.limits.max_workspace_bytes {
            return Err(ConfigError::Invalid(
                "workspace.max_file_bytes exceeds limits.max_workspace_bytes".to_string(),
            ));
        }
        if self.workspace.max_read_bytes > MAX_READ_BYTES_CEILING {
            return Err(ConfigError::Invalid(format!(
                "workspace.max_read_bytes exceeds {MAX_READ_BYTES_CEILING}"
            )));
        }
        if self.workspace.max_workspaces < self.admission.max_sessions {
            return Err(ConfigError::Invalid(
                "workspace.max_workspaces is below admission.max_sessions".to_string(),
            ));
        }
        if !self.workspace.root.is_absolute() {
            return Err(ConfigError::Invalid("workspace.root must be absolute".to_string()));
        }
        if self.toolchain.compiler.is_empty() || self.toolchain.artifact_name.is_empty() {
            return Err(ConfigError::Invalid(
                "toolchain.compiler and toolchain.artifact_name must be set".to_string(),
            ));
        }
        if self.toolchain.source_extensions.is_empty() {
            return Err(ConfigError::Invalid(
                "toolchain.source_extensions must not be empty".to_string(),
            ));
        }
        if self.terminal.settle_quiet_ms > self.terminal.settle_max_ms {
            return Err(ConfigError::Invalid(
                "terminal.settle_quiet_ms exceeds terminal.settle_max_ms".to_string(),
            ));
        }
        Ok(())
    }
}
