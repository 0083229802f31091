//! Per-session workspace directories.
//!
//! Every session owns `<root>/<session-id>`, created with mode 0700 and
//! removed when the session ends. Nothing under the root survives a daemon
//! restart: leftovers are swept at startup.
//!
//! All functions here are synchronous; async callers run them on the
//! blocking pool.

mod path;

use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use runcell_core::files::sort_listing;
use runcell_core::{ErrorKind, FileEntry, FileKind, SessionId, SourceFile};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::WorkspaceConfig;

pub use path::{relative_path, NameRules};

#[derive(Debug, Error)]
pub enum WorkspaceError {
    /// The workspace root is missing or unwritable. Fatal to the daemon.
    #[error("workspace root unavailable: {root}: {reason}")]
    RootUnavailable { root: PathBuf, reason: String },

    #[error("workspace already exists: {0}")]
    AlreadyExists(PathBuf),

    #[error("workspace resources exhausted: {0}")]
    ResourceExhausted(String),

    #[error("invalid file name {name:?}: {reason}")]
    InvalidName { name: String, reason: String },

    #[error("file {name:?} is {size} bytes (max: {max})")]
    FileTooLarge { name: String, size: u64, max: u64 },

    #[error("too many files: {count} (max: {max})")]
    TooManyFiles { count: usize, max: usize },

    #[error("no such file or directory: {0:?}")]
    NoSuchFile(String),

    #[error("workspace I/O error: {0}")]
    Io(#[from] io::Error),
}

impl WorkspaceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
            Self::InvalidName { .. }
            | Self::FileTooLarge { .. }
            | Self::TooManyFiles { .. }
            | Self::NoSuchFile(_) => ErrorKind::InvalidInput,
            Self::RootUnavailable { .. } | Self::AlreadyExists(_) | Self::Io(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Returns true for errors that should stop the daemon.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::RootUnavailable { .. })
    }
}

/// Maps an OS error to a workspace error, singling out quota exhaustion.
fn classify(err: io::Error, context: &str) -> WorkspaceError {
    match err.raw_os_error() {
        Some(code) if code == libc::ENOSPC || code == libc::EDQUOT => {
            WorkspaceError::ResourceExhausted(format!("{context}: {err}"))
        }
        _ => WorkspaceError::Io(err),
    }
}

/// Most entries returned by one directory listing.
const MAX_LISTING_ENTRIES: usize = 1024;

/// Creates, fills, measures and destroys session workspaces under one root.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
    max_workspaces: usize,
    max_file_bytes: u64,
    max_files: usize,
    max_read_bytes: u64,
    names: NameRules,
    /// Same bounds without the reserved names; reads may see the artifact.
    read_names: NameRules,
}

impl WorkspaceManager {
    /// Creates a manager. `artifact_name` is reserved and cannot be written
    /// by submissions.
    pub fn new(config: &WorkspaceConfig, artifact_name: &str) -> Self {
        Self {
            root: config.root.clone(),
            max_workspaces: config.max_workspaces,
            max_file_bytes: config.max_file_bytes,
            max_files: config.max_files,
            max_read_bytes: config.max_read_bytes,
            names: NameRules {
                max_depth: config.max_path_depth,
                max_component_len: config.max_name_len,
                reserved: vec![artifact_name.to_string()],
            },
            read_names: NameRules {
                max_depth: config.max_path_depth,
                max_component_len: config.max_name_len,
                reserved: Vec::new(),
            },
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates the root directory if needed. Called once at startup.
    pub fn ensure_root(&self) -> Result<(), WorkspaceError> {
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&self.root)
            .map_err(|e| WorkspaceError::RootUnavailable {
                root: self.root.clone(),
                reason: e.to_string(),
            })?;
        self.check_root()
    }

    fn check_root(&self) -> Result<(), WorkspaceError> {
        let unavailable = |reason: String| WorkspaceError::RootUnavailable {
            root: self.root.clone(),
            reason,
        };
        let meta = fs::metadata(&self.root).map_err(|e| unavailable(e.to_string()))?;
        if !meta.is_dir() {
            return Err(unavailable("not a directory".to_string()));
        }
        if meta.permissions().readonly() {
            return Err(unavailable("read-only".to_string()));
        }
        Ok(())
    }

    /// Number of workspace directories currently under the root.
    pub fn count(&self) -> usize {
        fs::read_dir(&self.root)
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Creates `<root>/<session_id>` with mode 0700.
    pub fn create(&self, session_id: &SessionId) -> Result<PathBuf, WorkspaceError> {
        if !session_id.is_well_formed() {
            return Err(WorkspaceError::InvalidName {
                name: session_id.to_string(),
                reason: "session id is not a plain token".to_string(),
            });
        }

        self.check_root()?;

        let present = self.count();
        if present >= self.max_workspaces {
            return Err(WorkspaceError::ResourceExhausted(format!(
                "{present} workspaces on disk (max: {})",
                self.max_workspaces
            )));
        }

        let path = self.root.join(session_id.as_str());
        match DirBuilder::new().mode(0o700).create(&path) {
            Ok(()) => {
                debug!(session_id = %session_id, path = %path.display(), "Workspace created");
                Ok(path)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(WorkspaceError::AlreadyExists(path))
            }
            Err(e)
                if matches!(
                    e.raw_os_error(),
                    Some(libc::ENOENT) | Some(libc::EACCES) | Some(libc::EROFS)
                ) =>
            {
                Err(WorkspaceError::RootUnavailable {
                    root: self.root.clone(),
                    reason: e.to_string(),
                })
            }
            Err(e) => Err(classify(e, "create workspace")),
        }
    }

    /// Writes submitted files into a workspace.
    ///
    /// All names and sizes are checked before anything is written.
    /// `max_workspace_bytes` bounds the total bytes under the workspace,
    /// counting files already present. Returns the bytes written.
    pub fn write_submission(
        &self,
        workspace: &Path,
        files: &[SourceFile],
        max_workspace_bytes: u64,
    ) -> Result<u64, WorkspaceError> {
        if files.len() > self.max_files {
            return Err(WorkspaceError::TooManyFiles {
                count: files.len(),
                max: self.max_files,
            });
        }

        let mut planned = Vec::with_capacity(files.len());
        for file in files {
            let relative =
                relative_path(&file.name, &self.names).map_err(|reason| {
                    WorkspaceError::InvalidName {
                        name: file.name.clone(),
                        reason,
                    }
                })?;
            let size = file.content.len() as u64;
            if size > self.max_file_bytes {
                return Err(WorkspaceError::FileTooLarge {
                    name: file.name.clone(),
                    size,
                    max: self.max_file_bytes,
                });
            }
            // Refuse before create_dir_all can follow a planted link.
            check_no_symlinks(workspace, &relative, false).map_err(|reason| {
                WorkspaceError::InvalidName {
                    name: file.name.clone(),
                    reason,
                }
            })?;
            planned.push((workspace.join(relative), file));
        }

        let existing = self.usage(workspace);
        let replaced: u64 = planned
            .iter()
            .filter_map(|(target, _)| fs::symlink_metadata(target).ok())
            .filter(|meta| meta.is_file())
            .map(|meta| meta.len())
            .sum();
        let incoming: u64 = files.iter().map(|f| f.content.len() as u64).sum();
        let total = existing.saturating_sub(replaced).saturating_add(incoming);
        if total > max_workspace_bytes {
            return Err(WorkspaceError::ResourceExhausted(format!(
                "workspace would hold {total} bytes (max: {max_workspace_bytes})"
            )));
        }

        let canonical_workspace = workspace.canonicalize()?;
        for (target, file) in &planned {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| classify(e, "create directory"))?;
                // A program run earlier in this session may have planted
                // symlinks; the resolved parent must still be inside.
                if !parent.canonicalize()?.starts_with(&canonical_workspace) {
                    return Err(WorkspaceError::InvalidName {
                        name: file.name.clone(),
                        reason: "resolves outside the workspace".to_string(),
                    });
                }
            }
            if fs::symlink_metadata(target)
                .map(|m| m.file_type().is_symlink())
                .unwrap_or(false)
            {
                fs::remove_file(target)?;
            }
            fs::write(target, file.content.as_bytes()).map_err(|e| classify(e, "write file"))?;
        }

        debug!(
            workspace = %workspace.display(),
            files = files.len(),
            bytes = incoming,
            "Submission written"
        );
        Ok(incoming)
    }

    /// Lists one directory of a workspace, folders first.
    ///
    /// `dir` of `None`, `""` or `"."` is the workspace itself. Symbolic links
    /// are listed as links and never traversed.
    pub fn list_files(
        &self,
        workspace: &Path,
        dir: Option<&str>,
    ) -> Result<Vec<FileEntry>, WorkspaceError> {
        let target = match dir.map(str::trim) {
            None | Some("") | Some(".") => workspace.to_path_buf(),
            Some(dir) => workspace.join(self.read_path(workspace, dir, true)?),
        };

        let entries = match fs::read_dir(&target) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(WorkspaceError::NoSuchFile(dir.unwrap_or(".").to_string()));
            }
            Err(e) if e.raw_os_error() == Some(libc::ENOTDIR) => {
                return Err(WorkspaceError::InvalidName {
                    name: dir.unwrap_or(".").to_string(),
                    reason: "not a directory".to_string(),
                });
            }
            Err(e) => return Err(WorkspaceError::Io(e)),
        };

        let mut listing = Vec::new();
        for entry in entries.filter_map(Result::ok) {
            if listing.len() >= MAX_LISTING_ENTRIES {
                debug!(dir = %target.display(), "Listing truncated");
                break;
            }
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            let (kind, size) = if file_type.is_symlink() {
                (FileKind::Link, 0)
            } else if file_type.is_dir() {
                (FileKind::Folder, 0)
            } else {
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                (FileKind::File, size)
            };
            listing.push(FileEntry::new(
                entry.file_name().to_string_lossy(),
                kind,
                size,
            ));
        }
        sort_listing(&mut listing);
        Ok(listing)
    }

    /// Reads one regular file of a workspace.
    ///
    /// Links are refused anywhere on the path, the file itself included.
    /// Files above the configured read bound are refused whole.
    pub fn read_file(&self, workspace: &Path, name: &str) -> Result<Vec<u8>, WorkspaceError> {
        let relative = self.read_path(workspace, name, true)?;
        let invalid = |reason: &str| WorkspaceError::InvalidName {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        let file = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NOFOLLOW)
            .open(workspace.join(&relative));
        let file: File = match file {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(WorkspaceError::NoSuchFile(name.to_string()));
            }
            Err(e) if e.raw_os_error() == Some(libc::ELOOP) => {
                return Err(invalid("is a symbolic link"));
            }
            Err(e) => return Err(WorkspaceError::Io(e)),
        };

        let meta = file.metadata()?;
        if !meta.is_file() {
            return Err(invalid("not a regular file"));
        }
        if meta.len() > self.max_read_bytes {
            return Err(WorkspaceError::FileTooLarge {
                name: name.to_string(),
                size: meta.len(),
                max: self.max_read_bytes,
            });
        }

        let mut data = Vec::with_capacity(meta.len() as usize);
        // The file may grow after the size check.
        file.take(self.max_read_bytes.saturating_add(1))
            .read_to_end(&mut data)?;
        if data.len() as u64 > self.max_read_bytes {
            return Err(WorkspaceError::FileTooLarge {
                name: name.to_string(),
                size: data.len() as u64,
                max: self.max_read_bytes,
            });
        }
        Ok(data)
    }

    fn read_path(
        &self,
        workspace: &Path,
        name: &str,
        include_last: bool,
    ) -> Result<PathBuf, WorkspaceError> {
        let invalid = |reason: String| WorkspaceError::InvalidName {
            name: name.to_string(),
            reason,
        };
        let relative = relative_path(name, &self.read_names).map_err(invalid)?;
        check_no_symlinks(workspace, &relative, include_last).map_err(invalid)?;
        Ok(relative)
    }

    /// Total bytes of regular files under a workspace. Symlinks are not followed.
    pub fn usage(&self, workspace: &Path) -> u64 {
        fn walk(dir: &Path) -> u64 {
            let Ok(entries) = fs::read_dir(dir) else {
                return 0;
            };
            entries
                .filter_map(Result::ok)
                .map(|entry| match entry.metadata() {
                    Ok(meta) if meta.is_dir() => walk(&entry.path()),
                    Ok(meta) if meta.is_file() => meta.len(),
                    _ => 0,
                })
                .sum()
        }
        walk(workspace)
    }

    /// Removes a workspace recursively.
    ///
    /// A missing path is success. Paths outside the root are refused. Never
    /// fails; problems are logged.
    pub fn destroy(&self, workspace: &Path) {
        if workspace == self.root || !workspace.starts_with(&self.root) {
            warn!(
                path = %workspace.display(),
                root = %self.root.display(),
                "Refusing to remove path outside workspace root"
            );
            return;
        }

        match fs::remove_dir_all(workspace) {
            Ok(()) => debug!(path = %workspace.display(), "Workspace removed"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                // Programs may chmod their own directories.
                relax_permissions(workspace);
                if let Err(e) = fs::remove_dir_all(workspace) {
                    warn!(path = %workspace.display(), error = %e, "Failed to remove workspace");
                }
            }
            Err(e) => warn!(path = %workspace.display(), error = %e, "Failed to remove workspace"),
        }
    }

    /// Removes every session directory left under the root. Returns how many.
    pub fn sweep_orphans(&self) -> usize {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return 0;
        };

        let mut removed = 0;
        for entry in entries.filter_map(Result::ok) {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if is_dir && SessionId::new(name).is_well_formed() {
                self.destroy(&entry.path());
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, root = %self.root.display(), "Swept orphaned workspaces");
        }
        removed
    }
}

/// Refuses a relative path that passes through a symbolic link.
///
/// Walks the existing prefix of `relative` under `workspace`; the walk stops
/// at the first component that does not exist yet. The last component is
/// checked only when `include_last` is set.
fn check_no_symlinks(workspace: &Path, relative: &Path, include_last: bool) -> Result<(), String> {
    let components: Vec<Component<'_>> = relative.components().collect();
    let checked = if include_last {
        components.len()
    } else {
        components.len().saturating_sub(1)
    };

    let mut current = workspace.to_path_buf();
    for component in components.iter().take(checked) {
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err("passes through a symbolic link".to_string());
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.to_string()),
        }
    }
    Ok(())
}

fn relax_permissions(dir: &Path) {
    let _ = fs::set_permissions(dir, fs::Permissions::from_mode(0o700));
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.filter_map(Result::ok) {
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                relax_permissions(&entry.path());
            }
        }
    }
}
