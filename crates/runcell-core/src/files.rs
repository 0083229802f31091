//! Entries of a session workspace listing.

use serde::{Deserialize, Serialize};

/// What a directory entry is. Symbolic links are reported, never followed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Folder,
    File,
    Link,
}

/// One entry of a workspace directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub kind: FileKind,
    /// Size in bytes; zero for folders and links.
    #[serde(default)]
    pub size: u64,
}

impl FileEntry {
    pub fn new(name: impl Into<String>, kind: FileKind, size: u64) -> Self {
        Self {
            name: name.into(),
            kind,
            size,
        }
    }
}

/// Orders a listing with folders first, then by name.
pub fn sort_listing(entries: &mut [FileEntry]) {
    entries.sort_by(|a, b| {
        let a_rank = a.kind != FileKind::Folder;
        let b_rank = b.kind != FileKind::Folder;
        a_rank.cmp(&b_rank).then_with(|| a.name.cmp(&b.name))
    });
}
