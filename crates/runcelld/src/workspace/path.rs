//! Validation of client-supplied file names.
//!
//! A name becomes a path relative to the workspace. Only plain components
//! are accepted; anything that could climb out of the workspace is refused
//! before the filesystem is touched.

use std::path::{Component, Path, PathBuf};

/// Bounds applied to submitted file names.
#[derive(Debug, Clone)]
pub struct NameRules {
    pub max_depth: usize,
    pub max_component_len: usize,
    /// Names that may not be written (the build artifact).
    pub reserved: Vec<String>,
}

/// Turns a submitted name into a workspace-relative path.
///
/// Returns the reason on rejection.
pub fn relative_path(name: &str, rules: &NameRules) -> Result<PathBuf, String> {
    if name.is_empty() {
        return Err("empty name".to_string());
    }
    if name.contains('\0') {
        return Err("name contains NUL".to_string());
    }

    let mut normalized = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => {
                if part.len() > rules.max_component_len {
                    return Err(format!(
                        "component longer than {} bytes",
                        rules.max_component_len
                    ));
                }
                normalized.push(part);
            }
            Component::CurDir => {}
            Component::ParentDir => return Err("parent directory reference".to_string()),
            Component::RootDir | Component::Prefix(_) => {
                return Err("absolute path".to_string())
            }
        }
    }

    let depth = normalized.components().count();
    if depth == 0 {
        return Err("name has no file component".to_string());
    }
    if depth > rules.max_depth {
        return Err(format!("nested deeper than {}", rules.max_depth));
    }
    if rules
        .reserved
        .iter()
        .any(|reserved| normalized == Path::new(reserved))
    {
        return Err("name is reserved for the build output".to_string());
    }

    Ok(normalized)
}
