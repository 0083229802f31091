//! User-supplied source files and compiler flags.

use serde::{Deserialize, Serialize};

use crate::{DomainError, DomainResult};

/// Optimisation levels accepted after `-O`.
const OPTIMIZATION_LEVELS: &[&str] = &["", "0", "1", "2", "3", "s", "g", "z", "fast"];

/// Standalone flags accepted verbatim.
const PLAIN_FLAGS: &[&str] = &["-w", "-pedantic", "-pedantic-errors", "-ansi", "-pthread", "-static"];

/// `-f` features that write or load files named outside the command line.
const DENIED_FEATURE_PREFIXES: &[&str] = &[
    "plugin",
    "profile",
    "auto-profile",
    "dump",
    "save-optimization-record",
    "callgraph-info",
    "record-gcc-switches",
];

/// Returns true for characters allowed in option words like `c++17` or `no-rtti`.
fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '+' | '.')
}

fn is_word(s: &str) -> bool {
    !s.is_empty() && s.chars().all(is_word_char)
}

/// A word, optionally followed by `=` and another word.
fn is_option_value(s: &str) -> bool {
    s.split_once('=')
        .map_or(is_word(s), |(name, value)| is_word(name) && is_word(value))
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Checks one flag against the allow-list.
///
/// Only options that cannot name a file are accepted: language standard,
/// optimisation, warnings, macros, debug info, libraries by name, machine
/// and feature switches. Values never contain a path separator.
fn is_allowed_flag(flag: &str) -> bool {
    if flag.contains(['/', '\\', ',', '@']) || flag.chars().any(char::is_whitespace) {
        return false;
    }
    if PLAIN_FLAGS.contains(&flag) {
        return true;
    }

    if let Some(standard) = flag.strip_prefix("-std=") {
        return is_word(standard);
    }
    if let Some(level) = flag.strip_prefix("-O") {
        return OPTIMIZATION_LEVELS.contains(&level);
    }
    if let Some(debug) = flag.strip_prefix("-g") {
        return debug.is_empty() || is_word(debug);
    }
    if let Some(warning) = flag.strip_prefix("-W") {
        return is_option_value(warning);
    }
    if let Some(define) = flag.strip_prefix("-D") {
        return match define.split_once('=') {
            Some((name, _value)) => is_identifier(name),
            None => is_identifier(define),
        };
    }
    if let Some(name) = flag.strip_prefix("-U") {
        return is_identifier(name);
    }
    if let Some(library) = flag.strip_prefix("-l") {
        return is_word(library);
    }
    if let Some(machine) = flag.strip_prefix("-m") {
        return is_option_value(machine);
    }
    if let Some(feature) = flag.strip_prefix("-f") {
        let feature = feature.strip_prefix("no-").unwrap_or(feature);
        return is_option_value(feature)
            && !DENIED_FEATURE_PREFIXES
                .iter()
                .any(|prefix| feature.starts_with(prefix));
    }
    false
}

/// A single named source file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    /// Relative path inside the workspace (e.g. "main.cpp", "lib/util.h").
    pub name: String,
    pub content: String,
}

impl SourceFile {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }

    /// Returns the file extension (without the dot), if any.
    pub fn extension(&self) -> Option<&str> {
        let file_name = self.name.rsplit('/').next()?;
        let (stem, ext) = file_name.rsplit_once('.')?;
        if stem.is_empty() {
            None
        } else {
            Some(ext)
        }
    }
}

/// A set of files plus compiler flags, written into a session's workspace.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Submission {
    pub files: Vec<SourceFile>,
    #[serde(default)]
    pub flags: Vec<String>,
    /// When set, only this file is handed to the compiler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<String>,
}

impl Submission {
    pub fn new(files: Vec<SourceFile>) -> Self {
        Self {
            files,
            flags: Vec::new(),
            entry: None,
        }
    }

    #[must_use]
    pub fn with_flags(mut self, flags: Vec<String>) -> Self {
        self.flags = flags;
        self
    }

    #[must_use]
    pub fn with_entry(mut self, entry: impl Into<String>) -> Self {
        self.entry = Some(entry.into());
        self
    }

    /// Total payload size in bytes.
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.content.len() as u64).sum()
    }

    /// Checks client flags against the allow-list and the count/length bounds.
    pub fn validate_flags(&self, max_flags: usize, max_flag_len: usize) -> DomainResult<()> {
        if self.flags.len() > max_flags {
            return Err(DomainError::InvalidFieldValue {
                field: "flags".to_string(),
                value: format!("{} flags", self.flags.len()),
                expected: format!("at most {max_flags}"),
            });
        }

        for flag in &self.flags {
            if flag.is_empty() || flag.len() > max_flag_len || flag.contains('\0') {
                return Err(DomainError::InvalidFieldValue {
                    field: "flag".to_string(),
                    value: flag.escape_default().to_string(),
                    expected: format!("1 to {max_flag_len} bytes without NUL"),
                });
            }
            if !is_allowed_flag(flag) {
                return Err(DomainError::InvalidFieldValue {
                    field: "flag".to_string(),
                    value: flag.clone(),
                    expected: "a standard, optimisation, warning, macro, debug, library, \
                               machine or feature option without paths"
                        .to_string(),
                });
            }
        }
        Ok(())
    }

    /// Returns the names of the files to pass to the compiler, in order.
    ///
    /// With an entry, that file alone (it must be part of the submission).
    /// Otherwise every file whose extension is in `source_extensions`.
    pub fn compile_units(&self, source_extensions: &[String]) -> DomainResult<Vec<&str>> {
        if self.files.is_empty() {
            return Err(DomainError::InvalidFieldValue {
                field: "files".to_string(),
                value: "[]".to_string(),
                expected: "at least one file".to_string(),
            });
        }

        if let Some(entry) = &self.entry {
            return match self.files.iter().find(|f| &f.name == entry) {
                Some(file) => Ok(vec![file.name.as_str()]),
                None => Err(DomainError::InvalidFieldValue {
                    field: "entry".to_string(),
                    value: entry.clone(),
                    expected: "the name of a submitted file".to_string(),
                }),
            };
        }

        let units: Vec<&str> = self
            .files
            .iter()
            .filter(|f| {
                f.extension()
                    .is_some_and(|ext| source_extensions.iter().any(|s| s == ext))
            })
            .map(|f| f.name.as_str())
            .collect();

        if units.is_empty() {
            return Err(DomainError::InvalidFieldValue {
                field: "files".to_string(),
                value: format!("{} files", self.files.len()),
                expected: format!("a source file ({})", source_extensions.join(", ")),
            });
        }
        Ok(units)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exts() -> Vec<String> {
        vec!["c".into(), "cc".into(), "cpp".into()]
    }

    #[test]
    fn test_extension() {
        assert_eq!(SourceFile::new("main.cpp", "").extension(), Some("cpp"));
        assert_eq!(SourceFile::new("lib/a.b.c", "").extension(), Some("c"));
        assert_eq!(SourceFile::new(".hidden", "").extension(), None);
        assert_eq!(SourceFile::new("Makefile", "").extension(), None);
    }

    #[test]
    fn test_compile_units_filters_by_extension() {
        let sub = Submission::new(vec![
            SourceFile::new("main.cpp", ""),
            SourceFile::new("util.h", ""),
            SourceFile::new("util.cpp", ""),
        ]);
        assert_eq!(sub.compile_units(&exts()).unwrap(), vec!["main.cpp", "util.cpp"]);
    }

    #[test]
    fn test_compile_units_with_entry() {
        let sub = Submission::new(vec![
            SourceFile::new("a.cpp", ""),
            SourceFile::new("b.cpp", ""),
        ])
        .with_entry("b.cpp");
        assert_eq!(sub.compile_units(&exts()).unwrap(), vec!["b.cpp"]);

        let missing = sub.clone().with_entry("c.cpp");
        assert!(missing.compile_units(&exts()).is_err());
    }

    #[test]
    fn test_compile_units_requires_source() {
        let sub = Submission::new(vec![SourceFile::new("notes.txt", "")]);
        assert!(sub.compile_units(&exts()).is_err());
        assert!(Submission::default().compile_units(&exts()).is_err());
    }

    #[test]
    fn test_allowed_flags() {
        let sub = Submission::default().with_flags(vec![
            "-std=c++17".into(),
            "-O2".into(),
            "-Wall".into(),
            "-lm".into(),
            "-lstdc++fs".into(),
            "-Wno-unused-variable".into(),
            "-Wformat=2".into(),
            "-DDEBUG".into(),
            "-DLIMIT=10".into(),
            "-UNDEBUG".into(),
            "-ggdb3".into(),
            "-g".into(),
            "-fno-exceptions".into(),
            "-fsanitize=address".into(),
            "-march=native".into(),
            "-pedantic".into(),
        ]);
        assert!(sub.validate_flags(16, 64).is_ok());
    }

    #[test]
    fn test_denied_flags() {
        for flag in [
            "-o",
            "-o/tmp/x",
            "@args",
            "-B/tmp",
            "-fplugin=x.so",
            "-Wl,-rpath",
            "--specs=x",
            "-MD",
            "-MF/tmp/escaped.d",
            "-MFdeps.d",
            "-MQ",
            "-MT",
            "-dumpdir",
            "-aux-info",
            "-save-temps=obj",
            "-fprofile-arcs",
            "-fprofile-generate=/tmp/p",
            "-fdump-tree-all",
            "-Wp,-MD,/tmp/x.d",
            "-Wa,-adhln=/tmp/x.s",
            "-Xpreprocessor",
            "-Xassembler",
            "--sysroot=/",
            "-include",
            "-imacros",
            "-I/usr/include",
            "-Iinc",
            "-L/tmp",
            "-DPATH=/etc/passwd",
            "-D1BAD",
            "-O9",
            "-x",
        ] {
            let sub = Submission::default().with_flags(vec![flag.to_string()]);
            let err = sub.validate_flags(16, 64).unwrap_err();
            assert_eq!(err.kind(), crate::ErrorKind::InvalidInput, "flag {flag}");
        }
    }

    #[test]
    fn test_total_bytes() {
        let sub = Submission::new(vec![
            SourceFile::new("main.cpp", "int main() {}"),
            SourceFile::new("util.h", "#pragma once"),
        ]);
        assert_eq!(sub.total_bytes(), 25);
        assert_eq!(Submission::default().total_bytes(), 0);
    }

    #[test]
    fn test_flag_bounds() {
        let many = Submission::default().with_flags(vec!["-g".into(); 17]);
        assert!(many.validate_flags(16, 64).is_err());

        let long = Submission::default().with_flags(vec![format!("-D{}", "x".repeat(100))]);
        assert!(long.validate_flags(16, 64).is_err());

        let positional = Submission::default().with_flags(vec!["/etc/passwd".into()]);
        assert!(positional.validate_flags(16, 64).is_err());
    }
}
