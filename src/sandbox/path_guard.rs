//! Workspace path confinement.
//!
//! Every path the engine touches is built through [`confine`], including
//! paths derived internally from caller-supplied identifiers.

use std::ffi::OsStr;
use std::fmt;
use std::path::{Component, Path, PathBuf};

use crate::error::{EngineError, Result};

/// Longest file stem accepted from a caller.
const MAX_NAME_LEN: usize = 100;

/// Device names that cannot be used as file names on Windows hosts.
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// A normalized path that is a strict descendant of a workspace root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfinedPath(PathBuf);

impl ConfinedPath {
    pub fn as_path(&self) -> &Path {
        &self.0
    }
}

impl AsRef<Path> for ConfinedPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl AsRef<OsStr> for ConfinedPath {
    fn as_ref(&self) -> &OsStr {
        self.0.as_os_str()
    }
}

impl fmt::Display for ConfinedPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.display().fmt(f)
    }
}

/// A single path component safe to join onto a confined directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafeName(String);

impl SafeName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<Path> for SafeName {
    fn as_ref(&self) -> &Path {
        Path::new(&self.0)
    }
}

impl fmt::Display for SafeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Confine `candidate` to `root`.
///
/// Relative candidates are taken relative to `root`. Any `..` segment is
/// rejected outright. Symbolic links are resolved through the deepest
/// existing ancestor, so a link pointing out of the root is caught even when
/// the final component does not exist yet. `root` must already be
/// canonical.
pub fn confine(candidate: &Path, root: &Path) -> Result<ConfinedPath> {
    let escape = || EngineError::PathEscape {
        path: candidate.to_path_buf(),
    };

    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };

    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::ParentDir => return Err(escape()),
            Component::CurDir => {}
            other => normalized.push(other),
        }
    }

    let resolved = resolve_existing_prefix(&normalized).map_err(|_| escape())?;
    if resolved == root || !resolved.starts_with(root) {
        return Err(escape());
    }

    Ok(ConfinedPath(resolved))
}

/// Canonicalize the longest existing prefix of `path` and re-append the rest.
fn resolve_existing_prefix(path: &Path) -> std::io::Result<PathBuf> {
    let mut existing = path;
    let mut tail = Vec::new();
    loop {
        match existing.canonicalize() {
            Ok(canonical) => {
                let mut resolved = canonical;
                resolved.extend(tail.iter().rev());
                return Ok(resolved);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let name = existing.file_name().ok_or(e)?;
                tail.push(name.to_os_string());
                existing = existing
                    .parent()
                    .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotFound))?;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Turn a caller-supplied name into a single safe path component.
///
/// Separators, null bytes and reserved device names are rejected. Any other
/// character outside `[A-Za-z0-9_.-]` becomes `_`, leading dots are dropped
/// and the result is capped at 100 characters.
pub fn sanitize_filename(name: &str) -> Result<SafeName> {
    let invalid = |reason| EngineError::InvalidName {
        name: name.to_string(),
        reason,
    };

    if name.contains('\0') {
        return Err(invalid("contains a null byte"));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(invalid("contains a path separator"));
    }

    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned: String = cleaned
        .trim_start_matches('.')
        .chars()
        .take(MAX_NAME_LEN)
        .collect();

    if cleaned.is_empty() {
        return Err(invalid("empty after sanitizing"));
    }

    let stem = cleaned.split('.').next().unwrap_or_default();
    if RESERVED_NAMES
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(stem))
    {
        return Err(invalid("reserved device name"));
    }

    Ok(SafeName(cleaned))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let canonical = dir.path().canonicalize().unwrap();
        (dir, canonical)
    }

    #[test]
    fn confines_relative_paths() {
        let (_dir, root) = root();
        let confined = confine(Path::new("src/main.cpp"), &root).unwrap();
        assert_eq!(confined.as_path(), root.join("src/main.cpp"));
    }

    #[test]
    fn strips_current_dir_segments() {
        let (_dir, root) = root();
        let confined = confine(Path::new("./src/./main.cpp"), &root).unwrap();
        assert_eq!(confined.as_path(), root.join("src/main.cpp"));
    }

    #[test]
    fn accepts_absolute_paths_inside_root() {
        let (_dir, root) = root();
        let inside = root.join("bin").join("main");
        assert_eq!(confine(&inside, &root).unwrap().as_path(), inside);
    }

    #[test]
    fn rejects_parent_segments() {
        let (_dir, root) = root();
        for candidate in ["../escape", "src/../../escape", "src/../main.cpp", ".."] {
            let err = confine(Path::new(candidate), &root).unwrap_err();
            assert!(
                matches!(err, EngineError::PathEscape { .. }),
                "{candidate} should escape"
            );
        }
    }

    #[test]
    fn rejects_absolute_paths_outside_root() {
        let (_dir, root) = root();
        let err = confine(Path::new("/etc/passwd"), &root).unwrap_err();
        assert!(matches!(err, EngineError::PathEscape { .. }));
    }

    #[test]
    fn rejects_root_itself() {
        let (_dir, root) = root();
        assert!(confine(&root, &root).is_err());
        assert!(confine(Path::new("."), &root).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn rejects_symlink_out_of_root() {
        let (_dir, root) = root();
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), root.join("link")).unwrap();

        let err = confine(Path::new("link/secret"), &root).unwrap_err();
        assert!(matches!(err, EngineError::PathEscape { .. }));
    }

    #[cfg(unix)]
    #[test]
    fn follows_symlink_within_root() {
        let (_dir, root) = root();
        std::fs::create_dir(root.join("real")).unwrap();
        std::os::unix::fs::symlink(root.join("real"), root.join("alias")).unwrap();

        let confined = confine(Path::new("alias/file"), &root).unwrap();
        assert_eq!(confined.as_path(), root.join("real/file"));
    }

    #[test]
    fn sanitize_keeps_plain_names() {
        assert_eq!(sanitize_filename("a_plus_b-1.v2").unwrap().as_str(), "a_plus_b-1.v2");
    }

    #[test]
    fn sanitize_replaces_odd_characters() {
        assert_eq!(sanitize_filename("a+b").unwrap().as_str(), "a_b");
        assert_eq!(sanitize_filename("my prog").unwrap().as_str(), "my_prog");
    }

    #[test]
    fn sanitize_strips_leading_dots() {
        assert_eq!(sanitize_filename("..hidden").unwrap().as_str(), "hidden");
    }

    #[test]
    fn sanitize_truncates() {
        let long = "x".repeat(300);
        assert_eq!(sanitize_filename(&long).unwrap().as_str().len(), MAX_NAME_LEN);
    }

    #[test]
    fn sanitize_rejects_dangerous_names() {
        for name in ["", "..", "a/b", "a\\b", "nul\0byte", "CON", "com1.txt", "lpt9"] {
            let err = sanitize_filename(name).unwrap_err();
            assert!(
                matches!(err, EngineError::InvalidName { .. }),
                "{name:?} should be rejected"
            );
        }
    }
}
