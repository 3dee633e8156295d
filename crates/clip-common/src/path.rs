//! Archive-path helpers.
//!
//! Paths inside an archive are absolute, `/`-separated strings: the root is
//! exactly `/`, every other path starts with `/` and has no trailing slash.
//! These helpers keep that invariant in one place.

use std::path::{Component, Path};

use thiserror::Error;

/// Errors produced when converting OS paths into archive paths.
#[derive(Debug, Error, Clone)]
pub enum ArchivePathError {
    /// Path is not located under the source root being archived.
    #[error("path is outside the source root: {path} not in {root}")]
    OutsideRoot { path: String, root: String },

    /// Path contains a component that cannot be represented (non-UTF-8).
    #[error("path is not valid UTF-8: {path}")]
    NotUtf8 { path: String },
}

/// Join a child name onto a directory path.
///
/// `join_child("/", "a")` is `/a`; `join_child("/a", "b")` is `/a/b`.
pub fn join_child(parent: &str, name: &str) -> String {
    if parent == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Parent of an archive path, or `None` for the root.
pub fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Final component of an archive path. The root's name is the empty string.
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or("")
}

/// Convert an OS path under `root` into an archive path.
///
/// The result is `/`-separated and rooted at the archive root; `root` itself
/// maps to `/`. Symlinks are never resolved, so the conversion is purely
/// lexical.
///
/// # Errors
/// Returns `OutsideRoot` if `path` does not live under `root`, `NotUtf8` if a
/// component cannot be represented as UTF-8.
pub fn to_archive_path(path: &Path, root: &Path) -> Result<String, ArchivePathError> {
    let relative: &Path = path
        .strip_prefix(root)
        .map_err(|_| ArchivePathError::OutsideRoot {
            path: path.display().to_string(),
            root: root.display().to_string(),
        })?;

    let mut out: String = String::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                let part: &str = part.to_str().ok_or_else(|| ArchivePathError::NotUtf8 {
                    path: path.display().to_string(),
                })?;
                out.push('/');
                out.push_str(part);
            }
            Component::CurDir => {}
            _ => {
                return Err(ArchivePathError::OutsideRoot {
                    path: path.display().to_string(),
                    root: root.display().to_string(),
                })
            }
        }
    }

    if out.is_empty() {
        out.push('/');
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_join_child() {
        assert_eq!(join_child("/", "a"), "/a");
        assert_eq!(join_child("/a", "b"), "/a/b");
        assert_eq!(join_child("/a/b", "c.txt"), "/a/b/c.txt");
    }

    #[test]
    fn test_parent_path() {
        assert_eq!(parent_path("/"), None);
        assert_eq!(parent_path("/a"), Some("/"));
        assert_eq!(parent_path("/a/b"), Some("/a"));
        assert_eq!(parent_path("/a/b/c.txt"), Some("/a/b"));
    }

    #[test]
    fn test_file_name() {
        assert_eq!(file_name("/a/b/c.txt"), "c.txt");
        assert_eq!(file_name("/a"), "a");
        assert_eq!(file_name("/"), "");
    }

    #[test]
    fn test_to_archive_path() {
        let root: PathBuf = PathBuf::from("/src/tree");
        assert_eq!(
            to_archive_path(&root.join("a/b.txt"), &root).unwrap(),
            "/a/b.txt"
        );
        assert_eq!(to_archive_path(&root, &root).unwrap(), "/");
    }

    #[test]
    fn test_to_archive_path_outside_root() {
        let root: PathBuf = PathBuf::from("/src/tree");
        let result = to_archive_path(Path::new("/elsewhere/x"), &root);
        assert!(matches!(result, Err(ArchivePathError::OutsideRoot { .. })));
    }
}
