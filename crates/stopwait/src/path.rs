//! Path confinement for served and stored files.

use std::path::{Component, Path, PathBuf};

/// Resolve a requested name to a regular file inside `root`.
///
/// Returns `None` for anything missing, anything that is not a regular file and
/// anything that escapes `root` once symlinks and `..` are resolved. Callers
/// answer all three the same way so the real layout is never revealed.
pub fn resolve_in_root(root: impl AsRef<Path>, filename: &str) -> Option<PathBuf> {
    if filename.is_empty() || filename.contains('\0') {
        return None;
    }

    let root_canon = root.as_ref().canonicalize().ok()?;
    let path_canon = root_canon.join(filename).canonicalize().ok()?;

    if !path_canon.starts_with(&root_canon) {
        tracing::warn!("Path traversal attempt detected: {:?}", filename);
        return None;
    }
    if !path_canon.is_file() {
        return None;
    }

    Some(path_canon)
}

/// The final component of `name`, usable as a file name in a flat directory.
///
/// Both `/` and `\` count as separators so a name built on another platform
/// cannot smuggle in directories.
pub fn sanitize_basename(name: &str) -> Option<String> {
    let last = name.rsplit(['/', '\\']).next()?;
    match Path::new(last).components().next() {
        Some(Component::Normal(part)) if !last.contains('\0') => Some(part.to_string_lossy().into_owned()),
        _ => None,
    }
}
