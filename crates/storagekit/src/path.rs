//! Backend-relative path handling.
//!
//! Storage paths are slash separated, relative to the storage root, with no
//! leading slash. The root itself is `""`. Every path reaching a backend
//! primitive goes through [`normalize`] first.

use crate::error::{ForbiddenReason, Result, StorageError};

/// Clean a storage path.
///
/// Strips leading/trailing slashes, collapses repeated separators, drops `.`
/// segments and resolves `..` against earlier segments. Backslashes count as
/// separators. A `..` that would climb above the root is rejected with
/// `Forbidden(PathEscape)` instead of being clamped.
pub fn normalize(path: &str) -> Result<String> {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(StorageError::forbidden(path, ForbiddenReason::PathEscape));
                }
            }
            name => segments.push(name),
        }
    }
    Ok(segments.join("/"))
}

/// Whether `name` is an entry listings must skip.
pub fn is_ignored_dir(name: &str) -> bool {
    matches!(name, "" | "." | "..")
}

/// Parent of a cleaned path. The parent of a top-level entry is the root `""`.
pub fn dirname(path: &str) -> &str {
    let path = path.trim_end_matches('/');
    match path.rfind('/') {
        Some(pos) => &path[..pos],
        None => "",
    }
}

/// Last segment of a path.
pub fn basename(path: &str) -> &str {
    let path = path.trim_end_matches('/');
    match path.rfind('/') {
        Some(pos) => &path[pos + 1..],
        None => path,
    }
}

/// Join a child name onto a storage path.
pub fn join(base: &str, child: &str) -> String {
    let base = base.trim_matches('/');
    let child = child.trim_matches('/');
    match (base.is_empty(), child.is_empty()) {
        (true, _) => child.to_string(),
        (_, true) => base.to_string(),
        _ => format!("{}/{}", base, child),
    }
}
