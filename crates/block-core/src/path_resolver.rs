//! Resolves document-relative paths against an explicit base directory.

use std::path::{Path, PathBuf};

/// Returns `candidate` unchanged if it is absolute, otherwise `base_directory/candidate`.
///
/// Pure path computation: nothing is touched on disk, so resolving an
/// already-resolved path is a no-op.
pub fn resolve(candidate: impl AsRef<Path>, base_directory: impl AsRef<Path>) -> PathBuf {
    let candidate = candidate.as_ref();
    if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        base_directory.as_ref().join(candidate)
    }
}

/// Returns the directory containing `document`, following symlinks when possible.
///
/// Falls back to the lexical parent when the document cannot be canonicalized.
pub fn document_directory(document: &Path) -> PathBuf {
    let resolved = std::fs::canonicalize(document).unwrap_or_else(|_| document.to_path_buf());
    match resolved.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}
