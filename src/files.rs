//! Document-root path resolution and file access.
//!
//! A request path is only ever served after it has been joined under the
//! document root, canonicalized, and shown to still live inside the
//! canonical root. If canonicalization fails the request is treated as
//! not found; there is no fallback to an unvalidated join.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

/// Why a request path could not be mapped to a servable file.
#[derive(Debug)]
pub enum ResolveError {
    /// The target does not exist (canonicalization failed).
    NotFound,
    /// The canonical target lies outside the document root.
    Escape,
}

/// Why an already-resolved path could not be opened for serving.
#[derive(Debug)]
pub enum FileError {
    /// Missing, or not a regular file.
    NotFound,
    /// open/metadata failed for some other reason.
    Io(io::Error),
}

/// Maps a request path onto a canonical filesystem path under `root`.
///
/// `root` must already be canonical (the caller canonicalizes it once at
/// startup). A leading `/` is stripped and an empty path defaults to
/// `index.html`. Containment is checked component-wise, so a sibling
/// directory sharing a string prefix with the root does not pass.
pub fn resolve(root: &Path, request_path: &str) -> Result<PathBuf, ResolveError> {
    let rel = request_path.strip_prefix('/').unwrap_or(request_path);
    let rel = if rel.is_empty() { "index.html" } else { rel };

    let joined = root.join(rel);
    let canonical = std::fs::canonicalize(&joined).map_err(|_| ResolveError::NotFound)?;

    if !canonical.starts_with(root) {
        return Err(ResolveError::Escape);
    }

    Ok(canonical)
}

/// Opens a resolved path for serving and returns it with its size.
///
/// Directories and special files are rejected the same way as missing
/// files so the client cannot distinguish them.
pub fn open_serving_file(path: &Path) -> Result<(File, u64), FileError> {
    let file = File::open(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => FileError::NotFound,
        _ => FileError::Io(e),
    })?;

    let meta = file.metadata().map_err(FileError::Io)?;
    if !meta.is_file() {
        return Err(FileError::NotFound);
    }

    Ok((file, meta.len()))
}
