//! Relative-path sanitization for client-supplied file names.
//!
//! Staged files land inside the session's staging tree and presigned
//! keys are built from these paths, so the rules are strict: relative,
//! forward slashes only, no NUL, no `.`/`..` segments, no empty
//! segments.

use std::path::PathBuf;

use crate::error::UploadError;

/// Validate and normalize a client-supplied relative path. Returns the
/// path as segments joined with `/` (also usable as an object key
/// suffix).
pub fn sanitize_relative_path(raw: &str) -> Result<String, UploadError> {
    if raw.is_empty() {
        return Err(UploadError::InvalidPath("empty path".to_string()));
    }
    if raw.starts_with('/') {
        return Err(UploadError::InvalidPath(format!(
            "absolute path not allowed: {raw}"
        )));
    }
    if raw.contains('\\') {
        return Err(UploadError::InvalidPath(format!(
            "backslashes not allowed: {raw}"
        )));
    }
    if raw.contains('\0') {
        return Err(UploadError::InvalidPath("NUL in path".to_string()));
    }

    let mut segments = Vec::new();
    for segment in raw.split('/') {
        match segment {
            "" => {
                return Err(UploadError::InvalidPath(format!(
                    "empty path segment in {raw}"
                )))
            }
            "." | ".." => {
                return Err(UploadError::InvalidPath(format!(
                    "dot segments not allowed: {raw}"
                )))
            }
            other => segments.push(other),
        }
    }
    Ok(segments.join("/"))
}

/// Sanitized path as a filesystem path relative to the staging root.
pub fn staging_file_path(sanitized: &str) -> PathBuf {
    sanitized.split('/').collect()
}
