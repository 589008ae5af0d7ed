//! Data-directory locking.
//!
//! Stevedore is single-node, single-writer: two instances sharing one
//! data directory would corrupt staging trees and double-run jobs. An
//! advisory `fs2` lock on `<dataDir>/.lock` enforces that; startup
//! aborts on contention.

use chrono::Utc;
use fs2::FileExt;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("data directory is locked by another process: {0}")]
    Locked(PathBuf),

    #[error("failed to create lock file: {0}")]
    CreateFailed(#[source] io::Error),

    #[error("failed to acquire lock: {0}")]
    AcquireFailed(#[source] io::Error),
}

/// Guard holding the exclusive data-directory lock.
///
/// Released when dropped (flock semantics: the OS also releases it if
/// the process dies).
pub struct DataDirLock {
    _file: File,
    lock_path: PathBuf,
    sidecar_path: Option<PathBuf>,
}

impl DataDirLock {
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

#[derive(Serialize)]
struct LockSidecar {
    pid: u32,
    exe: Option<String>,
    timestamp: String,
}

fn sidecar_path_for(lock_path: &Path) -> PathBuf {
    let mut p = lock_path.as_os_str().to_owned();
    p.push(".json");
    PathBuf::from(p)
}

fn write_lock_sidecar(lock_path: &Path) -> Option<PathBuf> {
    let sidecar = LockSidecar {
        pid: std::process::id(),
        exe: std::env::current_exe().ok().map(|p| p.display().to_string()),
        timestamp: Utc::now().to_rfc3339(),
    };
    let sidecar_path = sidecar_path_for(lock_path);
    match serde_json::to_vec_pretty(&sidecar)
        .map_err(io::Error::other)
        .and_then(|payload| fs::write(&sidecar_path, payload))
    {
        Ok(()) => Some(sidecar_path),
        Err(e) => {
            warn!("failed to write lock sidecar {}: {e}", sidecar_path.display());
            None
        }
    }
}

impl Drop for DataDirLock {
    fn drop(&mut self) {
        debug!("releasing data directory lock: {}", self.lock_path.display());
        if let Some(path) = &self.sidecar_path {
            if let Err(e) = fs::remove_file(path) {
                debug!("failed to remove lock sidecar {}: {e}", path.display());
            }
        }
        // The file itself unlocks on close.
    }
}

impl std::fmt::Debug for DataDirLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataDirLock")
            .field("lock_path", &self.lock_path)
            .finish()
    }
}

/// Try to take the exclusive lock, non-blocking.
pub fn try_lock_data_dir(lock_path: &Path) -> Result<DataDirLock, LockError> {
    if let Some(parent) = lock_path.parent() {
        fs::create_dir_all(parent).map_err(LockError::CreateFailed)?;
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)
        .map_err(LockError::CreateFailed)?;

    match FileExt::try_lock_exclusive(&file) {
        Ok(()) => {
            info!("acquired data directory lock: {}", lock_path.display());
            let sidecar_path = write_lock_sidecar(lock_path);
            Ok(DataDirLock {
                _file: file,
                lock_path: lock_path.to_path_buf(),
                sidecar_path,
            })
        }
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            Err(LockError::Locked(lock_path.to_path_buf()))
        }
        Err(e) => Err(LockError::AcquireFailed(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn lock_and_release() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join(".lock");

        let guard = try_lock_data_dir(&lock_path).unwrap();
        assert!(guard.lock_path().exists());
        drop(guard);

        let _again = try_lock_data_dir(&lock_path).unwrap();
    }

    #[test]
    fn sidecar_records_the_owner() {
        let dir = TempDir::new().unwrap();
        let lock_path = dir.path().join(".lock");
        let _guard = try_lock_data_dir(&lock_path).unwrap();

        let sidecar = std::fs::read_to_string(sidecar_path_for(&lock_path)).unwrap();
        assert!(sidecar.contains(&std::process::id().to_string()));
    }
}
