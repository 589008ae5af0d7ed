//! Engine binary discovery and the minimum-version gate.
//!
//! Checked on startup and re-checked (with a small cache TTL) on every
//! submit, so a binary removed or downgraded underneath a running
//! server fails jobs before they are enqueued.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::{debug, info};

use stevedore_protocol::defaults::{DEFAULT_ENGINE_BINARY, MIN_ENGINE_VERSION};

use crate::error::EngineError;

/// How long a successful probe stays valid.
const PROBE_TTL: Duration = Duration::from_secs(30);

/// A verified engine binary.
#[derive(Debug, Clone)]
pub struct EngineInfo {
    pub path: PathBuf,
    pub version: (u32, u32),
    pub version_string: String,
}

/// Cached availability prober.
pub struct EngineProbe {
    configured_path: Option<PathBuf>,
    cache: Mutex<Option<(Instant, EngineInfo)>>,
}

impl EngineProbe {
    pub fn new(configured_path: Option<PathBuf>) -> Self {
        Self {
            configured_path,
            cache: Mutex::new(None),
        }
    }

    /// Resolve the binary, run `--version` and enforce the floor.
    pub async fn verify(&self) -> Result<EngineInfo, EngineError> {
        if let Some((checked_at, info)) = self.cache.lock().unwrap().clone() {
            if checked_at.elapsed() < PROBE_TTL {
                return Ok(info);
            }
        }

        let path = self.resolve_path()?;
        let output = Command::new(&path)
            .arg("version")
            .output()
            .await
            .map_err(EngineError::Spawn)?;
        if !output.status.success() {
            return Err(EngineError::Missing(format!(
                "{} exited with {} on version probe",
                path.display(),
                output.status
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let (version, version_string) = parse_version(&stdout).ok_or_else(|| {
            EngineError::Output(format!("unrecognized version output: {}", stdout.trim()))
        })?;

        if version < MIN_ENGINE_VERSION {
            return Err(EngineError::Incompatible {
                found: version_string,
                required: format!("v{}.{}", MIN_ENGINE_VERSION.0, MIN_ENGINE_VERSION.1),
            });
        }

        let info = EngineInfo {
            path,
            version,
            version_string,
        };
        info!(
            engine = %info.path.display(),
            version = %info.version_string,
            "transfer engine verified"
        );
        *self.cache.lock().unwrap() = Some((Instant::now(), info.clone()));
        Ok(info)
    }

    fn resolve_path(&self) -> Result<PathBuf, EngineError> {
        if let Some(path) = &self.configured_path {
            if path.exists() {
                return Ok(path.clone());
            }
            return Err(EngineError::Missing(format!(
                "configured path {} does not exist",
                path.display()
            )));
        }
        if let Ok(path) = which::which(DEFAULT_ENGINE_BINARY) {
            debug!("found engine on PATH: {}", path.display());
            return Ok(path);
        }
        // Common locations outside PATH for service environments.
        for candidate in ["/usr/local/bin", "/usr/bin", "/opt/homebrew/bin"] {
            let path = Path::new(candidate).join(DEFAULT_ENGINE_BINARY);
            if path.exists() {
                return Ok(path);
            }
        }
        Err(EngineError::Missing(format!(
            "{DEFAULT_ENGINE_BINARY} not found on PATH"
        )))
    }
}

/// Parse `rclone v1.66.0` style output into ((major, minor), raw tag).
fn parse_version(output: &str) -> Option<((u32, u32), String)> {
    let first_line = output.lines().next()?;
    let tag = first_line
        .split_whitespace()
        .find(|tok| tok.starts_with('v') && tok[1..].chars().next().is_some_and(|c| c.is_ascii_digit()))?;
    let mut parts = tag[1..].split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some(((major, minor), tag.to_string()))
}
