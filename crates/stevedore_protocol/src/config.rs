//! Runtime settings shared by the launcher and every component.
//!
//! The binary assembles this from the closed flag/env set; components
//! only ever see the plain data.

use std::path::PathBuf;
use std::time::Duration;

use crate::defaults;

/// Exponential backoff policy for retryable engine failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Jitter ratio in [0, 1]; each delay is scaled by a factor drawn
    /// from `[1 - ratio, 1 + ratio]`.
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: defaults::DEFAULT_RETRY_ATTEMPTS,
            base_delay: defaults::DEFAULT_RETRY_BASE_DELAY,
            max_delay: defaults::DEFAULT_RETRY_MAX_DELAY,
            jitter_ratio: defaults::DEFAULT_RETRY_JITTER_RATIO,
        }
    }
}

/// What to do with rows found `running` at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestartPolicy {
    /// Fail them with `server_restarted`. Safe default: a partially
    /// executed destructive transfer must not silently re-run.
    #[default]
    Fail,
    /// Put them back in the queue with the attempt counter preserved.
    Requeue,
}

impl std::str::FromStr for RestartPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fail" => Ok(RestartPolicy::Fail),
            "requeue" => Ok(RestartPolicy::Requeue),
            other => Err(format!("unknown restart policy: {other} (fail|requeue)")),
        }
    }
}

/// Canonical system configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub listen_addr: String,
    pub data_dir: PathBuf,
    /// Override for the SQLite file; defaults to `<dataDir>/stevedore.db`.
    pub db_path: Option<PathBuf>,

    pub job_concurrency: usize,
    pub job_queue_capacity: usize,
    /// None = keep finished jobs forever.
    pub job_retention: Option<Duration>,
    pub job_log_retention: Option<Duration>,
    pub job_log_max_bytes: u64,

    pub upload_ttl: Duration,
    /// 0 = unlimited.
    pub upload_max_bytes: u64,

    /// Engine binary path; None = discover on PATH.
    pub engine_path: Option<PathBuf>,
    /// Whitelisted tuning flags appended to every engine invocation.
    pub engine_flags: Vec<String>,
    pub stats_interval: Duration,

    pub retry: RetryPolicy,
    pub restart_policy: RestartPolicy,

    pub local_path_allowlist: Vec<PathBuf>,
    pub allow_remote: bool,
    pub api_token: Option<String>,
    pub allowed_hosts: Vec<String>,
    /// 32-byte key for the credential sealer; None = store refuses to
    /// persist secrets.
    pub encryption_key: Option<[u8; 32]>,
    /// Keep staging trees of failed upload jobs around for debugging.
    pub keep_failed_staging: bool,
}

impl Settings {
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            listen_addr: defaults::DEFAULT_LISTEN_ADDR.to_string(),
            data_dir: data_dir.into(),
            db_path: None,
            job_concurrency: defaults::DEFAULT_JOB_CONCURRENCY,
            job_queue_capacity: defaults::DEFAULT_JOB_QUEUE_CAPACITY,
            job_retention: Some(defaults::DEFAULT_JOB_RETENTION),
            job_log_retention: Some(defaults::DEFAULT_JOB_LOG_RETENTION),
            job_log_max_bytes: defaults::DEFAULT_JOB_LOG_MAX_BYTES,
            upload_ttl: defaults::DEFAULT_UPLOAD_TTL,
            upload_max_bytes: defaults::DEFAULT_UPLOAD_MAX_BYTES,
            engine_path: None,
            engine_flags: Vec::new(),
            stats_interval: defaults::DEFAULT_STATS_INTERVAL,
            retry: RetryPolicy::default(),
            restart_policy: RestartPolicy::default(),
            local_path_allowlist: Vec::new(),
            allow_remote: false,
            api_token: None,
            allowed_hosts: Vec::new(),
            encryption_key: None,
            keep_failed_staging: false,
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join(defaults::DEFAULT_DB_FILE))
    }

    pub fn jobs_log_dir(&self) -> PathBuf {
        self.data_dir.join("logs").join("jobs")
    }

    pub fn unknown_errors_dir(&self) -> PathBuf {
        self.data_dir.join("logs").join("engineerrors").join("unknown")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.data_dir.join("artifacts").join("jobs")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.data_dir.join("staging")
    }

    pub fn engine_tmp_dir(&self) -> PathBuf {
        self.data_dir.join("tmp").join("engine")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.data_dir.join(".lock")
    }
}

/// Parse a human-friendly duration: `500ms`, `30s`, `15m`, `12h`, `7d`.
/// A bare number is seconds. `0` disables the knob where that applies.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("empty duration".to_string());
    }
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration: {raw}"))?;
    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "" | "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        "d" => Ok(Duration::from_secs(value * 24 * 3600)),
        other => Err(format!("unknown duration unit: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_units() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("15m").unwrap(), Duration::from_secs(900));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("7d").unwrap(), Duration::from_secs(604_800));
        assert!(parse_duration("10 parsecs").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn layout_is_rooted_in_data_dir() {
        let s = Settings::with_data_dir("/var/lib/stevedore");
        assert_eq!(
            s.db_path(),
            PathBuf::from("/var/lib/stevedore/stevedore.db")
        );
        assert_eq!(
            s.jobs_log_dir(),
            PathBuf::from("/var/lib/stevedore/logs/jobs")
        );
        assert_eq!(s.lock_path(), PathBuf::from("/var/lib/stevedore/.lock"));
    }
}
