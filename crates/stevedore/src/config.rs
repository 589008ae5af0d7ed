//! Flag/env configuration. The closed set lives here; everything else
//! in the system reads the assembled [`Settings`].

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use base64::Engine as _;
use clap::Parser;

use stevedore_protocol::config::{parse_duration, RestartPolicy, RetryPolicy, Settings};
use stevedore_protocol::defaults;

#[derive(Parser, Debug)]
#[command(name = "stevedore", about = "Control plane for bulk object-storage transfers")]
pub struct Args {
    /// Listen address for the HTTP API
    #[arg(long, env = "STVD_LISTEN", default_value = defaults::DEFAULT_LISTEN_ADDR)]
    pub listen: String,

    /// Data directory (database, logs, staging, artifacts)
    #[arg(long, env = "STVD_DATA_DIR", default_value = "./stevedore-data")]
    pub data_dir: PathBuf,

    /// Override the SQLite database path
    #[arg(long, env = "STVD_DB_PATH")]
    pub db_path: Option<PathBuf>,

    /// Concurrent job workers
    #[arg(long, env = "STVD_JOB_CONCURRENCY", default_value_t = defaults::DEFAULT_JOB_CONCURRENCY)]
    pub job_concurrency: usize,

    /// Ready-queue capacity; admission fails once it is full
    #[arg(long, env = "STVD_JOB_QUEUE_CAPACITY", default_value_t = defaults::DEFAULT_JOB_QUEUE_CAPACITY)]
    pub job_queue_capacity: usize,

    /// How long finished jobs are kept (e.g. 14d); 0 keeps them forever
    #[arg(long, env = "STVD_JOB_RETENTION", default_value = "14d")]
    pub job_retention: String,

    /// How long orphaned job log files are kept; 0 keeps them forever
    #[arg(long, env = "STVD_JOB_LOG_RETENTION", default_value = "14d")]
    pub job_log_retention: String,

    /// Per-job log file cap in bytes; the head is truncated beyond it
    #[arg(long, env = "STVD_JOB_LOG_MAX_BYTES", default_value_t = defaults::DEFAULT_JOB_LOG_MAX_BYTES)]
    pub job_log_max_bytes: u64,

    /// Upload session TTL (e.g. 24h)
    #[arg(long, env = "STVD_UPLOAD_TTL", default_value = "24h")]
    pub upload_ttl: String,

    /// Server-wide upload byte cap per session; 0 = unlimited
    #[arg(long, env = "STVD_UPLOAD_MAX_BYTES", default_value_t = defaults::DEFAULT_UPLOAD_MAX_BYTES)]
    pub upload_max_bytes: u64,

    /// Transfer engine binary; discovered on PATH when unset
    #[arg(long, env = "STVD_ENGINE_PATH")]
    pub engine_path: Option<PathBuf>,

    /// Extra tuning flags appended to every engine invocation
    #[arg(long = "engine-flag", env = "STVD_ENGINE_FLAGS", value_delimiter = ' ')]
    pub engine_flags: Vec<String>,

    /// Engine stats cadence (e.g. 1s)
    #[arg(long, env = "STVD_STATS_INTERVAL", default_value = "1s")]
    pub stats_interval: String,

    /// Retry attempts for retryable engine failures
    #[arg(long, env = "STVD_RETRY_ATTEMPTS", default_value_t = defaults::DEFAULT_RETRY_ATTEMPTS)]
    pub retry_attempts: u32,

    /// Base backoff delay (e.g. 2s)
    #[arg(long, env = "STVD_RETRY_BASE_DELAY", default_value = "2s")]
    pub retry_base_delay: String,

    /// Backoff ceiling (e.g. 60s)
    #[arg(long, env = "STVD_RETRY_MAX_DELAY", default_value = "60s")]
    pub retry_max_delay: String,

    /// Backoff jitter ratio in [0, 1]
    #[arg(long, env = "STVD_RETRY_JITTER_RATIO", default_value_t = defaults::DEFAULT_RETRY_JITTER_RATIO)]
    pub retry_jitter_ratio: f64,

    /// What to do with rows found running at startup (fail|requeue)
    #[arg(long, env = "STVD_ON_RESTART", default_value = "fail")]
    pub on_restart: String,

    /// Roots local sync paths must live under (repeatable)
    #[arg(long = "local-path-allow", env = "STVD_LOCAL_PATH_ALLOWLIST", value_delimiter = ',')]
    pub local_path_allowlist: Vec<PathBuf>,

    /// Serve on non-loopback interfaces (requires --api-token)
    #[arg(long, env = "STVD_ALLOW_REMOTE", default_value_t = false)]
    pub allow_remote: bool,

    /// Bearer token required on every API request
    #[arg(long, env = "STVD_API_TOKEN")]
    pub api_token: Option<String>,

    /// Host header allowlist (comma separated); empty disables the check
    #[arg(long, env = "STVD_ALLOWED_HOSTS", value_delimiter = ',')]
    pub allowed_hosts: Vec<String>,

    /// Base64-encoded 32-byte key sealing stored credentials
    #[arg(long, env = "STVD_ENCRYPTION_KEY")]
    pub encryption_key: Option<String>,

    /// Keep staging trees of failed upload jobs for debugging
    #[arg(long, env = "STVD_KEEP_FAILED_STAGING", default_value_t = false)]
    pub keep_failed_staging: bool,
}

impl Args {
    pub fn into_settings(self) -> Result<Settings> {
        if self.allow_remote && self.api_token.is_none() {
            bail!("--allow-remote requires --api-token");
        }
        if self.job_concurrency == 0 {
            bail!("--job-concurrency must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.retry_jitter_ratio) {
            bail!("--retry-jitter-ratio must be within [0, 1]");
        }

        let encryption_key = match &self.encryption_key {
            None => None,
            Some(encoded) => {
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .context("encryption key is not valid base64")?;
                let key: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("encryption key must decode to 32 bytes"))?;
                Some(key)
            }
        };

        let parse = |label: &str, raw: &str| {
            parse_duration(raw).map_err(|e| anyhow::anyhow!("{label}: {e}"))
        };
        let optional = |label: &str, raw: &str| -> Result<Option<std::time::Duration>> {
            let d = parse(label, raw)?;
            Ok((!d.is_zero()).then_some(d))
        };

        let mut settings = Settings::with_data_dir(self.data_dir);
        settings.listen_addr = self.listen;
        settings.db_path = self.db_path;
        settings.job_concurrency = self.job_concurrency;
        settings.job_queue_capacity = self.job_queue_capacity.max(1);
        settings.job_retention = optional("--job-retention", &self.job_retention)?;
        settings.job_log_retention = optional("--job-log-retention", &self.job_log_retention)?;
        settings.job_log_max_bytes = self.job_log_max_bytes;
        settings.upload_ttl = parse("--upload-ttl", &self.upload_ttl)?;
        settings.upload_max_bytes = self.upload_max_bytes;
        settings.engine_path = self.engine_path;
        settings.engine_flags = self.engine_flags;
        settings.stats_interval = parse("--stats-interval", &self.stats_interval)?;
        settings.retry = RetryPolicy {
            attempts: self.retry_attempts,
            base_delay: parse("--retry-base-delay", &self.retry_base_delay)?,
            max_delay: parse("--retry-max-delay", &self.retry_max_delay)?,
            jitter_ratio: self.retry_jitter_ratio,
        };
        settings.restart_policy = self
            .on_restart
            .parse::<RestartPolicy>()
            .map_err(|e| anyhow::anyhow!(e))?;
        settings.local_path_allowlist = self.local_path_allowlist;
        settings.allow_remote = self.allow_remote;
        settings.api_token = self.api_token;
        settings.allowed_hosts = self.allowed_hosts;
        settings.encryption_key = encryption_key;
        settings.keep_failed_staging = self.keep_failed_staging;
        Ok(settings)
    }
}
