//! Canonical default values shared across the control plane.

use std::time::Duration;

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8787";
pub const DEFAULT_DB_FILE: &str = "stevedore.db";

pub const DEFAULT_JOB_CONCURRENCY: usize = 2;
pub const DEFAULT_JOB_QUEUE_CAPACITY: usize = 64;

pub const DEFAULT_JOB_RETENTION: Duration = Duration::from_secs(14 * 24 * 3600);
pub const DEFAULT_JOB_LOG_RETENTION: Duration = Duration::from_secs(14 * 24 * 3600);
pub const DEFAULT_JOB_LOG_MAX_BYTES: u64 = 8 * 1024 * 1024;

pub const DEFAULT_UPLOAD_TTL: Duration = Duration::from_secs(24 * 3600);
/// 0 = unlimited.
pub const DEFAULT_UPLOAD_MAX_BYTES: u64 = 0;

pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_RETRY_MAX_DELAY: Duration = Duration::from_secs(60);
pub const DEFAULT_RETRY_JITTER_RATIO: f64 = 0.2;

pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(1);

pub const DEFAULT_ENGINE_BINARY: &str = "rclone";
/// Oldest engine release whose JSON log stream carries the stats block
/// shape the parser relies on.
pub const MIN_ENGINE_VERSION: (u32, u32) = (1, 57);

pub const CANCELED_BY_USER_MESSAGE: &str = "Canceled by user";
