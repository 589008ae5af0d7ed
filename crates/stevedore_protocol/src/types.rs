//! Domain types: profiles, jobs, payloads, progress, upload sessions.
//!
//! Payload structs serialize camelCase to match the HTTP surface; enums
//! serialize snake_case. Payload validation is pure (lexical path checks
//! only) — filesystem canonicalization happens where the worker loads
//! the row, not here.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

use crate::ids::{JobId, ProfileId, UploadId};

/// Hard cap on batch pair/key lists.
pub const MAX_BATCH_ITEMS: usize = 50_000;

// ============================================================================
// Providers and profiles
// ============================================================================

/// Storage backend family a profile points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    AwsS3,
    S3Compatible,
    OciS3Compat,
    AzureBlob,
    GcpGcs,
    OciObjectStorage,
}

impl Provider {
    pub const ALL: [Provider; 6] = [
        Provider::AwsS3,
        Provider::S3Compatible,
        Provider::OciS3Compat,
        Provider::AzureBlob,
        Provider::GcpGcs,
        Provider::OciObjectStorage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::AwsS3 => "aws_s3",
            Provider::S3Compatible => "s3_compatible",
            Provider::OciS3Compat => "oci_s3_compat",
            Provider::AzureBlob => "azure_blob",
            Provider::GcpGcs => "gcp_gcs",
            Provider::OciObjectStorage => "oci_object_storage",
        }
    }

    /// True for providers that speak the S3 API (native or compatible).
    pub fn is_s3_family(&self) -> bool {
        matches!(
            self,
            Provider::AwsS3 | Provider::S3Compatible | Provider::OciS3Compat
        )
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Provider::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| ValidationError::new(format!("unknown provider: {s}")))
    }
}

/// Behavior flags stored on a profile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProfileFlags {
    pub force_path_style: bool,
    pub preserve_leading_slash: bool,
    pub tls_insecure_skip_verify: bool,
}

/// Connection identity for one backend. Credential material is never on
/// this record; see [`ProfileSecrets`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: ProfileId,
    pub name: String,
    pub provider: Provider,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default)]
    pub flags: ProfileFlags,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// Unsealed credential bundle for one profile.
///
/// Lives only on the path store → engine plan / presigner. Debug output
/// is redacted so the bundle cannot leak through error chains.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProfileSecrets {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_key_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_access_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sas_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_account_json: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_cert_pem: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_key_pem: Option<String>,
}

impl ProfileSecrets {
    /// Every secret string present in the bundle, for leak checks and
    /// argv masking.
    pub fn secret_values(&self) -> Vec<&str> {
        [
            self.secret_access_key.as_deref(),
            self.session_token.as_deref(),
            self.account_key.as_deref(),
            self.sas_token.as_deref(),
            self.service_account_json.as_deref(),
            self.client_key_pem.as_deref(),
        ]
        .into_iter()
        .flatten()
        .filter(|s| !s.is_empty())
        .collect()
    }
}

impl fmt::Debug for ProfileSecrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfileSecrets").finish_non_exhaustive()
    }
}

// ============================================================================
// Job state machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Canceled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }

    /// Legal transitions. Everything not listed is a no-op at the store.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Queued, JobStatus::Running) => true,
            (JobStatus::Queued, JobStatus::Failed) => true,
            (JobStatus::Queued, JobStatus::Canceled) => true,
            (JobStatus::Running, s) if s.is_terminal() => true,
            // Requeue-on-restart policy re-opens a running row.
            (JobStatus::Running, JobStatus::Queued) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "canceled" => Ok(JobStatus::Canceled),
            other => Err(ValidationError::new(format!("unknown job status: {other}"))),
        }
    }
}

/// Closed set of job types the control plane schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    TransferSyncLocalToS3,
    TransferSyncS3ToLocal,
    TransferSyncStagingToS3,
    TransferDirectUpload,
    TransferDeletePrefix,
    TransferCopyObject,
    TransferMoveObject,
    TransferCopyBatch,
    TransferMoveBatch,
    TransferCopyPrefix,
    TransferMovePrefix,
    S3DeleteObjects,
    S3ZipPrefix,
    S3ZipObjects,
    S3IndexObjects,
}

impl JobType {
    pub const ALL: [JobType; 15] = [
        JobType::TransferSyncLocalToS3,
        JobType::TransferSyncS3ToLocal,
        JobType::TransferSyncStagingToS3,
        JobType::TransferDirectUpload,
        JobType::TransferDeletePrefix,
        JobType::TransferCopyObject,
        JobType::TransferMoveObject,
        JobType::TransferCopyBatch,
        JobType::TransferMoveBatch,
        JobType::TransferCopyPrefix,
        JobType::TransferMovePrefix,
        JobType::S3DeleteObjects,
        JobType::S3ZipPrefix,
        JobType::S3ZipObjects,
        JobType::S3IndexObjects,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::TransferSyncLocalToS3 => "transfer_sync_local_to_s3",
            JobType::TransferSyncS3ToLocal => "transfer_sync_s3_to_local",
            JobType::TransferSyncStagingToS3 => "transfer_sync_staging_to_s3",
            JobType::TransferDirectUpload => "transfer_direct_upload",
            JobType::TransferDeletePrefix => "transfer_delete_prefix",
            JobType::TransferCopyObject => "transfer_copy_object",
            JobType::TransferMoveObject => "transfer_move_object",
            JobType::TransferCopyBatch => "transfer_copy_batch",
            JobType::TransferMoveBatch => "transfer_move_batch",
            JobType::TransferCopyPrefix => "transfer_copy_prefix",
            JobType::TransferMovePrefix => "transfer_move_prefix",
            JobType::S3DeleteObjects => "s3_delete_objects",
            JobType::S3ZipPrefix => "s3_zip_prefix",
            JobType::S3ZipObjects => "s3_zip_objects",
            JobType::S3IndexObjects => "s3_index_objects",
        }
    }

    /// Types that produce a downloadable artifact on success.
    pub fn produces_artifact(&self) -> bool {
        matches!(self, JobType::S3ZipPrefix | JobType::S3ZipObjects)
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ValidationError::new(format!("unknown job type: {s}")))
    }
}

/// Progress snapshot reported by the engine parser. All fields optional;
/// which ones are populated depends on the transfer mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Progress {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub objects_done: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub objects_total: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_done: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_total: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed_bps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<u64>,
}

impl Progress {
    pub fn is_empty(&self) -> bool {
        *self == Progress::default()
    }
}

/// A durable unit of background work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub profile_id: ProfileId,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub status: JobStatus,
    pub payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<crate::error::NormalizedErrorCode>,
    pub attempt: u32,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
}

// ============================================================================
// Upload sessions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadMode {
    Staging,
    Direct,
    Presigned,
}

impl UploadMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadMode::Staging => "staging",
            UploadMode::Direct => "direct",
            UploadMode::Presigned => "presigned",
        }
    }
}

impl FromStr for UploadMode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "staging" => Ok(UploadMode::Staging),
            "direct" => Ok(UploadMode::Direct),
            "presigned" => Ok(UploadMode::Presigned),
            other => Err(ValidationError::new(format!("unknown upload mode: {other}"))),
        }
    }
}

/// Server-held rendezvous for client uploads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSession {
    pub id: UploadId,
    pub profile_id: ProfileId,
    pub bucket: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    pub mode: UploadMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staging_dir: Option<PathBuf>,
    pub bytes_budget: u64,
    pub bytes_tracked: u64,
    pub committed: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

// ============================================================================
// Job payloads
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLocalToS3Payload {
    pub bucket: String,
    pub local_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default)]
    pub delete_extraneous: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncS3ToLocalPayload {
    pub bucket: String,
    pub local_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default)]
    pub delete_extraneous: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub dry_run: bool,
}

/// Payload for `transfer_sync_staging_to_s3` and `transfer_direct_upload`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRefPayload {
    pub upload_id: UploadId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletePrefixPayload {
    pub bucket: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default)]
    pub delete_all: bool,
    #[serde(default)]
    pub allow_unsafe_prefix: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub dry_run: bool,
}

/// Payload for `transfer_copy_object` and `transfer_move_object`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyObjectPayload {
    pub src_bucket: String,
    pub src_key: String,
    pub dst_bucket: String,
    pub dst_key: String,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchPair {
    pub src_key: String,
    pub dst_key: String,
}

/// Payload for `transfer_copy_batch` and `transfer_move_batch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchPayload {
    pub src_bucket: String,
    pub dst_bucket: String,
    pub pairs: Vec<BatchPair>,
    #[serde(default)]
    pub dry_run: bool,
}

/// Payload for `transfer_copy_prefix` and `transfer_move_prefix`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopyPrefixPayload {
    pub src_bucket: String,
    pub src_prefix: String,
    pub dst_bucket: String,
    pub dst_prefix: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteObjectsPayload {
    pub bucket: String,
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZipPrefixPayload {
    pub bucket: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZipObjectsPayload {
    pub bucket: String,
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexObjectsPayload {
    pub bucket: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

// ============================================================================
// Payload validation
// ============================================================================

/// Payload rejected before it reached the store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ValidationError {
    pub message: String,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// What submit-time validation needs to know about the environment.
#[derive(Debug, Clone, Default)]
pub struct ValidationContext {
    /// Roots local sync paths must live under. Empty list = local sync
    /// disabled entirely.
    pub local_path_allowlist: Vec<PathBuf>,
    /// Profile flag: keys may begin with `/`.
    pub preserve_leading_slash: bool,
}

/// Validate a raw payload for the given job type. Returns the payload
/// back in normalized form (unknown fields rejected by deserialization).
pub fn validate_payload(
    job_type: JobType,
    payload: &serde_json::Value,
    ctx: &ValidationContext,
) -> Result<(), ValidationError> {
    match job_type {
        JobType::TransferSyncLocalToS3 => {
            let p: SyncLocalToS3Payload = parse(payload)?;
            check_bucket(&p.bucket)?;
            if let Some(prefix) = &p.prefix {
                check_prefix(prefix, ctx)?;
            }
            check_local_path(&p.local_path, ctx)?;
            check_filters(&p.include, &p.exclude)
        }
        JobType::TransferSyncS3ToLocal => {
            let p: SyncS3ToLocalPayload = parse(payload)?;
            check_bucket(&p.bucket)?;
            if let Some(prefix) = &p.prefix {
                check_prefix(prefix, ctx)?;
            }
            check_local_path(&p.local_path, ctx)?;
            check_filters(&p.include, &p.exclude)
        }
        JobType::TransferSyncStagingToS3 | JobType::TransferDirectUpload => {
            let _: UploadRefPayload = parse(payload)?;
            Ok(())
        }
        JobType::TransferDeletePrefix => {
            let p: DeletePrefixPayload = parse(payload)?;
            check_bucket(&p.bucket)?;
            match (&p.prefix, p.delete_all) {
                (None, false) => {
                    return Err(ValidationError::new(
                        "either prefix or deleteAll is required",
                    ))
                }
                (Some(_), true) => {
                    return Err(ValidationError::new(
                        "prefix and deleteAll are mutually exclusive",
                    ))
                }
                (Some(prefix), false) => {
                    check_prefix(prefix, ctx)?;
                    if prefix.contains('*') || prefix.contains('?') {
                        return Err(ValidationError::new(
                            "wildcards are not allowed in delete prefixes",
                        ));
                    }
                    if !prefix.ends_with('/') && !p.allow_unsafe_prefix {
                        return Err(ValidationError::new(
                            "delete prefix must end with '/' (or set allowUnsafePrefix)",
                        ));
                    }
                }
                (None, true) => {}
            }
            check_filters(&p.include, &p.exclude)
        }
        JobType::TransferCopyObject | JobType::TransferMoveObject => {
            let p: CopyObjectPayload = parse(payload)?;
            check_bucket(&p.src_bucket)?;
            check_bucket(&p.dst_bucket)?;
            check_key(&p.src_key, ctx)?;
            check_key(&p.dst_key, ctx)
        }
        JobType::TransferCopyBatch | JobType::TransferMoveBatch => {
            let p: BatchPayload = parse(payload)?;
            check_bucket(&p.src_bucket)?;
            check_bucket(&p.dst_bucket)?;
            if p.pairs.is_empty() {
                return Err(ValidationError::new("pairs must not be empty"));
            }
            if p.pairs.len() > MAX_BATCH_ITEMS {
                return Err(ValidationError::new(format!(
                    "pairs exceeds the {MAX_BATCH_ITEMS} item limit"
                )));
            }
            for pair in &p.pairs {
                check_key(&pair.src_key, ctx)?;
                check_key(&pair.dst_key, ctx)?;
            }
            Ok(())
        }
        JobType::TransferCopyPrefix | JobType::TransferMovePrefix => {
            let p: CopyPrefixPayload = parse(payload)?;
            check_bucket(&p.src_bucket)?;
            check_bucket(&p.dst_bucket)?;
            if !p.src_prefix.ends_with('/') {
                return Err(ValidationError::new("srcPrefix must end with '/'"));
            }
            check_prefix(&p.src_prefix, ctx)?;
            check_prefix(&p.dst_prefix, ctx)?;
            check_filters(&p.include, &p.exclude)
        }
        JobType::S3DeleteObjects => {
            let p: DeleteObjectsPayload = parse(payload)?;
            check_bucket(&p.bucket)?;
            check_key_list(&p.keys, ctx)
        }
        JobType::S3ZipPrefix => {
            let p: ZipPrefixPayload = parse(payload)?;
            check_bucket(&p.bucket)?;
            if let Some(prefix) = &p.prefix {
                check_prefix(prefix, ctx)?;
            }
            Ok(())
        }
        JobType::S3ZipObjects => {
            let p: ZipObjectsPayload = parse(payload)?;
            check_bucket(&p.bucket)?;
            check_key_list(&p.keys, ctx)
        }
        JobType::S3IndexObjects => {
            let p: IndexObjectsPayload = parse(payload)?;
            check_bucket(&p.bucket)?;
            if let Some(prefix) = &p.prefix {
                check_prefix(prefix, ctx)?;
            }
            Ok(())
        }
    }
}

fn parse<T: serde::de::DeserializeOwned>(payload: &serde_json::Value) -> Result<T, ValidationError> {
    serde_json::from_value(payload.clone())
        .map_err(|e| ValidationError::new(format!("invalid payload: {e}")))
}

fn check_bucket(bucket: &str) -> Result<(), ValidationError> {
    if bucket.is_empty() {
        return Err(ValidationError::new("bucket must not be empty"));
    }
    if bucket.contains('/') || bucket.contains('\0') {
        return Err(ValidationError::new("bucket contains illegal characters"));
    }
    Ok(())
}

fn check_key(key: &str, ctx: &ValidationContext) -> Result<(), ValidationError> {
    if key.is_empty() {
        return Err(ValidationError::new("object key must not be empty"));
    }
    if key.contains('\0') {
        return Err(ValidationError::new("object key contains NUL"));
    }
    if key.starts_with('/') && !ctx.preserve_leading_slash {
        return Err(ValidationError::new(
            "object key must not start with '/' for this profile",
        ));
    }
    Ok(())
}

fn check_prefix(prefix: &str, _ctx: &ValidationContext) -> Result<(), ValidationError> {
    if prefix.contains('\0') {
        return Err(ValidationError::new("prefix contains NUL"));
    }
    Ok(())
}

fn check_key_list(keys: &[String], ctx: &ValidationContext) -> Result<(), ValidationError> {
    if keys.is_empty() {
        return Err(ValidationError::new("keys must not be empty"));
    }
    if keys.len() > MAX_BATCH_ITEMS {
        return Err(ValidationError::new(format!(
            "keys exceeds the {MAX_BATCH_ITEMS} item limit"
        )));
    }
    for key in keys {
        check_key(key, ctx)?;
    }
    Ok(())
}

fn check_filters(include: &[String], exclude: &[String]) -> Result<(), ValidationError> {
    for pattern in include.iter().chain(exclude) {
        if pattern.is_empty() || pattern.contains('\0') {
            return Err(ValidationError::new("empty or malformed filter pattern"));
        }
    }
    Ok(())
}

/// Lexical allowlist check for local sync paths. The path must be
/// absolute, free of `..` segments, and sit under one allowlisted root.
/// The worker repeats this check (plus canonicalization) at episode
/// start, so an allowlist change invalidates stored rows too.
pub fn check_local_path(path: &Path, ctx: &ValidationContext) -> Result<(), ValidationError> {
    if !path.is_absolute() {
        return Err(ValidationError::new("localPath must be absolute"));
    }
    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(ValidationError::new("localPath must not contain '..'"))
            }
            Component::Normal(part) if part.to_string_lossy().contains('\0') => {
                return Err(ValidationError::new("localPath contains NUL"))
            }
            _ => {}
        }
    }
    if ctx.local_path_allowlist.is_empty() {
        return Err(ValidationError::new(
            "no local path allowlist is configured; local sync is disabled",
        ));
    }
    if !ctx
        .local_path_allowlist
        .iter()
        .any(|root| path.starts_with(root))
    {
        return Err(ValidationError::new(
            "localPath is outside the configured allowlist",
        ));
    }
    Ok(())
}
