//! Worker loop: one execution turn per dequeued job id.
//!
//! A turn reloads the row (the store is the source of truth), claims it
//! with the guarded queued→running transition, resolves the payload
//! into an engine plan, and drives episodes until a terminal state —
//! retrying with jittered backoff when the classifier says the failure
//! is transient.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use stevedore_engine::plan::{PlanInput, RemoteSpec, ZipSelection};
use stevedore_engine::{EngineError, EpisodeHooks, EpisodeOutcome, EpisodeOutput};
use stevedore_protocol::error::{classify, NormalizedErrorCode};
use stevedore_protocol::events::{EventKind, JobCompletedPayload, JobProgressPayload};
use stevedore_protocol::ids::JobId;
use stevedore_protocol::types::{
    check_local_path, Job, JobStatus, JobType, Progress, UploadMode, ValidationContext,
};
use stevedore_store::{JobStatusUpdate, StoreError};

use crate::manager::ManagerInner;
use crate::metrics::METRICS;
use crate::retry::backoff_delay;

/// Cap on the error summary persisted to the job row.
const ERROR_SUMMARY_MAX: usize = 2048;
/// Cap on stderr samples collected for unknown classifications.
const UNKNOWN_SAMPLE_LIMIT: usize = 50;

pub(crate) async fn worker_loop(inner: Arc<ManagerInner>, worker_idx: usize) {
    debug!("worker {worker_idx} started");
    loop {
        let job_id = tokio::select! {
            _ = inner.root.cancelled() => break,
            recv = inner.queue_rx.recv() => match recv {
                Ok(id) => id,
                Err(_) => break,
            },
        };
        run_turn(&inner, job_id).await;
    }
    debug!("worker {worker_idx} stopped");
}

async fn run_turn(inner: &Arc<ManagerInner>, job_id: JobId) {
    let job = match inner.store.get_job(&job_id).await {
        Ok(job) => job,
        Err(StoreError::NotFound(_)) => return,
        Err(e) => {
            error!("failed to load job {job_id}: {e}");
            return;
        }
    };
    if job.status != JobStatus::Queued {
        // Canceled or deleted while waiting; nothing to do.
        return;
    }

    let token = inner.root.child_token();
    inner
        .cancellations
        .lock()
        .unwrap()
        .insert(job_id.as_str().to_string(), token.clone());

    if let Err(e) = drive_job(inner, job, &token).await {
        error!("job {job_id} turn aborted: {e}");
    }

    inner.cancellations.lock().unwrap().remove(job_id.as_str());
}

async fn drive_job(
    inner: &Arc<ManagerInner>,
    job: Job,
    token: &CancellationToken,
) -> Result<(), StoreError> {
    let claimed = inner
        .store
        .update_job_status(
            &job.id,
            JobStatus::Running,
            JobStatusUpdate {
                started_at: Some(chrono::Utc::now()),
                ..Default::default()
            },
        )
        .await?;
    if !claimed {
        return Ok(());
    }
    publish_progress(inner, &job.id, JobStatus::Running, Progress::default());

    if token.is_cancelled() {
        return finish(
            inner,
            &job,
            JobStatus::Canceled,
            Progress::default(),
            None,
            Some(stevedore_protocol::defaults::CANCELED_BY_USER_MESSAGE.to_string()),
            Some(NormalizedErrorCode::Canceled),
        )
        .await;
    }

    // Resolve backend identity and the engine plan. Failures here are
    // terminal: the payload or profile is unusable.
    let (remote, plan) = match resolve(inner, &job).await {
        Ok(resolved) => resolved,
        Err(ResolveError::Store(e)) => return Err(e),
        Err(ResolveError::Invalid(message)) => {
            warn!("job {} failed validation at episode start: {message}", job.id);
            return finish(
                inner,
                &job,
                JobStatus::Failed,
                Progress::default(),
                None,
                Some(message),
                Some(NormalizedErrorCode::ValidationError),
            )
            .await;
        }
    };

    let mut attempt = job.attempt;
    loop {
        let (progress_tx, progress_rx) = watch::channel(Progress::default());
        let (log_tx, log_rx) = mpsc::channel(256);
        let pump = tokio::spawn(pump_events(
            inner.clone(),
            job.id.clone(),
            progress_rx,
            log_rx,
        ));
        let hooks = EpisodeHooks {
            progress: progress_tx,
            logs: log_tx,
        };

        let outcome = inner
            .supervisor
            .run_episode(&job.id, &plan, &remote, token, &hooks)
            .await;
        drop(hooks);
        let _ = pump.await;

        match outcome {
            Err(e) => {
                let code = match &e {
                    EngineError::Missing(_) => NormalizedErrorCode::TransferEngineMissing,
                    EngineError::Incompatible { .. } => {
                        NormalizedErrorCode::TransferEngineIncompatible
                    }
                    _ => NormalizedErrorCode::Unknown,
                };
                return finish(
                    inner,
                    &job,
                    JobStatus::Failed,
                    Progress::default(),
                    None,
                    Some(e.to_string()),
                    Some(code),
                )
                .await;
            }

            Ok(EpisodeOutcome::Success { progress, output }) => {
                let result = materialize_output(inner, &job, output).await?;
                return finish(inner, &job, JobStatus::Succeeded, progress, result, None, None)
                    .await;
            }

            Ok(EpisodeOutcome::Canceled { progress }) => {
                return finish(
                    inner,
                    &job,
                    JobStatus::Canceled,
                    progress,
                    None,
                    Some(stevedore_protocol::defaults::CANCELED_BY_USER_MESSAGE.to_string()),
                    Some(NormalizedErrorCode::Canceled),
                )
                .await;
            }

            Ok(EpisodeOutcome::Failed {
                progress,
                stderr_tail,
            }) => {
                let classification = classify(&stderr_tail, token.is_cancelled());
                if classification.code == NormalizedErrorCode::Canceled {
                    return finish(
                        inner,
                        &job,
                        JobStatus::Canceled,
                        progress,
                        None,
                        Some(stevedore_protocol::defaults::CANCELED_BY_USER_MESSAGE.to_string()),
                        Some(NormalizedErrorCode::Canceled),
                    )
                    .await;
                }

                let retry_budget_left = attempt < inner.settings.retry.attempts;
                if classification.retryable && retry_budget_left {
                    attempt += 1;
                    inner.store.set_job_attempt(&job.id, attempt).await?;
                    METRICS.inc_retried();
                    let delay =
                        backoff_delay(&inner.settings.retry, attempt - 1, &mut rand::thread_rng());
                    info!(
                        "job {} attempt {attempt} failed with {}; retrying in {delay:?}",
                        job.id, classification.code
                    );
                    inner.hub.publish(
                        EventKind::JobLog,
                        Some(job.id.clone()),
                        serde_json::to_value(stevedore_protocol::events::JobLogPayload {
                            level: "info".to_string(),
                            message: format!(
                                "retrying after {} (attempt {attempt}, backoff {delay:?})",
                                classification.code
                            ),
                        })
                        .unwrap_or_default(),
                    );

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => continue,
                        _ = token.cancelled() => {
                            return finish(
                                inner,
                                &job,
                                JobStatus::Canceled,
                                progress,
                                None,
                                Some(
                                    stevedore_protocol::defaults::CANCELED_BY_USER_MESSAGE
                                        .to_string(),
                                ),
                                Some(NormalizedErrorCode::Canceled),
                            )
                            .await;
                        }
                    }
                }

                if classification.code == NormalizedErrorCode::Unknown {
                    sample_unknown_stderr(inner, &job.id, &stderr_tail);
                }
                let summary = truncate_utf8(&stderr_tail, ERROR_SUMMARY_MAX);
                return finish(
                    inner,
                    &job,
                    JobStatus::Failed,
                    progress,
                    None,
                    Some(summary),
                    Some(classification.code),
                )
                .await;
            }
        }
    }
}

enum ResolveError {
    Store(StoreError),
    Invalid(String),
}

impl From<StoreError> for ResolveError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => ResolveError::Invalid(format!("{what} no longer exists")),
            other => ResolveError::Store(other),
        }
    }
}

/// Load the backend identity and turn the stored payload into an
/// engine plan. Local-path payloads are re-checked against the current
/// allowlist here, so a row submitted under an older allowlist cannot
/// escape the current one on retry or requeue.
async fn resolve(
    inner: &Arc<ManagerInner>,
    job: &Job,
) -> Result<(RemoteSpec, PlanInput), ResolveError> {
    let profile = inner.store.get_profile(&job.profile_id).await?;
    let secrets = inner.store.get_profile_secrets(&job.profile_id).await?;
    let remote = RemoteSpec {
        provider: profile.provider,
        endpoint: profile.endpoint.clone(),
        region: profile.region.clone(),
        flags: profile.flags,
        secrets,
    };

    let ctx = ValidationContext {
        local_path_allowlist: inner.settings.local_path_allowlist.clone(),
        preserve_leading_slash: profile.flags.preserve_leading_slash,
    };

    let invalid = |e: stevedore_protocol::types::ValidationError| ResolveError::Invalid(e.message);
    let parse_err = |e: serde_json::Error| ResolveError::Invalid(format!("invalid payload: {e}"));

    let plan = match job.job_type {
        JobType::TransferSyncLocalToS3 => {
            let p: stevedore_protocol::types::SyncLocalToS3Payload =
                serde_json::from_value(job.payload.clone()).map_err(parse_err)?;
            check_local_path(&p.local_path, &ctx).map_err(invalid)?;
            PlanInput::SyncLocalToS3(p)
        }
        JobType::TransferSyncS3ToLocal => {
            let p: stevedore_protocol::types::SyncS3ToLocalPayload =
                serde_json::from_value(job.payload.clone()).map_err(parse_err)?;
            check_local_path(&p.local_path, &ctx).map_err(invalid)?;
            PlanInput::SyncS3ToLocal(p)
        }
        JobType::TransferSyncStagingToS3 => {
            let p: stevedore_protocol::types::UploadRefPayload =
                serde_json::from_value(job.payload.clone()).map_err(parse_err)?;
            let session = inner.store.get_upload_session(&p.upload_id).await?;
            if session.mode != UploadMode::Staging {
                return Err(ResolveError::Invalid(format!(
                    "upload session {} is not a staging session",
                    p.upload_id
                )));
            }
            let staging_dir = session.staging_dir.ok_or_else(|| {
                ResolveError::Invalid(format!("upload session {} has no staging dir", p.upload_id))
            })?;
            PlanInput::SyncStagingToS3 {
                staging_dir,
                bucket: session.bucket,
                prefix: session.prefix,
            }
        }
        JobType::TransferDirectUpload => {
            let p: stevedore_protocol::types::UploadRefPayload =
                serde_json::from_value(job.payload.clone()).map_err(parse_err)?;
            let session = inner.store.get_upload_session(&p.upload_id).await?;
            PlanInput::VerifyDirectUpload {
                bucket: session.bucket,
                prefix: session.prefix,
            }
        }
        JobType::TransferDeletePrefix => PlanInput::DeletePrefix(
            serde_json::from_value(job.payload.clone()).map_err(parse_err)?,
        ),
        JobType::TransferCopyObject | JobType::TransferMoveObject => PlanInput::CopyObject {
            payload: serde_json::from_value(job.payload.clone()).map_err(parse_err)?,
            move_source: job.job_type == JobType::TransferMoveObject,
        },
        JobType::TransferCopyBatch | JobType::TransferMoveBatch => PlanInput::Batch {
            payload: serde_json::from_value(job.payload.clone()).map_err(parse_err)?,
            move_source: job.job_type == JobType::TransferMoveBatch,
        },
        JobType::TransferCopyPrefix | JobType::TransferMovePrefix => PlanInput::CopyPrefix {
            payload: serde_json::from_value(job.payload.clone()).map_err(parse_err)?,
            move_source: job.job_type == JobType::TransferMovePrefix,
        },
        JobType::S3DeleteObjects => PlanInput::DeleteObjects(
            serde_json::from_value(job.payload.clone()).map_err(parse_err)?,
        ),
        JobType::S3ZipPrefix => {
            let p: stevedore_protocol::types::ZipPrefixPayload =
                serde_json::from_value(job.payload.clone()).map_err(parse_err)?;
            PlanInput::Zip {
                bucket: p.bucket,
                selection: ZipSelection::Prefix(p.prefix),
            }
        }
        JobType::S3ZipObjects => {
            let p: stevedore_protocol::types::ZipObjectsPayload =
                serde_json::from_value(job.payload.clone()).map_err(parse_err)?;
            PlanInput::Zip {
                bucket: p.bucket,
                selection: ZipSelection::Keys(p.keys),
            }
        }
        JobType::S3IndexObjects => PlanInput::Index(
            serde_json::from_value(job.payload.clone()).map_err(parse_err)?,
        ),
    };

    Ok((remote, plan))
}

/// Turn a successful episode's secondary output into the persisted
/// result value (and side effects like the index upsert).
async fn materialize_output(
    inner: &Arc<ManagerInner>,
    job: &Job,
    output: EpisodeOutput,
) -> Result<Option<serde_json::Value>, StoreError> {
    match output {
        EpisodeOutput::None => Ok(None),
        EpisodeOutput::ZipArtifact { path, objects } => Ok(Some(serde_json::json!({
            "artifactPath": path.display().to_string(),
            "objects": objects,
        }))),
        EpisodeOutput::Index { entries } => {
            let payload: stevedore_protocol::types::IndexObjectsPayload =
                serde_json::from_value(job.payload.clone()).unwrap_or(
                    stevedore_protocol::types::IndexObjectsPayload {
                        bucket: String::new(),
                        prefix: None,
                    },
                );
            let count = entries.len();
            let rows: Vec<_> = entries
                .into_iter()
                .map(|e| {
                    let key = match payload.prefix.as_deref() {
                        Some(prefix) if !prefix.is_empty() => {
                            format!("{}{}", prefix, e.key)
                        }
                        _ => e.key,
                    };
                    (key, e.size, e.etag, e.last_modified)
                })
                .collect();
            inner
                .store
                .replace_index_prefix(
                    &job.profile_id,
                    &payload.bucket,
                    payload.prefix.as_deref().unwrap_or(""),
                    &rows,
                )
                .await?;
            Ok(Some(serde_json::json!({ "indexedObjects": count })))
        }
    }
}

/// Record the terminal state, publish `job.completed`, bump metrics
/// and clean up staging for upload-backed jobs.
async fn finish(
    inner: &Arc<ManagerInner>,
    job: &Job,
    status: JobStatus,
    progress: Progress,
    result: Option<serde_json::Value>,
    error: Option<String>,
    error_code: Option<NormalizedErrorCode>,
) -> Result<(), StoreError> {
    let updated = inner
        .store
        .update_job_status(
            &job.id,
            status,
            JobStatusUpdate {
                finished_at: Some(chrono::Utc::now()),
                progress: (!progress.is_empty()).then_some(progress),
                result: result.clone(),
                error: error.clone(),
                error_code,
                ..Default::default()
            },
        )
        .await?;
    if !updated {
        // Lost a race against another terminal writer; the store wins.
        debug!("job {} already terminal, skipping {status}", job.id);
        return Ok(());
    }

    match status {
        JobStatus::Succeeded => METRICS.inc_succeeded(),
        JobStatus::Failed => METRICS.inc_failed(),
        JobStatus::Canceled => METRICS.inc_canceled(),
        _ => {}
    }

    cleanup_staging(inner, job, status).await;

    inner.hub.publish(
        EventKind::JobCompleted,
        Some(job.id.clone()),
        serde_json::to_value(JobCompletedPayload {
            status,
            result,
            error,
            error_code,
        })
        .unwrap_or_default(),
    );
    Ok(())
}

/// Staging trees are removed once their job is terminal; failed jobs
/// keep theirs when the operator asked for debuggable staging.
async fn cleanup_staging(inner: &Arc<ManagerInner>, job: &Job, status: JobStatus) {
    if job.job_type != JobType::TransferSyncStagingToS3 {
        return;
    }
    if status != JobStatus::Succeeded && inner.settings.keep_failed_staging {
        return;
    }
    let Ok(p) = serde_json::from_value::<stevedore_protocol::types::UploadRefPayload>(
        job.payload.clone(),
    ) else {
        return;
    };
    let Ok(session) = inner.store.get_upload_session(&p.upload_id).await else {
        return;
    };
    if let Some(dir) = session.staging_dir {
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => debug!("removed staging dir {}", dir.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("failed to remove staging dir {}: {e}", dir.display()),
        }
    }
}

/// Forward engine telemetry: every progress tick goes to the hub, store
/// writes are throttled to the stats interval, and log lines become
/// `job.log` events.
async fn pump_events(
    inner: Arc<ManagerInner>,
    job_id: JobId,
    mut progress_rx: watch::Receiver<Progress>,
    mut log_rx: mpsc::Receiver<stevedore_protocol::events::JobLogPayload>,
) {
    let mut progress_open = true;
    let mut logs_open = true;
    let mut last_store_write: Option<Instant> = None;

    while progress_open || logs_open {
        tokio::select! {
            changed = progress_rx.changed(), if progress_open => {
                match changed {
                    Ok(()) => {
                        let progress = *progress_rx.borrow_and_update();
                        publish_progress(&inner, &job_id, JobStatus::Running, progress);
                        let due = last_store_write
                            .map(|t| t.elapsed() >= inner.settings.stats_interval)
                            .unwrap_or(true);
                        if due {
                            last_store_write = Some(Instant::now());
                            if let Err(e) =
                                inner.store.update_job_progress(&job_id, &progress).await
                            {
                                warn!("progress write for {job_id} failed: {e}");
                            }
                        }
                    }
                    Err(_) => progress_open = false,
                }
            }
            log = log_rx.recv(), if logs_open => {
                match log {
                    Some(payload) => {
                        inner.hub.publish(
                            EventKind::JobLog,
                            Some(job_id.clone()),
                            serde_json::to_value(payload).unwrap_or_default(),
                        );
                    }
                    None => logs_open = false,
                }
            }
        }
    }

    // Final snapshot so the row reflects the last observed progress.
    let progress = *progress_rx.borrow();
    if !progress.is_empty() {
        let _ = inner.store.update_job_progress(&job_id, &progress).await;
    }
}

fn publish_progress(
    inner: &Arc<ManagerInner>,
    job_id: &JobId,
    status: JobStatus,
    progress: Progress,
) {
    inner.hub.publish(
        EventKind::JobProgress,
        Some(job_id.clone()),
        serde_json::to_value(JobProgressPayload { status, progress }).unwrap_or_default(),
    );
}

/// Keep a bounded set of unknown-classification stderr samples so the
/// taxonomy can grow from real data.
fn sample_unknown_stderr(inner: &Arc<ManagerInner>, job_id: &JobId, stderr: &str) {
    let dir = inner.settings.unknown_errors_dir();
    if std::fs::create_dir_all(&dir).is_err() {
        return;
    }
    let existing = std::fs::read_dir(&dir).map(|d| d.count()).unwrap_or(0);
    if existing >= UNKNOWN_SAMPLE_LIMIT {
        return;
    }
    let sample = truncate_utf8(stderr, 4096);
    let _ = std::fs::write(dir.join(format!("{job_id}.txt")), sample);
}

/// Byte-capped truncation that never splits a UTF-8 code point.
fn truncate_utf8(input: &str, max_bytes: usize) -> String {
    if input.len() <= max_bytes {
        return input.to_string();
    }
    let mut cut = max_bytes;
    while cut > 0 && !input.is_char_boundary(cut) {
        cut -= 1;
    }
    input[..cut].to_string()
}
