//! Job manager: admission, cancellation, deletion, crash recovery and
//! the retention sweeper.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use stevedore_engine::{EngineError, EngineProbe, EngineSupervisor};
use stevedore_events::EventHub;
use stevedore_protocol::config::{RestartPolicy, Settings};
use stevedore_protocol::events::{DeletedReason, EventKind, JobsDeletedPayload};
use stevedore_protocol::ids::{JobId, ProfileId, UploadId};
use stevedore_protocol::types::{
    validate_payload, Job, JobStatus, JobType, UploadRefPayload, ValidationContext,
    ValidationError,
};
use stevedore_store::{NewJob, Store, StoreError};

use crate::metrics::METRICS;
use crate::worker;

/// How often the maintenance loop runs.
const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);
/// Max rows removed per sweep turn.
const SWEEP_BATCH: u32 = 256;

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("job queue is full ({queue_depth}/{queue_capacity})")]
    QueueFull {
        queue_depth: usize,
        queue_capacity: usize,
        retry_after_secs: u64,
    },

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum DeleteJobError {
    #[error("job is running; cancel it first")]
    Running,

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub(crate) struct ManagerInner {
    pub store: Store,
    pub hub: Arc<EventHub>,
    pub supervisor: Arc<EngineSupervisor>,
    pub probe: Arc<EngineProbe>,
    pub settings: Settings,
    pub queue_tx: async_channel::Sender<JobId>,
    pub queue_rx: async_channel::Receiver<JobId>,
    pub cancellations: Mutex<HashMap<String, CancellationToken>>,
    pub root: CancellationToken,
}

/// Front door for everything job-lifecycle. Cheap to clone.
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<ManagerInner>,
}

impl JobManager {
    pub fn new(
        store: Store,
        hub: Arc<EventHub>,
        supervisor: Arc<EngineSupervisor>,
        probe: Arc<EngineProbe>,
        settings: Settings,
    ) -> Self {
        let capacity = settings.job_queue_capacity.max(1);
        let (queue_tx, queue_rx) = async_channel::bounded(capacity);
        Self {
            inner: Arc::new(ManagerInner {
                store,
                hub,
                supervisor,
                probe,
                settings,
                queue_tx,
                queue_rx,
                cancellations: Mutex::new(HashMap::new()),
                root: CancellationToken::new(),
            }),
        }
    }

    /// Crash recovery, then workers, then the sweeper.
    pub async fn start(&self) -> Result<(), StoreError> {
        let recovered = match self.inner.settings.restart_policy {
            RestartPolicy::Fail => {
                let failed = self
                    .inner
                    .store
                    .fail_running("server restarted while the job was running")
                    .await?;
                for id in &failed {
                    self.publish_completed_from_store(id).await;
                }
                Vec::new()
            }
            RestartPolicy::Requeue => self.inner.store.requeue_running().await?,
        };

        // Zero workers is a valid (test) configuration: admission still
        // works, nothing drains.
        for i in 0..self.inner.settings.job_concurrency {
            let inner = self.inner.clone();
            tokio::spawn(async move { worker::worker_loop(inner, i).await });
        }

        // Requeued rows go back on the wire once workers are draining.
        for id in recovered {
            if self.inner.queue_tx.send(id.clone()).await.is_err() {
                warn!("ready queue closed while requeuing {id}");
            }
        }

        let inner = self.inner.clone();
        tokio::spawn(async move { sweeper_loop(inner).await });
        Ok(())
    }

    /// Stop workers and cancel every running episode.
    pub fn shutdown(&self) {
        self.inner.root.cancel();
        self.inner.queue_rx.close();
    }

    pub fn queue_depth(&self) -> usize {
        self.inner.queue_tx.len()
    }

    pub fn queue_capacity(&self) -> usize {
        self.inner.settings.job_queue_capacity.max(1)
    }

    /// Admission: engine gate, payload validation, insert, queue push.
    /// A full queue rolls the row back so no zombie `queued` row stays
    /// behind that no worker will ever see.
    pub async fn submit(
        &self,
        profile_id: &ProfileId,
        job_type: JobType,
        payload: serde_json::Value,
    ) -> Result<Job, SubmitError> {
        self.inner.probe.verify().await?;

        let profile = self.inner.store.get_profile(profile_id).await?;
        let ctx = ValidationContext {
            local_path_allowlist: self.inner.settings.local_path_allowlist.clone(),
            preserve_leading_slash: profile.flags.preserve_leading_slash,
        };
        validate_payload(job_type, &payload, &ctx)?;

        // Upload-backed jobs must reference a live session.
        if matches!(
            job_type,
            JobType::TransferSyncStagingToS3 | JobType::TransferDirectUpload
        ) {
            let upload_ref: UploadRefPayload = serde_json::from_value(payload.clone())
                .map_err(|e| ValidationError::new(format!("invalid payload: {e}")))?;
            self.require_upload_session(&upload_ref.upload_id).await?;
        }

        let job = self
            .inner
            .store
            .create_job(NewJob {
                profile_id: profile_id.clone(),
                job_type,
                payload,
            })
            .await?;

        if let Err(e) = self.inner.queue_tx.try_send(job.id.clone()) {
            // Roll back: a queued row the scheduler cannot reach is a zombie.
            let _ = self.inner.store.delete_job(&job.id).await;
            METRICS.inc_rejected();
            let queue_depth = self.queue_depth();
            let queue_capacity = self.queue_capacity();
            return match e {
                async_channel::TrySendError::Full(_) => Err(SubmitError::QueueFull {
                    queue_depth,
                    queue_capacity,
                    retry_after_secs: (queue_depth as u64 + 1).clamp(1, 60),
                }),
                async_channel::TrySendError::Closed(_) => Err(SubmitError::Validation(
                    ValidationError::new("scheduler is shut down"),
                )),
            };
        }

        METRICS.inc_submitted();
        self.inner.hub.publish(
            EventKind::JobCreated,
            Some(job.id.clone()),
            serde_json::to_value(&job).unwrap_or_default(),
        );
        Ok(job)
    }

    /// Idempotent cancellation. Queued jobs flip in the store; running
    /// jobs get their episode token fired and the worker records the
    /// terminal state. Terminal jobs are untouched.
    pub async fn cancel(&self, id: &JobId) -> Result<Job, StoreError> {
        let fired = {
            let cancellations = self.inner.cancellations.lock().unwrap();
            if let Some(token) = cancellations.get(id.as_str()) {
                token.cancel();
                true
            } else {
                false
            }
        };

        if !fired {
            let flipped = self
                .inner
                .store
                .cancel_queued(id, stevedore_protocol::defaults::CANCELED_BY_USER_MESSAGE)
                .await?;
            if flipped {
                METRICS.inc_canceled();
                self.publish_completed_from_store(id).await;
            }
        }

        self.inner.store.get_job(id).await
    }

    /// Delete a terminal or queued job (queued jobs are canceled
    /// first). Running jobs must be canceled explicitly.
    pub async fn delete(&self, id: &JobId) -> Result<(), DeleteJobError> {
        let job = self.inner.store.get_job(id).await?;
        match job.status {
            JobStatus::Running => return Err(DeleteJobError::Running),
            JobStatus::Queued => {
                let _ = self
                    .inner
                    .store
                    .cancel_queued(id, stevedore_protocol::defaults::CANCELED_BY_USER_MESSAGE)
                    .await?;
            }
            _ => {}
        }
        self.inner.store.delete_job(id).await?;
        remove_job_files(&self.inner.settings, id);
        self.inner.hub.publish(
            EventKind::JobsDeleted,
            None,
            serde_json::to_value(JobsDeletedPayload {
                job_ids: vec![id.clone()],
                reason: DeletedReason::Manual,
            })
            .unwrap_or_default(),
        );
        Ok(())
    }

    async fn require_upload_session(&self, upload_id: &UploadId) -> Result<(), SubmitError> {
        let session = self.inner.store.get_upload_session(upload_id).await?;
        if session.expires_at < chrono::Utc::now() {
            return Err(
                ValidationError::new(format!("upload session {upload_id} has expired")).into(),
            );
        }
        Ok(())
    }

    async fn publish_completed_from_store(&self, id: &JobId) {
        if let Ok(job) = self.inner.store.get_job(id).await {
            self.inner.hub.publish(
                EventKind::JobCompleted,
                Some(id.clone()),
                serde_json::to_value(stevedore_protocol::events::JobCompletedPayload {
                    status: job.status,
                    result: job.result,
                    error: job.error,
                    error_code: job.error_code,
                })
                .unwrap_or_default(),
            );
        }
    }
}

/// Remove a job's log, cmd and artifact files.
pub(crate) fn remove_job_files(settings: &Settings, id: &JobId) {
    let logs = settings.jobs_log_dir();
    for name in [format!("{id}.log"), format!("{id}.cmd")] {
        let path = logs.join(name);
        if let Err(e) = std::fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to remove {}: {e}", path.display());
            }
        }
    }
    let artifact = settings.artifacts_dir().join(format!("{id}.zip"));
    if let Err(e) = std::fs::remove_file(&artifact) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("failed to remove {}: {e}", artifact.display());
        }
    }
}

/// Maintenance loop: job retention, orphan log files.
async fn sweeper_loop(inner: Arc<ManagerInner>) {
    let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = inner.root.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if let Some(retention) = inner.settings.job_retention {
            let cutoff = chrono::Utc::now()
                - chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::days(14));
            match inner.store.sweep_finished_jobs(cutoff, SWEEP_BATCH).await {
                Ok(swept) if !swept.is_empty() => {
                    info!("retention sweep removed {} jobs", swept.len());
                    METRICS.add_swept(swept.len() as u64);
                    for id in &swept {
                        remove_job_files(&inner.settings, id);
                    }
                    inner.hub.publish(
                        EventKind::JobsDeleted,
                        None,
                        serde_json::to_value(JobsDeletedPayload {
                            job_ids: swept,
                            reason: DeletedReason::Retention,
                        })
                        .unwrap_or_default(),
                    );
                }
                Ok(_) => {}
                Err(e) => warn!("retention sweep failed: {e}"),
            }
        }

        if let Some(log_retention) = inner.settings.job_log_retention {
            sweep_orphan_logs(&inner, log_retention).await;
        }
    }
}

/// Remove log files whose job row is gone and whose mtime is past the
/// log retention window.
async fn sweep_orphan_logs(inner: &Arc<ManagerInner>, retention: std::time::Duration) {
    let dir = inner.settings.jobs_log_dir();
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let Ok(job_id) = JobId::parse(stem) else {
            continue;
        };
        let old_enough = entry
            .metadata()
            .and_then(|m| m.modified())
            .map(|m| m.elapsed().unwrap_or_default() > retention)
            .unwrap_or(false);
        if !old_enough {
            continue;
        }
        match inner.store.get_job(&job_id).await {
            Err(StoreError::NotFound(_)) => {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!("failed to remove orphan log {}: {e}", path.display());
                }
            }
            _ => {}
        }
    }
}
