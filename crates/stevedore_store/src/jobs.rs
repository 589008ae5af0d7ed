//! Job rows: creation, guarded status transitions, cursor listing,
//! retention sweeps and crash recovery.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use tracing::info;

use stevedore_protocol::error::NormalizedErrorCode;
use stevedore_protocol::ids::{JobId, ProfileId};
use stevedore_protocol::types::{Job, JobStatus, JobType, Progress};

use crate::{Result, Store, StoreError};

#[derive(Debug, Clone, FromRow)]
struct JobRow {
    id: String,
    profile_id: String,
    job_type: String,
    status: String,
    payload: String,
    progress: Option<String>,
    result: Option<String>,
    error: Option<String>,
    error_code: Option<String>,
    attempt: i64,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl JobRow {
    fn into_job(self) -> Result<Job> {
        let context = format!("jobs/{}", self.id);
        Ok(Job {
            id: JobId::parse(&self.id).map_err(|e| StoreError::corrupt(&context, e))?,
            profile_id: ProfileId::parse(&self.profile_id)
                .map_err(|e| StoreError::corrupt(&context, e))?,
            job_type: self
                .job_type
                .parse::<JobType>()
                .map_err(|e| StoreError::corrupt(&context, e))?,
            status: self
                .status
                .parse::<JobStatus>()
                .map_err(|e| StoreError::corrupt(&context, e))?,
            payload: serde_json::from_str(&self.payload)
                .map_err(|e| StoreError::corrupt(&context, e))?,
            progress: self
                .progress
                .as_deref()
                .map(serde_json::from_str::<Progress>)
                .transpose()
                .map_err(|e| StoreError::corrupt(&context, e))?,
            result: self
                .result
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .map_err(|e| StoreError::corrupt(&context, e))?,
            error: self.error,
            error_code: self
                .error_code
                .as_deref()
                .map(str::parse::<NormalizedErrorCode>)
                .transpose()
                .map_err(|e| StoreError::corrupt(&context, e))?,
            attempt: self.attempt.max(0) as u32,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        })
    }
}

/// Input for `create_job`.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub profile_id: ProfileId,
    pub job_type: JobType,
    pub payload: serde_json::Value,
}

/// Listing filter. All fields optional.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<JobType>,
    pub profile_id: Option<ProfileId>,
}

/// Atomic status transition. Fields left `None` keep their current
/// value (`started_at`/`finished_at` are only ever set once).
#[derive(Debug, Clone, Default)]
pub struct JobStatusUpdate {
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub progress: Option<Progress>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub error_code: Option<NormalizedErrorCode>,
    pub attempt: Option<u32>,
}

/// SQL fragment listing statuses that may transition into `next`.
fn legal_predecessors(next: JobStatus) -> String {
    let preds: Vec<String> = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::Canceled,
    ]
    .into_iter()
    .filter(|prev| prev.can_transition_to(next))
    .map(|prev| format!("'{}'", prev.as_str()))
    .collect();
    preds.join(",")
}

impl Store {
    pub async fn create_job(&self, new: NewJob) -> Result<Job> {
        let id = JobId::new();
        let now = Utc::now();
        sqlx::query(
            r#"INSERT INTO jobs (id, profile_id, job_type, status, payload, attempt, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)"#,
        )
        .bind(id.as_str())
        .bind(new.profile_id.as_str())
        .bind(new.job_type.as_str())
        .bind(JobStatus::Queued.as_str())
        .bind(new.payload.to_string())
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_job(&id).await
    }

    pub async fn get_job(&self, id: &JobId) -> Result<Job> {
        let row: Option<JobRow> = sqlx::query_as("SELECT * FROM jobs WHERE id = ?1")
            .bind(id.as_str())
            .fetch_optional(self.pool())
            .await?;
        row.ok_or_else(|| StoreError::NotFound(format!("job {id}")))?
            .into_job()
    }

    /// Descending-id cursor pagination. Returns the page and, when the
    /// page is full, the cursor for the next one.
    pub async fn list_jobs(
        &self,
        filter: &JobFilter,
        cursor: Option<&JobId>,
        limit: u32,
    ) -> Result<(Vec<Job>, Option<JobId>)> {
        let limit = limit.clamp(1, 500);
        let rows: Vec<JobRow> = sqlx::query_as(
            r#"SELECT * FROM jobs
               WHERE (?1 IS NULL OR status = ?1)
                 AND (?2 IS NULL OR job_type = ?2)
                 AND (?3 IS NULL OR profile_id = ?3)
                 AND (?4 IS NULL OR id < ?4)
               ORDER BY id DESC
               LIMIT ?5"#,
        )
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.job_type.map(|t| t.as_str()))
        .bind(filter.profile_id.as_ref().map(|p| p.as_str().to_string()))
        .bind(cursor.map(|c| c.as_str().to_string()))
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await?;

        let full_page = rows.len() as u32 == limit;
        let jobs = rows
            .into_iter()
            .map(JobRow::into_job)
            .collect::<Result<Vec<_>>>()?;
        let next = if full_page {
            jobs.last().map(|j| j.id.clone())
        } else {
            None
        };
        Ok((jobs, next))
    }

    /// Guarded transition. Returns `false` (no-op) when the transition
    /// is illegal for the row's current status or the row is gone.
    pub async fn update_job_status(
        &self,
        id: &JobId,
        status: JobStatus,
        update: JobStatusUpdate,
    ) -> Result<bool> {
        // A requeue clears the episode columns so the queued invariant
        // (startedAt unset while queued) holds for the next episode;
        // every other transition sets timestamps at most once.
        let sql = format!(
            r#"UPDATE jobs SET
                   status = ?1,
                   started_at = CASE WHEN ?1 = 'queued' THEN NULL
                                     ELSE COALESCE(started_at, ?2) END,
                   finished_at = CASE WHEN ?1 = 'queued' THEN NULL
                                      ELSE COALESCE(finished_at, ?3) END,
                   progress = CASE WHEN ?1 = 'queued' THEN NULL
                                   ELSE COALESCE(?9, progress) END,
                   result = COALESCE(?4, result),
                   error = COALESCE(?5, error),
                   error_code = COALESCE(?6, error_code),
                   attempt = COALESCE(?7, attempt)
               WHERE id = ?8 AND status IN ({})"#,
            legal_predecessors(status)
        );

        let affected = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(update.started_at)
            .bind(update.finished_at)
            .bind(update.result.map(|r| r.to_string()))
            .bind(update.error)
            .bind(update.error_code.map(|c| c.as_str()))
            .bind(update.attempt.map(|a| a as i64))
            .bind(id.as_str())
            .bind(
                update
                    .progress
                    .map(|p| serde_json::to_string(&p))
                    .transpose()
                    .map_err(|e| StoreError::corrupt("progress", e))?,
            )
            .execute(self.pool())
            .await?
            .rows_affected();
        Ok(affected > 0)
    }

    /// Lightweight progress write; only lands while the job is running.
    pub async fn update_job_progress(&self, id: &JobId, progress: &Progress) -> Result<bool> {
        let affected = sqlx::query(
            "UPDATE jobs SET progress = ?1 WHERE id = ?2 AND status = 'running'",
        )
        .bind(serde_json::to_string(progress).map_err(|e| StoreError::corrupt("progress", e))?)
        .bind(id.as_str())
        .execute(self.pool())
        .await?
        .rows_affected();
        Ok(affected > 0)
    }

    /// Cancel a job only if it is still waiting in the queue. Running
    /// jobs are canceled through their episode token instead.
    pub async fn cancel_queued(&self, id: &JobId, message: &str) -> Result<bool> {
        let affected = sqlx::query(
            r#"UPDATE jobs SET
                   status = 'canceled',
                   finished_at = ?1,
                   error = ?2,
                   error_code = ?3
               WHERE id = ?4 AND status = 'queued'"#,
        )
        .bind(Utc::now())
        .bind(message)
        .bind(NormalizedErrorCode::Canceled.as_str())
        .bind(id.as_str())
        .execute(self.pool())
        .await?
        .rows_affected();
        Ok(affected > 0)
    }

    /// Persist the attempt counter at retry start.
    pub async fn set_job_attempt(&self, id: &JobId, attempt: u32) -> Result<()> {
        sqlx::query("UPDATE jobs SET attempt = ?1 WHERE id = ?2")
            .bind(attempt as i64)
            .bind(id.as_str())
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn delete_job(&self, id: &JobId) -> Result<bool> {
        let affected = sqlx::query("DELETE FROM jobs WHERE id = ?1")
            .bind(id.as_str())
            .execute(self.pool())
            .await?
            .rows_affected();
        Ok(affected > 0)
    }

    /// Delete terminal jobs finished before `older_than`. Returns the
    /// ids removed so the caller can clean log files and publish the
    /// deletion event.
    pub async fn sweep_finished_jobs(
        &self,
        older_than: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<JobId>> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"SELECT id FROM jobs
               WHERE finished_at IS NOT NULL AND finished_at < ?1
               ORDER BY finished_at ASC
               LIMIT ?2"#,
        )
        .bind(older_than)
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await?;

        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut tx = self.pool().begin().await?;
        for id in &ids {
            sqlx::query("DELETE FROM jobs WHERE id = ?1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        ids.into_iter()
            .map(|id| JobId::parse(&id).map_err(|e| StoreError::corrupt("jobs", e)))
            .collect()
    }

    /// Crash recovery, fail flavor: every `running` row becomes
    /// `failed / server_restarted`.
    pub async fn fail_running(&self, message: &str) -> Result<Vec<JobId>> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM jobs WHERE status = 'running'")
            .fetch_all(self.pool())
            .await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let now = Utc::now();
        sqlx::query(
            r#"UPDATE jobs SET
                   status = 'failed',
                   finished_at = ?1,
                   error = ?2,
                   error_code = ?3
               WHERE status = 'running'"#,
        )
        .bind(now)
        .bind(message)
        .bind(NormalizedErrorCode::ServerRestarted.as_str())
        .execute(self.pool())
        .await?;
        info!("failed {} jobs left running by a previous process", ids.len());

        ids.into_iter()
            .map(|id| JobId::parse(&id).map_err(|e| StoreError::corrupt("jobs", e)))
            .collect()
    }

    /// Crash recovery, requeue flavor: `running` rows go back to
    /// `queued` with the attempt counter preserved.
    pub async fn requeue_running(&self) -> Result<Vec<JobId>> {
        let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM jobs WHERE status = 'running'")
            .fetch_all(self.pool())
            .await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        sqlx::query(
            r#"UPDATE jobs SET
                   status = 'queued',
                   started_at = NULL,
                   finished_at = NULL,
                   progress = NULL
               WHERE status = 'running'"#,
        )
        .execute(self.pool())
        .await?;
        info!("requeued {} jobs left running by a previous process", ids.len());

        ids.into_iter()
            .map(|id| JobId::parse(&id).map_err(|e| StoreError::corrupt("jobs", e)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sealer::PlainSealer;
    use crate::NewProfile;
    use std::sync::Arc;
    use stevedore_protocol::types::{ProfileFlags, ProfileSecrets, Provider};

    async fn store_with_profile() -> (Store, ProfileId) {
        let store = Store::open_in_memory(Arc::new(PlainSealer)).await.unwrap();
        let profile = store
            .create_profile(NewProfile {
                name: "minio".into(),
                provider: Provider::S3Compatible,
                endpoint: Some("http://127.0.0.1:9000".into()),
                region: None,
                flags: ProfileFlags::default(),
                secrets: ProfileSecrets::default(),
            })
            .await
            .unwrap();
        (store, profile.id)
    }

    fn copy_payload() -> serde_json::Value {
        serde_json::json!({
            "srcBucket": "a", "srcKey": "k", "dstBucket": "b", "dstKey": "k"
        })
    }

    #[tokio::test]
    async fn create_and_fetch() {
        let (store, profile_id) = store_with_profile().await;
        let job = store
            .create_job(NewJob {
                profile_id,
                job_type: JobType::TransferCopyObject,
                payload: copy_payload(),
            })
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempt, 0);
        assert!(job.started_at.is_none());

        let loaded = store.get_job(&job.id).await.unwrap();
        assert_eq!(loaded.id, job.id);
    }

    #[tokio::test]
    async fn illegal_transitions_are_noops() {
        let (store, profile_id) = store_with_profile().await;
        let job = store
            .create_job(NewJob {
                profile_id,
                job_type: JobType::TransferCopyObject,
                payload: copy_payload(),
            })
            .await
            .unwrap();

        // queued -> succeeded skips running: rejected.
        let ok = store
            .update_job_status(&job.id, JobStatus::Succeeded, JobStatusUpdate::default())
            .await
            .unwrap();
        assert!(!ok);

        // queued -> running -> succeeded.
        assert!(store
            .update_job_status(
                &job.id,
                JobStatus::Running,
                JobStatusUpdate {
                    started_at: Some(Utc::now()),
                    ..Default::default()
                }
            )
            .await
            .unwrap());
        assert!(store
            .update_job_status(
                &job.id,
                JobStatus::Succeeded,
                JobStatusUpdate {
                    finished_at: Some(Utc::now()),
                    ..Default::default()
                }
            )
            .await
            .unwrap());

        // Terminal is final.
        let ok = store
            .update_job_status(&job.id, JobStatus::Running, JobStatusUpdate::default())
            .await
            .unwrap();
        assert!(!ok);
        let reloaded = store.get_job(&job.id).await.unwrap();
        assert_eq!(reloaded.status, JobStatus::Succeeded);
        assert!(reloaded.finished_at.is_some());
    }

    #[tokio::test]
    async fn progress_only_lands_while_running() {
        let (store, profile_id) = store_with_profile().await;
        let job = store
            .create_job(NewJob {
                profile_id,
                job_type: JobType::TransferCopyObject,
                payload: copy_payload(),
            })
            .await
            .unwrap();

        let progress = Progress {
            objects_done: Some(3),
            ..Default::default()
        };
        assert!(!store.update_job_progress(&job.id, &progress).await.unwrap());

        store
            .update_job_status(
                &job.id,
                JobStatus::Running,
                JobStatusUpdate {
                    started_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(store.update_job_progress(&job.id, &progress).await.unwrap());
        let loaded = store.get_job(&job.id).await.unwrap();
        assert_eq!(loaded.progress.unwrap().objects_done, Some(3));
    }

    #[tokio::test]
    async fn cursor_pagination_descends() {
        let (store, profile_id) = store_with_profile().await;
        let mut created = Vec::new();
        for _ in 0..5 {
            created.push(
                store
                    .create_job(NewJob {
                        profile_id: profile_id.clone(),
                        job_type: JobType::TransferCopyObject,
                        payload: copy_payload(),
                    })
                    .await
                    .unwrap()
                    .id,
            );
            // ULIDs only order across distinct milliseconds.
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        let filter = JobFilter::default();
        let (page1, cursor) = store.list_jobs(&filter, None, 2).await.unwrap();
        assert_eq!(page1.len(), 2);
        assert_eq!(page1[0].id, created[4]);
        assert_eq!(page1[1].id, created[3]);

        let cursor = cursor.unwrap();
        let (page2, _) = store.list_jobs(&filter, Some(&cursor), 2).await.unwrap();
        assert_eq!(page2[0].id, created[2]);
        assert_eq!(page2[1].id, created[1]);
    }

    #[tokio::test]
    async fn crash_recovery_fail_flavor() {
        let (store, profile_id) = store_with_profile().await;
        let job = store
            .create_job(NewJob {
                profile_id,
                job_type: JobType::TransferCopyObject,
                payload: copy_payload(),
            })
            .await
            .unwrap();
        store
            .update_job_status(
                &job.id,
                JobStatus::Running,
                JobStatusUpdate {
                    started_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let failed = store.fail_running("server restarted").await.unwrap();
        assert_eq!(failed, vec![job.id.clone()]);

        let loaded = store.get_job(&job.id).await.unwrap();
        assert_eq!(loaded.status, JobStatus::Failed);
        assert_eq!(
            loaded.error_code,
            Some(NormalizedErrorCode::ServerRestarted)
        );
        assert!(loaded.finished_at.is_some());
    }

    #[tokio::test]
    async fn crash_recovery_requeue_flavor_preserves_attempt() {
        let (store, profile_id) = store_with_profile().await;
        let job = store
            .create_job(NewJob {
                profile_id,
                job_type: JobType::TransferCopyObject,
                payload: copy_payload(),
            })
            .await
            .unwrap();
        store
            .update_job_status(
                &job.id,
                JobStatus::Running,
                JobStatusUpdate {
                    started_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store.set_job_attempt(&job.id, 2).await.unwrap();

        let requeued = store.requeue_running().await.unwrap();
        assert_eq!(requeued.len(), 1);

        let loaded = store.get_job(&job.id).await.unwrap();
        assert_eq!(loaded.status, JobStatus::Queued);
        assert_eq!(loaded.attempt, 2);
        assert!(loaded.started_at.is_none());
    }

    #[tokio::test]
    async fn retention_sweep_removes_old_terminal_jobs() {
        let (store, profile_id) = store_with_profile().await;
        let job = store
            .create_job(NewJob {
                profile_id,
                job_type: JobType::TransferCopyObject,
                payload: copy_payload(),
            })
            .await
            .unwrap();
        store
            .update_job_status(
                &job.id,
                JobStatus::Running,
                JobStatusUpdate {
                    started_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .update_job_status(
                &job.id,
                JobStatus::Failed,
                JobStatusUpdate {
                    finished_at: Some(Utc::now() - chrono::Duration::days(30)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let swept = store
            .sweep_finished_jobs(Utc::now() - chrono::Duration::days(14), 100)
            .await
            .unwrap();
        assert_eq!(swept, vec![job.id.clone()]);
        assert!(matches!(
            store.get_job(&job.id).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
