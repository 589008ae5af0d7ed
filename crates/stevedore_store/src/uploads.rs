//! Upload session and multipart rows.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use stevedore_protocol::ids::{ProfileId, UploadId};
use stevedore_protocol::types::{UploadMode, UploadSession};

use crate::{Result, Store, StoreError};

#[derive(Debug, Clone, FromRow)]
struct UploadRow {
    id: String,
    profile_id: String,
    bucket: String,
    prefix: Option<String>,
    mode: String,
    staging_dir: Option<String>,
    bytes_budget: i64,
    bytes_tracked: i64,
    committed: i64,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl UploadRow {
    fn into_session(self) -> Result<UploadSession> {
        let context = format!("upload_sessions/{}", self.id);
        Ok(UploadSession {
            id: UploadId::parse(&self.id).map_err(|e| StoreError::corrupt(&context, e))?,
            profile_id: ProfileId::parse(&self.profile_id)
                .map_err(|e| StoreError::corrupt(&context, e))?,
            bucket: self.bucket,
            prefix: self.prefix,
            mode: self
                .mode
                .parse::<UploadMode>()
                .map_err(|e| StoreError::corrupt(&context, e))?,
            staging_dir: self.staging_dir.map(Into::into),
            bytes_budget: self.bytes_budget.max(0) as u64,
            bytes_tracked: self.bytes_tracked.max(0) as u64,
            committed: self.committed != 0,
            created_at: self.created_at,
            expires_at: self.expires_at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewUploadSession {
    pub profile_id: ProfileId,
    pub bucket: String,
    pub prefix: Option<String>,
    pub mode: UploadMode,
    pub staging_dir: Option<std::path::PathBuf>,
    pub bytes_budget: u64,
    pub expires_at: DateTime<Utc>,
}

/// Provider-multipart state, keyed by (session, logical path).
#[derive(Debug, Clone, FromRow)]
pub struct MultipartState {
    pub upload_id: String,
    pub logical_path: String,
    pub bucket: String,
    pub object_key: String,
    pub provider_upload_id: String,
    pub part_size: i64,
    pub file_size: i64,
    pub created_at: DateTime<Utc>,
}

impl Store {
    pub async fn create_upload_session(&self, new: NewUploadSession) -> Result<UploadSession> {
        let id = UploadId::new();
        let now = Utc::now();
        sqlx::query(
            r#"INSERT INTO upload_sessions
               (id, profile_id, bucket, prefix, mode, staging_dir,
                bytes_budget, bytes_tracked, committed, created_at, expires_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, 0, ?8, ?9)"#,
        )
        .bind(id.as_str())
        .bind(new.profile_id.as_str())
        .bind(&new.bucket)
        .bind(&new.prefix)
        .bind(new.mode.as_str())
        .bind(new.staging_dir.map(|p| p.display().to_string()))
        .bind(new.bytes_budget as i64)
        .bind(now)
        .bind(new.expires_at)
        .execute(self.pool())
        .await?;

        self.get_upload_session(&id).await
    }

    pub async fn get_upload_session(&self, id: &UploadId) -> Result<UploadSession> {
        let row: Option<UploadRow> = sqlx::query_as("SELECT * FROM upload_sessions WHERE id = ?1")
            .bind(id.as_str())
            .fetch_optional(self.pool())
            .await?;
        row.ok_or_else(|| StoreError::NotFound(format!("upload session {id}")))?
            .into_session()
    }

    /// Atomically account `delta` bytes against the session budget.
    /// Fails (no row change, returns `false`) when the budget would be
    /// exceeded or the session is already committed.
    pub async fn track_upload_bytes(&self, id: &UploadId, delta: u64) -> Result<bool> {
        let affected = sqlx::query(
            r#"UPDATE upload_sessions
               SET bytes_tracked = bytes_tracked + ?1
               WHERE id = ?2
                 AND committed = 0
                 AND (bytes_budget = 0 OR bytes_tracked + ?1 <= bytes_budget)"#,
        )
        .bind(delta as i64)
        .bind(id.as_str())
        .execute(self.pool())
        .await?
        .rows_affected();
        Ok(affected > 0)
    }

    pub async fn mark_upload_committed(&self, id: &UploadId) -> Result<bool> {
        let affected =
            sqlx::query("UPDATE upload_sessions SET committed = 1 WHERE id = ?1 AND committed = 0")
                .bind(id.as_str())
                .execute(self.pool())
                .await?
                .rows_affected();
        Ok(affected > 0)
    }

    /// Cascades to multipart rows.
    pub async fn delete_upload_session(&self, id: &UploadId) -> Result<bool> {
        let affected = sqlx::query("DELETE FROM upload_sessions WHERE id = ?1")
            .bind(id.as_str())
            .execute(self.pool())
            .await?
            .rows_affected();
        Ok(affected > 0)
    }

    /// Sessions past their TTL, committed or not.
    pub async fn list_expired_upload_sessions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<UploadSession>> {
        let rows: Vec<UploadRow> =
            sqlx::query_as("SELECT * FROM upload_sessions WHERE expires_at < ?1")
                .bind(now)
                .fetch_all(self.pool())
                .await?;
        rows.into_iter().map(UploadRow::into_session).collect()
    }

    // ------------------------------------------------------------------
    // Multipart state
    // ------------------------------------------------------------------

    pub async fn upsert_multipart(&self, state: &MultipartState) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO multipart_uploads
               (upload_id, logical_path, bucket, object_key, provider_upload_id,
                part_size, file_size, created_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
               ON CONFLICT(upload_id, logical_path) DO UPDATE SET
                   provider_upload_id = excluded.provider_upload_id,
                   part_size = excluded.part_size,
                   file_size = excluded.file_size"#,
        )
        .bind(&state.upload_id)
        .bind(&state.logical_path)
        .bind(&state.bucket)
        .bind(&state.object_key)
        .bind(&state.provider_upload_id)
        .bind(state.part_size)
        .bind(state.file_size)
        .bind(state.created_at)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_multipart(
        &self,
        upload_id: &UploadId,
        logical_path: &str,
    ) -> Result<Option<MultipartState>> {
        let row = sqlx::query_as(
            "SELECT * FROM multipart_uploads WHERE upload_id = ?1 AND logical_path = ?2",
        )
        .bind(upload_id.as_str())
        .bind(logical_path)
        .fetch_optional(self.pool())
        .await?;
        Ok(row)
    }

    pub async fn list_multipart(&self, upload_id: &UploadId) -> Result<Vec<MultipartState>> {
        let rows = sqlx::query_as(
            "SELECT * FROM multipart_uploads WHERE upload_id = ?1 ORDER BY logical_path",
        )
        .bind(upload_id.as_str())
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sealer::PlainSealer;
    use crate::NewProfile;
    use std::sync::Arc;
    use stevedore_protocol::types::{ProfileFlags, ProfileSecrets, Provider};

    async fn store_and_session(budget: u64) -> (Store, UploadId) {
        let store = Store::open_in_memory(Arc::new(PlainSealer)).await.unwrap();
        let profile = store
            .create_profile(NewProfile {
                name: "minio".into(),
                provider: Provider::S3Compatible,
                endpoint: None,
                region: None,
                flags: ProfileFlags::default(),
                secrets: ProfileSecrets::default(),
            })
            .await
            .unwrap();
        let session = store
            .create_upload_session(NewUploadSession {
                profile_id: profile.id,
                bucket: "incoming".into(),
                prefix: Some("drop/".into()),
                mode: UploadMode::Staging,
                staging_dir: Some("/tmp/staging/x".into()),
                bytes_budget: budget,
                expires_at: Utc::now() + chrono::Duration::hours(1),
            })
            .await
            .unwrap();
        (store, session.id)
    }

    #[tokio::test]
    async fn byte_budget_is_enforced_atomically() {
        let (store, id) = store_and_session(1024).await;

        assert!(store.track_upload_bytes(&id, 600).await.unwrap());
        assert!(store.track_upload_bytes(&id, 424).await.unwrap());
        // Next byte would exceed the budget.
        assert!(!store.track_upload_bytes(&id, 1).await.unwrap());

        let session = store.get_upload_session(&id).await.unwrap();
        assert_eq!(session.bytes_tracked, 1024);
    }

    #[tokio::test]
    async fn zero_budget_means_unlimited() {
        let (store, id) = store_and_session(0).await;
        assert!(store.track_upload_bytes(&id, u32::MAX as u64).await.unwrap());
    }

    #[tokio::test]
    async fn committed_sessions_reject_new_bytes() {
        let (store, id) = store_and_session(0).await;
        assert!(store.mark_upload_committed(&id).await.unwrap());
        // Commit is one-shot and further bytes are refused.
        assert!(!store.mark_upload_committed(&id).await.unwrap());
        assert!(!store.track_upload_bytes(&id, 1).await.unwrap());
    }

    #[tokio::test]
    async fn expired_sessions_are_listed() {
        let (store, id) = store_and_session(0).await;
        assert!(store
            .list_expired_upload_sessions(Utc::now())
            .await
            .unwrap()
            .is_empty());
        let expired = store
            .list_expired_upload_sessions(Utc::now() + chrono::Duration::hours(2))
            .await
            .unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, id);
    }

    #[tokio::test]
    async fn multipart_rows_cascade_with_the_session() {
        let (store, id) = store_and_session(0).await;
        store
            .upsert_multipart(&MultipartState {
                upload_id: id.as_str().to_string(),
                logical_path: "videos/a.mp4".into(),
                bucket: "incoming".into(),
                object_key: "drop/videos/a.mp4".into(),
                provider_upload_id: "mpu-123".into(),
                part_size: 8 * 1024 * 1024,
                file_size: 20 * 1024 * 1024,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        assert!(store
            .get_multipart(&id, "videos/a.mp4")
            .await
            .unwrap()
            .is_some());

        store.delete_upload_session(&id).await.unwrap();
        assert!(store
            .get_multipart(&id, "videos/a.mp4")
            .await
            .unwrap()
            .is_none());
    }
}
