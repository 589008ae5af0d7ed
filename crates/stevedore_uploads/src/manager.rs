//! Session lifecycle: create, receive bytes, presign, commit, expire.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use stevedore_engine::plan::RemoteSpec;
use stevedore_engine::EngineSupervisor;
use stevedore_protocol::capabilities::capabilities_for;
use stevedore_protocol::config::Settings;
use stevedore_protocol::ids::{ProfileId, UploadId};
use stevedore_protocol::types::{JobType, UploadMode, UploadSession};
use stevedore_store::{MultipartState, NewUploadSession, Store, StoreError};

use crate::error::UploadError;
use crate::paths::{sanitize_relative_path, staging_file_path};
use crate::presign::Presigner;

/// Default lifetime of issued presigned URLs.
const PRESIGN_EXPIRY: Duration = Duration::from_secs(3600);
/// How often expired sessions are swept.
const TTL_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct NewSessionRequest {
    pub profile_id: ProfileId,
    pub bucket: String,
    pub prefix: Option<String>,
    pub mode: UploadMode,
    /// 0 = inherit the server-wide cap (which may itself be 0 =
    /// unlimited).
    pub bytes_budget: u64,
}

/// What `commit` decided. The HTTP layer turns `TransferJob` into a
/// scheduler submit; `MultipartFinalized` needs no job.
#[derive(Debug)]
pub enum CommitOutcome {
    TransferJob {
        job_type: JobType,
        payload: serde_json::Value,
        profile_id: ProfileId,
    },
    MultipartFinalized {
        completed: usize,
    },
}

/// Presigned part URL plus the provider upload id backing it.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresignedPart {
    pub url: String,
    pub provider_upload_id: String,
    pub part_number: i32,
}

struct ManagerInner {
    store: Store,
    settings: Settings,
    supervisor: Arc<EngineSupervisor>,
}

#[derive(Clone)]
pub struct UploadManager {
    inner: Arc<ManagerInner>,
}

impl UploadManager {
    pub fn new(store: Store, settings: Settings, supervisor: Arc<EngineSupervisor>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                store,
                settings,
                supervisor,
            }),
        }
    }

    pub async fn create_session(
        &self,
        request: NewSessionRequest,
    ) -> Result<UploadSession, UploadError> {
        let profile = self.inner.store.get_profile(&request.profile_id).await?;
        let capability = capabilities_for(profile.provider).upload_mode(request.mode);
        if !capability.supported {
            return Err(UploadError::CapabilityDenied {
                mode: request.mode,
                reason: capability.reason.unwrap_or("unsupported"),
            });
        }

        let server_cap = self.inner.settings.upload_max_bytes;
        let bytes_budget = match (request.bytes_budget, server_cap) {
            (0, cap) => cap,
            (requested, 0) => requested,
            (requested, cap) => requested.min(cap),
        };

        let id_for_dir = UploadId::new();
        let staging_dir = if request.mode == UploadMode::Staging {
            let dir = self.inner.settings.staging_dir().join(id_for_dir.as_str());
            create_private_dir(&dir)?;
            Some(dir)
        } else {
            None
        };

        let session = self
            .inner
            .store
            .create_upload_session(NewUploadSession {
                profile_id: request.profile_id,
                bucket: request.bucket,
                prefix: request.prefix,
                mode: request.mode,
                staging_dir: staging_dir.clone(),
                bytes_budget,
                expires_at: Utc::now()
                    + chrono::Duration::from_std(self.inner.settings.upload_ttl)
                        .unwrap_or_else(|_| chrono::Duration::hours(24)),
            })
            .await;

        match session {
            Ok(session) => {
                info!(
                    "upload session {} created ({:?}, budget {})",
                    session.id, session.mode, session.bytes_budget
                );
                Ok(session)
            }
            Err(e) => {
                // Roll the directory back; a session row never existed.
                if let Some(dir) = staging_dir {
                    let _ = std::fs::remove_dir_all(dir);
                }
                Err(e.into())
            }
        }
    }

    pub async fn get_session(&self, id: &UploadId) -> Result<UploadSession, UploadError> {
        Ok(self.inner.store.get_upload_session(id).await?)
    }

    /// Receive one staged file. The byte budget is reserved atomically
    /// before anything touches disk.
    pub async fn store_staged_file(
        &self,
        id: &UploadId,
        relative_path: &str,
        data: &[u8],
    ) -> Result<PathBuf, UploadError> {
        let session = self.live_session(id).await?;
        if session.mode != UploadMode::Staging {
            return Err(UploadError::WrongMode);
        }
        let staging_dir = session
            .staging_dir
            .ok_or_else(|| UploadError::Provider("session has no staging dir".to_string()))?;
        let sanitized = sanitize_relative_path(relative_path)?;

        if !self
            .inner
            .store
            .track_upload_bytes(id, data.len() as u64)
            .await?
        {
            return Err(UploadError::BudgetExceeded);
        }

        let target = staging_dir.join(staging_file_path(&sanitized));
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, data).await?;
        debug!("staged {} ({} bytes)", target.display(), data.len());
        Ok(target)
    }

    /// Direct mode: stream the file through the engine to the backend
    /// right now. Bytes are tracked after the transfer (the stream's
    /// length is unknown up front); an over-budget session fails here
    /// and accepts nothing further.
    pub async fn direct_upload(
        &self,
        id: &UploadId,
        relative_path: &str,
        data: &mut (impl AsyncRead + Unpin),
        token: &CancellationToken,
    ) -> Result<u64, UploadError> {
        let session = self.live_session(id).await?;
        if session.mode != UploadMode::Direct {
            return Err(UploadError::WrongMode);
        }
        let sanitized = sanitize_relative_path(relative_path)?;
        let key = object_key(session.prefix.as_deref(), &sanitized);
        let remote = self.remote_spec(&session.profile_id).await?;

        let written = self
            .inner
            .supervisor
            .stream_into_object(&remote, &session.bucket, &key, data, token)
            .await?;

        if !self.inner.store.track_upload_bytes(id, written).await? {
            return Err(UploadError::BudgetExceeded);
        }
        Ok(written)
    }

    /// Presigned single PUT for one logical path.
    pub async fn presign_put(
        &self,
        id: &UploadId,
        relative_path: &str,
    ) -> Result<String, UploadError> {
        let session = self.live_session(id).await?;
        if session.mode != UploadMode::Presigned {
            return Err(UploadError::WrongMode);
        }
        let sanitized = sanitize_relative_path(relative_path)?;
        let key = object_key(session.prefix.as_deref(), &sanitized);
        let presigner = self.presigner(&session.profile_id).await?;
        presigner
            .presign_put(&session.bucket, &key, PRESIGN_EXPIRY)
            .await
    }

    /// Presigned URL for one multipart part. The provider upload is
    /// created on the first part and persisted so resumed uploads can
    /// finish after a server restart.
    pub async fn presign_multipart_part(
        &self,
        id: &UploadId,
        relative_path: &str,
        part_number: i32,
        part_size: u64,
        file_size: u64,
    ) -> Result<PresignedPart, UploadError> {
        if part_number < 1 {
            return Err(UploadError::InvalidPath(
                "part numbers start at 1".to_string(),
            ));
        }
        let session = self.live_session(id).await?;
        if session.mode != UploadMode::Presigned {
            return Err(UploadError::WrongMode);
        }
        let sanitized = sanitize_relative_path(relative_path)?;
        let key = object_key(session.prefix.as_deref(), &sanitized);
        let presigner = self.presigner(&session.profile_id).await?;

        let provider_upload_id = match self.inner.store.get_multipart(id, &sanitized).await? {
            Some(state) => state.provider_upload_id,
            None => {
                let provider_upload_id =
                    presigner.create_multipart(&session.bucket, &key).await?;
                self.inner
                    .store
                    .upsert_multipart(&MultipartState {
                        upload_id: id.as_str().to_string(),
                        logical_path: sanitized.clone(),
                        bucket: session.bucket.clone(),
                        object_key: key.clone(),
                        provider_upload_id: provider_upload_id.clone(),
                        part_size: part_size as i64,
                        file_size: file_size as i64,
                        created_at: Utc::now(),
                    })
                    .await?;
                provider_upload_id
            }
        };

        let url = presigner
            .presign_part(
                &session.bucket,
                &key,
                &provider_upload_id,
                part_number,
                PRESIGN_EXPIRY,
            )
            .await?;
        Ok(PresignedPart {
            url,
            provider_upload_id,
            part_number,
        })
    }

    /// Commit the session. One-shot: the committed flag flips
    /// atomically, so a racing double-commit gets `AlreadyCommitted`.
    pub async fn commit(&self, id: &UploadId) -> Result<CommitOutcome, UploadError> {
        let session = self.live_session(id).await?;
        if !self.inner.store.mark_upload_committed(id).await? {
            return Err(UploadError::AlreadyCommitted);
        }

        match session.mode {
            UploadMode::Staging => Ok(CommitOutcome::TransferJob {
                job_type: JobType::TransferSyncStagingToS3,
                payload: serde_json::json!({ "uploadId": session.id }),
                profile_id: session.profile_id,
            }),
            UploadMode::Direct => Ok(CommitOutcome::TransferJob {
                job_type: JobType::TransferDirectUpload,
                payload: serde_json::json!({ "uploadId": session.id }),
                profile_id: session.profile_id,
            }),
            UploadMode::Presigned => {
                let presigner = self.presigner(&session.profile_id).await?;
                let states = self.inner.store.list_multipart(id).await?;
                let completed = states.len();
                for state in states {
                    presigner
                        .complete_multipart(
                            &state.bucket,
                            &state.object_key,
                            &state.provider_upload_id,
                        )
                        .await?;
                }
                Ok(CommitOutcome::MultipartFinalized { completed })
            }
        }
    }

    /// Drop the session: abort provider multiparts (best effort),
    /// remove the staging tree, delete the row.
    pub async fn delete_session(&self, id: &UploadId) -> Result<(), UploadError> {
        let session = self.inner.store.get_upload_session(id).await?;
        self.teardown(&session).await;
        self.inner.store.delete_upload_session(id).await?;
        Ok(())
    }

    /// Spawn the TTL sweeper. Runs until the token fires.
    pub fn spawn_ttl_sweeper(&self, token: CancellationToken) {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TTL_SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                if let Err(e) = manager.sweep_expired().await {
                    warn!("upload TTL sweep failed: {e}");
                }
            }
        });
    }

    /// One sweep pass; public for tests.
    pub async fn sweep_expired(&self) -> Result<usize, UploadError> {
        let expired = self
            .inner
            .store
            .list_expired_upload_sessions(Utc::now())
            .await?;
        let count = expired.len();
        for session in expired {
            info!("sweeping expired upload session {}", session.id);
            self.teardown(&session).await;
            self.inner.store.delete_upload_session(&session.id).await?;
        }
        Ok(count)
    }

    async fn teardown(&self, session: &UploadSession) {
        if session.mode == UploadMode::Presigned {
            if let Ok(presigner) = self.presigner(&session.profile_id).await {
                if let Ok(states) = self.inner.store.list_multipart(&session.id).await {
                    for state in states {
                        if let Err(e) = presigner
                            .abort_multipart(
                                &state.bucket,
                                &state.object_key,
                                &state.provider_upload_id,
                            )
                            .await
                        {
                            warn!(
                                "abort of multipart {} failed: {e}",
                                state.provider_upload_id
                            );
                        }
                    }
                }
            }
        }
        if let Some(dir) = &session.staging_dir {
            match tokio::fs::remove_dir_all(dir).await {
                Ok(()) => debug!("removed staging dir {}", dir.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("failed to remove staging dir {}: {e}", dir.display()),
            }
        }
    }

    async fn live_session(&self, id: &UploadId) -> Result<UploadSession, UploadError> {
        let session = self.inner.store.get_upload_session(id).await?;
        if session.expires_at < Utc::now() {
            return Err(UploadError::Expired);
        }
        if session.committed {
            return Err(UploadError::AlreadyCommitted);
        }
        Ok(session)
    }

    async fn presigner(&self, profile_id: &ProfileId) -> Result<Presigner, UploadError> {
        let profile = self.inner.store.get_profile(profile_id).await?;
        let secrets = self.inner.store.get_profile_secrets(profile_id).await?;
        Presigner::for_profile(&profile, &secrets)
    }

    async fn remote_spec(&self, profile_id: &ProfileId) -> Result<RemoteSpec, UploadError> {
        let profile = self.inner.store.get_profile(profile_id).await?;
        let secrets = self.inner.store.get_profile_secrets(profile_id).await?;
        Ok(RemoteSpec {
            provider: profile.provider,
            endpoint: profile.endpoint,
            region: profile.region,
            flags: profile.flags,
            secrets,
        })
    }
}

fn object_key(prefix: Option<&str>, sanitized: &str) -> String {
    match prefix {
        Some(prefix) if !prefix.is_empty() => {
            format!("{}/{}", prefix.trim_end_matches('/'), sanitized)
        }
        _ => sanitized.to_string(),
    }
}

fn create_private_dir(dir: &std::path::Path) -> Result<(), UploadError> {
    std::fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use stevedore_engine::{EngineSettings, EngineSupervisor};
    use stevedore_protocol::types::{ProfileFlags, ProfileSecrets, Provider};
    use stevedore_store::{sealer::PlainSealer, NewProfile};
    use tempfile::TempDir;

    async fn harness(dir: &TempDir) -> (UploadManager, Store, ProfileId, Settings) {
        let mut settings = Settings::with_data_dir(dir.path());
        settings.upload_ttl = Duration::from_secs(3600);
        let store = Store::open_in_memory(Arc::new(PlainSealer)).await.unwrap();
        let profile_id = store
            .create_profile(NewProfile {
                name: "minio".into(),
                provider: Provider::S3Compatible,
                endpoint: Some("http://127.0.0.1:9000".into()),
                region: None,
                flags: ProfileFlags::default(),
                secrets: ProfileSecrets {
                    access_key_id: Some("minioadmin".into()),
                    secret_access_key: Some("miniosecret".into()),
                    ..Default::default()
                },
            })
            .await
            .unwrap()
            .id;
        let supervisor = Arc::new(EngineSupervisor::new(EngineSettings {
            binary: "/bin/false".into(),
            extra_flags: Vec::new(),
            stats_interval: Duration::from_secs(1),
            tmp_dir: dir.path().join("tmp"),
            artifacts_dir: dir.path().join("artifacts"),
            logs_dir: dir.path().join("logs"),
            log_max_bytes: 0,
            kill_grace: Duration::from_millis(200),
        }));
        let manager = UploadManager::new(store.clone(), settings.clone(), supervisor);
        (manager, store, profile_id, settings)
    }

    fn staging_request(profile_id: ProfileId, budget: u64) -> NewSessionRequest {
        NewSessionRequest {
            profile_id,
            bucket: "incoming".into(),
            prefix: Some("drop/".into()),
            mode: UploadMode::Staging,
            bytes_budget: budget,
        }
    }

    #[tokio::test]
    async fn staged_files_land_under_sanitized_paths() {
        let dir = TempDir::new().unwrap();
        let (manager, _store, profile_id, _) = harness(&dir).await;
        let session = manager
            .create_session(staging_request(profile_id, 0))
            .await
            .unwrap();

        let written = manager
            .store_staged_file(&session.id, "photos/2024/a.jpg", b"hello")
            .await
            .unwrap();
        assert!(written.exists());
        assert!(written.starts_with(session.staging_dir.as_ref().unwrap()));

        let err = manager
            .store_staged_file(&session.id, "../escape.bin", b"x")
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::InvalidPath(_)));
    }

    #[tokio::test]
    async fn byte_budget_rejects_the_overflowing_file() {
        let dir = TempDir::new().unwrap();
        let (manager, store, profile_id, _) = harness(&dir).await;
        let session = manager
            .create_session(staging_request(profile_id, 1024))
            .await
            .unwrap();

        manager
            .store_staged_file(&session.id, "a.bin", &[0u8; 1000])
            .await
            .unwrap();
        let err = manager
            .store_staged_file(&session.id, "b.bin", &[0u8; 100])
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::BudgetExceeded));

        // The rejected file consumed no budget and hit no disk.
        let reloaded = store.get_upload_session(&session.id).await.unwrap();
        assert_eq!(reloaded.bytes_tracked, 1000);
        assert!(!session
            .staging_dir
            .as_ref()
            .unwrap()
            .join("b.bin")
            .exists());
    }

    #[tokio::test]
    async fn commit_of_staging_session_yields_a_transfer_job() {
        let dir = TempDir::new().unwrap();
        let (manager, _store, profile_id, _) = harness(&dir).await;
        let session = manager
            .create_session(staging_request(profile_id.clone(), 0))
            .await
            .unwrap();
        manager
            .store_staged_file(&session.id, "a.bin", &[0u8; 1024])
            .await
            .unwrap();
        manager
            .store_staged_file(&session.id, "b.bin", &[0u8; 1024])
            .await
            .unwrap();

        match manager.commit(&session.id).await.unwrap() {
            CommitOutcome::TransferJob {
                job_type,
                payload,
                profile_id: owner,
            } => {
                assert_eq!(job_type, JobType::TransferSyncStagingToS3);
                assert_eq!(payload["uploadId"], session.id.as_str());
                assert_eq!(owner, profile_id);
            }
            other => panic!("expected TransferJob, got {other:?}"),
        }

        // A second commit is refused.
        assert!(matches!(
            manager.commit(&session.id).await,
            Err(UploadError::AlreadyCommitted)
        ));

        // A committed session refuses further files.
        assert!(matches!(
            manager
                .store_staged_file(&session.id, "c.bin", b"late")
                .await,
            Err(UploadError::AlreadyCommitted)
        ));
    }

    #[tokio::test]
    async fn presigned_mode_is_capability_gated() {
        let dir = TempDir::new().unwrap();
        let (manager, store, _, _) = harness(&dir).await;
        let azure_id = store
            .create_profile(NewProfile {
                name: "azure".into(),
                provider: Provider::AzureBlob,
                endpoint: None,
                region: None,
                flags: ProfileFlags::default(),
                secrets: ProfileSecrets::default(),
            })
            .await
            .unwrap()
            .id;

        let err = manager
            .create_session(NewSessionRequest {
                profile_id: azure_id,
                bucket: "container".into(),
                prefix: None,
                mode: UploadMode::Presigned,
                bytes_budget: 0,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::CapabilityDenied { .. }));
    }

    #[tokio::test]
    async fn expired_sessions_are_swept_with_their_staging_trees() {
        let dir = TempDir::new().unwrap();
        let (manager, store, profile_id, settings) = harness(&dir).await;

        // Seed an already-expired session directly in the store.
        let staging = settings.staging_dir().join("expired-session");
        std::fs::create_dir_all(&staging).unwrap();
        std::fs::write(staging.join("leftover.bin"), b"x").unwrap();
        let session = store
            .create_upload_session(NewUploadSession {
                profile_id,
                bucket: "incoming".into(),
                prefix: None,
                mode: UploadMode::Staging,
                staging_dir: Some(staging.clone()),
                bytes_budget: 0,
                expires_at: Utc::now() - chrono::Duration::minutes(1),
            })
            .await
            .unwrap();

        let swept = manager.sweep_expired().await.unwrap();
        assert_eq!(swept, 1);
        assert!(!staging.exists(), "staging tree removed on expiry");
        assert!(matches!(
            store.get_upload_session(&session.id).await,
            Err(StoreError::NotFound(_))
        ));
    }
}
