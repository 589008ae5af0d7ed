//! End-to-end scheduler tests against a stub engine.
//!
//! Cover the admission/rejection contract, retry backoff, cancellation
//! during backoff, staging cleanup and crash recovery.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use stevedore_engine::{EngineProbe, EngineSettings, EngineSupervisor};
use stevedore_events::EventHub;
use stevedore_protocol::config::{RestartPolicy, RetryPolicy, Settings};
use stevedore_protocol::error::NormalizedErrorCode;
use stevedore_protocol::events::EventKind;
use stevedore_protocol::ids::ProfileId;
use stevedore_protocol::types::{
    JobStatus, JobType, ProfileFlags, ProfileSecrets, Provider, UploadMode,
};
use stevedore_scheduler::{JobManager, SubmitError};
use stevedore_store::{
    sealer::PlainSealer, JobStatusUpdate, NewJob, NewProfile, NewUploadSession, Store,
};

const VERSION_STANZA: &str = r#"if [ "$1" = "version" ]; then
  echo "rclone v1.66.0"
  exit 0
fi"#;

fn write_stub(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("engine-stub.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{VERSION_STANZA}\n{body}\n")).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

fn settings(dir: &Path, stub: &Path) -> Settings {
    let mut settings = Settings::with_data_dir(dir);
    settings.engine_path = Some(stub.to_path_buf());
    settings.job_concurrency = 1;
    settings.job_queue_capacity = 8;
    settings.stats_interval = Duration::from_millis(50);
    settings.retry = RetryPolicy {
        attempts: 2,
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(1),
        jitter_ratio: 0.0,
    };
    settings
}

async fn build_manager(settings: &Settings) -> (JobManager, Store, Arc<EventHub>) {
    let store = Store::open(&settings.db_path(), Arc::new(PlainSealer))
        .await
        .unwrap();
    let hub = Arc::new(EventHub::new());
    let supervisor = Arc::new(EngineSupervisor::new(EngineSettings {
        binary: settings.engine_path.clone().unwrap(),
        extra_flags: settings.engine_flags.clone(),
        stats_interval: settings.stats_interval,
        tmp_dir: settings.engine_tmp_dir(),
        artifacts_dir: settings.artifacts_dir(),
        logs_dir: settings.jobs_log_dir(),
        log_max_bytes: settings.job_log_max_bytes,
        kill_grace: Duration::from_millis(500),
    }));
    let probe = Arc::new(EngineProbe::new(settings.engine_path.clone()));
    let manager = JobManager::new(
        store.clone(),
        hub.clone(),
        supervisor,
        probe,
        settings.clone(),
    );
    (manager, store, hub)
}

async fn seed_profile(store: &Store) -> ProfileId {
    store
        .create_profile(NewProfile {
            name: "minio".into(),
            provider: Provider::S3Compatible,
            endpoint: Some("http://127.0.0.1:9000".into()),
            region: None,
            flags: ProfileFlags::default(),
            secrets: ProfileSecrets::default(),
        })
        .await
        .unwrap()
        .id
}

fn copy_payload() -> serde_json::Value {
    serde_json::json!({
        "srcBucket": "a", "srcKey": "k", "dstBucket": "b", "dstKey": "k2"
    })
}

async fn wait_for_status(store: &Store, id: &stevedore_protocol::ids::JobId, wanted: JobStatus) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let job = store.get_job(id).await.unwrap();
        if job.status == wanted {
            return;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {wanted:?}, job is {:?}",
            job.status
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn admission_bounded_and_rejection_rolls_back() {
    let dir = tempfile::TempDir::new().unwrap();
    let stub = write_stub(dir.path(), "exit 0");
    let mut settings = settings(dir.path(), &stub);
    settings.job_queue_capacity = 2;
    settings.job_concurrency = 0;

    let (manager, store, _hub) = build_manager(&settings).await;
    manager.start().await.unwrap();
    let profile_id = seed_profile(&store).await;

    for _ in 0..2 {
        manager
            .submit(&profile_id, JobType::TransferCopyObject, copy_payload())
            .await
            .unwrap();
    }

    match manager
        .submit(&profile_id, JobType::TransferCopyObject, copy_payload())
        .await
    {
        Err(SubmitError::QueueFull {
            queue_depth,
            queue_capacity,
            retry_after_secs,
        }) => {
            assert_eq!(queue_depth, 2);
            assert_eq!(queue_capacity, 2);
            assert_eq!(retry_after_secs, 3);
        }
        other => panic!("expected QueueFull, got {other:?}"),
    }

    // The rejected row was rolled back: exactly two rows remain.
    let (jobs, _) = store.list_jobs(&Default::default(), None, 10).await.unwrap();
    assert_eq!(jobs.len(), 2);
}

#[tokio::test]
async fn retryable_failures_back_off_then_fail() {
    let dir = tempfile::TempDir::new().unwrap();
    // Engine always fails with a throttle message.
    let stub = write_stub(
        dir.path(),
        r#"echo 'ERROR: SlowDown: reduce your request rate' >&2
exit 1"#,
    );
    let settings = settings(dir.path(), &stub);
    let (manager, store, _hub) = build_manager(&settings).await;
    manager.start().await.unwrap();
    let profile_id = seed_profile(&store).await;

    let started = Instant::now();
    let job = manager
        .submit(&profile_id, JobType::TransferCopyObject, copy_payload())
        .await
        .unwrap();
    wait_for_status(&store, &job.id, JobStatus::Failed).await;
    let elapsed = started.elapsed();

    let job = store.get_job(&job.id).await.unwrap();
    assert_eq!(job.error_code, Some(NormalizedErrorCode::RateLimited));
    assert_eq!(job.attempt, 2, "two retries were attempted");
    assert!(job.error.as_deref().unwrap_or("").contains("SlowDown"));
    // Backoff slept ~100ms then ~200ms (jitter 0).
    assert!(elapsed >= Duration::from_millis(280), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(8), "elapsed {elapsed:?}");
}

#[tokio::test]
async fn cancel_during_backoff_interrupts_the_sleep() {
    let dir = tempfile::TempDir::new().unwrap();
    let stub = write_stub(
        dir.path(),
        r#"echo 'ERROR: SlowDown' >&2
exit 1"#,
    );
    let mut settings = settings(dir.path(), &stub);
    // Long backoff so the cancel lands inside the first sleep.
    settings.retry = RetryPolicy {
        attempts: 2,
        base_delay: Duration::from_secs(2),
        max_delay: Duration::from_secs(4),
        jitter_ratio: 0.0,
    };
    let (manager, store, _hub) = build_manager(&settings).await;
    manager.start().await.unwrap();
    let profile_id = seed_profile(&store).await;

    let job = manager
        .submit(&profile_id, JobType::TransferCopyObject, copy_payload())
        .await
        .unwrap();

    // Wait until the first episode failed and the retry sleep began.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let j = store.get_job(&job.id).await.unwrap();
        if j.attempt >= 1 {
            break;
        }
        assert!(Instant::now() < deadline, "first retry never started");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let canceled_at = Instant::now();
    manager.cancel(&job.id).await.unwrap();
    wait_for_status(&store, &job.id, JobStatus::Canceled).await;
    assert!(
        canceled_at.elapsed() < Duration::from_millis(800),
        "cancel must interrupt the backoff sleep, not wait it out"
    );

    let job = store.get_job(&job.id).await.unwrap();
    assert_eq!(job.error_code, Some(NormalizedErrorCode::Canceled));
    assert_eq!(job.attempt, 1, "no further retry after cancellation");
}

#[tokio::test]
async fn cancel_is_idempotent() {
    let dir = tempfile::TempDir::new().unwrap();
    let stub = write_stub(dir.path(), "exit 0");
    let mut settings = settings(dir.path(), &stub);
    settings.job_concurrency = 0;
    let (manager, store, _hub) = build_manager(&settings).await;
    manager.start().await.unwrap();
    let profile_id = seed_profile(&store).await;

    let job = manager
        .submit(&profile_id, JobType::TransferCopyObject, copy_payload())
        .await
        .unwrap();

    let first = manager.cancel(&job.id).await.unwrap();
    assert_eq!(first.status, JobStatus::Canceled);
    let finished_at = first.finished_at;

    let second = manager.cancel(&job.id).await.unwrap();
    assert_eq!(second.status, JobStatus::Canceled);
    assert_eq!(second.finished_at, finished_at, "terminal state untouched");
}

#[tokio::test]
async fn successful_job_emits_ordered_events() {
    let dir = tempfile::TempDir::new().unwrap();
    let stub = write_stub(
        dir.path(),
        r#"echo '{"level":"info","msg":"copying"}'
echo '{"level":"notice","msg":"Transferred","stats":{"bytes":100,"totalBytes":100,"transfers":1,"totalTransfers":1}}'
exit 0"#,
    );
    let settings = settings(dir.path(), &stub);
    let (manager, store, hub) = build_manager(&settings).await;
    manager.start().await.unwrap();
    let profile_id = seed_profile(&store).await;

    let mut sub = hub.subscribe(None, false);
    let job = manager
        .submit(&profile_id, JobType::TransferCopyObject, copy_payload())
        .await
        .unwrap();
    wait_for_status(&store, &job.id, JobStatus::Succeeded).await;

    // created < progress* <= completed, with strictly increasing seq.
    let mut kinds = Vec::new();
    let mut last_seq = 0;
    let deadline = Instant::now() + Duration::from_secs(5);
    while !kinds.contains(&EventKind::JobCompleted) {
        assert!(Instant::now() < deadline, "completed event never arrived");
        let event = tokio::time::timeout(Duration::from_secs(1), sub.receiver.recv())
            .await
            .expect("event stream stalled")
            .expect("hub closed");
        assert!(event.seq > last_seq);
        last_seq = event.seq;
        if event.job_id.as_ref() == Some(&job.id) {
            kinds.push(event.kind);
        }
    }
    assert_eq!(kinds.first(), Some(&EventKind::JobCreated));
    assert_eq!(kinds.last(), Some(&EventKind::JobCompleted));

    let job = store.get_job(&job.id).await.unwrap();
    assert!(job.finished_at.is_some());
    let progress = job.progress.unwrap();
    assert_eq!(progress.objects_done, Some(1));
}

#[tokio::test]
async fn staging_dir_removed_after_successful_commit_job() {
    let dir = tempfile::TempDir::new().unwrap();
    let stub = write_stub(dir.path(), "exit 0");
    let settings = settings(dir.path(), &stub);
    let (manager, store, _hub) = build_manager(&settings).await;
    manager.start().await.unwrap();
    let profile_id = seed_profile(&store).await;

    // Seed a staging session with a real directory and some bytes.
    let staging_dir = settings.staging_dir().join("upl-test");
    std::fs::create_dir_all(&staging_dir).unwrap();
    std::fs::write(staging_dir.join("a.bin"), vec![0u8; 1024]).unwrap();
    std::fs::write(staging_dir.join("b.bin"), vec![0u8; 1024]).unwrap();
    let session = store
        .create_upload_session(NewUploadSession {
            profile_id: profile_id.clone(),
            bucket: "incoming".into(),
            prefix: Some("drop/".into()),
            mode: UploadMode::Staging,
            staging_dir: Some(staging_dir.clone()),
            bytes_budget: 0,
            expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
        })
        .await
        .unwrap();

    let job = manager
        .submit(
            &profile_id,
            JobType::TransferSyncStagingToS3,
            serde_json::json!({ "uploadId": session.id }),
        )
        .await
        .unwrap();
    wait_for_status(&store, &job.id, JobStatus::Succeeded).await;

    let deadline = Instant::now() + Duration::from_secs(3);
    while staging_dir.exists() {
        assert!(
            Instant::now() < deadline,
            "staging dir must be removed after success"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn crash_recovery_fails_running_rows_before_workers_start() {
    let dir = tempfile::TempDir::new().unwrap();
    let stub = write_stub(dir.path(), "exit 0");
    let mut settings = settings(dir.path(), &stub);
    settings.restart_policy = RestartPolicy::Fail;

    // Simulate the previous process: a row stuck in `running`.
    let store = Store::open(&settings.db_path(), Arc::new(PlainSealer))
        .await
        .unwrap();
    let profile_id = seed_profile(&store).await;
    let job = store
        .create_job(NewJob {
            profile_id: profile_id.clone(),
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
                started_at: Some(chrono::Utc::now()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    store.close().await;

    // Restart.
    let (manager, store, _hub) = build_manager(&settings).await;
    manager.start().await.unwrap();

    let recovered = store.get_job(&job.id).await.unwrap();
    assert_eq!(recovered.status, JobStatus::Failed);
    assert_eq!(
        recovered.error_code,
        Some(NormalizedErrorCode::ServerRestarted)
    );
    assert!(recovered.finished_at.is_some());
    assert_eq!(manager.queue_depth(), 0, "ready queue starts empty");
}
