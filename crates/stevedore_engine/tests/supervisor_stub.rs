//! Supervisor tests against a stub engine binary.
//!
//! The stub is a shell script that speaks the engine's structured-log
//! contract, so these tests exercise spawning, stdout parsing, stderr
//! capture, log files and cancellation without a real backend.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use stevedore_engine::plan::{PlanInput, RemoteSpec};
use stevedore_engine::supervisor::{
    EngineSettings, EngineSupervisor, EpisodeHooks, EpisodeOutcome,
};
use stevedore_protocol::ids::JobId;
use stevedore_protocol::types::{
    ProfileFlags, ProfileSecrets, Progress, Provider, SyncLocalToS3Payload,
};

fn write_stub(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("engine-stub.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}

fn settings(dir: &Path, binary: PathBuf) -> EngineSettings {
    EngineSettings {
        binary,
        extra_flags: Vec::new(),
        stats_interval: Duration::from_secs(1),
        tmp_dir: dir.join("tmp"),
        artifacts_dir: dir.join("artifacts"),
        logs_dir: dir.join("logs"),
        log_max_bytes: 1024 * 1024,
        kill_grace: Duration::from_millis(500),
    }
}

fn remote() -> RemoteSpec {
    RemoteSpec {
        provider: Provider::S3Compatible,
        endpoint: Some("http://127.0.0.1:9000".into()),
        region: None,
        flags: ProfileFlags::default(),
        secrets: ProfileSecrets {
            access_key_id: Some("stub-access".into()),
            secret_access_key: Some("stub-secret-value".into()),
            ..Default::default()
        },
    }
}

fn sync_plan() -> PlanInput {
    PlanInput::SyncLocalToS3(SyncLocalToS3Payload {
        bucket: "media".into(),
        local_path: "/tmp/anything".into(),
        prefix: None,
        delete_extraneous: false,
        include: vec![],
        exclude: vec![],
        dry_run: false,
    })
}

fn hooks() -> (EpisodeHooks, watch::Receiver<Progress>) {
    let (progress_tx, progress_rx) = watch::channel(Progress::default());
    let (logs_tx, _logs_rx) = mpsc::channel(64);
    (
        EpisodeHooks {
            progress: progress_tx,
            logs: logs_tx,
        },
        progress_rx,
    )
}

#[tokio::test]
async fn successful_episode_reports_progress() {
    let dir = tempfile::TempDir::new().unwrap();
    let stub = write_stub(
        dir.path(),
        r#"echo '{"level":"info","msg":"starting transfer"}'
echo '{"level":"notice","msg":"Transferred: 1/2","stats":{"bytes":512,"totalBytes":1024,"transfers":1,"totalTransfers":2,"speed":256.0,"eta":2.0}}'
echo '{"level":"notice","msg":"Transferred: 2/2","stats":{"bytes":1024,"totalBytes":1024,"transfers":2,"totalTransfers":2}}'
exit 0"#,
    );
    let supervisor = EngineSupervisor::new(settings(dir.path(), stub));
    let (hooks, progress_rx) = hooks();
    let job_id = JobId::new();

    let outcome = supervisor
        .run_episode(
            &job_id,
            &sync_plan(),
            &remote(),
            &CancellationToken::new(),
            &hooks,
        )
        .await
        .unwrap();

    match outcome {
        EpisodeOutcome::Success { progress, .. } => {
            assert_eq!(progress.objects_done, Some(2));
            assert_eq!(progress.objects_total, Some(2));
            assert_eq!(progress.bytes_done, Some(1024));
        }
        other => panic!("expected success, got {other:?}"),
    }
    assert_eq!(progress_rx.borrow().objects_done, Some(2));

    // The job log captured the raw structured lines.
    let log = std::fs::read_to_string(
        dir.path().join("logs").join(format!("{}.log", job_id.as_str())),
    )
    .unwrap();
    assert!(log.contains("starting transfer"));

    // The .cmd record exists and never leaks the secret.
    let cmd = std::fs::read_to_string(
        dir.path().join("logs").join(format!("{}.cmd", job_id.as_str())),
    )
    .unwrap();
    assert!(!cmd.contains("stub-secret-value"));

    // The per-episode temp directory is cleaned up.
    assert!(!dir.path().join("tmp").join(job_id.as_str()).exists());
}

#[tokio::test]
async fn failed_episode_preserves_stderr_for_classification() {
    let dir = tempfile::TempDir::new().unwrap();
    let stub = write_stub(
        dir.path(),
        r#"echo '{"level":"info","msg":"starting"}'
echo 'ERROR: SlowDown: please reduce request rate' >&2
exit 3"#,
    );
    let supervisor = EngineSupervisor::new(settings(dir.path(), stub));
    let (hooks, _progress_rx) = hooks();
    let job_id = JobId::new();

    let outcome = supervisor
        .run_episode(
            &job_id,
            &sync_plan(),
            &remote(),
            &CancellationToken::new(),
            &hooks,
        )
        .await
        .unwrap();

    match outcome {
        EpisodeOutcome::Failed { stderr_tail, .. } => {
            assert!(stderr_tail.contains("SlowDown"));
        }
        other => panic!("expected failure, got {other:?}"),
    }

    let log = std::fs::read_to_string(
        dir.path().join("logs").join(format!("{}.log", job_id.as_str())),
    )
    .unwrap();
    assert!(log.contains("[stderr] ERROR: SlowDown"));
}

#[tokio::test]
async fn cancellation_kills_the_child_promptly() {
    let dir = tempfile::TempDir::new().unwrap();
    // Stub ignores nothing: default SIGTERM disposition terminates it.
    let stub = write_stub(
        dir.path(),
        r#"echo '{"level":"info","msg":"long transfer"}'
sleep 30
exit 0"#,
    );
    let supervisor = EngineSupervisor::new(settings(dir.path(), stub));
    let (hooks, _progress_rx) = hooks();
    let token = CancellationToken::new();

    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        cancel.cancel();
    });

    let started = std::time::Instant::now();
    let outcome = supervisor
        .run_episode(&JobId::new(), &sync_plan(), &remote(), &token, &hooks)
        .await
        .unwrap();

    assert!(matches!(outcome, EpisodeOutcome::Canceled { .. }));
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "cancellation must not wait for the 30s sleep"
    );
}
