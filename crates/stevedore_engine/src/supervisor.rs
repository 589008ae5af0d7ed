//! Child-process supervision for one execution episode.
//!
//! The supervisor owns everything the episode touches: the per-episode
//! temp directory with the 0600 remote config, the child process group,
//! the stdout parser, the stderr tail kept for classification, and the
//! per-job log file. Cancellation is cooperative at this layer's
//! boundary and forceful below it: the process group gets SIGTERM, a
//! grace period, then SIGKILL.

use std::collections::VecDeque;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use stevedore_protocol::events::JobLogPayload;
use stevedore_protocol::ids::JobId;
use stevedore_protocol::types::Progress;

use crate::error::EngineError;
use crate::joblog::{write_cmd_file, JobLogWriter};
use crate::plan::{
    self, base_flags, credential_env, render_remote_config, Invocation, PlanInput, RemoteSpec,
    ZipSelection,
};
use crate::progress::{EngineLogRecord, ProgressTracker};

/// Bytes of stderr retained for the classifier.
const STDERR_TAIL_BYTES: usize = 8 * 1024;
/// Chunk size for object streaming (zip, rcat).
const STREAM_CHUNK: usize = 64 * 1024;
/// Placeholder deadline for the disarmed kill-grace timer.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 30);

/// Tuning and layout the supervisor needs; derived from [`Settings`]
/// by the launcher.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub binary: PathBuf,
    pub extra_flags: Vec<String>,
    pub stats_interval: Duration,
    pub tmp_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub log_max_bytes: u64,
    pub kill_grace: Duration,
}

/// Outbound channels for one episode. Progress coalesces to the latest
/// snapshot (watch semantics); log lines are fire-and-forget.
pub struct EpisodeHooks {
    pub progress: watch::Sender<Progress>,
    pub logs: mpsc::Sender<JobLogPayload>,
}

/// Secondary output of a successful episode.
#[derive(Debug)]
pub enum EpisodeOutput {
    None,
    ZipArtifact { path: PathBuf, objects: u64 },
    Index { entries: Vec<IndexedEntry> },
}

/// One listed object, for the object index.
#[derive(Debug, Clone)]
pub struct IndexedEntry {
    pub key: String,
    pub size: u64,
    pub etag: Option<String>,
    pub last_modified: Option<chrono::DateTime<chrono::Utc>>,
}

/// Terminal state of one execution episode.
#[derive(Debug)]
pub enum EpisodeOutcome {
    Success {
        progress: Progress,
        output: EpisodeOutput,
    },
    Failed {
        progress: Progress,
        stderr_tail: String,
    },
    Canceled {
        progress: Progress,
    },
}

pub struct EngineSupervisor {
    settings: EngineSettings,
}

struct ChildResult {
    success: bool,
    canceled: bool,
    stderr_tail: String,
}

/// Bounded stderr tail: keeps the newest lines up to a byte budget.
struct StderrTail {
    lines: VecDeque<String>,
    bytes: usize,
}

impl StderrTail {
    fn new() -> Self {
        Self {
            lines: VecDeque::new(),
            bytes: 0,
        }
    }

    fn push(&mut self, line: &str) {
        self.bytes += line.len() + 1;
        self.lines.push_back(line.to_string());
        while self.bytes > STDERR_TAIL_BYTES {
            if let Some(dropped) = self.lines.pop_front() {
                self.bytes -= dropped.len() + 1;
            } else {
                break;
            }
        }
    }

    fn join(&self) -> String {
        self.lines
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl EngineSupervisor {
    pub fn new(settings: EngineSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Drive one execution episode to a terminal outcome.
    pub async fn run_episode(
        &self,
        job_id: &JobId,
        input: &PlanInput,
        remote: &RemoteSpec,
        token: &CancellationToken,
        hooks: &EpisodeHooks,
    ) -> Result<EpisodeOutcome, EngineError> {
        let episode_dir = self.settings.tmp_dir.join(job_id.as_str());
        let result = self
            .run_episode_inner(job_id, input, remote, token, hooks, &episode_dir)
            .await;
        if let Err(e) = tokio::fs::remove_dir_all(&episode_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!("failed to clean episode dir {}: {e}", episode_dir.display());
            }
        }
        result
    }

    async fn run_episode_inner(
        &self,
        job_id: &JobId,
        input: &PlanInput,
        remote: &RemoteSpec,
        token: &CancellationToken,
        hooks: &EpisodeHooks,
        episode_dir: &Path,
    ) -> Result<EpisodeOutcome, EngineError> {
        tokio::fs::create_dir_all(episode_dir)
            .await
            .map_err(|e| EngineError::io(episode_dir, e))?;
        let config_path = episode_dir.join("remote.conf");
        write_private_file(&config_path, render_remote_config(remote).as_bytes())?;

        let env = credential_env(remote);
        let mut log = JobLogWriter::open(
            &self.settings.logs_dir,
            job_id.as_str(),
            self.settings.log_max_bytes,
        )?;
        let base = base_flags(
            &config_path,
            self.settings.stats_interval.as_secs().max(1),
            &self.settings.extra_flags,
        );

        match input {
            PlanInput::SyncLocalToS3(_)
            | PlanInput::SyncS3ToLocal(_)
            | PlanInput::SyncStagingToS3 { .. }
            | PlanInput::DeletePrefix(_)
            | PlanInput::CopyPrefix { .. } => {
                let invocation = plan::transfer_invocation(input, remote)
                    .expect("single-child plan has an invocation");
                let mut tracker = match input {
                    PlanInput::DeletePrefix(_) => ProgressTracker::delete(),
                    _ => ProgressTracker::transfer(),
                };
                self.record_cmd(job_id, &invocation, &base, &env, remote)?;
                let result = self
                    .run_child(&invocation, &base, &env, &mut tracker, hooks, &mut log, token)
                    .await?;
                Ok(conclude(result, tracker.snapshot(), EpisodeOutput::None))
            }

            PlanInput::CopyObject {
                payload,
                move_source,
            } => {
                let invocation = plan::pair_invocation(
                    &payload.src_bucket,
                    &payload.src_key,
                    &payload.dst_bucket,
                    &payload.dst_key,
                    *move_source,
                    payload.dry_run,
                    remote,
                );
                let mut tracker = ProgressTracker::batch(1);
                self.record_cmd(job_id, &invocation, &base, &env, remote)?;
                let result = self
                    .run_child(&invocation, &base, &env, &mut tracker, hooks, &mut log, token)
                    .await?;
                if result.success {
                    let progress = tracker.finish_item();
                    let _ = hooks.progress.send_replace(progress);
                }
                Ok(conclude(result, tracker.snapshot(), EpisodeOutput::None))
            }

            PlanInput::Batch {
                payload,
                move_source,
            } => {
                let mut tracker = ProgressTracker::batch(payload.pairs.len() as u64);
                let _ = hooks.progress.send_replace(tracker.snapshot());
                for (i, pair) in payload.pairs.iter().enumerate() {
                    if token.is_cancelled() {
                        return Ok(EpisodeOutcome::Canceled {
                            progress: tracker.snapshot(),
                        });
                    }
                    let invocation = plan::pair_invocation(
                        &payload.src_bucket,
                        &pair.src_key,
                        &payload.dst_bucket,
                        &pair.dst_key,
                        *move_source,
                        payload.dry_run,
                        remote,
                    );
                    if i == 0 {
                        self.record_cmd(job_id, &invocation, &base, &env, remote)?;
                    }
                    let result = self
                        .run_child(&invocation, &base, &env, &mut tracker, hooks, &mut log, token)
                        .await?;
                    if !result.success || result.canceled {
                        return Ok(conclude(result, tracker.snapshot(), EpisodeOutput::None));
                    }
                    let progress = tracker.finish_item();
                    let _ = hooks.progress.send_replace(progress);
                }
                Ok(EpisodeOutcome::Success {
                    progress: tracker.snapshot(),
                    output: EpisodeOutput::None,
                })
            }

            PlanInput::DeleteObjects(payload) => {
                let list_path = episode_dir.join("delete-keys.txt");
                write_private_file(&list_path, payload.keys.join("\n").as_bytes())?;
                let invocation = plan::delete_list_invocation(&payload.bucket, &list_path, remote);
                let mut tracker = ProgressTracker::delete();
                self.record_cmd(job_id, &invocation, &base, &env, remote)?;
                let result = self
                    .run_child(&invocation, &base, &env, &mut tracker, hooks, &mut log, token)
                    .await?;
                Ok(conclude(result, tracker.snapshot(), EpisodeOutput::None))
            }

            PlanInput::Zip { bucket, selection } => {
                self.run_zip(job_id, bucket, selection, remote, &base, &env, hooks, &mut log, token)
                    .await
            }

            PlanInput::Index(payload) => {
                let listed = self
                    .run_listing(&payload.bucket, payload.prefix.as_deref(), remote, &base, &env, token)
                    .await?;
                match listed {
                    Listed::Canceled => Ok(EpisodeOutcome::Canceled {
                        progress: Progress::default(),
                    }),
                    Listed::Failed(stderr_tail) => Ok(EpisodeOutcome::Failed {
                        progress: Progress::default(),
                        stderr_tail,
                    }),
                    Listed::Entries(entries) => {
                        let progress = Progress {
                            objects_done: Some(entries.len() as u64),
                            objects_total: Some(entries.len() as u64),
                            ..Default::default()
                        };
                        let _ = hooks.progress.send_replace(progress);
                        Ok(EpisodeOutcome::Success {
                            progress,
                            output: EpisodeOutput::Index { entries },
                        })
                    }
                }
            }

            PlanInput::VerifyDirectUpload { bucket, prefix } => {
                let listed = self
                    .run_listing(bucket, prefix.as_deref(), remote, &base, &env, token)
                    .await?;
                match listed {
                    Listed::Canceled => Ok(EpisodeOutcome::Canceled {
                        progress: Progress::default(),
                    }),
                    Listed::Failed(stderr_tail) => Ok(EpisodeOutcome::Failed {
                        progress: Progress::default(),
                        stderr_tail,
                    }),
                    Listed::Entries(entries) => {
                        let progress = Progress {
                            objects_done: Some(entries.len() as u64),
                            objects_total: Some(entries.len() as u64),
                            ..Default::default()
                        };
                        let _ = hooks.progress.send_replace(progress);
                        Ok(EpisodeOutcome::Success {
                            progress,
                            output: EpisodeOutput::None,
                        })
                    }
                }
            }
        }
    }

    /// Stream `data` into `bucket/key` through the engine. Used by the
    /// direct upload path; returns bytes written.
    pub async fn stream_into_object(
        &self,
        remote: &RemoteSpec,
        bucket: &str,
        key: &str,
        data: &mut (impl AsyncRead + Unpin),
        token: &CancellationToken,
    ) -> Result<u64, EngineError> {
        let episode_dir = self.settings.tmp_dir.join(format!("rcat-{}", stevedore_protocol::ids::new_ulid()));
        tokio::fs::create_dir_all(&episode_dir)
            .await
            .map_err(|e| EngineError::io(&episode_dir, e))?;
        let config_path = episode_dir.join("remote.conf");
        write_private_file(&config_path, render_remote_config(remote).as_bytes())?;

        let invocation = plan::rcat_invocation(bucket, key, remote);
        let mut cmd = self.command(&invocation, &["--config".to_string(), config_path.display().to_string()], &credential_env(remote));
        cmd.stdin(Stdio::piped());
        let mut child = cmd.spawn().map_err(EngineError::Spawn)?;
        let pid = child.id();
        let mut stdin = child.stdin.take().expect("stdin piped");

        let mut written = 0u64;
        let mut buf = vec![0u8; STREAM_CHUNK];
        let copy_result: Result<(), EngineError> = loop {
            if token.is_cancelled() {
                kill_group(pid, true);
                break Err(EngineError::Output("canceled".to_string()));
            }
            match data.read(&mut buf).await {
                Ok(0) => break Ok(()),
                Ok(n) => {
                    if let Err(e) = stdin.write_all(&buf[..n]).await {
                        break Err(EngineError::io(key, e));
                    }
                    written += n as u64;
                }
                Err(e) => break Err(EngineError::io(key, e)),
            }
        };
        drop(stdin);

        let output = child.wait_with_output().await.map_err(EngineError::Spawn);
        let _ = tokio::fs::remove_dir_all(&episode_dir).await;
        copy_result?;
        let output = output?;
        if !output.status.success() {
            return Err(EngineError::Output(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(written)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_zip(
        &self,
        job_id: &JobId,
        bucket: &str,
        selection: &ZipSelection,
        remote: &RemoteSpec,
        base: &[String],
        env: &[(String, String)],
        hooks: &EpisodeHooks,
        log: &mut JobLogWriter,
        token: &CancellationToken,
    ) -> Result<EpisodeOutcome, EngineError> {
        // Resolve the object set first.
        let (keys, strip_prefix): (Vec<String>, Option<String>) = match selection {
            ZipSelection::Keys(keys) => (keys.clone(), None),
            ZipSelection::Prefix(prefix) => {
                let listed = self
                    .run_listing(bucket, prefix.as_deref(), remote, base, env, token)
                    .await?;
                match listed {
                    Listed::Canceled => {
                        return Ok(EpisodeOutcome::Canceled {
                            progress: Progress::default(),
                        })
                    }
                    Listed::Failed(stderr_tail) => {
                        return Ok(EpisodeOutcome::Failed {
                            progress: Progress::default(),
                            stderr_tail,
                        })
                    }
                    Listed::Entries(entries) => {
                        let root = prefix.clone().unwrap_or_default();
                        (
                            entries
                                .into_iter()
                                .map(|e| {
                                    if root.is_empty() {
                                        e.key
                                    } else {
                                        format!("{}{}", root, e.key)
                                    }
                                })
                                .collect(),
                            Some(root),
                        )
                    }
                }
            }
        };

        tokio::fs::create_dir_all(&self.settings.artifacts_dir)
            .await
            .map_err(|e| EngineError::io(&self.settings.artifacts_dir, e))?;
        let artifact_path = self
            .settings
            .artifacts_dir
            .join(format!("{}.zip", job_id.as_str()));
        let artifact_file = std::fs::File::create(&artifact_path)
            .map_err(|e| EngineError::io(&artifact_path, e))?;
        let mut writer = zip::ZipWriter::new(artifact_file);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .large_file(true);

        let mut tracker = ProgressTracker::batch(keys.len() as u64);
        let _ = hooks.progress.send_replace(tracker.snapshot());

        for key in &keys {
            if token.is_cancelled() {
                drop(writer);
                let _ = std::fs::remove_file(&artifact_path);
                return Ok(EpisodeOutcome::Canceled {
                    progress: tracker.snapshot(),
                });
            }
            let entry_name = match &strip_prefix {
                Some(root) if !root.is_empty() && key.starts_with(root.as_str()) => {
                    key[root.len()..].to_string()
                }
                _ => key.clone(),
            };
            writer
                .start_file(entry_name, options)
                .map_err(|e| EngineError::Zip(e.to_string()))?;

            match self
                .stream_object(bucket, key, remote, base, env, &mut writer, token)
                .await?
            {
                StreamEnd::Done => {
                    log.append_line(&format!("zipped {key}"))?;
                    let progress = tracker.finish_item();
                    let _ = hooks.progress.send_replace(progress);
                }
                StreamEnd::Canceled => {
                    drop(writer);
                    let _ = std::fs::remove_file(&artifact_path);
                    return Ok(EpisodeOutcome::Canceled {
                        progress: tracker.snapshot(),
                    });
                }
                StreamEnd::Failed(stderr_tail) => {
                    drop(writer);
                    let _ = std::fs::remove_file(&artifact_path);
                    return Ok(EpisodeOutcome::Failed {
                        progress: tracker.snapshot(),
                        stderr_tail,
                    });
                }
            }
        }

        writer.finish().map_err(|e| EngineError::Zip(e.to_string()))?;
        Ok(EpisodeOutcome::Success {
            progress: tracker.snapshot(),
            output: EpisodeOutput::ZipArtifact {
                path: artifact_path,
                objects: keys.len() as u64,
            },
        })
    }

    /// Pipe one object's bytes into the zip writer.
    async fn stream_object(
        &self,
        bucket: &str,
        key: &str,
        remote: &RemoteSpec,
        base: &[String],
        env: &[(String, String)],
        writer: &mut zip::ZipWriter<std::fs::File>,
        token: &CancellationToken,
    ) -> Result<StreamEnd, EngineError> {
        let invocation = plan::cat_invocation(bucket, key, remote);
        let mut cmd = self.command(&invocation, base, env);
        let mut child = cmd.spawn().map_err(EngineError::Spawn)?;
        let pid = child.id();
        let mut stdout = child.stdout.take().expect("stdout piped");

        let mut buf = vec![0u8; STREAM_CHUNK];
        loop {
            if token.is_cancelled() {
                kill_group(pid, true);
                let _ = child.wait().await;
                return Ok(StreamEnd::Canceled);
            }
            match stdout.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => writer
                    .write_all(&buf[..n])
                    .map_err(|e| EngineError::Zip(e.to_string()))?,
                Err(e) => return Err(EngineError::io(key, e)),
            }
        }

        let output = child.wait_with_output().await.map_err(EngineError::Spawn)?;
        if output.status.success() {
            Ok(StreamEnd::Done)
        } else {
            Ok(StreamEnd::Failed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    /// Run `lsjson` and parse the listing.
    async fn run_listing(
        &self,
        bucket: &str,
        prefix: Option<&str>,
        remote: &RemoteSpec,
        base: &[String],
        env: &[(String, String)],
        token: &CancellationToken,
    ) -> Result<Listed, EngineError> {
        let invocation = plan::listing_invocation(bucket, prefix, remote);
        let mut cmd = self.command(&invocation, base, env);
        let child = cmd.spawn().map_err(EngineError::Spawn)?;
        let pid = child.id();

        let output_fut = child.wait_with_output();
        tokio::pin!(output_fut);
        let mut canceled = false;
        let output = loop {
            tokio::select! {
                out = &mut output_fut => break out.map_err(EngineError::Spawn)?,
                _ = token.cancelled(), if !canceled => {
                    canceled = true;
                    kill_group(pid, false);
                }
            }
        };
        if canceled {
            return Ok(Listed::Canceled);
        }
        if !output.status.success() {
            return Ok(Listed::Failed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let raw: Vec<ListEntry> = serde_json::from_slice(&output.stdout)
            .map_err(|e| EngineError::Output(format!("lsjson parse: {e}")))?;
        let entries = raw
            .into_iter()
            .filter(|e| !e.is_dir)
            .map(|e| IndexedEntry {
                size: e.size.max(0) as u64,
                etag: e.hashes.and_then(|h| h.md5),
                last_modified: e
                    .mod_time
                    .as_deref()
                    .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
                    .map(|t| t.with_timezone(&chrono::Utc)),
                key: e.path,
            })
            .collect();
        Ok(Listed::Entries(entries))
    }

    /// Spawn one transfer child and pump its streams until exit.
    #[allow(clippy::too_many_arguments)]
    async fn run_child(
        &self,
        invocation: &Invocation,
        base: &[String],
        env: &[(String, String)],
        tracker: &mut ProgressTracker,
        hooks: &EpisodeHooks,
        log: &mut JobLogWriter,
        token: &CancellationToken,
    ) -> Result<ChildResult, EngineError> {
        let mut cmd = self.command(invocation, base, env);
        let mut child = cmd.spawn().map_err(EngineError::Spawn)?;
        let pid = child.id();

        let mut stdout_lines =
            BufReader::new(child.stdout.take().expect("stdout piped")).lines();
        let mut stderr_lines =
            BufReader::new(child.stderr.take().expect("stderr piped")).lines();

        let mut stdout_done = false;
        let mut stderr_done = false;
        let mut status: Option<std::process::ExitStatus> = None;
        let mut canceled = false;
        let mut escalated = false;
        let mut tail = StderrTail::new();
        // Armed (reset to the grace deadline) when cancellation fires.
        let grace_timer = tokio::time::sleep(FAR_FUTURE);
        tokio::pin!(grace_timer);

        loop {
            tokio::select! {
                line = stdout_lines.next_line(), if !stdout_done => {
                    match line {
                        Ok(Some(line)) => {
                            self.handle_stdout_line(&line, tracker, hooks, log)?;
                        }
                        _ => stdout_done = true,
                    }
                }
                line = stderr_lines.next_line(), if !stderr_done => {
                    match line {
                        Ok(Some(line)) => {
                            tail.push(&line);
                            log.append_line(&format!("[stderr] {line}"))?;
                            let _ = hooks.logs.try_send(JobLogPayload {
                                level: "error".to_string(),
                                message: line,
                            });
                        }
                        _ => stderr_done = true,
                    }
                }
                result = child.wait(), if status.is_none() => {
                    status = Some(result.map_err(EngineError::Spawn)?);
                }
                _ = token.cancelled(), if !canceled => {
                    canceled = true;
                    kill_group(pid, false);
                    grace_timer
                        .as_mut()
                        .reset(tokio::time::Instant::now() + self.settings.kill_grace);
                }
                _ = grace_timer.as_mut(), if canceled && !escalated && status.is_none() => {
                    warn!("engine ignored SIGTERM, escalating to SIGKILL");
                    escalated = true;
                    kill_group(pid, true);
                }
            }
            if stdout_done && stderr_done && status.is_some() {
                break;
            }
        }

        let status = status.expect("exit status recorded");
        Ok(ChildResult {
            success: status.success(),
            canceled,
            stderr_tail: tail.join(),
        })
    }

    fn handle_stdout_line(
        &self,
        line: &str,
        tracker: &mut ProgressTracker,
        hooks: &EpisodeHooks,
        log: &mut JobLogWriter,
    ) -> Result<(), EngineError> {
        let Some(record) = EngineLogRecord::parse(line) else {
            return Ok(());
        };
        log.append_line(line)?;
        if let Some(stats) = &record.stats {
            if let Some(progress) = tracker.apply(stats) {
                let _ = hooks.progress.send_replace(progress);
            }
        }
        if !record.msg.is_empty() {
            // Dropped when the hub's buffer is full; log events are
            // best-effort by contract.
            let _ = hooks.logs.try_send(JobLogPayload {
                level: record.level,
                message: record.msg,
            });
        }
        Ok(())
    }

    fn command(&self, invocation: &Invocation, base: &[String], env: &[(String, String)]) -> Command {
        let mut cmd = Command::new(&self.settings.binary);
        cmd.args(&invocation.args)
            .args(base)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in env {
            cmd.env(key, value);
        }
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    fn record_cmd(
        &self,
        job_id: &JobId,
        invocation: &Invocation,
        base: &[String],
        env: &[(String, String)],
        remote: &RemoteSpec,
    ) -> Result<(), EngineError> {
        let mut args = invocation.args.clone();
        args.extend(base.iter().cloned());
        write_cmd_file(
            &self.settings.logs_dir,
            job_id.as_str(),
            &self.settings.binary,
            &args,
            env,
            &remote.secrets.secret_values(),
        )?;
        Ok(())
    }
}

enum StreamEnd {
    Done,
    Canceled,
    Failed(String),
}

enum Listed {
    Entries(Vec<IndexedEntry>),
    Failed(String),
    Canceled,
}

#[derive(Debug, Deserialize)]
struct ListEntry {
    #[serde(rename = "Path")]
    path: String,
    #[serde(rename = "Size", default)]
    size: i64,
    #[serde(rename = "ModTime", default)]
    mod_time: Option<String>,
    #[serde(rename = "IsDir", default)]
    is_dir: bool,
    #[serde(rename = "Hashes", default)]
    hashes: Option<ListHashes>,
}

#[derive(Debug, Deserialize)]
struct ListHashes {
    #[serde(rename = "md5", default)]
    md5: Option<String>,
}

fn conclude(result: ChildResult, progress: Progress, output: EpisodeOutput) -> EpisodeOutcome {
    if result.canceled {
        EpisodeOutcome::Canceled { progress }
    } else if result.success {
        EpisodeOutcome::Success { progress, output }
    } else {
        EpisodeOutcome::Failed {
            progress,
            stderr_tail: result.stderr_tail,
        }
    }
}

/// Signal the whole child process group.
fn kill_group(pid: Option<u32>, force: bool) {
    let Some(pid) = pid else { return };
    #[cfg(unix)]
    {
        let signal = if force { libc::SIGKILL } else { libc::SIGTERM };
        // Negative pid addresses the process group created at spawn.
        unsafe {
            libc::kill(-(pid as i32), signal);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (pid, force);
    }
}

/// Write a file readable only by the owning user.
fn write_private_file(path: &Path, contents: &[u8]) -> Result<(), EngineError> {
    let mut options = std::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path).map_err(|e| EngineError::io(path, e))?;
    file.write_all(contents)
        .map_err(|e| EngineError::io(path, e))?;
    Ok(())
}
