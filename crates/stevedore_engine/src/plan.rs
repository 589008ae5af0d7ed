//! Per-job-type planning: argv construction, the credential
//! environment delta, and the per-episode remote-config file.
//!
//! The whole binding between job types and concrete engine verbs lives
//! here. Three rules hold everywhere:
//! - argv is array-form and whitelisted; nothing user-controlled is
//!   interpreted by a shell,
//! - credentials travel in the environment, never argv, and
//! - the config file carries only non-secret remote settings.

use std::path::PathBuf;

use stevedore_protocol::types::{
    BatchPayload, CopyObjectPayload, CopyPrefixPayload, DeleteObjectsPayload, DeletePrefixPayload,
    IndexObjectsPayload, ProfileFlags, ProfileSecrets, Provider, SyncLocalToS3Payload,
    SyncS3ToLocalPayload,
};

/// Remote section name inside the per-episode config file.
pub const REMOTE_NAME: &str = "target";

/// Everything the planner needs to know about the backend.
#[derive(Debug, Clone)]
pub struct RemoteSpec {
    pub provider: Provider,
    pub endpoint: Option<String>,
    pub region: Option<String>,
    pub flags: ProfileFlags,
    pub secrets: ProfileSecrets,
}

/// Object selection for zip jobs.
#[derive(Debug, Clone)]
pub enum ZipSelection {
    Prefix(Option<String>),
    Keys(Vec<String>),
}

/// Resolved input for one execution episode. Upload-session job types
/// are resolved by the scheduler (session → staging dir / target)
/// before they reach the engine.
#[derive(Debug, Clone)]
pub enum PlanInput {
    SyncLocalToS3(SyncLocalToS3Payload),
    SyncS3ToLocal(SyncS3ToLocalPayload),
    SyncStagingToS3 {
        staging_dir: PathBuf,
        bucket: String,
        prefix: Option<String>,
    },
    VerifyDirectUpload {
        bucket: String,
        prefix: Option<String>,
    },
    DeletePrefix(DeletePrefixPayload),
    CopyObject {
        payload: CopyObjectPayload,
        move_source: bool,
    },
    Batch {
        payload: BatchPayload,
        move_source: bool,
    },
    CopyPrefix {
        payload: CopyPrefixPayload,
        move_source: bool,
    },
    DeleteObjects(DeleteObjectsPayload),
    Zip {
        bucket: String,
        selection: ZipSelection,
    },
    Index(IndexObjectsPayload),
}

/// Remote path `target:bucket` / `target:bucket/prefix`.
pub fn remote_path(bucket: &str, key_or_prefix: Option<&str>) -> String {
    match key_or_prefix {
        Some(rest) if !rest.is_empty() => {
            format!("{REMOTE_NAME}:{bucket}/{}", rest.trim_start_matches('/'))
        }
        _ => format!("{REMOTE_NAME}:{bucket}"),
    }
}

/// Render the non-secret remote config section.
pub fn render_remote_config(spec: &RemoteSpec) -> String {
    let mut lines = vec![format!("[{REMOTE_NAME}]")];
    match spec.provider {
        Provider::AwsS3 => {
            lines.push("type = s3".to_string());
            lines.push("provider = AWS".to_string());
        }
        Provider::S3Compatible => {
            lines.push("type = s3".to_string());
            lines.push("provider = Other".to_string());
        }
        Provider::OciS3Compat => {
            lines.push("type = s3".to_string());
            lines.push("provider = Other".to_string());
        }
        Provider::AzureBlob => {
            lines.push("type = azureblob".to_string());
        }
        Provider::GcpGcs => {
            lines.push("type = google cloud storage".to_string());
        }
        Provider::OciObjectStorage => {
            lines.push("type = oracleobjectstorage".to_string());
        }
    }
    if let Some(endpoint) = &spec.endpoint {
        lines.push(format!("endpoint = {endpoint}"));
    }
    if let Some(region) = &spec.region {
        lines.push(format!("region = {region}"));
    }
    if spec.provider.is_s3_family() {
        if spec.flags.force_path_style {
            lines.push("force_path_style = true".to_string());
        }
        // Credentials come from the environment, not this file.
        lines.push("env_auth = false".to_string());
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Credential environment delta for the child process.
pub fn credential_env(spec: &RemoteSpec) -> Vec<(String, String)> {
    let prefix = format!("RCLONE_CONFIG_{}", REMOTE_NAME.to_ascii_uppercase());
    let mut env = Vec::new();
    let mut push = |suffix: &str, value: &Option<String>| {
        if let Some(value) = value {
            env.push((format!("{prefix}_{suffix}"), value.clone()));
        }
    };
    match spec.provider {
        Provider::AwsS3 | Provider::S3Compatible | Provider::OciS3Compat => {
            push("ACCESS_KEY_ID", &spec.secrets.access_key_id);
            push("SECRET_ACCESS_KEY", &spec.secrets.secret_access_key);
            push("SESSION_TOKEN", &spec.secrets.session_token);
        }
        Provider::AzureBlob => {
            push("ACCOUNT", &spec.secrets.account_name);
            push("KEY", &spec.secrets.account_key);
            push("SAS_URL", &spec.secrets.sas_token);
        }
        Provider::GcpGcs => {
            push(
                "SERVICE_ACCOUNT_CREDENTIALS",
                &spec.secrets.service_account_json,
            );
        }
        Provider::OciObjectStorage => {
            // Native OCI auth reads its own config; S3-compat profiles
            // are the supported path for key-based access.
        }
    }
    env
}

/// Flags shared by every invocation.
pub fn base_flags(config_path: &std::path::Path, stats_interval_secs: u64, extra: &[String]) -> Vec<String> {
    let mut flags = vec![
        "--config".to_string(),
        config_path.display().to_string(),
        "--use-json-log".to_string(),
        "-v".to_string(),
        "--stats".to_string(),
        format!("{stats_interval_secs}s"),
        "--stats-log-level".to_string(),
        "NOTICE".to_string(),
    ];
    flags.extend(extra.iter().cloned());
    flags
}

fn filter_flags(include: &[String], exclude: &[String]) -> Vec<String> {
    let mut flags = Vec::new();
    for pattern in include {
        flags.push("--include".to_string());
        flags.push(pattern.clone());
    }
    for pattern in exclude {
        flags.push("--exclude".to_string());
        flags.push(pattern.clone());
    }
    flags
}

fn tls_flags(spec: &RemoteSpec) -> Vec<String> {
    if spec.flags.tls_insecure_skip_verify {
        vec!["--no-check-certificate".to_string()]
    } else {
        Vec::new()
    }
}

/// One child-process invocation (argv after the binary).
#[derive(Debug, Clone)]
pub struct Invocation {
    pub args: Vec<String>,
}

impl Invocation {
    fn new(args: Vec<String>) -> Self {
        Self { args }
    }
}

/// Argv for the main transfer child of a plan. Batch, zip and index
/// plans are composed from several invocations by the supervisor; this
/// covers the single-child plans.
pub fn transfer_invocation(input: &PlanInput, spec: &RemoteSpec) -> Option<Invocation> {
    let mut args: Vec<String> = Vec::new();
    match input {
        PlanInput::SyncLocalToS3(p) => {
            args.push(if p.delete_extraneous { "sync" } else { "copy" }.to_string());
            args.push(p.local_path.display().to_string());
            args.push(remote_path(&p.bucket, p.prefix.as_deref()));
            args.extend(filter_flags(&p.include, &p.exclude));
            if p.dry_run {
                args.push("--dry-run".to_string());
            }
        }
        PlanInput::SyncS3ToLocal(p) => {
            args.push(if p.delete_extraneous { "sync" } else { "copy" }.to_string());
            args.push(remote_path(&p.bucket, p.prefix.as_deref()));
            args.push(p.local_path.display().to_string());
            args.extend(filter_flags(&p.include, &p.exclude));
            if p.dry_run {
                args.push("--dry-run".to_string());
            }
        }
        PlanInput::SyncStagingToS3 {
            staging_dir,
            bucket,
            prefix,
        } => {
            args.push("copy".to_string());
            args.push(staging_dir.display().to_string());
            args.push(remote_path(bucket, prefix.as_deref()));
        }
        PlanInput::DeletePrefix(p) => {
            if p.delete_all {
                args.push("delete".to_string());
                args.push(remote_path(&p.bucket, None));
            } else {
                args.push("delete".to_string());
                args.push(remote_path(&p.bucket, p.prefix.as_deref()));
            }
            args.extend(filter_flags(&p.include, &p.exclude));
            if p.dry_run {
                args.push("--dry-run".to_string());
            }
        }
        PlanInput::CopyPrefix {
            payload: p,
            move_source,
        } => {
            args.push(if *move_source { "move" } else { "copy" }.to_string());
            args.push(remote_path(&p.src_bucket, Some(&p.src_prefix)));
            args.push(remote_path(&p.dst_bucket, Some(&p.dst_prefix)));
            args.extend(filter_flags(&p.include, &p.exclude));
            if p.dry_run {
                args.push("--dry-run".to_string());
            }
        }
        // Composed plans have no single transfer child.
        PlanInput::CopyObject { .. }
        | PlanInput::Batch { .. }
        | PlanInput::DeleteObjects(_)
        | PlanInput::Zip { .. }
        | PlanInput::Index(_)
        | PlanInput::VerifyDirectUpload { .. } => return None,
    }
    args.extend(tls_flags(spec));
    Some(Invocation::new(args))
}

/// Argv for one object pair (`copyto`/`moveto`).
pub fn pair_invocation(
    src_bucket: &str,
    src_key: &str,
    dst_bucket: &str,
    dst_key: &str,
    move_source: bool,
    dry_run: bool,
    spec: &RemoteSpec,
) -> Invocation {
    let mut args = vec![
        if move_source { "moveto" } else { "copyto" }.to_string(),
        remote_path(src_bucket, Some(src_key)),
        remote_path(dst_bucket, Some(dst_key)),
    ];
    if dry_run {
        args.push("--dry-run".to_string());
    }
    args.extend(tls_flags(spec));
    Invocation::new(args)
}

/// Argv for a `--files-from` bulk delete.
pub fn delete_list_invocation(
    bucket: &str,
    list_file: &std::path::Path,
    spec: &RemoteSpec,
) -> Invocation {
    let mut args = vec![
        "delete".to_string(),
        remote_path(bucket, None),
        "--files-from".to_string(),
        list_file.display().to_string(),
    ];
    args.extend(tls_flags(spec));
    Invocation::new(args)
}

/// Argv for a recursive listing (`lsjson -R`).
pub fn listing_invocation(bucket: &str, prefix: Option<&str>, spec: &RemoteSpec) -> Invocation {
    let mut args = vec![
        "lsjson".to_string(),
        "-R".to_string(),
        "--files-only".to_string(),
        remote_path(bucket, prefix),
    ];
    args.extend(tls_flags(spec));
    Invocation::new(args)
}

/// Argv for streaming one object to stdout.
pub fn cat_invocation(bucket: &str, key: &str, spec: &RemoteSpec) -> Invocation {
    let mut args = vec!["cat".to_string(), remote_path(bucket, Some(key))];
    args.extend(tls_flags(spec));
    Invocation::new(args)
}

/// Argv for streaming stdin into one object.
pub fn rcat_invocation(bucket: &str, key: &str, spec: &RemoteSpec) -> Invocation {
    let mut args = vec!["rcat".to_string(), remote_path(bucket, Some(key))];
    args.extend(tls_flags(spec));
    Invocation::new(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> RemoteSpec {
        RemoteSpec {
            provider: Provider::S3Compatible,
            endpoint: Some("http://127.0.0.1:9000".to_string()),
            region: None,
            flags: ProfileFlags {
                force_path_style: true,
                ..Default::default()
            },
            secrets: ProfileSecrets {
                access_key_id: Some("minioadmin".to_string()),
                secret_access_key: Some("miniosecret".to_string()),
                ..Default::default()
            },
        }
    }

    #[test]
    fn config_file_never_contains_secrets() {
        let rendered = render_remote_config(&spec());
        assert!(rendered.contains("[target]"));
        assert!(rendered.contains("type = s3"));
        assert!(rendered.contains("endpoint = http://127.0.0.1:9000"));
        assert!(rendered.contains("force_path_style = true"));
        assert!(!rendered.contains("minioadmin"));
        assert!(!rendered.contains("miniosecret"));
    }

    #[test]
    fn credentials_only_in_env() {
        let env = credential_env(&spec());
        assert!(env
            .iter()
            .any(|(k, v)| k == "RCLONE_CONFIG_TARGET_ACCESS_KEY_ID" && v == "minioadmin"));
        assert!(env
            .iter()
            .any(|(k, v)| k == "RCLONE_CONFIG_TARGET_SECRET_ACCESS_KEY" && v == "miniosecret"));
    }

    #[test]
    fn sync_argv_is_shaped_by_delete_extraneous() {
        let payload = SyncLocalToS3Payload {
            bucket: "media".into(),
            local_path: "/srv/exports/photos".into(),
            prefix: Some("backup/".into()),
            delete_extraneous: true,
            include: vec!["*.jpg".into()],
            exclude: vec![],
            dry_run: true,
        };
        let invocation =
            transfer_invocation(&PlanInput::SyncLocalToS3(payload), &spec()).unwrap();
        assert_eq!(invocation.args[0], "sync");
        assert_eq!(invocation.args[1], "/srv/exports/photos");
        assert_eq!(invocation.args[2], "target:media/backup/");
        assert!(invocation.args.contains(&"--include".to_string()));
        assert!(invocation.args.contains(&"--dry-run".to_string()));
    }

    #[test]
    fn argv_never_contains_secret_values() {
        let s = spec();
        let payload = SyncS3ToLocalPayload {
            bucket: "media".into(),
            local_path: "/srv/exports".into(),
            prefix: None,
            delete_extraneous: false,
            include: vec![],
            exclude: vec![],
            dry_run: false,
        };
        let invocation = transfer_invocation(&PlanInput::SyncS3ToLocal(payload), &s).unwrap();
        for secret in s.secrets.secret_values() {
            assert!(invocation.args.iter().all(|a| !a.contains(secret)));
        }
    }

    #[test]
    fn pair_invocation_uses_copyto_and_moveto() {
        let copy = pair_invocation("a", "x", "b", "y", false, false, &spec());
        assert_eq!(copy.args[0], "copyto");
        assert_eq!(copy.args[1], "target:a/x");
        assert_eq!(copy.args[2], "target:b/y");

        let mv = pair_invocation("a", "x", "b", "y", true, true, &spec());
        assert_eq!(mv.args[0], "moveto");
        assert!(mv.args.contains(&"--dry-run".to_string()));
    }

    #[test]
    fn remote_path_strips_leading_slash() {
        assert_eq!(remote_path("b", Some("/k")), "target:b/k");
        assert_eq!(remote_path("b", None), "target:b");
        assert_eq!(remote_path("b", Some("")), "target:b");
    }
}
