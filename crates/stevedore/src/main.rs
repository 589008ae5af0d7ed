//! Stevedore — local-first control plane for bulk object-storage
//! transfers.
//!
//! Usage:
//!     stevedore --data-dir /var/lib/stevedore --listen 127.0.0.1:8787

mod config;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stevedore_engine::{EngineProbe, EngineSettings, EngineSupervisor};
use stevedore_events::EventHub;
use stevedore_scheduler::JobManager;
use stevedore_server::{build_router, AppState};
use stevedore_store::{lock, sealer, Store};
use stevedore_uploads::UploadManager;

use crate::config::Args;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stevedore=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let settings = args.into_settings()?;

    tracing::info!("starting stevedore");
    tracing::info!("  listen:   {}", settings.listen_addr);
    tracing::info!("  data dir: {}", settings.data_dir.display());

    // Layout first, lock second: everything below assumes both.
    for dir in [
        settings.data_dir.clone(),
        settings.jobs_log_dir(),
        settings.unknown_errors_dir(),
        settings.artifacts_dir(),
        settings.staging_dir(),
        settings.engine_tmp_dir(),
    ] {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&settings.data_dir, std::fs::Permissions::from_mode(0o700))?;
    }

    let _lock = lock::try_lock_data_dir(&settings.lock_path())
        .context("another stevedore instance owns this data directory")?;

    let sealer: Arc<dyn sealer::Sealer> = match settings.encryption_key {
        Some(key) => Arc::new(sealer::AesGcmSealer::new(&key)),
        None => {
            tracing::warn!(
                "no encryption key configured; profile credentials are stored unsealed"
            );
            Arc::new(sealer::PlainSealer)
        }
    };

    let store = Store::open(&settings.db_path(), sealer)
        .await
        .context("failed to open the database")?;

    let probe = Arc::new(EngineProbe::new(settings.engine_path.clone()));
    match probe.verify().await {
        Ok(info) => tracing::info!("transfer engine: {} ({})", info.path.display(), info.version_string),
        Err(e) => tracing::warn!("transfer engine unavailable: {e} (submits will be rejected)"),
    }

    let supervisor = Arc::new(EngineSupervisor::new(EngineSettings {
        binary: settings
            .engine_path
            .clone()
            .unwrap_or_else(|| stevedore_protocol::defaults::DEFAULT_ENGINE_BINARY.into()),
        extra_flags: settings.engine_flags.clone(),
        stats_interval: settings.stats_interval,
        tmp_dir: settings.engine_tmp_dir(),
        artifacts_dir: settings.artifacts_dir(),
        logs_dir: settings.jobs_log_dir(),
        log_max_bytes: settings.job_log_max_bytes,
        kill_grace: std::time::Duration::from_secs(5),
    }));

    let hub = Arc::new(EventHub::new());
    let jobs = JobManager::new(
        store.clone(),
        hub.clone(),
        supervisor.clone(),
        probe.clone(),
        settings.clone(),
    );
    jobs.start().await.context("scheduler startup failed")?;

    let uploads = UploadManager::new(store.clone(), settings.clone(), supervisor.clone());
    let sweep_token = tokio_util::sync::CancellationToken::new();
    uploads.spawn_ttl_sweeper(sweep_token.clone());

    let state = AppState {
        store: store.clone(),
        hub,
        jobs: jobs.clone(),
        uploads,
        probe,
        settings: Arc::new(settings.clone()),
    };
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(&settings.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.listen_addr))?;
    tracing::info!("listening on {}", settings.listen_addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    tracing::info!("shutting down");
    sweep_token.cancel();
    jobs.shutdown();
    store.close().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
