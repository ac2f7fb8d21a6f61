use anyhow::{Context, Result};
use gfs_backup::{
    config::{Action, AppConfig},
    errors::BackupError,
    services::{BackupOrchestrator, SystemClock},
};
use std::{process::ExitCode, sync::Arc};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    // --- Parse config ---
    let cfg = AppConfig::from_env_and_args()?;
    tracing::info!("Starting gfs-backup with config: {:?}", cfg);

    // --- Open the local store ---
    let store = cfg.open_store().await?;

    let orchestrator =
        BackupOrchestrator::new(Arc::new(store), cfg.policy.clone(), Arc::new(SystemClock))?;
    let request = &cfg.request;

    // --- Dispatch ---
    let outcome = match cfg.action {
        Action::Backup => orchestrator
            .run_backup(request, cfg.dry_run)
            .await
            .map(|report| {
                tracing::info!(
                    key = %report.key,
                    tier = %report.tier,
                    pruned = report.rotation.pruned.len(),
                    deferred = report.rotation.deferred.len(),
                    "Backup finished"
                )
            }),
        Action::Upload => orchestrator
            .run_upload(request, cfg.dry_run)
            .await
            .map(|key| tracing::info!(key = %key, "Upload finished")),
        Action::Download => orchestrator
            .run_download(request, cfg.dry_run)
            .await
            .map(|bytes| tracing::info!(bytes, "Download finished")),
        Action::Rotate => orchestrator
            .run_rotate_only(&request.bucket, &request.bucket_directory, cfg.dry_run)
            .await
            .map(|report| tracing::info!(pruned = report.pruned(), "Rotation finished")),
        Action::Cleanup => orchestrator
            .run_cleanup(&request.bucket, cfg.dry_run)
            .await
            .map(|report| tracing::info!(aborted = report.aborted.len(), "Cleanup finished")),
    };

    match outcome {
        Ok(()) => Ok(()),
        Err(BackupError::Rotation(warning)) => {
            tracing::warn!("{} finished with warnings: {}", cfg.action, warning);
            Ok(())
        }
        Err(err) => Err(err).with_context(|| format!("{} failed", cfg.action)),
    }
}
