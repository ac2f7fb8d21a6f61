use crate::{
    models::{RotationPolicy, TransferRequest},
    store::LocalObjectStore,
};
use anyhow::{Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use std::{env, fmt, path::PathBuf};

/// Workflow selected on the command line.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Upload under a tiered key, then rotate that tier
    Backup,
    /// Upload under the key given, no rotation
    Upload,
    /// Fetch an object to a local file
    Download,
    /// Rotate every tier without uploading
    Rotate,
    /// Abort abandoned multipart uploads
    Cleanup,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Backup => "backup",
            Action::Upload => "upload",
            Action::Download => "download",
            Action::Rotate => "rotate",
            Action::Cleanup => "cleanup",
        })
    }
}

/// Centralized run configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub action: Action,
    pub dry_run: bool,
    pub create_bucket: bool,
    pub region: String,
    pub storage_dir: String,
    pub database_url: String,
    pub request: TransferRequest,
    pub policy: RotationPolicy,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "GFS rotating backups to an object store")]
pub struct Args {
    #[arg(long, value_enum)]
    pub action: Action,

    /// Bucket region (overrides GFS_BACKUP_REGION)
    #[arg(long)]
    pub region: Option<String>,

    #[arg(long)]
    pub bucket: Option<String>,

    /// Key prefix inside the bucket, ending in `/` (overrides GFS_BACKUP_BUCKET_DIR)
    #[arg(long)]
    pub bucket_dir: Option<String>,

    /// File to upload, or the destination of a download
    #[arg(long)]
    pub path_to_file: Option<PathBuf>,

    /// Object name in the bucket. Defaults to the file name of --path-to-file
    #[arg(long)]
    pub s3_file_name: Option<String>,

    /// Transfer deadline in seconds. 0 disables the deadline; negative values are rejected
    #[arg(long, default_value_t = 3600, allow_negative_numbers = true)]
    pub timeout: i64,

    #[arg(long)]
    pub dry_run: bool,

    #[arg(long, default_value_t = 5)]
    pub concurrent_workers: usize,

    /// Chunk size in MB
    #[arg(long, default_value_t = 50)]
    pub part_size: usize,

    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub enforce_retention_period: bool,

    #[arg(long, default_value_t = 6)]
    pub daily_retention_count: usize,

    #[arg(long, default_value_t = 4)]
    pub weekly_retention_count: usize,

    /// Minimum age in hours before a daily backup may be pruned
    #[arg(long, default_value_t = 168, allow_negative_numbers = true)]
    pub daily_retention_period: i64,

    /// Minimum age in hours before a weekly backup may be pruned
    #[arg(long, default_value_t = 672, allow_negative_numbers = true)]
    pub weekly_retention_period: i64,

    /// Create the bucket in the local store if it does not exist. Skipped with --dry-run
    #[arg(long)]
    pub create_bucket: bool,

    /// Directory where objects are stored (overrides GFS_BACKUP_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides GFS_BACKUP_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,
}

fn env_or(name: &str, default: &str) -> Result<String> {
    match env::var(name) {
        Ok(value) => Ok(value),
        Err(env::VarError::NotPresent) => Ok(default.to_string()),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig.
    pub fn from_env_and_args() -> Result<Self> {
        Self::from_args(Args::parse())
    }

    /// CLI values win over the environment, the environment over defaults.
    pub fn from_args(args: Args) -> Result<Self> {
        // --- Environment fallback ---
        let env_region = env_or("GFS_BACKUP_REGION", "local")?;
        let env_bucket_dir = env_or("GFS_BACKUP_BUCKET_DIR", "")?;
        let env_storage = env_or("GFS_BACKUP_STORAGE_DIR", "./data/objects")?;
        let env_db = env_or("GFS_BACKUP_DATABASE_URL", "sqlite://./data/meta/gfs_backup.db")?;

        let local_path = args.path_to_file.unwrap_or_default();
        let destination_key = match args.s3_file_name {
            Some(name) => name,
            None => local_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };

        // --- Merge ---
        let request = TransferRequest {
            local_path,
            destination_key,
            bucket: args.bucket.unwrap_or_default(),
            bucket_directory: args.bucket_dir.unwrap_or(env_bucket_dir),
            deadline: chrono::Duration::try_seconds(args.timeout)
                .context("--timeout out of range")?,
            worker_count: args.concurrent_workers,
            chunk_size_mb: args.part_size,
            apply_naming: args.action == Action::Backup,
        };
        let policy = RotationPolicy {
            daily_retention_count: args.daily_retention_count,
            weekly_retention_count: args.weekly_retention_count,
            daily_retention_period: chrono::Duration::try_hours(args.daily_retention_period)
                .context("--daily-retention-period out of range")?,
            weekly_retention_period: chrono::Duration::try_hours(args.weekly_retention_period)
                .context("--weekly-retention-period out of range")?,
            enforce_retention_period: args.enforce_retention_period,
            ..RotationPolicy::default()
        };

        Ok(Self {
            action: args.action,
            dry_run: args.dry_run,
            create_bucket: args.create_bucket,
            region: args.region.unwrap_or(env_region),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            request,
            policy,
        })
    }

    /// Open the local store for this run.
    ///
    /// A dry run opens an existing store read-only and never creates the
    /// bucket, so nothing on disk changes.
    pub async fn open_store(&self) -> Result<LocalObjectStore> {
        if self.dry_run {
            let store = LocalObjectStore::open_read_only(&self.database_url, &self.storage_dir)
                .await
                .with_context(|| format!("opening store at {} read-only", self.storage_dir))?;
            if self.create_bucket {
                tracing::info!(bucket = %self.request.bucket, "dry run: would create bucket");
            }
            return Ok(store);
        }

        let store = LocalObjectStore::connect(&self.database_url, &self.storage_dir)
            .await
            .with_context(|| format!("opening store at {}", self.storage_dir))?;
        if self.create_bucket {
            let bucket = store
                .ensure_bucket(&self.request.bucket, &self.region)
                .await
                .with_context(|| format!("creating bucket `{}`", self.request.bucket))?;
            tracing::info!("Using bucket {} in {}", bucket.name, bucket.region);
        }
        Ok(store)
    }
}
