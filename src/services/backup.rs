//! Backup workflows: tiered backup, plain upload and download, rotation and
//! multipart cleanup.

use crate::{
    errors::{BackupError, CleanupFailure, RotationWarning, TransferError},
    models::{BucketEntry, MultipartSession, RotationPolicy, Tier, TransferRequest},
    services::{
        classifier::classify,
        clock::Clock,
        retention::{self, RetentionPlan},
        transfer::TransferPipeline,
    },
    store::{ObjectStoreClient, StoreError},
};
use chrono::{DateTime, Utc};
use futures::{StreamExt, stream};
use std::sync::Arc;
use tracing::{info, warn};

/// Concurrent deletes or aborts issued during a maintenance pass.
const MAINTENANCE_CONCURRENCY: usize = 8;

/// What rotation did, or in a dry run would have done, to one tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierReport {
    pub tier: Tier,
    /// Listing prefix, bucket directory included.
    pub prefix: String,
    pub kept: Vec<String>,
    pub deferred: Vec<String>,
    /// Deleted keys. In a dry run, the keys that would be deleted.
    pub pruned: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupReport {
    pub key: String,
    pub tier: Tier,
    pub rotation: TierReport,
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationReport {
    pub tiers: Vec<TierReport>,
    pub dry_run: bool,
}

impl RotationReport {
    pub fn pruned(&self) -> usize {
        self.tiers.iter().map(|tier| tier.pruned.len()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    /// Aborted sessions. In a dry run, the sessions that would be aborted.
    pub aborted: Vec<MultipartSession>,
    pub dry_run: bool,
}

/// Runs the workflows against one store with one policy.
///
/// Every workflow reads the clock once, so classification, naming and
/// retention ages agree within a run.
#[derive(Clone)]
pub struct BackupOrchestrator {
    store: Arc<dyn ObjectStoreClient>,
    pipeline: TransferPipeline,
    policy: RotationPolicy,
    clock: Arc<dyn Clock>,
}

impl BackupOrchestrator {
    pub fn new(
        store: Arc<dyn ObjectStoreClient>,
        policy: RotationPolicy,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, BackupError> {
        policy.validate()?;
        if !policy.enforce_retention_period {
            warn!("retention periods are not enforced, pruning is governed by counts alone");
        }
        Ok(Self {
            pipeline: TransferPipeline::new(store.clone()),
            store,
            policy,
            clock,
        })
    }

    /// Upload under a tiered, timestamped key, then rotate that tier.
    ///
    /// Rotation only runs after a successful upload. Rotation failures come
    /// back as `BackupError::Rotation`; the upload stands regardless. A dry
    /// run plans rotation as if the new key were already listed.
    pub async fn run_backup(
        &self,
        request: &TransferRequest,
        dry_run: bool,
    ) -> Result<BackupReport, BackupError> {
        let now = self.clock.now();
        let tier = classify(now);
        let request = TransferRequest {
            apply_naming: true,
            ..request.clone()
        };

        let key = self
            .pipeline
            .upload(&request, self.policy.prefix(tier), now, dry_run)
            .await?;
        info!(bucket = %request.bucket, key = %key, %tier, dry_run, "backup uploaded");

        let mut warning = RotationWarning::new(&request.bucket);
        let pending = dry_run.then(|| BucketEntry::new(key.clone(), now));
        let rotation = match self
            .rotate_tier(
                &request.bucket,
                &request.bucket_directory,
                tier,
                now,
                pending,
                dry_run,
                &mut warning,
            )
            .await
        {
            Ok(report) => report,
            Err((prefix, err)) => {
                warn!(bucket = %request.bucket, prefix = %prefix, "listing for rotation failed: {}", err);
                warning.listing = Some((prefix, err));
                return Err(warning.into());
            }
        };

        if !warning.is_empty() {
            return Err(warning.into());
        }
        Ok(BackupReport {
            key,
            tier,
            rotation,
            dry_run,
        })
    }

    /// Upload under `destination_key` as given. No tiering, no rotation.
    pub async fn run_upload(
        &self,
        request: &TransferRequest,
        dry_run: bool,
    ) -> Result<String, BackupError> {
        let request = TransferRequest {
            apply_naming: false,
            ..request.clone()
        };
        let key = self
            .pipeline
            .upload(&request, "", self.clock.now(), dry_run)
            .await?;
        Ok(key)
    }

    /// Fetch `bucket_directory + destination_key` into `local_path`.
    pub async fn run_download(
        &self,
        request: &TransferRequest,
        dry_run: bool,
    ) -> Result<u64, BackupError> {
        if dry_run {
            request.validate_fields()?;
            info!(
                bucket = %request.bucket,
                key = %request.verbatim_key(),
                destination = %request.local_path.display(),
                "dry run: skipping download"
            );
            return Ok(0);
        }
        Ok(self.pipeline.download(request).await?)
    }

    /// Rotate every tier under `bucket_directory` without uploading.
    ///
    /// A failed listing is fatal. Failed deletes are collected into
    /// `BackupError::Rotation` once every tier has been processed.
    pub async fn run_rotate_only(
        &self,
        bucket: &str,
        bucket_directory: &str,
        dry_run: bool,
    ) -> Result<RotationReport, BackupError> {
        check_location(bucket, bucket_directory)?;
        let now = self.clock.now();
        let mut warning = RotationWarning::new(bucket);
        let mut tiers = Vec::with_capacity(Tier::ALL.len());
        for tier in Tier::ALL {
            let report = self
                .rotate_tier(bucket, bucket_directory, tier, now, None, dry_run, &mut warning)
                .await
                .map_err(|(_, source)| BackupError::Store {
                    operation: "list objects",
                    bucket: bucket.to_string(),
                    source,
                })?;
            tiers.push(report);
        }

        if !warning.is_empty() {
            return Err(warning.into());
        }
        let report = RotationReport { tiers, dry_run };
        info!(bucket, pruned = report.pruned(), dry_run, "rotation finished");
        Ok(report)
    }

    /// Abort every open multipart session in the bucket.
    pub async fn run_cleanup(
        &self,
        bucket: &str,
        dry_run: bool,
    ) -> Result<CleanupReport, BackupError> {
        check_location(bucket, "")?;
        let sessions = self
            .store
            .list_multipart_uploads(bucket)
            .await
            .map_err(|source| BackupError::Store {
                operation: "list multipart uploads",
                bucket: bucket.to_string(),
                source,
            })?;
        info!(bucket, open = sessions.len(), dry_run, "found open multipart uploads");

        if dry_run {
            for session in &sessions {
                info!(
                    bucket,
                    key = %session.key,
                    upload_id = %session.upload_id,
                    initiated_at = %session.initiated_at,
                    "dry run: would abort"
                );
            }
            return Ok(CleanupReport {
                aborted: sessions,
                dry_run,
            });
        }

        let outcomes: Vec<_> = stream::iter(sessions)
            .map(|session| async move {
                let result = self
                    .store
                    .abort_multipart_upload(bucket, &session.key, &session.upload_id)
                    .await;
                (session, result)
            })
            .buffer_unordered(MAINTENANCE_CONCURRENCY)
            .collect()
            .await;

        let mut warning = RotationWarning::new(bucket);
        let mut aborted = Vec::new();
        for (session, result) in outcomes {
            match result {
                Ok(()) => {
                    info!(bucket, key = %session.key, upload_id = %session.upload_id, "aborted");
                    aborted.push(session);
                }
                // Completed or aborted by someone else in the meantime.
                Err(StoreError::UploadNotFound(_)) => {}
                Err(error) => {
                    warn!(bucket, key = %session.key, "abort failed: {}", error);
                    warning.failures.push(CleanupFailure {
                        key: session.key,
                        error,
                    });
                }
            }
        }

        if !warning.is_empty() {
            return Err(warning.into());
        }
        Ok(CleanupReport { aborted, dry_run })
    }

    /// List one tier, plan its retention and delete what the plan prunes.
    ///
    /// `pending` is an object not yet in the store that the plan should
    /// count, such as the upload a dry run skipped. A failed listing is
    /// returned with its prefix; failed deletes go into `warning` and do not
    /// stop the remaining deletes.
    #[allow(clippy::too_many_arguments)]
    async fn rotate_tier(
        &self,
        bucket: &str,
        bucket_directory: &str,
        tier: Tier,
        now: DateTime<Utc>,
        pending: Option<BucketEntry>,
        dry_run: bool,
        warning: &mut RotationWarning,
    ) -> Result<TierReport, (String, StoreError)> {
        let prefix = format!("{}{}", bucket_directory, self.policy.prefix(tier));
        let mut entries = match self.store.list_objects(bucket, &prefix).await {
            Ok(entries) => entries,
            Err(err) => return Err((prefix, err)),
        };
        if let Some(entry) = pending {
            if !entries.iter().any(|listed| listed.key == entry.key) {
                entries.push(entry);
            }
        }

        let RetentionPlan {
            keep,
            deferred,
            prune,
        } = retention::plan(&self.policy, tier, entries, now);
        for key in &deferred {
            warn!(
                bucket,
                key = %key,
                %tier,
                "past the retention count but younger than the retention period, deferring"
            );
        }

        let pruned = if dry_run {
            for key in &prune {
                info!(bucket, key = %key, %tier, "dry run: would delete");
            }
            prune
        } else {
            self.delete_all(bucket, tier, prune, warning).await
        };

        info!(
            bucket,
            prefix = %prefix,
            %tier,
            kept = keep.len(),
            deferred = deferred.len(),
            pruned = pruned.len(),
            dry_run,
            "rotated tier"
        );
        Ok(TierReport {
            tier,
            prefix,
            kept: keep,
            deferred,
            pruned,
        })
    }

    /// Best-effort deletes. Returns the keys actually deleted, newest first.
    async fn delete_all(
        &self,
        bucket: &str,
        tier: Tier,
        keys: Vec<String>,
        warning: &mut RotationWarning,
    ) -> Vec<String> {
        let outcomes: Vec<_> = stream::iter(keys)
            .map(|key| async move {
                let result = self.store.delete_object(bucket, &key).await;
                (key, result)
            })
            .buffered(MAINTENANCE_CONCURRENCY)
            .collect()
            .await;

        let mut deleted = Vec::with_capacity(outcomes.len());
        for (key, result) in outcomes {
            match result {
                Ok(()) => {
                    info!(bucket, key = %key, %tier, "deleted");
                    deleted.push(key);
                }
                Err(error) => {
                    warn!(bucket, key = %key, %tier, "delete failed: {}", error);
                    warning.failures.push(CleanupFailure { key, error });
                }
            }
        }
        deleted
    }
}

/// Location checks for workflows that take no `TransferRequest`.
fn check_location(bucket: &str, bucket_directory: &str) -> Result<(), TransferError> {
    if bucket.is_empty() {
        return Err(TransferError::validation(
            "bucket",
            "invalid bucket specified, bucket must be specified",
        ));
    }
    if !bucket_directory.is_empty() && !bucket_directory.ends_with('/') {
        return Err(TransferError::validation(
            "bucket_directory",
            format!(
                "expected bucket dir to have trailing slash, got `{}`",
                bucket_directory
            ),
        ));
    }
    Ok(())
}
