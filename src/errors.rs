//! Error types surfaced by the transfer pipeline and the backup workflows.
//!
//! Store-level failures are `StoreError` (see `crate::store`); these types add
//! the operation, bucket and key they happened under.

use crate::store::StoreError;
use std::{fmt, io, path::PathBuf, time::Duration};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransferError {
    /// A request field is malformed. Raised before any store call.
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    /// The store rejected a call.
    #[error("{operation} failed for `{key}` in bucket `{bucket}`: {source} (status code: {})", .source.status())]
    Store {
        operation: &'static str,
        bucket: String,
        key: String,
        #[source]
        source: StoreError,
    },

    /// The transfer ran past its deadline and was cancelled.
    #[error("transfer of `{key}` in bucket `{bucket}` cancelled after {deadline:?}: context deadline exceeded")]
    DeadlineExceeded {
        bucket: String,
        key: String,
        deadline: Duration,
    },

    #[error("local file `{}`: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl TransferError {
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }

    pub fn store(
        operation: &'static str,
        bucket: impl Into<String>,
        key: impl Into<String>,
        source: StoreError,
    ) -> Self {
        Self::Store {
            operation,
            bucket: bucket.into(),
            key: key.into(),
            source,
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }

    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self, Self::DeadlineExceeded { .. })
    }
}

/// One store call that failed during best-effort pruning or cleanup.
#[derive(Debug)]
pub struct CleanupFailure {
    pub key: String,
    pub error: StoreError,
}

/// Non-fatal aggregate of failures after a successful upload, or of
/// individual deletes/aborts during a maintenance pass.
#[derive(Debug, Default)]
pub struct RotationWarning {
    pub bucket: String,
    /// A listing that failed outright, leaving the tier untouched.
    pub listing: Option<(String, StoreError)>,
    pub failures: Vec<CleanupFailure>,
}

impl RotationWarning {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.listing.is_none() && self.failures.is_empty()
    }
}

impl fmt::Display for RotationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rotation in bucket `{}` partially failed", self.bucket)?;
        if let Some((prefix, err)) = &self.listing {
            write!(f, "; listing `{}` failed: {}", prefix, err)?;
        }
        if !self.failures.is_empty() {
            write!(f, "; {} operation(s) failed:", self.failures.len())?;
            for failure in &self.failures {
                write!(f, " [{}: {}]", failure.key, failure.error)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for RotationWarning {}

#[derive(Debug, Error)]
pub enum BackupError {
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// A store call outside the transfer failed and nothing was changed.
    #[error("{operation} failed in bucket `{bucket}`: {source}")]
    Store {
        operation: &'static str,
        bucket: String,
        #[source]
        source: StoreError,
    },

    /// The primary work succeeded but pruning or cleanup did not fully.
    #[error(transparent)]
    Rotation(#[from] RotationWarning),

    #[error("invalid rotation policy: {0}")]
    Policy(#[from] crate::models::policy::PolicyError),
}

impl BackupError {
    /// Whether the workflow's primary outcome still holds.
    pub fn is_warning(&self) -> bool {
        matches!(self, Self::Rotation(_))
    }
}
