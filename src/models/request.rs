//! Per-transfer request handed to the transfer pipeline.

use crate::errors::TransferError;
use chrono::{DateTime, Duration, Utc};
use std::path::PathBuf;

/// Sortable timestamp appended to tiered keys, e.g. `20240305T100000`.
pub const KEY_TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S";

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Describes one file moving between local disk and the store.
///
/// For uploads `local_path` is the source file; for downloads it is the
/// destination the object is written to.
#[derive(Clone, Debug)]
pub struct TransferRequest {
    pub local_path: PathBuf,
    /// Object name in the store, before any directory or tier naming.
    pub destination_key: String,
    pub bucket: String,
    /// Key prefix inside the bucket. Empty, or terminated by `/`.
    pub bucket_directory: String,
    /// Wall-clock bound on the whole transfer. Zero disables the deadline.
    pub deadline: Duration,
    pub worker_count: usize,
    pub chunk_size_mb: usize,
    /// Prepend the tier prefix and append a timestamp to the key.
    pub apply_naming: bool,
}

impl TransferRequest {
    /// Field checks shared by uploads and downloads. No I/O.
    pub fn validate_fields(&self) -> Result<(), TransferError> {
        if self.bucket.is_empty() {
            return Err(TransferError::validation(
                "bucket",
                "invalid bucket specified, bucket must be specified",
            ));
        }
        if self.local_path.as_os_str().is_empty() {
            return Err(TransferError::validation(
                "local_path",
                "path to file should not be empty and must include the full path to the file",
            ));
        }
        if self.destination_key.is_empty() {
            return Err(TransferError::validation(
                "destination_key",
                "file name in the bucket must be specified",
            ));
        }
        if !self.bucket_directory.is_empty() && !self.bucket_directory.ends_with('/') {
            return Err(TransferError::validation(
                "bucket_directory",
                format!(
                    "expected bucket dir to have trailing slash, got `{}`",
                    self.bucket_directory
                ),
            ));
        }
        if self.worker_count < 1 {
            return Err(TransferError::validation(
                "worker_count",
                "concurrent workers should not be less than 1",
            ));
        }
        if self.chunk_size_mb < 1 {
            return Err(TransferError::validation(
                "chunk_size_mb",
                "part size should not be less than 1 MB",
            ));
        }
        if (self.chunk_size_mb as u64).checked_mul(BYTES_PER_MB).is_none() {
            return Err(TransferError::validation(
                "chunk_size_mb",
                format!("part size of {} MB is too large", self.chunk_size_mb),
            ));
        }
        if self.deadline < Duration::zero() {
            return Err(TransferError::validation(
                "deadline",
                "timeout must not be less than 0",
            ));
        }
        Ok(())
    }

    /// Chunk size in bytes. Saturates for sizes `validate_fields` rejects.
    pub fn chunk_size_bytes(&self) -> u64 {
        (self.chunk_size_mb as u64).saturating_mul(BYTES_PER_MB)
    }

    /// The deadline as a tokio-compatible duration, `None` when disabled.
    pub fn deadline_std(&self) -> Option<std::time::Duration> {
        self.deadline
            .to_std()
            .ok()
            .filter(|deadline| !deadline.is_zero())
    }

    /// Name of the object after tier naming, without the bucket directory.
    pub fn object_name(&self, tier_prefix: &str, at: DateTime<Utc>) -> String {
        if self.apply_naming {
            format!(
                "{}{}_{}",
                tier_prefix,
                self.destination_key,
                at.format(KEY_TIMESTAMP_FORMAT)
            )
        } else {
            self.destination_key.clone()
        }
    }

    /// `destination_key` under the bucket directory, with no tier naming.
    pub fn verbatim_key(&self) -> String {
        format!("{}{}", self.bucket_directory, self.destination_key)
    }

    /// Full key in the bucket, bucket directory included.
    pub fn object_key(&self, tier_prefix: &str, at: DateTime<Utc>) -> String {
        format!(
            "{}{}",
            self.bucket_directory,
            self.object_name(tier_prefix, at)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn request() -> TransferRequest {
        TransferRequest {
            local_path: PathBuf::from("/tmp/backup.tar"),
            destination_key: "f".into(),
            bucket: "backups".into(),
            bucket_directory: String::new(),
            deadline: Duration::seconds(3600),
            worker_count: 5,
            chunk_size_mb: 50,
            apply_naming: true,
        }
    }

    #[test]
    fn tiered_name_carries_prefix_and_timestamp() {
        let at = Utc.with_ymd_and_hms(2024, 3, 5, 10, 0, 0).unwrap();
        assert_eq!(request().object_key("daily_", at), "daily_f_20240305T100000");
    }

    #[test]
    fn verbatim_name_is_unchanged() {
        let at = Utc.with_ymd_and_hms(2024, 3, 5, 10, 0, 0).unwrap();
        let req = TransferRequest {
            apply_naming: false,
            ..request()
        };
        assert_eq!(req.object_key("daily_", at), "f");
    }

    #[test]
    fn bucket_directory_is_prepended() {
        let at = Utc.with_ymd_and_hms(2024, 3, 5, 10, 0, 0).unwrap();
        let req = TransferRequest {
            bucket_directory: "testdir/".into(),
            ..request()
        };
        assert_eq!(
            req.object_key("weekly_", at),
            "testdir/weekly_f_20240305T100000"
        );
    }

    #[rstest]
    #[case::empty_bucket(TransferRequest { bucket: String::new(), ..request() }, "bucket must be specified")]
    #[case::empty_path(TransferRequest { local_path: PathBuf::new(), ..request() }, "path to file should not be empty")]
    #[case::bad_dir(TransferRequest { bucket_directory: "badbucketdir".into(), ..request() }, "trailing slash")]
    #[case::no_workers(TransferRequest { worker_count: 0, ..request() }, "concurrent workers should not be less than 1")]
    #[case::no_chunk(TransferRequest { chunk_size_mb: 0, ..request() }, "part size")]
    #[case::huge_chunk(TransferRequest { chunk_size_mb: usize::MAX, ..request() }, "is too large")]
    #[case::negative_deadline(TransferRequest { deadline: Duration::seconds(-1), ..request() }, "timeout must not be less than 0")]
    fn rejects_invalid_fields(#[case] req: TransferRequest, #[case] expected: &str) {
        let err = req.validate_fields().unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains(expected), "got: {err}");
    }

    #[test]
    fn accepts_terminated_bucket_directory() {
        let req = TransferRequest {
            bucket_directory: "testdir/".into(),
            ..request()
        };
        assert!(req.validate_fields().is_ok());
    }

    #[test]
    fn zero_deadline_disables_timer() {
        let req = TransferRequest {
            deadline: Duration::zero(),
            ..request()
        };
        assert!(req.validate_fields().is_ok());
        assert_eq!(req.deadline_std(), None);
        assert_eq!(
            request().deadline_std(),
            Some(std::time::Duration::from_secs(3600))
        );
    }

    #[test]
    fn huge_part_size_saturates_instead_of_overflowing() {
        let req = TransferRequest {
            chunk_size_mb: usize::MAX,
            ..request()
        };
        assert_eq!(req.chunk_size_bytes(), u64::MAX);
        assert_eq!(request().chunk_size_bytes(), 50 * 1024 * 1024);
    }
}
