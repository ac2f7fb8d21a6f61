//! Object store port used by the rotation engine and the transfer pipeline.
//!
//! Implementations are bucket-scoped and stateless per call, so a single
//! `Arc<dyn ObjectStoreClient>` is shared by every worker and workflow in a
//! run. Chunked put/get are built on top of these primitives by
//! `TransferPipeline`.

use crate::models::{BucketEntry, CompletedPart, MultipartSession, ObjectInfo};
use async_trait::async_trait;
use bytes::Bytes;
use std::{io, ops::Range};
use thiserror::Error;

pub mod local;
pub mod memory;

pub use local::LocalObjectStore;
pub use memory::InMemoryObjectStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("bucket `{0}` not found")]
    BucketNotFound(String),
    #[error("bucket `{0}` already exists")]
    BucketAlreadyExists(String),
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("region `{0}` is not supported")]
    UnsupportedRegion(String),
    #[error("object `{key}` not found in bucket `{bucket}`")]
    ObjectNotFound { bucket: String, key: String },
    #[error("invalid object key `{0}`")]
    InvalidObjectKey(String),
    #[error("multipart upload `{0}` not found")]
    UploadNotFound(String),
    #[error("multipart upload `{upload_id}` rejected: {reason}")]
    InvalidPart { upload_id: String, reason: String },
    #[error("access to bucket `{0}` denied")]
    PermissionDenied(String),
    #[error("store temporarily unavailable: {0}")]
    Unavailable(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl StoreError {
    /// HTTP-style status signal for the failure.
    pub fn status(&self) -> u16 {
        match self {
            StoreError::InvalidBucketName { .. }
            | StoreError::UnsupportedRegion(_)
            | StoreError::InvalidObjectKey(_)
            | StoreError::InvalidPart { .. } => 400,
            StoreError::PermissionDenied(_) => 403,
            StoreError::BucketNotFound(_)
            | StoreError::ObjectNotFound { .. }
            | StoreError::UploadNotFound(_) => 404,
            StoreError::BucketAlreadyExists(_) => 409,
            StoreError::Unavailable(_) => 503,
            StoreError::Sqlx(_) | StoreError::Io(_) => 500,
        }
    }

    /// Whether repeating the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Unavailable(_) => true,
            StoreError::Sqlx(sqlx::Error::PoolTimedOut) => true,
            StoreError::Sqlx(sqlx::Error::Database(db_err)) => {
                let message = db_err.message().to_ascii_lowercase();
                message.contains("locked") || message.contains("busy")
            }
            StoreError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait ObjectStoreClient: Send + Sync {
    /// List every object whose key starts with `prefix` (all objects when empty).
    async fn list_objects(&self, bucket: &str, prefix: &str) -> StoreResult<Vec<BucketEntry>>;

    async fn head_object(&self, bucket: &str, key: &str) -> StoreResult<ObjectInfo>;

    /// Read `range` of an object. The end is clamped to the object length.
    async fn get_object_range(&self, bucket: &str, key: &str, range: Range<u64>)
    -> StoreResult<Bytes>;

    async fn delete_object(&self, bucket: &str, key: &str) -> StoreResult<()>;

    async fn create_multipart_upload(&self, bucket: &str, key: &str)
    -> StoreResult<MultipartSession>;

    /// Store one part. Re-sending a part number replaces the earlier payload.
    async fn upload_part(
        &self,
        bucket: &str,
        session: &MultipartSession,
        part_number: i32,
        body: Bytes,
    ) -> StoreResult<CompletedPart>;

    /// Assemble the parts, numbered contiguously from 1, into the final object.
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        session: &MultipartSession,
        parts: &[CompletedPart],
    ) -> StoreResult<ObjectInfo>;

    async fn abort_multipart_upload(&self, bucket: &str, key: &str, upload_id: &str)
    -> StoreResult<()>;

    async fn list_multipart_uploads(&self, bucket: &str) -> StoreResult<Vec<MultipartSession>>;
}
