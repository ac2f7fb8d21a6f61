//! Represents an object (file) stored in a bucket of the local store.

use crate::models::{BucketEntry, ObjectInfo};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Metadata row for a single stored object. The payload lives on disk.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Object {
    /// Internal UUID for DB indexing.
    pub id: Uuid,

    /// Foreign key linking to the parent bucket.
    pub bucket_id: Uuid,

    /// Object key (path-like identifier within the bucket).
    pub key: String,

    /// Size in bytes.
    pub size_bytes: i64,

    /// MD5 checksum of the assembled payload.
    pub etag: Option<String>,

    /// Timestamp when object was last modified.
    pub last_modified: DateTime<Utc>,
}

impl Object {
    pub fn to_entry(&self) -> BucketEntry {
        BucketEntry::new(self.key.clone(), self.last_modified)
    }

    pub fn to_info(&self) -> ObjectInfo {
        ObjectInfo {
            key: self.key.clone(),
            size_bytes: self.size_bytes.max(0) as u64,
            etag: self.etag.clone(),
            last_modified: self.last_modified,
        }
    }
}
