//! Represents multipart upload sessions and parts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// An open multipart upload session, initiated before uploading a file in parts.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct MultipartSession {
    /// Object key being uploaded.
    pub key: String,

    /// Unique upload ID issued by the store.
    pub upload_id: String,

    /// Timestamp when upload was initiated.
    pub initiated_at: DateTime<Utc>,
}

/// Acknowledgement for a single uploaded part.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct CompletedPart {
    /// Part number (1-based).
    pub part_number: i32,

    /// Size in bytes.
    pub size_bytes: i64,

    /// ETag hash for this part.
    pub etag: String,
}
