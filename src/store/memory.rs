//! In-memory object store with operation tracing and fault injection.
//!
//! Every call is recorded so tests can assert on call counts. Object
//! timestamps come from a logical clock that advances one second per
//! completed write, which keeps newest-first ordering deterministic.

use super::{ObjectStoreClient, StoreError, StoreResult};
use crate::models::{BucketEntry, CompletedPart, MultipartSession, ObjectInfo};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    ops::Range,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

/// Record of a store call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    List { bucket: String, prefix: String },
    Head { bucket: String, key: String },
    GetRange { bucket: String, key: String, start: u64, end: u64 },
    Delete { bucket: String, key: String },
    CreateMultipart { bucket: String, key: String },
    UploadPart { bucket: String, key: String, part_number: i32 },
    CompleteMultipart { bucket: String, key: String },
    AbortMultipart { bucket: String, key: String, upload_id: String },
    ListMultipart { bucket: String },
}

impl StoreOp {
    /// Whether the call can change store contents.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            StoreOp::Delete { .. }
                | StoreOp::CreateMultipart { .. }
                | StoreOp::UploadPart { .. }
                | StoreOp::CompleteMultipart { .. }
                | StoreOp::AbortMultipart { .. }
        )
    }
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    last_modified: DateTime<Utc>,
}

#[derive(Debug)]
struct OpenSession {
    bucket: String,
    session: MultipartSession,
    parts: BTreeMap<i32, Bytes>,
}

#[derive(Debug)]
struct State {
    buckets: HashMap<String, BTreeMap<String, StoredObject>>,
    sessions: HashMap<String, OpenSession>,
    clock: DateTime<Utc>,
    next_upload: u64,
    operations: Vec<StoreOp>,
}

#[derive(Debug, Default)]
struct Faults {
    stall_parts: bool,
    fail_parts: bool,
    transient_part_failures: usize,
    failing_deletes: HashSet<String>,
    denied_buckets: HashSet<String>,
}

#[derive(Debug, Clone)]
pub struct InMemoryObjectStore {
    state: Arc<Mutex<State>>,
    faults: Arc<Mutex<Faults>>,
}

fn relock<'a, T>(
    result: Result<MutexGuard<'a, T>, PoisonError<MutexGuard<'a, T>>>,
) -> MutexGuard<'a, T> {
    result.unwrap_or_else(PoisonError::into_inner)
}

impl Default for InMemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryObjectStore {
    /// Empty store whose logical clock starts at 2024-01-01T00:00:00Z.
    pub fn new() -> Self {
        Self::starting_at(Utc.timestamp_opt(1_704_067_200, 0).single().unwrap_or_default())
    }

    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                buckets: HashMap::new(),
                sessions: HashMap::new(),
                clock: start,
                next_upload: 1,
                operations: Vec::new(),
            })),
            faults: Arc::new(Mutex::new(Faults::default())),
        }
    }

    /// Store with a single empty bucket.
    pub fn with_bucket(bucket: &str) -> Self {
        let store = Self::new();
        store.create_bucket(bucket);
        store
    }

    pub fn create_bucket(&self, bucket: &str) {
        relock(self.state.lock())
            .buckets
            .entry(bucket.to_string())
            .or_default();
    }

    /// Seed an object with an explicit modification time. Not recorded.
    pub fn insert_object(
        &self,
        bucket: &str,
        key: &str,
        data: impl Into<Bytes>,
        last_modified: DateTime<Utc>,
    ) {
        relock(self.state.lock())
            .buckets
            .entry(bucket.to_string())
            .or_default()
            .insert(
                key.to_string(),
                StoredObject {
                    data: data.into(),
                    last_modified,
                },
            );
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<Bytes> {
        relock(self.state.lock())
            .buckets
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .map(|obj| obj.data.clone())
    }

    /// Keys in a bucket, lexically ordered.
    pub fn keys(&self, bucket: &str) -> Vec<String> {
        relock(self.state.lock())
            .buckets
            .get(bucket)
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn open_sessions(&self) -> usize {
        relock(self.state.lock()).sessions.len()
    }

    pub fn operations(&self) -> Vec<StoreOp> {
        relock(self.state.lock()).operations.clone()
    }

    pub fn count_operations(&self, pred: impl Fn(&StoreOp) -> bool) -> usize {
        relock(self.state.lock())
            .operations
            .iter()
            .filter(|op| pred(op))
            .count()
    }

    pub fn now(&self) -> DateTime<Utc> {
        relock(self.state.lock()).clock
    }

    /// Part uploads never return.
    pub fn stall_part_uploads(&self) {
        relock(self.faults.lock()).stall_parts = true;
    }

    /// Part uploads fail with a non-retryable error.
    pub fn fail_part_uploads(&self) {
        relock(self.faults.lock()).fail_parts = true;
    }

    /// The next `n` part uploads fail with a retryable error.
    pub fn fail_next_part_uploads(&self, n: usize) {
        relock(self.faults.lock()).transient_part_failures = n;
    }

    pub fn fail_delete_of(&self, key: &str) {
        relock(self.faults.lock())
            .failing_deletes
            .insert(key.to_string());
    }

    /// Every call against `bucket` is rejected with a permission error.
    pub fn deny_bucket(&self, bucket: &str) {
        relock(self.faults.lock())
            .denied_buckets
            .insert(bucket.to_string());
    }

    /// Record `op` and check the bucket is reachable.
    fn enter(&self, bucket: &str, op: StoreOp) -> StoreResult<()> {
        let mut state = relock(self.state.lock());
        state.operations.push(op);
        if relock(self.faults.lock()).denied_buckets.contains(bucket) {
            return Err(StoreError::PermissionDenied(bucket.to_string()));
        }
        if !state.buckets.contains_key(bucket) {
            return Err(StoreError::BucketNotFound(bucket.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStoreClient for InMemoryObjectStore {
    async fn list_objects(&self, bucket: &str, prefix: &str) -> StoreResult<Vec<BucketEntry>> {
        self.enter(
            bucket,
            StoreOp::List {
                bucket: bucket.to_string(),
                prefix: prefix.to_string(),
            },
        )?;
        let state = relock(self.state.lock());
        Ok(state
            .buckets
            .get(bucket)
            .map(|objects| {
                objects
                    .iter()
                    .filter(|(key, _)| key.starts_with(prefix))
                    .map(|(key, obj)| BucketEntry::new(key.clone(), obj.last_modified))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn head_object(&self, bucket: &str, key: &str) -> StoreResult<ObjectInfo> {
        self.enter(
            bucket,
            StoreOp::Head {
                bucket: bucket.to_string(),
                key: key.to_string(),
            },
        )?;
        let state = relock(self.state.lock());
        state
            .buckets
            .get(bucket)
            .and_then(|objects| objects.get(key))
            .map(|obj| ObjectInfo {
                key: key.to_string(),
                size_bytes: obj.data.len() as u64,
                etag: Some(format!("{:x}", md5::compute(&obj.data))),
                last_modified: obj.last_modified,
            })
            .ok_or_else(|| StoreError::ObjectNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }

    async fn get_object_range(
        &self,
        bucket: &str,
        key: &str,
        range: Range<u64>,
    ) -> StoreResult<Bytes> {
        self.enter(
            bucket,
            StoreOp::GetRange {
                bucket: bucket.to_string(),
                key: key.to_string(),
                start: range.start,
                end: range.end,
            },
        )?;
        let data = self.object(bucket, key).ok_or_else(|| StoreError::ObjectNotFound {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })?;
        let len = data.len() as u64;
        let end = range.end.min(len);
        let start = range.start.min(end);
        Ok(data.slice(start as usize..end as usize))
    }

    async fn delete_object(&self, bucket: &str, key: &str) -> StoreResult<()> {
        self.enter(
            bucket,
            StoreOp::Delete {
                bucket: bucket.to_string(),
                key: key.to_string(),
            },
        )?;
        if relock(self.faults.lock()).failing_deletes.contains(key) {
            return Err(StoreError::Unavailable(format!("delete of `{}` refused", key)));
        }
        let mut state = relock(self.state.lock());
        if let Some(objects) = state.buckets.get_mut(bucket) {
            objects.remove(key);
        }
        Ok(())
    }

    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
    ) -> StoreResult<MultipartSession> {
        self.enter(
            bucket,
            StoreOp::CreateMultipart {
                bucket: bucket.to_string(),
                key: key.to_string(),
            },
        )?;
        let mut state = relock(self.state.lock());
        let upload_id = format!("upload-{}", state.next_upload);
        state.next_upload += 1;
        let session = MultipartSession {
            key: key.to_string(),
            upload_id: upload_id.clone(),
            initiated_at: state.clock,
        };
        state.sessions.insert(
            upload_id,
            OpenSession {
                bucket: bucket.to_string(),
                session: session.clone(),
                parts: BTreeMap::new(),
            },
        );
        Ok(session)
    }

    async fn upload_part(
        &self,
        bucket: &str,
        session: &MultipartSession,
        part_number: i32,
        body: Bytes,
    ) -> StoreResult<CompletedPart> {
        self.enter(
            bucket,
            StoreOp::UploadPart {
                bucket: bucket.to_string(),
                key: session.key.clone(),
                part_number,
            },
        )?;

        let stall = {
            let mut faults = relock(self.faults.lock());
            if faults.fail_parts {
                return Err(StoreError::PermissionDenied(bucket.to_string()));
            }
            if faults.transient_part_failures > 0 {
                faults.transient_part_failures -= 1;
                return Err(StoreError::Unavailable(format!(
                    "part {} of `{}` dropped",
                    part_number, session.key
                )));
            }
            faults.stall_parts
        };
        if stall {
            std::future::pending::<()>().await;
        }

        let mut state = relock(self.state.lock());
        let open = state
            .sessions
            .get_mut(&session.upload_id)
            .ok_or_else(|| StoreError::UploadNotFound(session.upload_id.clone()))?;
        let part = CompletedPart {
            part_number,
            size_bytes: body.len() as i64,
            etag: format!("{:x}", md5::compute(&body)),
        };
        open.parts.insert(part_number, body);
        Ok(part)
    }

    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        session: &MultipartSession,
        parts: &[CompletedPart],
    ) -> StoreResult<ObjectInfo> {
        self.enter(
            bucket,
            StoreOp::CompleteMultipart {
                bucket: bucket.to_string(),
                key: session.key.clone(),
            },
        )?;
        let mut state = relock(self.state.lock());
        let open = state
            .sessions
            .remove(&session.upload_id)
            .ok_or_else(|| StoreError::UploadNotFound(session.upload_id.clone()))?;

        let mut assembled = BytesMut::new();
        for (expected, part) in (1..).zip(parts) {
            if part.part_number != expected {
                return Err(StoreError::InvalidPart {
                    upload_id: session.upload_id.clone(),
                    reason: format!("expected part {}, got {}", expected, part.part_number),
                });
            }
            let body = open.parts.get(&part.part_number).ok_or_else(|| StoreError::InvalidPart {
                upload_id: session.upload_id.clone(),
                reason: format!("part {} was never uploaded", part.part_number),
            })?;
            assembled.extend_from_slice(body);
        }

        state.clock += Duration::seconds(1);
        let last_modified = state.clock;
        let data = assembled.freeze();
        let info = ObjectInfo {
            key: open.session.key.clone(),
            size_bytes: data.len() as u64,
            etag: Some(format!("{:x}", md5::compute(&data))),
            last_modified,
        };
        state
            .buckets
            .entry(open.bucket)
            .or_default()
            .insert(open.session.key, StoredObject { data, last_modified });
        Ok(info)
    }

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> StoreResult<()> {
        self.enter(
            bucket,
            StoreOp::AbortMultipart {
                bucket: bucket.to_string(),
                key: key.to_string(),
                upload_id: upload_id.to_string(),
            },
        )?;
        relock(self.state.lock())
            .sessions
            .remove(upload_id)
            .map(|_| ())
            .ok_or_else(|| StoreError::UploadNotFound(upload_id.to_string()))
    }

    async fn list_multipart_uploads(&self, bucket: &str) -> StoreResult<Vec<MultipartSession>> {
        self.enter(
            bucket,
            StoreOp::ListMultipart {
                bucket: bucket.to_string(),
            },
        )?;
        let state = relock(self.state.lock());
        let mut sessions: Vec<_> = state
            .sessions
            .values()
            .filter(|open| open.bucket == bucket)
            .map(|open| open.session.clone())
            .collect();
        sessions.sort_by(|a, b| a.upload_id.cmp(&b.upload_id));
        Ok(sessions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn multipart_round_trip_assembles_parts_in_order() {
        let store = InMemoryObjectStore::with_bucket("backups");
        let session = store.create_multipart_upload("backups", "k").await.unwrap();
        let p2 = store
            .upload_part("backups", &session, 2, Bytes::from_static(b"world"))
            .await
            .unwrap();
        let p1 = store
            .upload_part("backups", &session, 1, Bytes::from_static(b"hello "))
            .await
            .unwrap();
        let info = store
            .complete_multipart_upload("backups", &session, &[p1, p2])
            .await
            .unwrap();

        assert_eq!(info.size_bytes, 11);
        assert_eq!(store.object("backups", "k").unwrap(), "hello world");
        assert_eq!(store.open_sessions(), 0);
    }

    #[tokio::test]
    async fn completed_writes_advance_the_clock() {
        let store = InMemoryObjectStore::with_bucket("backups");
        let start = store.now();
        for key in ["a", "b"] {
            let session = store.create_multipart_upload("backups", key).await.unwrap();
            let part = store
                .upload_part("backups", &session, 1, Bytes::from_static(b"x"))
                .await
                .unwrap();
            store
                .complete_multipart_upload("backups", &session, &[part])
                .await
                .unwrap();
        }
        let entries = store.list_objects("backups", "").await.unwrap();
        assert_eq!(entries[0].last_modified, start + Duration::seconds(1));
        assert_eq!(entries[1].last_modified, start + Duration::seconds(2));
    }

    #[tokio::test]
    async fn missing_bucket_and_denied_bucket_are_distinct() {
        let store = InMemoryObjectStore::with_bucket("backups");
        let missing = store.list_objects("nope", "").await.unwrap_err();
        assert_eq!(missing.status(), 404);

        store.deny_bucket("backups");
        let denied = store.list_objects("backups", "").await.unwrap_err();
        assert_eq!(denied.status(), 403);
        assert_eq!(store.count_operations(|op| matches!(op, StoreOp::List { .. })), 2);
    }

    #[tokio::test]
    async fn range_reads_clamp_to_length() {
        let store = InMemoryObjectStore::with_bucket("backups");
        store.insert_object("backups", "k", "abcdef", store.now());
        let tail = store.get_object_range("backups", "k", 4..100).await.unwrap();
        assert_eq!(tail, "ef");
    }
}
