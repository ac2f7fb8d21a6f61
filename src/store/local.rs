//! `ObjectStoreClient` backed by SQLite for metadata and local disk for
//! payloads, sharded beneath `base_path/{bucket}/{shard}/{shard}/{key}`. Multipart parts are staged under
//! `base_path/{bucket}/.multipart/{upload_id}/` until the session is completed
//! or aborted.

use super::{ObjectStoreClient, StoreError, StoreResult};
use crate::models::{
    BucketEntry, CompletedPart, MultipartSession, ObjectInfo, bucket::Bucket, object::Object,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use md5::Context;
use sqlx::{
    QueryBuilder, SqlitePool,
    sqlite::{Sqlite, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};
use std::{
    io::{self, ErrorKind, SeekFrom},
    ops::Range,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

const MAX_OBJECT_KEY_LEN: usize = 1024;
const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;
const MULTIPART_DIR: &str = ".multipart";
const SUPPORTED_REGIONS: [&str; 16] = [
    "local",
    "us-east-1",
    "us-east-2",
    "us-west-1",
    "us-west-2",
    "eu-west-1",
    "ap-southeast-1",
    "ap-northeast-1",
    "ap-south-1",
    "ap-south-2",
    "ap-southeast-2",
    "ap-southeast-3",
    "ap-southeast-4",
    "ap-northeast-2",
    "ap-northeast-3",
    "me-south-1",
];

const OBJECT_COLUMNS: &str = "id, bucket_id, key, size_bytes, etag, last_modified";

#[derive(Clone)]
pub struct LocalObjectStore {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where object payloads are stored.
    pub base_path: PathBuf,
}

impl LocalObjectStore {
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
        }
    }

    /// Open (creating if needed) the metadata database and payload directory,
    /// then apply the schema.
    pub async fn connect(database_url: &str, storage_dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let base_path = storage_dir.into();
        if !base_path.exists() {
            fs::create_dir_all(&base_path).await?;
            tracing::info!("Created storage directory at {}", base_path.display());
        }

        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        if let Some(parent) = options.get_filename().parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).await?;
                tracing::info!("Created missing directory {:?}", parent);
            }
        }
        debug!("Connecting to metadata database {}", database_url);

        let db = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        let store = Self::new(Arc::new(db), base_path);
        store.migrate().await?;
        Ok(store)
    }

    /// Open an existing store without creating or changing anything on disk.
    /// Writes through the returned store fail.
    pub async fn open_read_only(
        database_url: &str,
        storage_dir: impl Into<PathBuf>,
    ) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(false)
            .read_only(true);
        debug!("Opening metadata database {} read-only", database_url);

        let db = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Self::new(Arc::new(db), storage_dir.into()))
    }

    /// Apply the embedded schema. Every statement is idempotent.
    pub async fn migrate(&self) -> StoreResult<()> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        debug!("Running {} schema statements", statements.len());
        for stmt in statements {
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    /// Basic key validation to avoid trivial path traversal vectors.
    fn ensure_key_safe(&self, key: &str) -> StoreResult<()> {
        let invalid = || StoreError::InvalidObjectKey(key.to_string());
        if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
            return Err(invalid());
        }
        if key.starts_with('/') || key.contains("..") {
            return Err(invalid());
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(invalid());
        }
        Ok(())
    }

    /// Validate bucket name format.
    ///
    /// Enforces S3-like naming rules:
    /// - 3–63 characters
    /// - lowercase letters, digits, dots, hyphens only
    /// - cannot start/end with dot or hyphen
    /// - cannot contain consecutive dots or dot-hyphen patterns
    /// - cannot look like an IPv4 address
    fn ensure_bucket_name_safe(&self, name: &str) -> StoreResult<()> {
        let invalid = |reason: &str| -> StoreResult<()> {
            Err(StoreError::InvalidBucketName {
                name: name.to_string(),
                reason: reason.to_string(),
            })
        };

        if name.trim() != name {
            return invalid("cannot begin or end with whitespace");
        }
        let len = name.len();
        if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&len) {
            return invalid("must be between 3 and 63 characters");
        }
        if !name
            .chars()
            .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
        {
            return invalid("allowed characters are lowercase letters, digits, dots, and hyphens");
        }
        if name.starts_with(['.', '-']) || name.ends_with(['.', '-']) {
            return invalid("must start and end with a lowercase letter or digit");
        }
        if name.contains("..") || name.contains("-.") || name.contains(".-") {
            return invalid("cannot contain consecutive dots or dot-hyphen combinations");
        }
        if is_ipv4_like(name) {
            return invalid("must not be formatted like an IP address");
        }
        Ok(())
    }

    fn ensure_region_valid(&self, region: &str) -> StoreResult<()> {
        if SUPPORTED_REGIONS
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(region))
        {
            Ok(())
        } else {
            Err(StoreError::UnsupportedRegion(region.to_string()))
        }
    }

    fn bucket_root(&self, bucket_name: &str) -> PathBuf {
        self.base_path.join(bucket_name)
    }

    /// Two-level shard identifiers: the first two bytes of MD5(bucket/key).
    fn object_shards(bucket_name: &str, key: &str) -> (String, String) {
        let digest = md5::compute(format!("{}/{}", bucket_name, key));
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, bucket_name: &str, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(bucket_name, key);
        let mut path = self.bucket_root(bucket_name);
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    fn staging_dir(&self, bucket_name: &str, upload_id: &str) -> PathBuf {
        self.bucket_root(bucket_name)
            .join(MULTIPART_DIR)
            .join(upload_id)
    }

    fn part_path(&self, bucket_name: &str, upload_id: &str, part_number: i32) -> PathBuf {
        self.staging_dir(bucket_name, upload_id)
            .join(format!("{:05}.part", part_number))
    }

    async fn fetch_bucket(&self, bucket: &str) -> StoreResult<Bucket> {
        self.ensure_bucket_name_safe(bucket)?;
        sqlx::query_as::<Sqlite, Bucket>(
            "SELECT id, name, region, created_at FROM buckets WHERE name = ?",
        )
        .bind(bucket)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StoreError::BucketNotFound(bucket.to_string()),
            other => StoreError::Sqlx(other),
        })
    }

    async fn fetch_object(&self, bucket: &Bucket, key: &str) -> StoreResult<Object> {
        sqlx::query_as::<_, Object>(&format!(
            "SELECT {} FROM objects WHERE key = ? AND bucket_id = ?",
            OBJECT_COLUMNS
        ))
        .bind(key)
        .bind(bucket.id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StoreError::ObjectNotFound {
                bucket: bucket.name.clone(),
                key: key.to_string(),
            },
            other => StoreError::Sqlx(other),
        })
    }

    async fn fetch_session(&self, bucket: &Bucket, upload_id: &str) -> StoreResult<MultipartSession> {
        sqlx::query_as::<_, MultipartSession>(
            "SELECT key, upload_id, initiated_at FROM multipart_uploads
             WHERE upload_id = ? AND bucket_id = ?",
        )
        .bind(upload_id)
        .bind(bucket.id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StoreError::UploadNotFound(upload_id.to_string()),
            other => StoreError::Sqlx(other),
        })
    }

    /// Create a bucket and its directory.
    ///
    /// Returns BucketAlreadyExists if the name is taken.
    pub async fn create_bucket(&self, name: &str, region: &str) -> StoreResult<Bucket> {
        self.ensure_bucket_name_safe(name)?;
        let normalized_region = region.to_lowercase();
        self.ensure_region_valid(&normalized_region)?;
        fs::create_dir_all(self.bucket_root(name)).await?;

        let bucket = Bucket {
            id: Uuid::new_v4(),
            name: name.to_string(),
            region: normalized_region,
            created_at: Utc::now(),
        };

        match sqlx::query("INSERT INTO buckets (id, name, region, created_at) VALUES (?, ?, ?, ?)")
            .bind(bucket.id)
            .bind(&bucket.name)
            .bind(&bucket.region)
            .bind(bucket.created_at)
            .execute(&*self.db)
            .await
        {
            Ok(_) => Ok(bucket),
            Err(err) if is_unique_violation(&err) => {
                Err(StoreError::BucketAlreadyExists(name.to_string()))
            }
            Err(err) => Err(StoreError::Sqlx(err)),
        }
    }

    /// Create the bucket unless it already exists.
    pub async fn ensure_bucket(&self, name: &str, region: &str) -> StoreResult<Bucket> {
        match self.create_bucket(name, region).await {
            Err(StoreError::BucketAlreadyExists(_)) => self.fetch_bucket(name).await,
            other => other,
        }
    }

    /// Write `body` to `path` through a temp file in the same directory.
    async fn write_atomically(path: &Path, body: &[u8]) -> StoreResult<()> {
        let parent = path.parent().ok_or_else(|| {
            StoreError::Io(io::Error::new(ErrorKind::Other, "path missing parent directory"))
        })?;
        fs::create_dir_all(parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        if let Err(err) = write_synced(&tmp_path, body).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }
        if let Err(err) = fs::rename(&tmp_path, path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }
        Ok(())
    }

    /// Concatenate staged parts into `dest`, returning size and MD5 etag.
    async fn assemble_parts(
        &self,
        bucket_name: &str,
        upload_id: &str,
        parts: &[CompletedPart],
        dest: &Path,
    ) -> io::Result<(i64, String)> {
        let mut out = File::create(dest).await?;
        let mut size_bytes: i64 = 0;
        let mut digest = Context::new();
        for part in parts {
            let source = File::open(self.part_path(bucket_name, upload_id, part.part_number)).await?;
            let mut stream = ReaderStream::new(source);
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                size_bytes += chunk.len() as i64;
                digest.consume(&chunk);
                out.write_all(&chunk).await?;
            }
        }
        out.flush().await?;
        out.sync_all().await?;
        Ok((size_bytes, format!("{:x}", digest.compute())))
    }

    /// Drop the session's part rows, session row and staging directory.
    async fn discard_session(&self, bucket: &Bucket, upload_id: &str) -> StoreResult<u64> {
        sqlx::query("DELETE FROM multipart_parts WHERE upload_id = ?")
            .bind(upload_id)
            .execute(&*self.db)
            .await?;
        let result =
            sqlx::query("DELETE FROM multipart_uploads WHERE upload_id = ? AND bucket_id = ?")
                .bind(upload_id)
                .bind(bucket.id)
                .execute(&*self.db)
                .await?;

        let staging = self.staging_dir(&bucket.name, upload_id);
        if let Err(err) = fs::remove_dir_all(&staging).await {
            if err.kind() != ErrorKind::NotFound {
                debug!("failed to remove staging dir {}: {}", staging.display(), err);
            }
        }
        Ok(result.rows_affected())
    }

    /// Recursively remove empty directories up to the bucket root.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStoreClient for LocalObjectStore {
    async fn list_objects(&self, bucket: &str, prefix: &str) -> StoreResult<Vec<BucketEntry>> {
        let bucket_rec = self.fetch_bucket(bucket).await?;

        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM objects WHERE bucket_id = ",
            OBJECT_COLUMNS
        ));
        builder.push_bind(bucket_rec.id);
        if !prefix.is_empty() {
            // substr compares exactly; LIKE would treat `_` as a wildcard
            builder.push(" AND substr(key, 1, ");
            builder.push_bind(prefix.chars().count() as i64);
            builder.push(") = ");
            builder.push_bind(prefix);
        }
        builder.push(" ORDER BY key ASC");

        let rows: Vec<Object> = builder.build_query_as().fetch_all(&*self.db).await?;
        Ok(rows.iter().map(Object::to_entry).collect())
    }

    async fn head_object(&self, bucket: &str, key: &str) -> StoreResult<ObjectInfo> {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;
        Ok(self.fetch_object(&bucket_rec, key).await?.to_info())
    }

    async fn get_object_range(
        &self,
        bucket: &str,
        key: &str,
        range: Range<u64>,
    ) -> StoreResult<Bytes> {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;
        let object = self.fetch_object(&bucket_rec, key).await?;

        let file_path = self.object_path(&bucket_rec.name, key);
        let mut file = File::open(&file_path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StoreError::ObjectNotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                }
            } else {
                StoreError::Io(err)
            }
        })?;

        let len = object.size_bytes.max(0) as u64;
        let end = range.end.min(len);
        let start = range.start.min(end);
        file.seek(SeekFrom::Start(start)).await?;
        let mut buf = Vec::with_capacity((end - start) as usize);
        file.take(end - start).read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    /// Remove the metadata row and payload, then prune empty shard directories.
    async fn delete_object(&self, bucket: &str, key: &str) -> StoreResult<()> {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;

        let result = sqlx::query("DELETE FROM objects WHERE key = ? AND bucket_id = ?")
            .bind(key)
            .bind(bucket_rec.id)
            .execute(&*self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ObjectNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }

        let file_path = self.object_path(&bucket_rec.name, key);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed physical file {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", file_path.display());
            }
            Err(err) => return Err(StoreError::Io(err)),
        }

        if let Some(parent) = file_path.parent() {
            let bucket_root = self.bucket_root(&bucket_rec.name);
            self.prune_empty_dirs(parent, &bucket_root).await;
        }
        Ok(())
    }

    async fn create_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
    ) -> StoreResult<MultipartSession> {
        self.ensure_key_safe(key)?;
        let bucket_rec = self.fetch_bucket(bucket).await?;

        let session = MultipartSession {
            key: key.to_string(),
            upload_id: Uuid::new_v4().simple().to_string(),
            initiated_at: Utc::now(),
        };
        fs::create_dir_all(self.staging_dir(&bucket_rec.name, &session.upload_id)).await?;
        sqlx::query(
            "INSERT INTO multipart_uploads (upload_id, bucket_id, key, initiated_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(&session.upload_id)
        .bind(bucket_rec.id)
        .bind(&session.key)
        .bind(session.initiated_at)
        .execute(&*self.db)
        .await?;

        debug!("opened multipart upload {} for {}", session.upload_id, key);
        Ok(session)
    }

    async fn upload_part(
        &self,
        bucket: &str,
        session: &MultipartSession,
        part_number: i32,
        body: Bytes,
    ) -> StoreResult<CompletedPart> {
        if part_number < 1 {
            return Err(StoreError::InvalidPart {
                upload_id: session.upload_id.clone(),
                reason: format!("part number {} must be at least 1", part_number),
            });
        }
        let bucket_rec = self.fetch_bucket(bucket).await?;
        self.fetch_session(&bucket_rec, &session.upload_id).await?;

        let path = self.part_path(&bucket_rec.name, &session.upload_id, part_number);
        Self::write_atomically(&path, &body).await?;

        let part = CompletedPart {
            part_number,
            size_bytes: body.len() as i64,
            etag: format!("{:x}", md5::compute(&body)),
        };
        sqlx::query(
            "INSERT INTO multipart_parts (upload_id, part_number, size_bytes, etag)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(upload_id, part_number) DO UPDATE SET
                size_bytes = excluded.size_bytes,
                etag = excluded.etag",
        )
        .bind(&session.upload_id)
        .bind(part.part_number)
        .bind(part.size_bytes)
        .bind(&part.etag)
        .execute(&*self.db)
        .await?;

        Ok(part)
    }

    /// Assemble staged parts into the final object.
    ///
    /// Parts must be numbered 1..=n and match the recorded etags. The payload
    /// is written to a temp file, fsynced and renamed into place before the
    /// metadata row is upserted.
    async fn complete_multipart_upload(
        &self,
        bucket: &str,
        session: &MultipartSession,
        parts: &[CompletedPart],
    ) -> StoreResult<ObjectInfo> {
        let bucket_rec = self.fetch_bucket(bucket).await?;
        let stored = self.fetch_session(&bucket_rec, &session.upload_id).await?;
        let recorded: Vec<CompletedPart> = sqlx::query_as(
            "SELECT part_number, size_bytes, etag FROM multipart_parts
             WHERE upload_id = ? ORDER BY part_number ASC",
        )
        .bind(&session.upload_id)
        .fetch_all(&*self.db)
        .await?;

        let invalid = |reason: String| StoreError::InvalidPart {
            upload_id: session.upload_id.clone(),
            reason,
        };
        if parts.is_empty() {
            return Err(invalid("no parts supplied".into()));
        }
        for (expected, part) in (1..).zip(parts) {
            if part.part_number != expected {
                return Err(invalid(format!(
                    "expected part {}, got {}",
                    expected, part.part_number
                )));
            }
            match recorded.iter().find(|r| r.part_number == part.part_number) {
                Some(r) if r.etag == part.etag => {}
                Some(_) => return Err(invalid(format!("etag mismatch for part {}", expected))),
                None => return Err(invalid(format!("part {} was never uploaded", expected))),
            }
        }

        let file_path = self.object_path(&bucket_rec.name, &stored.key);
        let parent = file_path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StoreError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        let (size_bytes, etag) = match self
            .assemble_parts(&bucket_rec.name, &session.upload_id, parts, &tmp_path)
            .await
        {
            Ok(assembled) => assembled,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(StoreError::Io(err));
            }
        };
        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StoreError::Io(err));
        }

        let object = sqlx::query_as::<_, Object>(&format!(
            r#"
            INSERT INTO objects (id, bucket_id, key, size_bytes, etag, last_modified)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(bucket_id, key) DO UPDATE SET
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                last_modified = excluded.last_modified
            RETURNING {}
            "#,
            OBJECT_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(bucket_rec.id)
        .bind(&stored.key)
        .bind(size_bytes)
        .bind(&etag)
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await?;

        self.discard_session(&bucket_rec, &session.upload_id).await?;
        debug!(
            "completed multipart upload {} into {} ({} bytes)",
            session.upload_id, stored.key, size_bytes
        );
        Ok(object.to_info())
    }

    async fn abort_multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> StoreResult<()> {
        if !upload_id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(StoreError::UploadNotFound(upload_id.to_string()));
        }
        let bucket_rec = self.fetch_bucket(bucket).await?;
        if self.discard_session(&bucket_rec, upload_id).await? == 0 {
            return Err(StoreError::UploadNotFound(upload_id.to_string()));
        }
        debug!("aborted multipart upload {} for {}", upload_id, key);
        Ok(())
    }

    async fn list_multipart_uploads(&self, bucket: &str) -> StoreResult<Vec<MultipartSession>> {
        let bucket_rec = self.fetch_bucket(bucket).await?;
        let sessions = sqlx::query_as::<_, MultipartSession>(
            "SELECT key, upload_id, initiated_at FROM multipart_uploads
             WHERE bucket_id = ? ORDER BY initiated_at ASC, upload_id ASC",
        )
        .bind(bucket_rec.id)
        .fetch_all(&*self.db)
        .await?;
        Ok(sessions)
    }
}

async fn write_synced(path: &Path, body: &[u8]) -> io::Result<()> {
    let mut file = File::create(path).await?;
    file.write_all(body).await?;
    file.sync_all().await
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

/// Check if a string matches IPv4-like dotted decimal form.
fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() == 4
        && parts.iter().all(|segment| {
            !segment.is_empty()
                && segment.len() <= 3
                && segment.chars().all(|c| c.is_ascii_digit())
                && segment.parse::<u8>().is_ok()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store() -> (TempDir, LocalObjectStore) {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}", dir.path().join("meta/store.db").display());
        let store = LocalObjectStore::connect(&url, dir.path().join("objects"))
            .await
            .unwrap();
        store.create_bucket("backups", "local").await.unwrap();
        (dir, store)
    }

    async fn put(store: &LocalObjectStore, key: &str, parts: &[&'static [u8]]) -> ObjectInfo {
        let session = store.create_multipart_upload("backups", key).await.unwrap();
        let mut done = Vec::new();
        for (i, body) in parts.iter().enumerate() {
            done.push(
                store
                    .upload_part("backups", &session, i as i32 + 1, Bytes::from_static(*body))
                    .await
                    .unwrap(),
            );
        }
        store
            .complete_multipart_upload("backups", &session, &done)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn read_only_open_of_a_missing_store_creates_nothing() {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}", dir.path().join("meta/store.db").display());

        let result = LocalObjectStore::open_read_only(&url, dir.path().join("objects")).await;

        assert!(result.is_err());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn read_only_store_lists_but_rejects_writes() {
        let (dir, store) = store().await;
        put(&store, "daily_db_20240305T100000", &[b"x"]).await;
        let url = format!("sqlite://{}", dir.path().join("meta/store.db").display());

        let reader = LocalObjectStore::open_read_only(&url, dir.path().join("objects"))
            .await
            .unwrap();

        let listed = reader.list_objects("backups", "daily_").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(reader.delete_object("backups", "daily_db_20240305T100000").await.is_err());
        assert_eq!(store.list_objects("backups", "daily_").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn multipart_upload_assembles_payload() {
        let (_dir, store) = store().await;
        let info = put(&store, "daily_db_20240305T100000", &[b"hello ", b"world"]).await;

        assert_eq!(info.size_bytes, 11);
        assert_eq!(info.etag.as_deref(), Some(format!("{:x}", md5::compute(b"hello world")).as_str()));
        let body = store
            .get_object_range("backups", "daily_db_20240305T100000", 0..u64::MAX)
            .await
            .unwrap();
        assert_eq!(body, "hello world");
        let middle = store
            .get_object_range("backups", "daily_db_20240305T100000", 3..8)
            .await
            .unwrap();
        assert_eq!(middle, "lo wo");
        assert!(store.list_multipart_uploads("backups").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn prefix_listing_treats_underscore_literally() {
        let (_dir, store) = store().await;
        put(&store, "daily_a", &[b"a"]).await;
        put(&store, "dailyXb", &[b"b"]).await;
        put(&store, "weekly_c", &[b"c"]).await;

        let keys: Vec<_> = store
            .list_objects("backups", "daily_")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.key)
            .collect();
        assert_eq!(keys, vec!["daily_a"]);
        assert_eq!(store.list_objects("backups", "").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn abort_discards_session() {
        let (_dir, store) = store().await;
        let session = store.create_multipart_upload("backups", "k").await.unwrap();
        store
            .upload_part("backups", &session, 1, Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert_eq!(store.list_multipart_uploads("backups").await.unwrap().len(), 1);

        store
            .abort_multipart_upload("backups", "k", &session.upload_id)
            .await
            .unwrap();
        assert!(store.list_multipart_uploads("backups").await.unwrap().is_empty());
        let again = store
            .abort_multipart_upload("backups", "k", &session.upload_id)
            .await
            .unwrap_err();
        assert_eq!(again.status(), 404);
    }

    #[tokio::test]
    async fn complete_rejects_gaps() {
        let (_dir, store) = store().await;
        let session = store.create_multipart_upload("backups", "k").await.unwrap();
        let part = store
            .upload_part("backups", &session, 2, Bytes::from_static(b"x"))
            .await
            .unwrap();
        let err = store
            .complete_multipart_upload("backups", &session, &[part])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidPart { .. }));
    }

    #[tokio::test]
    async fn delete_removes_row_and_payload() {
        let (dir, store) = store().await;
        put(&store, "dir/k", &[b"x"]).await;
        store.delete_object("backups", "dir/k").await.unwrap();

        assert!(store.list_objects("backups", "").await.unwrap().is_empty());
        let err = store.delete_object("backups", "dir/k").await.unwrap_err();
        assert_eq!(err.status(), 404);
        let shard_a = LocalObjectStore::object_shards("backups", "dir/k").0;
        assert!(!dir.path().join("objects/backups").join(shard_a).exists());
    }

    #[tokio::test]
    async fn rejects_bad_bucket_names_and_regions() {
        let (_dir, store) = store().await;
        let err = store.list_objects("badbucket*?", "").await.unwrap_err();
        assert_eq!(err.status(), 400);
        assert!(matches!(
            store.create_bucket("192.168.1.1", "local").await,
            Err(StoreError::InvalidBucketName { .. })
        ));
        assert!(matches!(
            store.create_bucket("valid-name", "mars-1").await,
            Err(StoreError::UnsupportedRegion(_))
        ));
        assert!(matches!(
            store.create_bucket("backups", "local").await,
            Err(StoreError::BucketAlreadyExists(_))
        ));
        assert!(store.ensure_bucket("backups", "local").await.is_ok());
    }

    #[tokio::test]
    async fn rejects_traversal_keys() {
        let (_dir, store) = store().await;
        let err = store
            .create_multipart_upload("backups", "../escape")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidObjectKey(_)));
    }
}
