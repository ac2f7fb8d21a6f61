//! Chunked, deadline-bounded transfers between local files and the store.
//!
//! A file is split into fixed-size chunks which a fixed pool of workers pulls
//! from a shared queue. Results flow back over a channel to a single
//! aggregator that tracks progress and stops the pool on the first fatal
//! error. One deadline covers the whole transfer; when it fires, outstanding
//! work is cancelled and an open multipart session gets exactly one abort
//! attempt.

use crate::{
    errors::TransferError,
    models::{CompletedPart, MultipartSession, TransferRequest},
    store::{ObjectStoreClient, StoreResult},
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::{
    collections::VecDeque,
    future::Future,
    io::{self, SeekFrom},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    sync::mpsc,
    task::JoinSet,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Attempts per chunk before a retryable store error becomes fatal.
pub const MAX_CHUNK_ATTEMPTS: u32 = 3;
/// Multipart sessions accept at most this many parts.
pub const MAX_PARTS: u64 = 10_000;

const RETRY_BACKOFF: Duration = Duration::from_millis(200);
/// Upper bound on the best-effort abort issued after a failure.
const ABORT_GRACE: Duration = Duration::from_secs(30);

/// A byte range of the file, transferred as one part.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// 1-based, as multipart sessions number parts.
    pub part_number: i32,
    pub offset: u64,
    pub len: u64,
}

/// Split `size` bytes into chunks of `chunk_size`. An empty file still
/// yields a single empty chunk so the session has a part to complete with.
pub fn plan_chunks(size: u64, chunk_size: u64) -> Vec<Chunk> {
    let chunk_size = chunk_size.max(1);
    if size == 0 {
        return vec![Chunk {
            part_number: 1,
            offset: 0,
            len: 0,
        }];
    }
    (0..size.div_ceil(chunk_size))
        .map(|index| {
            let offset = index * chunk_size;
            Chunk {
                part_number: index as i32 + 1,
                offset,
                len: chunk_size.min(size - offset),
            }
        })
        .collect()
}

/// Coarse progress over acknowledged chunks, logged at each 10% step.
struct Progress<'a> {
    key: &'a str,
    total: usize,
    acknowledged: usize,
    last_decile: usize,
}

impl<'a> Progress<'a> {
    fn new(key: &'a str, total: usize) -> Self {
        Self {
            key,
            total,
            acknowledged: 0,
            last_decile: 0,
        }
    }

    fn acknowledge(&mut self) {
        self.acknowledged += 1;
        let decile = self.acknowledged * 10 / self.total.max(1);
        if decile > self.last_decile {
            self.last_decile = decile;
            info!(
                key = self.key,
                "transfer {}% ({}/{} chunks)",
                decile * 10,
                self.acknowledged,
                self.total
            );
        }
    }
}

/// Await `fut`, giving up at `deadline` when one is set.
async fn within<T>(deadline: Option<Instant>, fut: impl Future<Output = T>) -> Option<T> {
    match deadline {
        Some(at) => tokio::time::timeout_at(at, fut).await.ok(),
        None => Some(fut.await),
    }
}

/// Run `call` until it succeeds, fails permanently, or runs out of attempts.
async fn with_retries<T, F, Fut>(what: &str, part_number: i32, mut call: F) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < MAX_CHUNK_ATTEMPTS => {
                warn!(part_number, attempt, "{} failed, retrying: {}", what, err);
                tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

fn relock_queue(
    queue: &Mutex<VecDeque<Chunk>>,
) -> std::sync::MutexGuard<'_, VecDeque<Chunk>> {
    queue.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drive `job` over every chunk with `worker_count` concurrent workers.
///
/// Returns the per-chunk results in completion order, or the first error. On
/// error the token is cancelled and the remaining workers are dropped.
async fn run_chunks<T, F, Fut>(
    key: &str,
    chunks: Vec<Chunk>,
    worker_count: usize,
    token: CancellationToken,
    job: F,
) -> Result<Vec<T>, TransferError>
where
    T: Send + 'static,
    F: Fn(Chunk) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, TransferError>> + Send + 'static,
{
    let total = chunks.len();
    let queue = Arc::new(Mutex::new(VecDeque::from(chunks)));
    let job = Arc::new(job);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let mut workers = JoinSet::new();
    for worker in 0..worker_count.min(total) {
        let queue = queue.clone();
        let job = job.clone();
        let tx = tx.clone();
        let token = token.clone();
        workers.spawn(async move {
            loop {
                let Some(chunk) = relock_queue(&queue).pop_front() else {
                    break;
                };
                let result = tokio::select! {
                    _ = token.cancelled() => break,
                    result = job(chunk) => result,
                };
                debug!(worker, part_number = chunk.part_number, ok = result.is_ok(), "chunk finished");
                let failed = result.is_err();
                if tx.send(result).is_err() || failed {
                    break;
                }
            }
        });
    }
    drop(tx);

    let mut progress = Progress::new(key, total);
    let mut results = Vec::with_capacity(total);
    while let Some(result) = rx.recv().await {
        match result {
            Ok(value) => {
                results.push(value);
                progress.acknowledge();
            }
            Err(err) => {
                token.cancel();
                return Err(err);
            }
        }
    }

    while let Some(joined) = workers.join_next().await {
        if let Err(err) = joined {
            token.cancel();
            return Err(TransferError::Io {
                path: PathBuf::from(key),
                source: io::Error::other(format!("transfer worker failed: {}", err)),
            });
        }
    }
    Ok(results)
}

async fn read_chunk(path: &Path, chunk: Chunk) -> io::Result<Bytes> {
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(chunk.offset)).await?;
    let mut buf = vec![0u8; chunk.len as usize];
    file.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

async fn write_chunk(path: &Path, offset: u64, body: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(body).await?;
    file.flush().await
}

async fn upload_chunk(
    store: Arc<dyn ObjectStoreClient>,
    bucket: String,
    session: Arc<MultipartSession>,
    path: Arc<PathBuf>,
    chunk: Chunk,
) -> Result<CompletedPart, TransferError> {
    let body = read_chunk(&path, chunk)
        .await
        .map_err(|source| TransferError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    with_retries("upload part", chunk.part_number, || {
        store.upload_part(&bucket, &session, chunk.part_number, body.clone())
    })
    .await
    .map_err(|err| TransferError::store("upload part", &bucket, &session.key, err))
}

/// Fetch one range and write it at its offset. Returns the bytes written.
async fn download_chunk(
    store: Arc<dyn ObjectStoreClient>,
    bucket: String,
    key: String,
    path: Arc<PathBuf>,
    chunk: Chunk,
) -> Result<u64, TransferError> {
    let range = chunk.offset..chunk.offset + chunk.len;
    let body = with_retries("get object range", chunk.part_number, || {
        store.get_object_range(&bucket, &key, range.clone())
    })
    .await
    .map_err(|err| TransferError::store("get object range", &bucket, &key, err))?;
    write_chunk(&path, chunk.offset, &body)
        .await
        .map_err(|source| TransferError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(body.len() as u64)
}

/// Size of the upload source, which must be a readable regular file.
async fn inspect_source(path: &Path) -> Result<u64, TransferError> {
    let unreadable = |reason: String| TransferError::validation("local_path", reason);
    let meta = fs::metadata(path)
        .await
        .map_err(|err| unreadable(format!("cannot access `{}`: {}", path.display(), err)))?;
    if !meta.is_file() {
        return Err(unreadable(format!("`{}` is not a regular file", path.display())));
    }
    File::open(path)
        .await
        .map_err(|err| unreadable(format!("cannot read `{}`: {}", path.display(), err)))?;
    Ok(meta.len())
}

fn check_part_count(size: u64, chunk_size: u64) -> Result<(), TransferError> {
    let parts = size.div_ceil(chunk_size.max(1));
    if parts > MAX_PARTS {
        return Err(TransferError::validation(
            "chunk_size_mb",
            format!(
                "a {} byte file needs {} parts, more than the {} a session accepts",
                size, parts, MAX_PARTS
            ),
        ));
    }
    Ok(())
}

/// Moves single files between local disk and the store.
#[derive(Clone)]
pub struct TransferPipeline {
    store: Arc<dyn ObjectStoreClient>,
}

impl TransferPipeline {
    pub fn new(store: Arc<dyn ObjectStoreClient>) -> Self {
        Self { store }
    }

    /// Upload `request.local_path`, returning the key it was stored under.
    ///
    /// With `dry_run` the request is validated and named but the store is
    /// never called.
    pub async fn upload(
        &self,
        request: &TransferRequest,
        tier_prefix: &str,
        at: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<String, TransferError> {
        request.validate_fields()?;
        let size = inspect_source(&request.local_path).await?;
        let chunk_size = request.chunk_size_bytes();
        check_part_count(size, chunk_size)?;
        let key = request.object_key(tier_prefix, at);

        if dry_run {
            info!(
                bucket = %request.bucket,
                key = %key,
                size,
                "dry run: skipping upload"
            );
            return Ok(key);
        }

        let deadline = request.deadline_std();
        let deadline_at = deadline.and_then(|d| Instant::now().checked_add(d));
        let bucket = request.bucket.as_str();
        let expired = || TransferError::DeadlineExceeded {
            bucket: bucket.to_string(),
            key: key.clone(),
            deadline: deadline.unwrap_or_default(),
        };

        info!(
            bucket,
            key = %key,
            size,
            workers = request.worker_count,
            chunk_size,
            "starting upload"
        );

        let session = match within(deadline_at, self.store.create_multipart_upload(bucket, &key)).await {
            None => return Err(expired()),
            Some(Err(err)) => {
                return Err(TransferError::store("create multipart upload", bucket, &key, err));
            }
            Some(Ok(session)) => session,
        };

        let token = CancellationToken::new();
        let parts = match within(
            deadline_at,
            self.send_parts(request, &session, plan_chunks(size, chunk_size), token.clone()),
        )
        .await
        {
            None => {
                token.cancel();
                self.abort(bucket, &session).await;
                return Err(expired());
            }
            Some(Err(err)) => {
                self.abort(bucket, &session).await;
                return Err(err);
            }
            Some(Ok(parts)) => parts,
        };

        match within(
            deadline_at,
            self.store.complete_multipart_upload(bucket, &session, &parts),
        )
        .await
        {
            None => {
                self.abort(bucket, &session).await;
                Err(expired())
            }
            Some(Err(err)) => {
                self.abort(bucket, &session).await;
                Err(TransferError::store("complete multipart upload", bucket, &key, err))
            }
            Some(Ok(object)) => {
                info!(
                    bucket,
                    key = %key,
                    size = object.size_bytes,
                    etag = object.etag.as_deref().unwrap_or(""),
                    "upload complete"
                );
                Ok(key)
            }
        }
    }

    async fn send_parts(
        &self,
        request: &TransferRequest,
        session: &MultipartSession,
        chunks: Vec<Chunk>,
        token: CancellationToken,
    ) -> Result<Vec<CompletedPart>, TransferError> {
        let key = session.key.clone();
        let store = self.store.clone();
        let bucket = request.bucket.clone();
        let path = Arc::new(request.local_path.clone());
        let session = Arc::new(session.clone());

        let job = move |chunk: Chunk| {
            upload_chunk(store.clone(), bucket.clone(), session.clone(), path.clone(), chunk)
        };

        let mut parts = run_chunks(&key, chunks, request.worker_count, token, job).await?;
        parts.sort_by_key(|part| part.part_number);
        Ok(parts)
    }

    /// Single best-effort abort. Failure is logged, never retried; abandoned
    /// sessions are left to `cleanup` or store-side expiry.
    async fn abort(&self, bucket: &str, session: &MultipartSession) {
        let call = self
            .store
            .abort_multipart_upload(bucket, &session.key, &session.upload_id);
        match tokio::time::timeout(ABORT_GRACE, call).await {
            Ok(Ok(())) => info!(
                bucket,
                key = %session.key,
                upload_id = %session.upload_id,
                "aborted multipart upload"
            ),
            Ok(Err(err)) => warn!(
                bucket,
                key = %session.key,
                upload_id = %session.upload_id,
                "failed to abort multipart upload: {}",
                err
            ),
            Err(_) => warn!(
                bucket,
                key = %session.key,
                upload_id = %session.upload_id,
                "abort of multipart upload timed out"
            ),
        }
    }

    /// Download the object named by the request into `request.local_path`,
    /// returning its size. A partial file is left behind on failure.
    pub async fn download(&self, request: &TransferRequest) -> Result<u64, TransferError> {
        request.validate_fields()?;
        match fs::metadata(&request.local_path).await {
            Ok(meta) if meta.is_dir() => {
                return Err(TransferError::validation(
                    "local_path",
                    format!("`{}` is a directory", request.local_path.display()),
                ));
            }
            // Missing or unreadable paths surface when the file is created.
            _ => {}
        }

        let key = request.verbatim_key();
        let bucket = request.bucket.as_str();
        let deadline = request.deadline_std();
        let deadline_at = deadline.and_then(|d| Instant::now().checked_add(d));
        let expired = || TransferError::DeadlineExceeded {
            bucket: bucket.to_string(),
            key: key.clone(),
            deadline: deadline.unwrap_or_default(),
        };

        let object = match within(deadline_at, self.store.head_object(bucket, &key)).await {
            None => return Err(expired()),
            Some(Err(err)) => return Err(TransferError::store("head object", bucket, &key, err)),
            Some(Ok(object)) => object,
        };

        let local_io = |source: io::Error| TransferError::Io {
            path: request.local_path.clone(),
            source,
        };
        let file = File::create(&request.local_path).await.map_err(local_io)?;
        file.set_len(object.size_bytes).await.map_err(local_io)?;
        drop(file);

        info!(
            bucket,
            key = %key,
            size = object.size_bytes,
            destination = %request.local_path.display(),
            "starting download"
        );

        let chunks = plan_chunks(object.size_bytes, request.chunk_size_bytes());
        let store = self.store.clone();
        let job_bucket = request.bucket.clone();
        let job_key = key.clone();
        let path = Arc::new(request.local_path.clone());
        let job = move |chunk: Chunk| {
            download_chunk(store.clone(), job_bucket.clone(), job_key.clone(), path.clone(), chunk)
        };

        let token = CancellationToken::new();
        match within(
            deadline_at,
            run_chunks(&key, chunks, request.worker_count, token.clone(), job),
        )
        .await
        {
            None => {
                token.cancel();
                Err(expired())
            }
            Some(Err(err)) => Err(err),
            Some(Ok(written)) => {
                let total: u64 = written.iter().sum();
                info!(bucket, key = %key, bytes = total, "download complete");
                Ok(total)
            }
        }
    }
}
