//! The content-addressed store.
//!
//! The filesystem is the index: every lookup stats the content path (then
//! the link sidecar), and a process restart is a no-op. Writers install
//! through a temp file on the same filesystem followed by a rename, with
//! an existence re-check just before the rename so that concurrent
//! installers of the same content converge on a single final file.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio_util::io::ReaderStream;
use url::Url;

use kachery_core::manifest::ManifestBuilder;
use kachery_core::{DataStream, Error, FileKey, Result, Sha1Hash, Sha1Hasher};

use crate::link::{LinkFile, LinkStat, MTIME_TOLERANCE_MS, stat_ms};
use crate::paths;

/// Stream-of-bytes type used at every transport seam.
pub type ByteStream = Box<dyn Stream<Item = io::Result<Bytes>> + Send + Unpin + 'static>;

/// How long to wait for a freshly renamed file to stat at its expected
/// size (buffered-write races on networked filesystems).
const INSTALL_STAT_DEADLINE: Duration = Duration::from_secs(10);

const INSTALL_STAT_INTERVAL: Duration = Duration::from_millis(100);

/// A successful local resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundFile {
    pub size: u64,

    /// Path of the direct or linked content. `None` for chunk keys, whose
    /// bytes must be read through [`KacheryStorageManager::get_read_stream`].
    pub local_path: Option<PathBuf>,
}

/// Result of a streaming ingest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    pub sha1: Sha1Hash,

    /// Present when the content spans more than one chunk; the manifest
    /// file itself is installed in the store.
    pub manifest_sha1: Option<Sha1Hash>,

    pub size: u64,
}

#[derive(Clone)]
pub struct KacheryStorageManager {
    storage_dir: PathBuf,
    http_client: reqwest::Client,
    stored_tx: broadcast::Sender<Sha1Hash>,
    /// Serializes installs within this process, so concurrent ingests of
    /// the same content produce one rename and one stored event. Across
    /// processes the existence re-check before rename does the same job.
    install_lock: std::sync::Arc<tokio::sync::Mutex<()>>,
}

impl KacheryStorageManager {
    pub fn new(storage_dir: impl Into<PathBuf>) -> Self {
        let (stored_tx, _) = broadcast::channel(256);
        KacheryStorageManager {
            storage_dir: storage_dir.into(),
            http_client: reqwest::Client::new(),
            stored_tx,
            install_lock: std::sync::Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    /// Subscribe to hashes of newly installed files. Fires strictly after
    /// the content is readable at its final path, at most once per install
    /// in this process.
    pub fn subscribe_stored(&self) -> broadcast::Receiver<Sha1Hash> {
        self.stored_tx.subscribe()
    }

    fn notify_stored(&self, sha1: &Sha1Hash) {
        let _ = self.stored_tx.send(*sha1);
    }

    /// Resolve a file key against local storage.
    ///
    /// Whole-file keys resolve to the direct content path or a still-valid
    /// link target. Chunk keys resolve iff their parent does, with the
    /// chunk's size and no path.
    pub async fn find_file(&self, key: &FileKey) -> Result<Option<FoundFile>> {
        if let Some(chunk) = &key.chunk_of {
            let parent = self.resolve_content(&chunk.file_key.sha1).await?;
            return Ok(parent.map(|_| FoundFile {
                size: chunk.end_byte - chunk.start_byte,
                local_path: None,
            }));
        }
        Ok(self
            .resolve_content(&key.sha1)
            .await?
            .map(|(path, size)| FoundFile {
                size,
                local_path: Some(path),
            }))
    }

    pub async fn has_local_file(&self, key: &FileKey) -> Result<bool> {
        Ok(self.find_file(key).await?.is_some())
    }

    /// Direct path first; the link sidecar is parsed only on a miss.
    async fn resolve_content(&self, sha1: &Sha1Hash) -> Result<Option<(PathBuf, u64)>> {
        let direct = paths::content_path(&self.storage_dir, sha1);
        match tokio::fs::metadata(&direct).await {
            Ok(meta) if meta.is_file() => return Ok(Some((direct, meta.len()))),
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let link_path = paths::link_path(&self.storage_dir, sha1);
        let raw = match tokio::fs::read(&link_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let link: LinkFile = serde_json::from_slice(&raw)
            .map_err(|e| Error::protocol(format!("malformed link file {link_path:?}: {e}")))?;
        if link.is_valid().await {
            Ok(Some((link.path, link.stat.size)))
        } else {
            Ok(None)
        }
    }

    /// Install `data` under `sha1`. The caller vouches that the bytes hash
    /// to `sha1`; already-present content is skipped without I/O beyond
    /// the stat.
    pub async fn store_file_from_buffer(&self, sha1: &Sha1Hash, data: &[u8]) -> Result<()> {
        let dest = paths::content_path(&self.storage_dir, sha1);
        if tokio::fs::try_exists(&dest).await? {
            return Ok(());
        }
        ensure_parent(&dest).await?;
        let tmp = paths::install_tmp_path(&dest, "tmp");
        {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
        }
        if self.atomic_install(&tmp, &dest, data.len() as u64).await? {
            self.notify_stored(sha1);
        }
        Ok(())
    }

    /// Single-pass streaming ingest: hash the bytes, accumulate the chunk
    /// manifest, and (unless `calculate_hash_only`) install the content.
    ///
    /// A manifest is emitted whenever the content spans more than one
    /// chunk, and is itself stored as a regular file. The declared `size`
    /// must match the number of bytes the stream actually yields.
    pub async fn store_file_from_stream(
        &self,
        stream: ByteStream,
        size: u64,
        calculate_hash_only: bool,
    ) -> Result<IngestOutcome> {
        let scratch = if calculate_hash_only {
            None
        } else {
            Some(self.create_scratch("ingest").await?)
        };
        let result = self.consume_stream(stream, size, scratch.as_ref()).await;
        let (sha1, manifest, total) = match result {
            Ok(ok) => ok,
            Err(e) => {
                if let Some(path) = &scratch {
                    let _ = tokio::fs::remove_file(path).await;
                }
                return Err(e);
            }
        };

        let manifest_sha1 = if manifest.chunks.len() > 1 {
            let bytes = manifest.to_canonical_bytes();
            let manifest_sha1 = Sha1Hash::new(&bytes);
            self.store_file_from_buffer(&manifest_sha1, &bytes).await?;
            Some(manifest_sha1)
        } else {
            None
        };

        if let Some(path) = scratch {
            let dest = paths::content_path(&self.storage_dir, &sha1);
            ensure_parent(&dest).await?;
            if self.atomic_install(&path, &dest, total).await? {
                self.notify_stored(&sha1);
            }
        }
        Ok(IngestOutcome {
            sha1,
            manifest_sha1,
            size: total,
        })
    }

    async fn consume_stream(
        &self,
        mut stream: ByteStream,
        declared_size: u64,
        scratch: Option<&PathBuf>,
    ) -> Result<(Sha1Hash, kachery_core::FileManifest, u64)> {
        let mut file = match scratch {
            Some(path) => Some(tokio::fs::File::create(path).await?),
            None => None,
        };
        let mut hasher = Sha1Hasher::new();
        let mut builder = ManifestBuilder::new();
        let mut total: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::transient(format!("stream read: {e}")))?;
            hasher.update(&chunk);
            builder.update(&chunk);
            total += chunk.len() as u64;
            if let Some(file) = &mut file {
                file.write_all(&chunk).await?;
            }
        }
        if total != declared_size {
            return Err(Error::precondition(format!(
                "stream yielded {total} bytes where {declared_size} were declared"
            )));
        }
        if let Some(file) = &mut file {
            file.sync_all().await?;
        }
        let sha1 = hasher.finalize();
        Ok((sha1, builder.finalize(sha1), total))
    }

    /// Start downloading a bucket object into the store.
    ///
    /// Returns a hot [`DataStream`]: bytes are accounted as they arrive,
    /// the size is set from `Content-Length` when present, and the stream
    /// finishes only after the computed hash matched `expected_sha1` and
    /// the content was installed. A mismatch is fatal, the temp file is
    /// deleted, and nothing is installed. Cancelling the stream aborts the
    /// request and deletes the temp file.
    pub fn store_file_from_bucket_url(&self, url: Url, expected_sha1: Sha1Hash) -> DataStream {
        let handle = DataStream::new();
        let manager = self.clone();
        let task_handle = handle.clone();
        tokio::spawn(async move {
            match manager
                .fetch_bucket_url(url, expected_sha1, &task_handle)
                .await
            {
                Ok(()) => task_handle.finish(),
                Err(e) => task_handle.fail(e),
            }
        });
        handle
    }

    async fn fetch_bucket_url(
        &self,
        url: Url,
        expected_sha1: Sha1Hash,
        handle: &DataStream,
    ) -> Result<()> {
        let response = self
            .http_client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| Error::transient(format!("GET {url}: {e}")))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::not_found(format!("bucket object {url}")));
        }
        if !response.status().is_success() {
            return Err(Error::transient(format!(
                "GET {url}: status {}",
                response.status()
            )));
        }
        if let Some(len) = response.content_length() {
            handle.set_size(len);
        }

        let scratch = self.create_scratch("download").await?;
        let outcome = self
            .drain_response(response, &scratch, handle, &expected_sha1)
            .await;
        match outcome {
            Ok(total) => {
                let dest = paths::content_path(&self.storage_dir, &expected_sha1);
                ensure_parent(&dest).await?;
                if self.atomic_install(&scratch, &dest, total).await? {
                    self.notify_stored(&expected_sha1);
                }
                Ok(())
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&scratch).await;
                Err(e)
            }
        }
    }

    async fn drain_response(
        &self,
        response: reqwest::Response,
        scratch: &Path,
        handle: &DataStream,
        expected_sha1: &Sha1Hash,
    ) -> Result<u64> {
        let mut file = tokio::fs::File::create(scratch).await?;
        let mut hasher = Sha1Hasher::new();
        let mut total: u64 = 0;
        let mut body = Box::pin(response.bytes_stream());
        loop {
            tokio::select! {
                _ = handle.cancelled() => {
                    // Dropping the body aborts the request.
                    return Err(Error::Cancelled);
                }
                chunk = body.next() => match chunk {
                    Some(Ok(bytes)) => {
                        hasher.update(&bytes);
                        file.write_all(&bytes).await?;
                        total += bytes.len() as u64;
                        handle.report_bytes(bytes.len() as u64);
                    }
                    Some(Err(e)) => {
                        return Err(Error::transient(format!("bucket stream: {e}")));
                    }
                    None => break,
                }
            }
        }
        file.sync_all().await?;
        let computed = hasher.finalize();
        if computed != *expected_sha1 {
            return Err(Error::integrity(format!(
                "downloaded content hashed to {computed}, expected {expected_sha1}"
            )));
        }
        Ok(total)
    }

    /// Ingest a file already on local disk.
    pub async fn store_local_file(&self, path: &Path) -> Result<IngestOutcome> {
        let meta = tokio::fs::metadata(path).await?;
        let file = tokio::fs::File::open(path).await?;
        self.store_file_from_stream(Box::new(ReaderStream::new(file)), meta.len(), false)
            .await
    }

    /// Record that an external file mirrors its own hash, without copying
    /// the bytes in.
    ///
    /// The caller declares the stat it observed; if the file on disk no
    /// longer matches (size exactly, mtime within
    /// [`MTIME_TOLERANCE_MS`]), the link is refused.
    pub async fn link_local_file(&self, path: &Path, declared: &LinkStat) -> Result<IngestOutcome> {
        let observed = stat_ms(path).await?;
        if observed.size != declared.size {
            return Err(Error::precondition(format!(
                "link target {path:?} has size {} but {} was declared",
                observed.size, declared.size
            )));
        }
        if observed.mtime.abs_diff(declared.mtime) > MTIME_TOLERANCE_MS {
            return Err(Error::precondition(format!(
                "link target {path:?} has mtime {} but {} was declared",
                observed.mtime, declared.mtime
            )));
        }

        let file = tokio::fs::File::open(path).await?;
        let outcome = self
            .store_file_from_stream(Box::new(ReaderStream::new(file)), observed.size, true)
            .await?;

        let link = LinkFile {
            path: tokio::fs::canonicalize(path).await?,
            manifest_sha1: outcome.manifest_sha1,
            stat: observed,
        };
        let content = paths::content_path(&self.storage_dir, &outcome.sha1);
        ensure_parent(&content).await?;
        let dest = paths::link_path(&self.storage_dir, &outcome.sha1);
        let tmp = paths::install_tmp_path(&content, "link.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec(&link)?).await?;
        tokio::fs::rename(&tmp, &dest).await?;
        Ok(outcome)
    }

    /// Reassemble a file from locally present chunks, verifying the total
    /// hash before install.
    pub async fn concatenate_chunks_and_store_result(
        &self,
        expected_sha1: &Sha1Hash,
        chunk_sha1s: &[Sha1Hash],
    ) -> Result<()> {
        let dest = paths::content_path(&self.storage_dir, expected_sha1);
        if tokio::fs::try_exists(&dest).await? {
            return Ok(());
        }
        let mut sources = Vec::with_capacity(chunk_sha1s.len());
        for chunk in chunk_sha1s {
            let (path, _) = self.resolve_content(chunk).await?.ok_or_else(|| {
                Error::not_found(format!("chunk {chunk} not present locally"))
            })?;
            sources.push(path);
        }

        let scratch = self.create_scratch("concat").await?;
        let result = concat_into(&sources, &scratch, expected_sha1).await;
        match result {
            Ok(total) => {
                ensure_parent(&dest).await?;
                if self.atomic_install(&scratch, &dest, total).await? {
                    self.notify_stored(expected_sha1);
                }
                Ok(())
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&scratch).await;
                Err(e)
            }
        }
    }

    /// Stream a byte range of a stored file. For chunk keys the range is
    /// relative to the chunk and translated into the parent file.
    pub async fn get_read_stream(
        &self,
        key: &FileKey,
        start_byte: Option<u64>,
        end_byte: Option<u64>,
    ) -> Result<ByteStream> {
        let (path, abs_start, abs_end) = if let Some(chunk) = &key.chunk_of {
            let (path, _) = self
                .resolve_content(&chunk.file_key.sha1)
                .await?
                .ok_or_else(|| Error::not_found(format!("file {}", chunk.file_key.sha1)))?;
            let len = chunk.end_byte - chunk.start_byte;
            let rel_start = start_byte.unwrap_or(0);
            let rel_end = end_byte.unwrap_or(len);
            if rel_start > rel_end || rel_end > len {
                return Err(Error::precondition(format!(
                    "range {rel_start}..{rel_end} outside chunk of {len} bytes"
                )));
            }
            (
                path,
                chunk.start_byte + rel_start,
                chunk.start_byte + rel_end,
            )
        } else {
            let (path, size) = self
                .resolve_content(&key.sha1)
                .await?
                .ok_or_else(|| Error::not_found(format!("file {}", key.sha1)))?;
            let abs_start = start_byte.unwrap_or(0);
            let abs_end = end_byte.unwrap_or(size);
            if abs_start > abs_end || abs_end > size {
                return Err(Error::precondition(format!(
                    "range {abs_start}..{abs_end} outside file of {size} bytes"
                )));
            }
            (path, abs_start, abs_end)
        };

        let mut file = tokio::fs::File::open(&path).await?;
        if abs_start > 0 {
            file.seek(io::SeekFrom::Start(abs_start)).await?;
        }
        Ok(Box::new(ReaderStream::new(file.take(abs_end - abs_start))))
    }

    /// Read the whole content of a stored file into memory.
    pub async fn get_file_bytes(&self, key: &FileKey) -> Result<Bytes> {
        let mut stream = self.get_read_stream(key, None, None).await?;
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(Bytes::from(out))
    }

    /// Move stored content into the trash tree. The only deletion
    /// primitive: if the trash slot is already occupied, the source is
    /// unlinked instead.
    pub async fn move_file_to_trash(&self, sha1: &Sha1Hash) -> Result<()> {
        let src = paths::content_path(&self.storage_dir, sha1);
        if !tokio::fs::try_exists(&src).await? {
            return Err(Error::not_found(format!("file {sha1}")));
        }
        let dest = paths::trash_path(&self.storage_dir, sha1);
        if tokio::fs::try_exists(&dest).await? {
            tokio::fs::remove_file(&src).await?;
            return Ok(());
        }
        ensure_parent(&dest).await?;
        tokio::fs::rename(&src, &dest).await?;
        Ok(())
    }

    async fn create_scratch(&self, prefix: &str) -> Result<PathBuf> {
        let path = paths::scratch_path(&self.storage_dir, prefix);
        ensure_parent(&path).await?;
        Ok(path)
    }

    /// Move `tmp` onto `dest`, defending against concurrent installers of
    /// the same content. Returns whether this call performed the install.
    async fn atomic_install(&self, tmp: &Path, dest: &Path, expected_size: u64) -> Result<bool> {
        let _guard = self.install_lock.lock().await;
        if tokio::fs::try_exists(dest).await? {
            let _ = tokio::fs::remove_file(tmp).await;
            return Ok(false);
        }
        if let Err(e) = tokio::fs::rename(tmp, dest).await {
            // A concurrent installer may have won the rename race.
            if let Ok(meta) = tokio::fs::metadata(dest).await {
                if meta.len() == expected_size {
                    tracing::debug!(?dest, "rename failed but destination is present");
                    let _ = tokio::fs::remove_file(tmp).await;
                    return Ok(false);
                }
            }
            let _ = tokio::fs::remove_file(tmp).await;
            return Err(Error::transient(format!("rename into {dest:?}: {e}")));
        }

        let deadline = tokio::time::Instant::now() + INSTALL_STAT_DEADLINE;
        loop {
            match tokio::fs::metadata(dest).await {
                Ok(meta) if meta.len() == expected_size => break,
                _ if tokio::time::Instant::now() >= deadline => {
                    return Err(Error::transient(format!(
                        "installed file {dest:?} did not reach {expected_size} bytes"
                    )));
                }
                _ => tokio::time::sleep(INSTALL_STAT_INTERVAL).await,
            }
        }
        tokio::fs::set_permissions(dest, std::fs::Permissions::from_mode(0o644)).await?;
        Ok(true)
    }
}

impl std::fmt::Debug for KacheryStorageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KacheryStorageManager")
            .field("storage_dir", &self.storage_dir)
            .finish()
    }
}

async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

/// Stream `sources` in order into `scratch`, returning the total size
/// after the accumulated hash matched `expected`.
async fn concat_into(sources: &[PathBuf], scratch: &Path, expected: &Sha1Hash) -> Result<u64> {
    let mut out = tokio::fs::File::create(scratch).await?;
    let mut hasher = Sha1Hasher::new();
    let mut total: u64 = 0;
    let mut buf = vec![0u8; 64 * 1024];
    for source in sources {
        let mut file = tokio::fs::File::open(source).await?;
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            out.write_all(&buf[..n]).await?;
            total += n as u64;
        }
    }
    out.sync_all().await?;
    let computed = hasher.finalize();
    if computed != *expected {
        return Err(Error::integrity(format!(
            "concatenation hashed to {computed}, expected {expected}"
        )));
    }
    Ok(total)
}
