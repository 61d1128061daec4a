//! Resolving files by key.
//!
//! A load first consults local storage, then falls back to the channel
//! bucket: HEAD probe, and if the object is absent, a `requestFile`
//! round trip through the hub before probing again. Manifest-carrying
//! keys fan out into bounded-concurrency chunk loads that are
//! reassembled and verified by the store.

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use url::Url;

use kachery_core::{DataStream, Error, FileKey, FileManifest, Result, Sha1Hash};
use kachery_store::{FoundFile, KacheryStorageManager};

use crate::bucket::{
    BucketClient as _, DynBucketClient, bucket_file_path, bucket_uri_to_url, object_url,
};
use crate::hub::HubCoordinator;
use crate::stats::NodeStats;

/// Bound on simultaneous chunk downloads of one manifest load.
const MANIFEST_CHUNK_CONCURRENCY: usize = 5;

/// Attempts per chunk (one initial try plus two retries).
const CHUNK_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Default)]
pub struct LoadFileOpts {
    /// Channel to consult for remote content. Required unless the file is
    /// already local.
    pub channel_name: Option<String>,

    /// Free-form description used in logs.
    pub label: String,
}

#[derive(Clone)]
pub struct Downloader {
    storage: KacheryStorageManager,
    hub: Arc<HubCoordinator>,
    bucket_client: DynBucketClient,
    stats: NodeStats,
}

impl Downloader {
    pub fn new(
        storage: KacheryStorageManager,
        hub: Arc<HubCoordinator>,
        bucket_client: DynBucketClient,
        stats: NodeStats,
    ) -> Self {
        Downloader {
            storage,
            hub,
            bucket_client,
            stats,
        }
    }

    /// Begin loading a file, returning an observable stream.
    ///
    /// If the file is already local the returned stream is terminal;
    /// callers re-query the store for the path.
    pub fn load_file<'a>(
        &'a self,
        file_key: &'a FileKey,
        opts: &'a LoadFileOpts,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<DataStream>> + Send + 'a>> {
        Box::pin(async move {
            if self.storage.has_local_file(file_key).await? {
                return Ok(DataStream::finished());
            }
            if file_key.manifest_sha1.is_some() {
                self.load_with_manifest(file_key, opts).await
            } else {
                self.load_direct(file_key, opts).await
            }
        })
    }

    /// Load a file to completion and resolve it locally.
    pub fn load_file_async<'a>(
        &'a self,
        file_key: &'a FileKey,
        opts: &'a LoadFileOpts,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<FoundFile>> + Send + 'a>> {
        Box::pin(async move {
            let stream = self.load_file(file_key, opts).await?;
            stream.wait().await?;
            self.storage
                .find_file(file_key)
                .await?
                .ok_or_else(|| Error::not_found(format!("Unable to find file {file_key}")))
        })
    }

    // -- direct load --------------------------------------------------------

    /// Probe the channel bucket; if absent, ask the channel to provide the
    /// file and probe again. Up to two request rounds.
    async fn load_direct(&self, file_key: &FileKey, opts: &LoadFileOpts) -> Result<DataStream> {
        let channel_name = opts.channel_name.as_deref().ok_or_else(|| {
            Error::precondition(format!(
                "no channel to load {file_key} from (label: {})",
                opts.label
            ))
        })?;
        let membership = self.hub.membership(channel_name)?;
        let base = bucket_uri_to_url(&membership.channel_bucket_uri)?;
        let url = object_url(&base, &bucket_file_path(&file_key.sha1))?;

        for _pass in 0..2 {
            if self.bucket_client.head(&url).await.unwrap_or(false) {
                return Ok(self.start_bucket_download(channel_name, &url, file_key.sha1));
            }
            self.hub
                .request_file_and_wait(channel_name, file_key)
                .await
                .map_err(|e| match e {
                    Error::Transient(_) => {
                        Error::not_found(format!("Unable to find file {file_key}"))
                    }
                    other => other,
                })?;
        }
        if self.bucket_client.head(&url).await.unwrap_or(false) {
            return Ok(self.start_bucket_download(channel_name, &url, file_key.sha1));
        }
        Err(Error::not_found(format!("Unable to find file {file_key}")))
    }

    fn start_bucket_download(
        &self,
        channel_name: &str,
        url: &Url,
        expected_sha1: Sha1Hash,
    ) -> DataStream {
        tracing::debug!(channel = channel_name, %url, "downloading from channel bucket");
        let stream = self
            .storage
            .store_file_from_bucket_url(url.clone(), expected_sha1);
        let stats = self.stats.clone();
        let channel_name = channel_name.to_owned();
        let observed = stream.clone();
        tokio::spawn(async move {
            if observed.wait().await.is_ok() {
                stats.report_bytes_received(&channel_name, observed.bytes_loaded());
            }
        });
        stream
    }

    // -- manifest load ------------------------------------------------------

    async fn load_with_manifest(&self, file_key: &FileKey, opts: &LoadFileOpts) -> Result<DataStream> {
        // Recursion bottoms out here: the manifest's own key carries no
        // manifest reference.
        let manifest_key = FileKey::from_sha1(file_key.manifest_sha1.unwrap());
        self.load_file_async(&manifest_key, opts).await?;
        let bytes = self.storage.get_file_bytes(&manifest_key).await?;
        let manifest = FileManifest::parse(&bytes)?;
        if manifest.sha1 != file_key.sha1 {
            return Err(Error::integrity(format!(
                "manifest {} does not describe file {}",
                manifest_key.sha1, file_key.sha1
            )));
        }

        let parent = DataStream::with_size(manifest.size);
        let downloader = self.clone();
        let opts = opts.clone();
        let handle = parent.clone();
        tokio::spawn(async move {
            downloader.run_chunk_fanout(manifest, opts, handle).await;
        });
        Ok(parent)
    }

    async fn run_chunk_fanout(&self, manifest: FileManifest, opts: LoadFileOpts, parent: DataStream) {
        let semaphore = Arc::new(Semaphore::new(MANIFEST_CHUNK_CONCURRENCY));
        let children: ChunkStreams = Arc::default();
        let chunk_sha1s: Vec<Sha1Hash> = manifest.chunks.iter().map(|c| c.sha1).collect();

        let mut tasks: FuturesUnordered<_> = manifest
            .chunks
            .iter()
            .enumerate()
            .map(|(index, chunk)| {
                let chunk_key = FileKey::chunk(
                    chunk.sha1,
                    FileKey::from_sha1(manifest.sha1),
                    chunk.start,
                    chunk.end,
                );
                let downloader = self.clone();
                let opts = opts.clone();
                let parent = parent.clone();
                let children = children.clone();
                let semaphore = semaphore.clone();
                tokio::spawn(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|_| Error::transient("chunk semaphore closed"))?;
                    let mut last_error = Error::transient("chunk load not attempted");
                    for _attempt in 0..CHUNK_ATTEMPTS {
                        if parent.is_cancelled() {
                            return Err(Error::Cancelled);
                        }
                        match downloader.load_chunk(index, &chunk_key, &opts, &children).await {
                            Ok(()) => return Ok(()),
                            Err(Error::Cancelled) => return Err(Error::Cancelled),
                            Err(e) => {
                                tracing::debug!(chunk = %chunk_key, error = %e, "chunk load attempt failed");
                                last_error = e;
                            }
                        }
                    }
                    Err(last_error)
                })
            })
            .collect();

        let mut progress_tick = tokio::time::interval(Duration::from_millis(100));
        loop {
            tokio::select! {
                _ = parent.cancelled() => {
                    cancel_children(&children);
                    return;
                }
                _ = progress_tick.tick() => {
                    parent.set_bytes_loaded(sum_progress(&children));
                }
                next = tasks.next() => match next {
                    None => break,
                    Some(Ok(Ok(()))) => {
                        parent.set_bytes_loaded(sum_progress(&children));
                    }
                    Some(Ok(Err(e))) => {
                        cancel_children(&children);
                        parent.fail(e);
                        return;
                    }
                    Some(Err(join_error)) => {
                        cancel_children(&children);
                        parent.fail(Error::transient(format!("chunk task failed: {join_error}")));
                        return;
                    }
                }
            }
        }

        parent.set_bytes_loaded(sum_progress(&children));
        match self
            .storage
            .concatenate_chunks_and_store_result(&manifest.sha1, &chunk_sha1s)
            .await
        {
            Ok(()) => parent.finish(),
            Err(e) => parent.fail(e),
        }
    }

    async fn load_chunk(
        &self,
        index: usize,
        chunk_key: &FileKey,
        opts: &LoadFileOpts,
        children: &ChunkStreams,
    ) -> Result<()> {
        let child = Box::pin(self.load_file(chunk_key, opts)).await?;
        // A retry replaces the failed attempt's stream, so partial bytes
        // of abandoned attempts never count toward parent progress.
        children.lock().unwrap().insert(index, child.clone());
        child.wait().await
    }
}

/// Live chunk streams keyed by chunk index.
type ChunkStreams = Arc<Mutex<std::collections::HashMap<usize, DataStream>>>;

fn sum_progress(children: &ChunkStreams) -> u64 {
    children
        .lock()
        .unwrap()
        .values()
        .map(|c| c.bytes_loaded())
        .sum()
}

/// Cancel all outstanding chunk streams exactly once: the map is drained
/// so a second call finds nothing to cancel.
fn cancel_children(children: &ChunkStreams) {
    let drained = std::mem::take(&mut *children.lock().unwrap());
    for child in drained.into_values() {
        child.cancel();
    }
}

impl std::fmt::Debug for Downloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Downloader")
            .field("storage", &self.storage)
            .finish()
    }
}
