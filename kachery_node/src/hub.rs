//! Channel pubsub coordination.
//!
//! Each channel membership implies up to four pubsub sub-channels; the
//! coordinator subscribes according to role × permission, verifies every
//! incoming envelope signature before routing, answers file and subfeed
//! requests against local storage, and runs the staged waiter that the
//! downloader uses while a remote node uploads a requested file.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use url::Url;

use kachery_core::canonical::canonical_bytes;
use kachery_core::{
    Error, FeedId, FileKey, KeyPair, NodeId, Result, Signature, SignedSubfeedMessage, SubfeedHash,
};
use kachery_store::{FoundFile, KacheryStorageManager};

use crate::bucket::{
    BucketClient as _, DynBucketClient, bucket_file_path, bucket_subfeed_dir, bucket_uri_to_url,
    object_url,
};
use crate::config::{ChannelMembership, ChannelRole};
use crate::stats::NodeStats;
use crate::subfeed::{FeedManager, Subfeed};

/// Time allowed for a remote provider to post the first upload status.
const REQUEST_FILE_INITIAL_DEADLINE: Duration = Duration::from_secs(3);

/// Time allowed in the `pending` and `started` stages.
const REQUEST_FILE_STAGE_DEADLINE: Duration = Duration::from_secs(30);

/// How long a file request will watch the store's install events for an
/// ingest that is still in flight.
const INGEST_WAIT_DEADLINE: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Started,
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PubsubMessageBody {
    #[serde(rename = "requestFile")]
    RequestFile {
        #[serde(rename = "fileKey")]
        file_key: FileKey,
    },

    #[serde(rename = "uploadFileStatus")]
    UploadFileStatus {
        #[serde(rename = "fileKey")]
        file_key: FileKey,
        status: UploadStatus,
    },

    #[serde(rename = "requestSubfeed")]
    RequestSubfeed {
        #[serde(rename = "feedId")]
        feed_id: FeedId,
        #[serde(rename = "subfeedHash")]
        subfeed_hash: SubfeedHash,
        position: u64,
    },

    #[serde(rename = "subfeedMessageCountUpdate")]
    SubfeedMessageCountUpdate {
        #[serde(rename = "feedId")]
        feed_id: FeedId,
        #[serde(rename = "subfeedHash")]
        subfeed_hash: SubfeedHash,
        #[serde(rename = "messageCount")]
        message_count: u64,
    },
}

/// A pubsub message: body plus sender identity and signature over the
/// body's canonical form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PubsubEnvelope {
    pub body: PubsubMessageBody,

    #[serde(rename = "fromNodeId")]
    pub from_node_id: NodeId,

    pub signature: Signature,
}

impl PubsubEnvelope {
    pub fn sign_new(keypair: &KeyPair, body: PubsubMessageBody) -> Self {
        // Body serialization cannot fail
        let signature = keypair.sign(&serde_json::to_value(&body).unwrap());
        PubsubEnvelope {
            body,
            from_node_id: keypair.public_key(),
            signature,
        }
    }

    pub fn verify(&self) -> bool {
        let body = serde_json::to_value(&self.body).unwrap();
        kachery_core::keys::verify_signature(&body, &self.from_node_id, &self.signature)
    }
}

/// The four pubsub sub-channels of a federation channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PubsubChannelKind {
    RequestFiles,
    ProvideFiles,
    RequestFeeds,
    ProvideFeeds,
}

impl PubsubChannelKind {
    fn suffix(&self) -> &'static str {
        match self {
            PubsubChannelKind::RequestFiles => "requestFiles",
            PubsubChannelKind::ProvideFiles => "provideFiles",
            PubsubChannelKind::RequestFeeds => "requestFeeds",
            PubsubChannelKind::ProvideFeeds => "provideFeeds",
        }
    }

    /// Is this body type expected on this sub-channel?
    fn accepts(&self, body: &PubsubMessageBody) -> bool {
        matches!(
            (self, body),
            (
                PubsubChannelKind::RequestFiles,
                PubsubMessageBody::RequestFile { .. }
            ) | (
                PubsubChannelKind::ProvideFiles,
                PubsubMessageBody::UploadFileStatus { .. }
            ) | (
                PubsubChannelKind::RequestFeeds,
                PubsubMessageBody::RequestSubfeed { .. }
            ) | (
                PubsubChannelKind::ProvideFeeds,
                PubsubMessageBody::SubfeedMessageCountUpdate { .. }
            )
        )
    }
}

pub fn pubsub_channel_name(channel_name: &str, kind: PubsubChannelKind) -> String {
    format!("{channel_name}-{}", kind.suffix())
}

// ---------------------------------------------------------------------------
// Collaborator seams
// ---------------------------------------------------------------------------

/// Transport fabric carrying signed envelopes between channel members.
#[async_trait]
pub trait PubsubTransport: std::fmt::Debug + Send + Sync + 'static {
    async fn publish(&self, pubsub_channel: &str, envelope: PubsubEnvelope) -> Result<()>;

    /// Subscribe to a sub-channel; delivery stops when the receiver is
    /// dropped.
    async fn subscribe(&self, pubsub_channel: &str) -> Result<mpsc::Receiver<PubsubEnvelope>>;
}

pub type DynPubsubTransport = Arc<dyn PubsubTransport>;

/// Mints pre-signed PUT URLs for bucket objects.
#[async_trait]
pub trait SignedUrlMinter: std::fmt::Debug + Send + Sync + 'static {
    async fn mint_upload_url(
        &self,
        channel_name: &str,
        object_path: &str,
        size: u64,
    ) -> Result<Url>;
}

pub type DynSignedUrlMinter = Arc<dyn SignedUrlMinter>;

/// Transport used when no hub connection is configured: publishes are
/// dropped and subscriptions never deliver. The daemon still serves its
/// local store.
#[derive(Debug, Default)]
pub struct NullPubsubTransport {
    keepalive: std::sync::Mutex<Vec<mpsc::Sender<PubsubEnvelope>>>,
}

#[async_trait]
impl PubsubTransport for NullPubsubTransport {
    async fn publish(&self, pubsub_channel: &str, _envelope: PubsubEnvelope) -> Result<()> {
        tracing::debug!(pubsub_channel, "pubsub transport not configured; dropping publish");
        Ok(())
    }

    async fn subscribe(&self, _pubsub_channel: &str) -> Result<mpsc::Receiver<PubsubEnvelope>> {
        let (tx, rx) = mpsc::channel(1);
        self.keepalive.lock().unwrap().push(tx);
        Ok(rx)
    }
}

/// Minter used when no hub connection is configured; uploads are refused.
#[derive(Debug, Default)]
pub struct NullSignedUrlMinter;

#[async_trait]
impl SignedUrlMinter for NullSignedUrlMinter {
    async fn mint_upload_url(
        &self,
        channel_name: &str,
        _object_path: &str,
        _size: u64,
    ) -> Result<Url> {
        Err(Error::precondition(format!(
            "no signed-url minter configured for channel {channel_name}"
        )))
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum UploadStage {
    NotSeen,
    Pending,
    Started,
    Finished,
}

impl From<UploadStatus> for UploadStage {
    fn from(status: UploadStatus) -> Self {
        match status {
            UploadStatus::Pending => UploadStage::Pending,
            UploadStatus::Started => UploadStage::Started,
            UploadStatus::Finished => UploadStage::Finished,
        }
    }
}

pub struct HubCoordinator {
    keypair: KeyPair,
    storage: KacheryStorageManager,
    feeds: Arc<FeedManager>,
    bucket_client: DynBucketClient,
    transport: DynPubsubTransport,
    minter: DynSignedUrlMinter,
    stats: NodeStats,
    memberships: Vec<ChannelMembership>,
    /// Upload-status observations, keyed by canonical file key, feeding
    /// the request-file waiters.
    upload_status_tx: broadcast::Sender<(String, UploadStatus)>,
    listeners: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl HubCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        keypair: KeyPair,
        storage: KacheryStorageManager,
        feeds: Arc<FeedManager>,
        bucket_client: DynBucketClient,
        transport: DynPubsubTransport,
        minter: DynSignedUrlMinter,
        stats: NodeStats,
        memberships: Vec<ChannelMembership>,
    ) -> Arc<Self> {
        let (upload_status_tx, _) = broadcast::channel(256);
        Arc::new(HubCoordinator {
            keypair,
            storage,
            feeds,
            bucket_client,
            transport,
            minter,
            stats,
            memberships,
            upload_status_tx,
            listeners: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.keypair.public_key()
    }

    pub fn stats(&self) -> &NodeStats {
        &self.stats
    }

    pub fn membership(&self, channel_name: &str) -> Result<&ChannelMembership> {
        self.memberships
            .iter()
            .find(|m| m.channel_name == channel_name)
            .ok_or_else(|| Error::not_found(format!("not a member of channel {channel_name}")))
    }

    /// Subscribe to the pubsub sub-channels implied by each membership's
    /// roles and permissions, and start routing.
    pub async fn start(self: Arc<Self>) -> Result<()> {
        let table = [
            (ChannelRole::RequestFiles, PubsubChannelKind::ProvideFiles),
            (ChannelRole::ProvideFiles, PubsubChannelKind::RequestFiles),
            (ChannelRole::RequestFeeds, PubsubChannelKind::ProvideFeeds),
            (ChannelRole::ProvideFeeds, PubsubChannelKind::RequestFeeds),
        ];
        for membership in self.memberships.clone() {
            for (role, kind) in table.iter().copied() {
                if !membership.can(role) {
                    continue;
                }
                let name = pubsub_channel_name(&membership.channel_name, kind);
                let mut receiver = self.transport.subscribe(&name).await?;
                let hub = self.clone();
                let membership = membership.clone();
                let handle = tokio::spawn(async move {
                    while let Some(envelope) = receiver.recv().await {
                        hub.clone().handle_incoming(&membership, kind, envelope).await;
                    }
                });
                self.listeners.lock().unwrap().push(handle);
            }
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        for handle in self.listeners.lock().unwrap().drain(..) {
            handle.abort();
        }
    }

    async fn handle_incoming(
        self: Arc<Self>,
        membership: &ChannelMembership,
        kind: PubsubChannelKind,
        envelope: PubsubEnvelope,
    ) {
        if envelope.from_node_id == self.node_id() {
            return;
        }
        if !envelope.verify() {
            tracing::warn!(
                channel = %membership.channel_name,
                from = %envelope.from_node_id,
                "dropping pubsub message with bad signature"
            );
            return;
        }
        if !kind.accepts(&envelope.body) {
            tracing::warn!(
                channel = %membership.channel_name,
                sub_channel = kind.suffix(),
                "dropping pubsub message on wrong sub-channel"
            );
            return;
        }

        match envelope.body {
            PubsubMessageBody::RequestFile { file_key } => {
                let hub = self.clone();
                let membership = membership.clone();
                tokio::spawn(async move {
                    if let Err(e) = hub.handle_file_request(&membership, &file_key).await {
                        tracing::warn!(
                            channel = %membership.channel_name,
                            file_key = %file_key,
                            error = %e,
                            "file request handling failed"
                        );
                    }
                });
            }
            PubsubMessageBody::UploadFileStatus { file_key, status } => {
                let _ = self
                    .upload_status_tx
                    .send((file_key.canonical_string(), status));
            }
            PubsubMessageBody::RequestSubfeed {
                feed_id,
                subfeed_hash,
                position,
            } => {
                let hub = self.clone();
                let membership = membership.clone();
                tokio::spawn(async move {
                    if let Err(e) = hub
                        .handle_subfeed_request(&membership, &feed_id, &subfeed_hash, position)
                        .await
                    {
                        tracing::warn!(
                            channel = %membership.channel_name,
                            feed_id = %feed_id,
                            error = %e,
                            "subfeed request handling failed"
                        );
                    }
                });
            }
            PubsubMessageBody::SubfeedMessageCountUpdate {
                feed_id,
                subfeed_hash,
                message_count,
            } => {
                let hub = self.clone();
                let membership = membership.clone();
                tokio::spawn(async move {
                    if let Err(e) = hub
                        .handle_subfeed_count_update(
                            &membership,
                            &feed_id,
                            &subfeed_hash,
                            message_count,
                        )
                        .await
                    {
                        tracing::warn!(
                            channel = %membership.channel_name,
                            feed_id = %feed_id,
                            error = %e,
                            "subfeed count update handling failed"
                        );
                    }
                });
            }
        }
    }

    async fn publish(
        &self,
        channel_name: &str,
        kind: PubsubChannelKind,
        body: PubsubMessageBody,
    ) -> Result<()> {
        let envelope = PubsubEnvelope::sign_new(&self.keypair, body);
        self.transport
            .publish(&pubsub_channel_name(channel_name, kind), envelope)
            .await
    }

    // -- file provider ------------------------------------------------------

    /// Answer a `requestFile`: if the content is in the local store,
    /// upload it to the channel bucket and publish the status
    /// progression.
    async fn handle_file_request(
        &self,
        membership: &ChannelMembership,
        file_key: &FileKey,
    ) -> Result<()> {
        if !membership.can(ChannelRole::ProvideFiles) {
            return Ok(());
        }
        let found = match self.storage.find_file(file_key).await? {
            Some(found) => found,
            // The request may have raced an ingest still in flight.
            None => match self.wait_for_local_ingest(file_key).await? {
                Some(found) => found,
                None => return Ok(()),
            },
        };

        self.publish(
            &membership.channel_name,
            PubsubChannelKind::ProvideFiles,
            PubsubMessageBody::UploadFileStatus {
                file_key: file_key.clone(),
                status: UploadStatus::Pending,
            },
        )
        .await?;

        let base = bucket_uri_to_url(&membership.channel_bucket_uri)?;
        let path = bucket_file_path(&file_key.sha1);
        let already = self
            .bucket_client
            .head(&object_url(&base, &path)?)
            .await
            .unwrap_or(false);

        if !already {
            self.publish(
                &membership.channel_name,
                PubsubChannelKind::ProvideFiles,
                PubsubMessageBody::UploadFileStatus {
                    file_key: file_key.clone(),
                    status: UploadStatus::Started,
                },
            )
            .await?;

            let bytes = self.storage.get_file_bytes(file_key).await?;
            let url = self
                .minter
                .mint_upload_url(&membership.channel_name, &path, found.size)
                .await?;
            self.bucket_client.put_signed(&url, bytes.clone()).await?;
            self.stats
                .report_bytes_sent(&membership.channel_name, bytes.len() as u64);
            tracing::info!(
                channel = %membership.channel_name,
                file_key = %file_key,
                size = found.size,
                "uploaded requested file to channel bucket"
            );
        }

        self.publish(
            &membership.channel_name,
            PubsubChannelKind::ProvideFiles,
            PubsubMessageBody::UploadFileStatus {
                file_key: file_key.clone(),
                status: UploadStatus::Finished,
            },
        )
        .await
    }

    /// Watch the store's install events for the requested hash (or, for
    /// a chunk key, its parent's) within a bounded window, so a request
    /// that arrives mid-ingest is answered once the content lands.
    async fn wait_for_local_ingest(&self, file_key: &FileKey) -> Result<Option<FoundFile>> {
        let mut stored = self.storage.subscribe_stored();
        // Re-check after subscribing; the install may just have finished.
        if let Some(found) = self.storage.find_file(file_key).await? {
            return Ok(Some(found));
        }
        let deadline = tokio::time::Instant::now() + INGEST_WAIT_DEADLINE;
        loop {
            match tokio::time::timeout_at(deadline, stored.recv()).await {
                Ok(Ok(sha1)) => {
                    let relevant = sha1 == file_key.sha1
                        || file_key
                            .chunk_of
                            .as_ref()
                            .is_some_and(|c| c.file_key.sha1 == sha1);
                    if relevant {
                        return self.storage.find_file(file_key).await;
                    }
                }
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => {
                    if let Some(found) = self.storage.find_file(file_key).await? {
                        return Ok(Some(found));
                    }
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => return Ok(None),
                Err(_) => return Ok(None),
            }
        }
    }

    // -- file requester -----------------------------------------------------

    /// Publish `requestFile` and wait for a provider to move the upload
    /// through its stages.
    ///
    /// Stages only ever advance; each advance resets the deadline for the
    /// stage entered. Resolves once `finished` is observed.
    pub async fn request_file_and_wait(
        &self,
        channel_name: &str,
        file_key: &FileKey,
    ) -> Result<()> {
        let membership = self.membership(channel_name)?;
        if !membership.can(ChannelRole::RequestFiles) {
            return Err(Error::precondition(format!(
                "requestFiles is not enabled on channel {channel_name}"
            )));
        }
        // Subscribe before publishing so no status can slip past.
        let mut status_rx = self.upload_status_tx.subscribe();
        self.publish(
            channel_name,
            PubsubChannelKind::RequestFiles,
            PubsubMessageBody::RequestFile {
                file_key: file_key.clone(),
            },
        )
        .await?;

        let key = file_key.canonical_string();
        let mut stage = UploadStage::NotSeen;
        let mut deadline = tokio::time::Instant::now() + REQUEST_FILE_INITIAL_DEADLINE;
        loop {
            let received = tokio::time::timeout_at(deadline, status_rx.recv()).await;
            match received {
                Ok(Ok((observed_key, status))) => {
                    if observed_key != key {
                        continue;
                    }
                    let observed: UploadStage = status.into();
                    if observed <= stage {
                        continue;
                    }
                    stage = observed;
                    if stage == UploadStage::Finished {
                        return Ok(());
                    }
                    deadline = tokio::time::Instant::now() + REQUEST_FILE_STAGE_DEADLINE;
                }
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => {
                    return Err(Error::transient("upload status channel closed"));
                }
                Err(_) => {
                    return Err(Error::transient(format!(
                        "timed out in upload stage {stage:?} for {file_key}"
                    )));
                }
            }
        }
    }

    // -- subfeed provider ---------------------------------------------------

    /// Answer a `requestSubfeed`: replicate local messages from
    /// `position` onward into the bucket and announce the new count.
    async fn handle_subfeed_request(
        &self,
        membership: &ChannelMembership,
        feed_id: &FeedId,
        subfeed_hash: &SubfeedHash,
        position: u64,
    ) -> Result<()> {
        if !membership.can(ChannelRole::ProvideFeeds) {
            return Ok(());
        }
        let subfeed = self.feeds.subfeed(feed_id, subfeed_hash).await?;
        if subfeed.num_messages().await == 0 {
            return Ok(());
        }
        self.replicate_subfeed_to_bucket(membership, &subfeed, position)
            .await
    }

    /// Producer path: PUT messages `[from_number, count)` and the updated
    /// `subfeed.json`, then publish the count update.
    pub async fn replicate_subfeed_to_bucket(
        &self,
        membership: &ChannelMembership,
        subfeed: &Subfeed,
        from_number: u64,
    ) -> Result<()> {
        let count = subfeed.num_messages().await;
        let dir = bucket_subfeed_dir(subfeed.feed_id(), subfeed.subfeed_hash());

        for msg in subfeed.get_signed_messages(from_number, count).await {
            let path = format!("{dir}/{}", msg.body.message_number);
            let bytes = bytes::Bytes::from(canonical_bytes(&msg)?);
            let url = self
                .minter
                .mint_upload_url(&membership.channel_name, &path, bytes.len() as u64)
                .await?;
            self.stats
                .report_bytes_sent(&membership.channel_name, bytes.len() as u64);
            self.bucket_client.put_signed(&url, bytes).await?;
        }

        let subfeed_json = bytes::Bytes::from(canonical_bytes(&json!({"messageCount": count}))?);
        let url = self
            .minter
            .mint_upload_url(
                &membership.channel_name,
                &format!("{dir}/subfeed.json"),
                subfeed_json.len() as u64,
            )
            .await?;
        self.bucket_client.put_signed(&url, subfeed_json).await?;

        self.publish(
            &membership.channel_name,
            PubsubChannelKind::ProvideFeeds,
            PubsubMessageBody::SubfeedMessageCountUpdate {
                feed_id: subfeed.feed_id().clone(),
                subfeed_hash: *subfeed.subfeed_hash(),
                message_count: count,
            },
        )
        .await
    }

    /// Push newly appended local messages to every channel where this
    /// node provides feeds. The bucket's current `subfeed.json` decides
    /// where the upload resumes.
    pub async fn broadcast_appended_messages(
        &self,
        feed_id: &FeedId,
        subfeed_hash: &SubfeedHash,
    ) -> Result<()> {
        let subfeed = self.feeds.subfeed(feed_id, subfeed_hash).await?;
        for membership in &self.memberships {
            if !membership.can(ChannelRole::ProvideFeeds) {
                continue;
            }
            let base = bucket_uri_to_url(&membership.channel_bucket_uri)?;
            let dir = bucket_subfeed_dir(feed_id, subfeed_hash);
            let existing = self
                .bucket_client
                .get_json(&object_url(&base, &format!("{dir}/subfeed.json"))?, false)
                .await
                .ok()
                .flatten()
                .and_then(|v| v.get("messageCount").and_then(|c| c.as_u64()))
                .unwrap_or(0);
            self.replicate_subfeed_to_bucket(membership, &subfeed, existing)
                .await?;
        }
        Ok(())
    }

    // -- subfeed consumer ---------------------------------------------------

    /// Ask channel members to replicate a subfeed this node is missing.
    pub async fn request_subfeed(
        &self,
        channel_name: &str,
        feed_id: &FeedId,
        subfeed_hash: &SubfeedHash,
    ) -> Result<()> {
        let membership = self.membership(channel_name)?;
        if !membership.can(ChannelRole::RequestFeeds) {
            return Err(Error::precondition(format!(
                "requestFeeds is not enabled on channel {channel_name}"
            )));
        }
        let position = self
            .feeds
            .subfeed(feed_id, subfeed_hash)
            .await?
            .num_messages()
            .await;
        self.publish(
            channel_name,
            PubsubChannelKind::RequestFeeds,
            PubsubMessageBody::RequestSubfeed {
                feed_id: feed_id.clone(),
                subfeed_hash: *subfeed_hash,
                position,
            },
        )
        .await
    }

    /// Apply a `subfeedMessageCountUpdate`: confirm against the bucket's
    /// `subfeed.json`, download the missing messages, and append them.
    /// Verification happens on append; a bad batch is discarded whole.
    async fn handle_subfeed_count_update(
        &self,
        membership: &ChannelMembership,
        feed_id: &FeedId,
        subfeed_hash: &SubfeedHash,
        message_count: u64,
    ) -> Result<()> {
        if !membership.can(ChannelRole::RequestFeeds) {
            return Ok(());
        }
        let subfeed = self.feeds.subfeed(feed_id, subfeed_hash).await?;
        let local = subfeed.num_messages().await;
        if message_count <= local {
            return Ok(());
        }

        let base = bucket_uri_to_url(&membership.channel_bucket_uri)?;
        let dir = bucket_subfeed_dir(feed_id, subfeed_hash);
        let confirmed = self
            .bucket_client
            .get_json(&object_url(&base, &format!("{dir}/subfeed.json"))?, true)
            .await?
            .and_then(|v| v.get("messageCount").and_then(|c| c.as_u64()))
            .unwrap_or(0);
        if confirmed < message_count {
            tracing::warn!(
                channel = %membership.channel_name,
                feed_id = %feed_id,
                announced = message_count,
                confirmed,
                "subfeed count update not confirmed by bucket"
            );
            return Ok(());
        }

        let mut batch = Vec::with_capacity((message_count - local) as usize);
        for i in local..message_count {
            let url = object_url(&base, &format!("{dir}/{i}"))?;
            let value = self
                .bucket_client
                .get_json(&url, false)
                .await?
                .ok_or_else(|| Error::not_found(format!("subfeed message {i} missing")))?;
            let msg: SignedSubfeedMessage = serde_json::from_value(value)
                .map_err(|e| Error::protocol(format!("malformed subfeed message {i}: {e}")))?;
            batch.push(msg);
        }
        let received: u64 = batch
            .iter()
            .map(|m| canonical_bytes(m).map(|b| b.len() as u64).unwrap_or(0))
            .sum();
        subfeed.add_signed_messages(batch).await?;
        self.stats
            .report_bytes_received(&membership.channel_name, received);
        Ok(())
    }
}

impl std::fmt::Debug for HubCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubCoordinator")
            .field("node_id", &self.node_id())
            .field(
                "channels",
                &self
                    .memberships
                    .iter()
                    .map(|m| m.channel_name.as_str())
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl Drop for HubCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_sign_verify() {
        let keypair = KeyPair::generate();
        let body = PubsubMessageBody::RequestFile {
            file_key: FileKey::from_sha1(kachery_core::Sha1Hash::new(b"x")),
        };
        let envelope = PubsubEnvelope::sign_new(&keypair, body);
        assert!(envelope.verify());

        let mut forged = envelope.clone();
        forged.from_node_id = KeyPair::generate().public_key();
        assert!(!forged.verify());
    }

    #[test]
    fn test_body_wire_tags() {
        let body = PubsubMessageBody::UploadFileStatus {
            file_key: FileKey::from_sha1(kachery_core::Sha1Hash::new(b"x")),
            status: UploadStatus::Started,
        };
        let v = serde_json::to_value(&body).unwrap();
        assert_eq!(v["type"], "uploadFileStatus");
        assert_eq!(v["status"], "started");
        assert!(v["fileKey"]["sha1"].is_string());
    }

    #[test]
    fn test_channel_kind_accepts() {
        let request = PubsubMessageBody::RequestFile {
            file_key: FileKey::from_sha1(kachery_core::Sha1Hash::new(b"x")),
        };
        assert!(PubsubChannelKind::RequestFiles.accepts(&request));
        assert!(!PubsubChannelKind::ProvideFiles.accepts(&request));
        assert_eq!(
            pubsub_channel_name("lab", PubsubChannelKind::ProvideFeeds),
            "lab-provideFeeds"
        );
    }

    #[test]
    fn test_upload_stage_order() {
        assert!(UploadStage::NotSeen < UploadStage::Pending);
        assert!(UploadStage::Pending < UploadStage::Started);
        assert!(UploadStage::Started < UploadStage::Finished);
    }
}
