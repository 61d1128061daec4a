//! The kachery node daemon.
//!
//! A node stores and serves SHA-1-addressed files from local disk,
//! retrieves files from channel buckets on demand, and replicates
//! cryptographically signed append-only subfeeds through those buckets.
//! The pubsub fabric and pre-signed-URL minting are consumed through the
//! collaborator traits in [`hub`]; everything else lives here.

use std::sync::Arc;

use kachery_core::{KeyPair, NodeId};
use kachery_store::KacheryStorageManager;

pub mod bucket;
pub mod config;
pub mod downloader;
pub mod feeds;
pub mod hub;
pub mod stats;
pub mod subfeed;
pub mod testing;

pub use bucket::{BucketClient, DynBucketClient, HttpBucketClient};
pub use config::{ChannelMembership, ChannelRole, NodeConfig};
pub use downloader::{Downloader, LoadFileOpts};
pub use feeds::{DynLocalFeedManager, FileFeedManager, LocalFeedManager};
pub use hub::{
    DynPubsubTransport, DynSignedUrlMinter, HubCoordinator, NullPubsubTransport,
    NullSignedUrlMinter, PubsubEnvelope, PubsubMessageBody, PubsubTransport, SignedUrlMinter,
    UploadStatus,
};
pub use stats::NodeStats;
pub use subfeed::{FeedManager, Subfeed};

/// A running node: storage, feeds, hub coordination, and the downloader,
/// wired together from one config.
pub struct KacheryNode {
    config: NodeConfig,
    keypair: KeyPair,
    storage: KacheryStorageManager,
    feeds: Arc<FeedManager>,
    hub: Arc<HubCoordinator>,
    downloader: Downloader,
    stats: NodeStats,
}

impl KacheryNode {
    /// Construct the node and start the hub listeners.
    pub async fn start(
        config: NodeConfig,
        keypair: KeyPair,
        transport: DynPubsubTransport,
        minter: DynSignedUrlMinter,
    ) -> anyhow::Result<Self> {
        let storage = KacheryStorageManager::new(&config.storage_dir);
        let local_feeds: DynLocalFeedManager =
            Arc::new(FileFeedManager::new(&config.storage_dir));
        let feeds = Arc::new(FeedManager::new(local_feeds));
        let bucket_client: DynBucketClient = Arc::new(HttpBucketClient::new());
        let stats = NodeStats::new();

        let hub = HubCoordinator::new(
            keypair.clone(),
            storage.clone(),
            feeds.clone(),
            bucket_client.clone(),
            transport,
            minter,
            stats.clone(),
            config.channels.clone(),
        );
        hub.clone().start().await?;

        let downloader = Downloader::new(storage.clone(), hub.clone(), bucket_client, stats.clone());

        tracing::info!(
            label = %config.label,
            node_id = %keypair.public_key(),
            storage_dir = %config.storage_dir.display(),
            channels = config.channels.len(),
            "kachery node started"
        );

        Ok(KacheryNode {
            config,
            keypair,
            storage,
            feeds,
            hub,
            downloader,
            stats,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.keypair.public_key()
    }

    pub fn label(&self) -> &str {
        &self.config.label
    }

    pub fn storage(&self) -> &KacheryStorageManager {
        &self.storage
    }

    pub fn feeds(&self) -> &Arc<FeedManager> {
        &self.feeds
    }

    pub fn hub(&self) -> &Arc<HubCoordinator> {
        &self.hub
    }

    pub fn downloader(&self) -> &Downloader {
        &self.downloader
    }

    pub fn stats(&self) -> &NodeStats {
        &self.stats
    }

    /// Block until interrupted, then stop the hub listeners.
    pub async fn run_until_shutdown(&self) -> anyhow::Result<()> {
        tokio::signal::ctrl_c().await?;
        tracing::info!("shutting down");
        self.hub.shutdown();
        Ok(())
    }
}
