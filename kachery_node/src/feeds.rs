//! Local persistence of signed subfeed messages.
//!
//! The daemon consumes feed storage through the [`LocalFeedManager`]
//! trait; the shipped implementation appends JSON lines under a fan-out
//! tree mirroring the bucket subfeed layout. A batch is written with a
//! single appending write, so either the whole range lands on disk or
//! none of it does.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

use kachery_core::{Error, FeedId, Result, SignedSubfeedMessage, SubfeedHash};

#[async_trait]
pub trait LocalFeedManager: std::fmt::Debug + Send + Sync + 'static {
    /// All locally stored messages of a subfeed, in storage order. A
    /// subfeed that was never written is an empty list, not an error.
    async fn get_signed_subfeed_messages(
        &self,
        feed_id: &FeedId,
        subfeed_hash: &SubfeedHash,
    ) -> Result<Vec<SignedSubfeedMessage>>;

    /// Append a batch of messages. All-or-nothing per batch.
    async fn add_signed_messages_to_subfeed(
        &self,
        feed_id: &FeedId,
        subfeed_hash: &SubfeedHash,
        messages: &[SignedSubfeedMessage],
    ) -> Result<()>;
}

pub type DynLocalFeedManager = Arc<dyn LocalFeedManager>;

/// JSONL-file-backed feed storage under `<base_dir>/feeds/…`.
#[derive(Debug, Clone)]
pub struct FileFeedManager {
    base_dir: PathBuf,
}

impl FileFeedManager {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        FileFeedManager {
            base_dir: base_dir.into(),
        }
    }

    fn messages_path(&self, feed_id: &FeedId, subfeed_hash: &SubfeedHash) -> PathBuf {
        let f = feed_id.as_str();
        let (a, b, c) = subfeed_hash.fanout_prefixes();
        self.base_dir
            .join("feeds")
            .join(&f[0..2])
            .join(&f[2..4])
            .join(&f[4..6])
            .join(f)
            .join("subfeeds")
            .join(a)
            .join(b)
            .join(c)
            .join(subfeed_hash.to_hex())
            .join("messages.jsonl")
    }
}

#[async_trait]
impl LocalFeedManager for FileFeedManager {
    async fn get_signed_subfeed_messages(
        &self,
        feed_id: &FeedId,
        subfeed_hash: &SubfeedHash,
    ) -> Result<Vec<SignedSubfeedMessage>> {
        let path = self.messages_path(feed_id, subfeed_hash);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut messages = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let msg: SignedSubfeedMessage = serde_json::from_str(line).map_err(|e| {
                Error::protocol(format!("corrupt subfeed log {path:?}: {e}"))
            })?;
            messages.push(msg);
        }
        Ok(messages)
    }

    async fn add_signed_messages_to_subfeed(
        &self,
        feed_id: &FeedId,
        subfeed_hash: &SubfeedHash,
        messages: &[SignedSubfeedMessage],
    ) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let path = self.messages_path(feed_id, subfeed_hash);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut batch = String::new();
        for msg in messages {
            batch.push_str(&serde_json::to_string(msg)?);
            batch.push('\n');
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(batch.as_bytes()).await?;
        file.sync_all().await?;
        Ok(())
    }
}
