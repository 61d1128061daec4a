//! In-memory verified view of a subfeed, one instance per
//! `(feed_id, subfeed_hash)`.
//!
//! On open, the backing log is loaded and the whole signature chain is
//! verified; a subfeed that fails verification is unusable until the
//! inconsistency is resolved out of band. Appends go through a single
//! writer mutex, persist before splicing into memory, and quietly drop
//! idempotent replays.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use kachery_core::feed::verify_chain;
use kachery_core::{Error, FeedId, Result, Signature, SignedSubfeedMessage, SubfeedHash};

use crate::feeds::{DynLocalFeedManager, LocalFeedManager as _};

#[derive(Debug)]
pub struct Subfeed {
    feed_id: FeedId,
    subfeed_hash: SubfeedHash,
    feed_manager: DynLocalFeedManager,
    /// Serializes writers; readers take it briefly to snapshot.
    state: Mutex<Vec<SignedSubfeedMessage>>,
}

impl Subfeed {
    /// Load from the backing log, verifying message numbers, the
    /// previous-signature chain, and every Ed25519 signature. A
    /// remote-only subfeed loads empty.
    pub async fn load(
        feed_id: FeedId,
        subfeed_hash: SubfeedHash,
        feed_manager: DynLocalFeedManager,
    ) -> Result<Self> {
        let messages = feed_manager
            .get_signed_subfeed_messages(&feed_id, &subfeed_hash)
            .await?;
        verify_chain(&messages, &feed_id, 0, None)?;
        Ok(Subfeed {
            feed_id,
            subfeed_hash,
            feed_manager,
            state: Mutex::new(messages),
        })
    }

    pub fn feed_id(&self) -> &FeedId {
        &self.feed_id
    }

    pub fn subfeed_hash(&self) -> &SubfeedHash {
        &self.subfeed_hash
    }

    pub async fn num_messages(&self) -> u64 {
        self.state.lock().await.len() as u64
    }

    /// Messages `[start, end)`, clamped to the current length.
    pub async fn get_signed_messages(&self, start: u64, end: u64) -> Vec<SignedSubfeedMessage> {
        let state = self.state.lock().await;
        let len = state.len() as u64;
        let start = start.min(len) as usize;
        let end = end.min(len) as usize;
        if start >= end {
            return Vec::new();
        }
        state[start..end].to_vec()
    }

    /// Signature of the last message, the chain anchor for continuations.
    pub async fn tail_signature(&self) -> Option<Signature> {
        self.state.lock().await.last().map(|m| m.signature.clone())
    }

    /// Append a batch of signed messages.
    ///
    /// The first incoming number must be 0 for an empty subfeed, and at
    /// most one past the current tail otherwise. Messages at positions
    /// already present are dropped quietly; the extending suffix is
    /// verified against the chain, persisted as one batch, and then
    /// spliced into memory. Returns the new message count.
    pub async fn add_signed_messages(
        &self,
        messages: Vec<SignedSubfeedMessage>,
    ) -> Result<u64> {
        let mut state = self.state.lock().await;
        let len = state.len() as u64;
        let Some(first) = messages.first() else {
            return Ok(len);
        };
        if state.is_empty() {
            if first.body.message_number != 0 {
                return Err(Error::precondition(format!(
                    "first message of an empty subfeed must be number 0, got {}",
                    first.body.message_number
                )));
            }
        } else if first.body.message_number > len {
            return Err(Error::precondition(format!(
                "append starts at {} but subfeed has {} messages",
                first.body.message_number, len
            )));
        }

        let fresh: Vec<SignedSubfeedMessage> = messages
            .into_iter()
            .filter(|m| m.body.message_number >= len)
            .collect();
        if fresh.is_empty() {
            return Ok(len);
        }
        let tail = state.last().map(|m| m.signature.clone());
        verify_chain(&fresh, &self.feed_id, len, tail.as_ref())?;

        self.feed_manager
            .add_signed_messages_to_subfeed(&self.feed_id, &self.subfeed_hash, &fresh)
            .await?;
        state.extend(fresh);
        Ok(state.len() as u64)
    }
}

/// Registry of open subfeeds, so every `(feed_id, subfeed_hash)` resolves
/// to one shared instance per process.
#[derive(Debug)]
pub struct FeedManager {
    local: DynLocalFeedManager,
    subfeeds: Mutex<HashMap<(FeedId, SubfeedHash), Arc<Subfeed>>>,
}

impl FeedManager {
    pub fn new(local: DynLocalFeedManager) -> Self {
        FeedManager {
            local,
            subfeeds: Mutex::new(HashMap::new()),
        }
    }

    /// Open (loading and verifying if necessary) a subfeed.
    pub async fn subfeed(
        &self,
        feed_id: &FeedId,
        subfeed_hash: &SubfeedHash,
    ) -> Result<Arc<Subfeed>> {
        let mut subfeeds = self.subfeeds.lock().await;
        if let Some(subfeed) = subfeeds.get(&(feed_id.clone(), *subfeed_hash)) {
            return Ok(subfeed.clone());
        }
        let subfeed = Arc::new(
            Subfeed::load(feed_id.clone(), *subfeed_hash, self.local.clone()).await?,
        );
        subfeeds.insert((feed_id.clone(), *subfeed_hash), subfeed.clone());
        Ok(subfeed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feeds::{FileFeedManager, LocalFeedManager};
    use kachery_core::KeyPair;
    use kachery_core::feed::subfeed_hash_for_name;
    use serde_json::json;

    fn chain(keypair: &KeyPair, n: u64) -> Vec<SignedSubfeedMessage> {
        let mut messages = Vec::new();
        let mut prev = None;
        for i in 0..n {
            let msg =
                SignedSubfeedMessage::sign_new(keypair, json!({"i": i}), i, prev.clone(), 1000 + i);
            prev = Some(msg.signature.clone());
            messages.push(msg);
        }
        messages
    }

    fn setup() -> (tempfile::TempDir, DynLocalFeedManager, KeyPair, SubfeedHash) {
        let dir = tempfile::tempdir().unwrap();
        let feeds: DynLocalFeedManager = Arc::new(FileFeedManager::new(dir.path()));
        (dir, feeds, KeyPair::generate(), subfeed_hash_for_name("main"))
    }

    #[tokio::test]
    async fn test_append_and_range_read() {
        let (_dir, feeds, keypair, hash) = setup();
        let subfeed = Subfeed::load(keypair.public_key(), hash, feeds)
            .await
            .unwrap();

        let messages = chain(&keypair, 3);
        assert_eq!(subfeed.add_signed_messages(messages.clone()).await.unwrap(), 3);
        assert_eq!(subfeed.num_messages().await, 3);
        assert_eq!(subfeed.get_signed_messages(1, 3).await, messages[1..3]);
        assert_eq!(subfeed.get_signed_messages(2, 100).await, messages[2..]);
        assert!(subfeed.get_signed_messages(5, 9).await.is_empty());
    }

    #[tokio::test]
    async fn test_replay_is_idempotent() {
        let (_dir, feeds, keypair, hash) = setup();
        let subfeed = Subfeed::load(keypair.public_key(), hash, feeds.clone())
            .await
            .unwrap();

        let messages = chain(&keypair, 3);
        subfeed.add_signed_messages(messages.clone()).await.unwrap();
        // Overlapping replay: positions 0..3 dropped quietly.
        assert_eq!(subfeed.add_signed_messages(messages.clone()).await.unwrap(), 3);
        assert_eq!(subfeed.num_messages().await, 3);

        // One copy on disk as well.
        let stored = feeds
            .get_signed_subfeed_messages(&keypair.public_key(), &hash)
            .await
            .unwrap();
        assert_eq!(stored, messages);
    }

    #[tokio::test]
    async fn test_append_preconditions() {
        let (_dir, feeds, keypair, hash) = setup();
        let subfeed = Subfeed::load(keypair.public_key(), hash, feeds)
            .await
            .unwrap();

        let messages = chain(&keypair, 4);
        // Empty subfeed must start at 0.
        assert!(matches!(
            subfeed.add_signed_messages(messages[1..2].to_vec()).await,
            Err(Error::PreconditionFailure(_))
        ));
        subfeed.add_signed_messages(messages[..2].to_vec()).await.unwrap();
        // Gap past the tail.
        assert!(matches!(
            subfeed.add_signed_messages(messages[3..].to_vec()).await,
            Err(Error::PreconditionFailure(_))
        ));
        // Contiguous continuation is fine.
        assert_eq!(subfeed.add_signed_messages(messages[2..].to_vec()).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_append_rejects_foreign_signature() {
        let (_dir, feeds, keypair, hash) = setup();
        let subfeed = Subfeed::load(keypair.public_key(), hash, feeds)
            .await
            .unwrap();

        let intruder = KeyPair::generate();
        let forged = chain(&intruder, 1);
        assert!(matches!(
            subfeed.add_signed_messages(forged).await,
            Err(Error::IntegrityViolation(_))
        ));
        assert_eq!(subfeed.num_messages().await, 0);
    }

    #[tokio::test]
    async fn test_corrupt_log_fails_load() {
        let (_dir, feeds, keypair, hash) = setup();
        let mut messages = chain(&keypair, 3);
        messages[1].body.message = json!({"i": "tampered"});
        feeds
            .add_signed_messages_to_subfeed(&keypair.public_key(), &hash, &messages)
            .await
            .unwrap();

        let err = Subfeed::load(keypair.public_key(), hash, feeds)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IntegrityViolation(_)));
    }

    #[tokio::test]
    async fn test_concurrent_appends_converge() {
        let (_dir, feeds, keypair, hash) = setup();
        let subfeed = Arc::new(
            Subfeed::load(keypair.public_key(), hash, feeds)
                .await
                .unwrap(),
        );

        let messages = chain(&keypair, 5);
        let mut tasks = Vec::new();
        for _ in 0..4 {
            let subfeed = subfeed.clone();
            let messages = messages.clone();
            tasks.push(tokio::spawn(async move {
                subfeed.add_signed_messages(messages).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(subfeed.num_messages().await, 5);
        assert_eq!(subfeed.get_signed_messages(0, 5).await, messages);
    }

    #[tokio::test]
    async fn test_manager_shares_instances() {
        let (_dir, feeds, keypair, hash) = setup();
        let manager = FeedManager::new(feeds);
        let a = manager.subfeed(&keypair.public_key(), &hash).await.unwrap();
        let b = manager.subfeed(&keypair.public_key(), &hash).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
