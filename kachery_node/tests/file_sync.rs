use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

use kachery_core::{Error, FileKey, KeyPair, Sha1Hash};
use kachery_node::testing::{MemoryPubsub, TestBucketServer, TestUrlMinter};
use kachery_node::{
    ChannelMembership, KacheryNode, LoadFileOpts, NodeConfig, PubsubEnvelope, PubsubMessageBody,
    PubsubTransport, UploadStatus,
};
use kachery_node::config::{ChannelAuthorization, ChannelRoles};

const CHANNEL: &str = "testchannel";

fn membership(bucket: &TestBucketServer, roles: ChannelRoles) -> ChannelMembership {
    ChannelMembership {
        channel_name: CHANNEL.into(),
        channel_bucket_uri: bucket.bucket_uri(),
        roles: roles.clone(),
        authorization: ChannelAuthorization { permissions: roles },
    }
}

fn requester_roles() -> ChannelRoles {
    ChannelRoles {
        request_files: true,
        ..Default::default()
    }
}

fn provider_roles() -> ChannelRoles {
    ChannelRoles {
        provide_files: true,
        ..Default::default()
    }
}

async fn start_node(
    bucket: &TestBucketServer,
    pubsub: &Arc<MemoryPubsub>,
    roles: ChannelRoles,
) -> (tempfile::TempDir, KacheryNode) {
    let dir = tempdir().unwrap();
    let config = NodeConfig {
        label: "test".into(),
        owner: None,
        storage_dir: dir.path().to_path_buf(),
        channels: vec![membership(bucket, roles)],
    };
    let node = KacheryNode::start(
        config,
        KeyPair::generate(),
        pubsub.clone(),
        Arc::new(TestUrlMinter::new(bucket)),
    )
    .await
    .unwrap();
    (dir, node)
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn opts() -> LoadFileOpts {
    LoadFileOpts {
        channel_name: Some(CHANNEL.into()),
        label: "test load".into(),
    }
}

/// The received-bytes counter is updated by an observer task, so give it
/// a moment to land.
async fn wait_for_bytes_received(node: &KacheryNode, expected: u64) {
    for _ in 0..100 {
        let received = node
            .stats()
            .snapshot()
            .get(CHANNEL)
            .map(|s| s.bytes_received)
            .unwrap_or(0);
        if received == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("bytes_received never reached {expected}");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_direct_load_from_bucket() {
    let bucket = TestBucketServer::start().await;
    let pubsub = MemoryPubsub::new();
    let (_dir, node) = start_node(&bucket, &pubsub, requester_roles()).await;

    let data = patterned(80_000);
    let sha1 = Sha1Hash::new(&data);
    bucket.insert(&kachery_node::bucket::bucket_file_path(&sha1), data.clone());

    let key = FileKey::from_sha1(sha1);
    let found = node.downloader().load_file_async(&key, &opts()).await.unwrap();
    assert_eq!(found.size, 80_000);
    assert_eq!(std::fs::read(found.local_path.unwrap()).unwrap(), data);
    wait_for_bytes_received(&node, 80_000).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_file_round_trip_between_nodes() {
    let bucket = TestBucketServer::start().await;
    let pubsub = MemoryPubsub::new();
    let (_provider_dir, provider) = start_node(&bucket, &pubsub, provider_roles()).await;
    let (_requester_dir, requester) = start_node(&bucket, &pubsub, requester_roles()).await;

    let data = patterned(120_000);
    let sha1 = Sha1Hash::new(&data);
    provider
        .storage()
        .store_file_from_buffer(&sha1, &data)
        .await
        .unwrap();

    let key = FileKey::from_sha1(sha1);
    let found = requester
        .downloader()
        .load_file_async(&key, &opts())
        .await
        .unwrap();
    assert_eq!(found.size, 120_000);
    assert!(requester.storage().has_local_file(&key).await.unwrap());

    assert!(provider.stats().snapshot()[CHANNEL].bytes_sent >= 120_000);
    wait_for_bytes_received(&requester, 120_000).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_manifest_load_between_nodes() {
    let bucket = TestBucketServer::start().await;
    let pubsub = MemoryPubsub::new();
    let (_provider_dir, provider) = start_node(&bucket, &pubsub, provider_roles()).await;
    let (_requester_dir, requester) = start_node(&bucket, &pubsub, requester_roles()).await;

    // Two chunks' worth of content, ingested at the provider.
    let data = patterned(30_000_000);
    let outcome = {
        let chunks: Vec<Result<bytes::Bytes, std::io::Error>> = data
            .chunks(1 << 20)
            .map(|c| Ok(bytes::Bytes::copy_from_slice(c)))
            .collect();
        provider
            .storage()
            .store_file_from_stream(
                Box::new(tokio_stream::iter(chunks)),
                data.len() as u64,
                false,
            )
            .await
            .unwrap()
    };
    let manifest_sha1 = outcome.manifest_sha1.unwrap();

    let key = FileKey::with_manifest(outcome.sha1, manifest_sha1);
    let stream = requester.downloader().load_file(&key, &opts()).await.unwrap();
    stream.wait().await.unwrap();

    // Progress aggregated over the chunk loads.
    assert_eq!(stream.size(), Some(30_000_000));
    assert_eq!(stream.bytes_loaded(), 30_000_000);

    let found = requester
        .storage()
        .find_file(&key)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.size, 30_000_000);
    assert_eq!(std::fs::read(found.local_path.unwrap()).unwrap(), data);

    // The fan-out never exceeded its concurrency bound.
    assert!(bucket.max_concurrent_gets() <= 5);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_request_is_answered_after_late_ingest() {
    let bucket = TestBucketServer::start().await;
    let pubsub = MemoryPubsub::new();
    let (_provider_dir, provider) = start_node(&bucket, &pubsub, provider_roles()).await;
    let (_requester_dir, requester) = start_node(&bucket, &pubsub, requester_roles()).await;

    let data = patterned(60_000);
    let sha1 = Sha1Hash::new(&data);
    let key = FileKey::from_sha1(sha1);

    // The provider sees the request before it has the content; the ingest
    // lands shortly after, and the provider serves it off the store's
    // install event.
    let provider_storage = provider.storage().clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        provider_storage
            .store_file_from_buffer(&sha1, &data)
            .await
            .unwrap();
    });

    let found = requester
        .downloader()
        .load_file_async(&key, &opts())
        .await
        .unwrap();
    assert_eq!(found.size, 60_000);
    assert!(requester.storage().has_local_file(&key).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_request_file_times_out_without_providers() {
    let bucket = TestBucketServer::start().await;
    let pubsub = MemoryPubsub::new();
    let (_dir, node) = start_node(&bucket, &pubsub, requester_roles()).await;

    let key = FileKey::from_sha1(Sha1Hash::new(b"nobody has this"));
    let t0 = tokio::time::Instant::now();
    let err = node
        .downloader()
        .load_file_async(&key, &opts())
        .await
        .unwrap_err();
    let elapsed = t0.elapsed();

    assert!(matches!(err, Error::NotFound(msg) if msg.contains("Unable to find file")));
    // No status ever arrives, so the waiter fails after the initial stage
    // deadline.
    assert!(elapsed >= Duration::from_secs(3), "failed too early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(10), "failed too late: {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn test_request_file_stalls_in_pending() {
    let bucket = TestBucketServer::start().await;
    let pubsub = MemoryPubsub::new();
    let (_dir, node) = start_node(&bucket, &pubsub, requester_roles()).await;

    // A degenerate provider that acknowledges requests but never uploads.
    let provider_keypair = KeyPair::generate();
    let mut requests = pubsub
        .subscribe(&format!("{CHANNEL}-requestFiles"))
        .await
        .unwrap();
    let pubsub_for_provider = pubsub.clone();
    tokio::spawn(async move {
        while let Some(envelope) = requests.recv().await {
            let PubsubMessageBody::RequestFile { file_key } = envelope.body else {
                continue;
            };
            let reply = PubsubEnvelope::sign_new(
                &provider_keypair,
                PubsubMessageBody::UploadFileStatus {
                    file_key,
                    status: UploadStatus::Pending,
                },
            );
            let _ = pubsub_for_provider
                .publish(&format!("{CHANNEL}-provideFiles"), reply)
                .await;
        }
    });

    let key = FileKey::from_sha1(Sha1Hash::new(b"stuck in pending"));
    let t0 = tokio::time::Instant::now();
    let err = node
        .downloader()
        .load_file_async(&key, &opts())
        .await
        .unwrap_err();
    let elapsed = t0.elapsed();

    assert!(matches!(err, Error::NotFound(msg) if msg.contains("Unable to find file")));
    // The pending stage got its 30 s and never advanced.
    assert!(elapsed >= Duration::from_secs(30), "failed too early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(45), "failed too late: {elapsed:?}");
}
