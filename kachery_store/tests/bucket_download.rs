use tempfile::tempdir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use url::Url;

use kachery_core::{Error, FileKey, Sha1Hash};
use kachery_store::KacheryStorageManager;

/// Serve one HTTP response per connection on an ephemeral port.
async fn serve_bytes(body: Vec<u8>) -> Url {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let body = body.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let header = format!(
                    "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                    body.len()
                );
                let _ = socket.write_all(header.as_bytes()).await;
                let _ = socket.write_all(&body).await;
            });
        }
    });
    Url::parse(&format!("http://{addr}/sha1/obj")).unwrap()
}

#[tokio::test]
async fn test_bucket_download_installs_matching_content() {
    let dir = tempdir().unwrap();
    let store = KacheryStorageManager::new(dir.path());

    let data: Vec<u8> = (0..100_000u32).map(|i| (i % 249) as u8).collect();
    let sha1 = Sha1Hash::new(&data);
    let url = serve_bytes(data.clone()).await;

    let stream = store.store_file_from_bucket_url(url, sha1);
    stream.wait().await.unwrap();
    assert_eq!(stream.size(), Some(100_000));
    assert_eq!(stream.bytes_loaded(), 100_000);

    let found = store
        .find_file(&FileKey::from_sha1(sha1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.size, 100_000);
    assert_eq!(std::fs::read(found.local_path.unwrap()).unwrap(), data);
}

#[tokio::test]
async fn test_bucket_download_hash_mismatch_is_fatal() {
    let dir = tempdir().unwrap();
    let store = KacheryStorageManager::new(dir.path());

    let url = serve_bytes(b"tampered bytes".to_vec()).await;
    let expected = Sha1Hash::new(b"the real content");

    let stream = store.store_file_from_bucket_url(url, expected);
    let err = stream.wait().await.unwrap_err();
    assert!(matches!(err, Error::IntegrityViolation(_)));

    // Nothing installed, temp file removed.
    assert!(
        !store
            .has_local_file(&FileKey::from_sha1(expected))
            .await
            .unwrap()
    );
    let tmp_entries = std::fs::read_dir(dir.path().join("tmp"))
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(tmp_entries, 0);
}

#[tokio::test]
async fn test_bucket_download_cancel_cleans_up() {
    let dir = tempdir().unwrap();
    let store = KacheryStorageManager::new(dir.path());

    // A listener that accepts but sends only headers, then stalls.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let Ok((mut socket, _)) = listener.accept().await else {
            return;
        };
        let mut buf = [0u8; 4096];
        let _ = socket.read(&mut buf).await;
        let _ = socket
            .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 1000000\r\n\r\n")
            .await;
        // Hold the socket open without sending the body.
        tokio::time::sleep(std::time::Duration::from_secs(30)).await;
    });

    let url = Url::parse(&format!("http://{addr}/sha1/obj")).unwrap();
    let expected = Sha1Hash::new(b"whatever");
    let stream = store.store_file_from_bucket_url(url, expected);

    // Give the transfer a moment to open its temp file, then cancel.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    stream.cancel();
    assert_eq!(stream.wait().await, Err(Error::Cancelled));

    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    let tmp_entries = std::fs::read_dir(dir.path().join("tmp"))
        .map(|entries| entries.count())
        .unwrap_or(0);
    assert_eq!(tmp_entries, 0);
}
