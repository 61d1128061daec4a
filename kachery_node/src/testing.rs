//! In-process doubles for integration tests.
//!
//! The bucket double is a real HTTP server over an in-memory object map,
//! so both the bucket client and the store's direct bucket ingest exercise
//! their production code paths against it. Pubsub is an in-memory fan-out.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use url::Url;

use kachery_core::Result;

use crate::bucket::object_url;
use crate::hub::{PubsubEnvelope, PubsubTransport, SignedUrlMinter};

/// A minimal bucket: HEAD/GET/PUT over HTTP against a shared map.
#[derive(Debug, Clone)]
pub struct TestBucketServer {
    base_url: Url,
    objects: Arc<Mutex<HashMap<String, Bytes>>>,
    active_gets: Arc<AtomicUsize>,
    max_concurrent_gets: Arc<AtomicUsize>,
    get_delay: Arc<Mutex<Duration>>,
}

impl TestBucketServer {
    pub async fn start() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = TestBucketServer {
            base_url: Url::parse(&format!("http://{addr}")).unwrap(),
            objects: Arc::default(),
            active_gets: Arc::default(),
            max_concurrent_gets: Arc::default(),
            get_delay: Arc::new(Mutex::new(Duration::ZERO)),
        };
        let accept = server.clone();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                let server = accept.clone();
                tokio::spawn(async move {
                    let _ = server.handle_connection(socket).await;
                });
            }
        });
        server
    }

    /// Usable as a `channelBucketUri` (http URIs pass through the mapper).
    pub fn bucket_uri(&self) -> String {
        self.base_url.as_str().trim_end_matches('/').to_owned()
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn object_url(&self, path: &str) -> Url {
        object_url(&self.base_url, path).unwrap()
    }

    pub fn insert(&self, path: &str, bytes: impl Into<Bytes>) {
        self.objects
            .lock()
            .unwrap()
            .insert(path.trim_start_matches('/').to_owned(), bytes.into());
    }

    pub fn get(&self, path: &str) -> Option<Bytes> {
        self.objects
            .lock()
            .unwrap()
            .get(path.trim_start_matches('/'))
            .cloned()
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    /// Delay every GET response, to make concurrency observable.
    pub fn set_get_delay(&self, delay: Duration) {
        *self.get_delay.lock().unwrap() = delay;
    }

    /// Highest number of GETs that were in flight at once.
    pub fn max_concurrent_gets(&self) -> usize {
        self.max_concurrent_gets.load(Ordering::Relaxed)
    }

    async fn handle_connection(&self, mut socket: tokio::net::TcpStream) -> std::io::Result<()> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        let header_end = loop {
            let n = socket.read(&mut chunk).await?;
            if n == 0 {
                return Ok(());
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = find_header_end(&buf) {
                break pos;
            }
        };

        let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
        let mut lines = head.lines();
        let request_line = lines.next().unwrap_or_default().to_owned();
        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or_default().to_owned();
        let target = parts.next().unwrap_or_default().to_owned();
        // Strip cache-bust style query parameters.
        let path = target
            .split('?')
            .next()
            .unwrap_or_default()
            .trim_start_matches('/')
            .to_owned();
        let content_length: usize = lines
            .filter_map(|l| l.split_once(':'))
            .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, v)| v.trim().parse().ok())
            .unwrap_or(0);

        match method.as_str() {
            "PUT" => {
                let mut body = buf[header_end + 4..].to_vec();
                while body.len() < content_length {
                    let n = socket.read(&mut chunk).await?;
                    if n == 0 {
                        break;
                    }
                    body.extend_from_slice(&chunk[..n]);
                }
                self.objects
                    .lock()
                    .unwrap()
                    .insert(path, Bytes::from(body));
                socket
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                    .await?;
            }
            "HEAD" | "GET" => {
                let object = self.objects.lock().unwrap().get(&path).cloned();
                match object {
                    Some(bytes) => {
                        if method == "GET" {
                            let delay = *self.get_delay.lock().unwrap();
                            let active = self.active_gets.fetch_add(1, Ordering::Relaxed) + 1;
                            self.max_concurrent_gets
                                .fetch_max(active, Ordering::Relaxed);
                            if delay > Duration::ZERO {
                                tokio::time::sleep(delay).await;
                            }
                        }
                        let header = format!(
                            "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                            bytes.len()
                        );
                        socket.write_all(header.as_bytes()).await?;
                        if method == "GET" {
                            socket.write_all(&bytes).await?;
                            self.active_gets.fetch_sub(1, Ordering::Relaxed);
                        }
                    }
                    None => {
                        socket
                            .write_all(
                                b"HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                            )
                            .await?;
                    }
                }
            }
            _ => {
                socket
                    .write_all(
                        b"HTTP/1.1 405 Method Not Allowed\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                    )
                    .await?;
            }
        }
        socket.shutdown().await
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Mints plain PUT URLs straight into a [`TestBucketServer`].
#[derive(Debug)]
pub struct TestUrlMinter {
    base_url: Url,
}

impl TestUrlMinter {
    pub fn new(bucket: &TestBucketServer) -> Self {
        TestUrlMinter {
            base_url: bucket.base_url().clone(),
        }
    }
}

#[async_trait]
impl SignedUrlMinter for TestUrlMinter {
    async fn mint_upload_url(
        &self,
        _channel_name: &str,
        object_path: &str,
        _size: u64,
    ) -> Result<Url> {
        object_url(&self.base_url, object_path)
    }
}

/// In-memory pubsub fan-out keyed by sub-channel name.
#[derive(Debug, Default)]
pub struct MemoryPubsub {
    subscribers: Mutex<HashMap<String, Vec<mpsc::Sender<PubsubEnvelope>>>>,
}

impl MemoryPubsub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl PubsubTransport for MemoryPubsub {
    async fn publish(&self, pubsub_channel: &str, envelope: PubsubEnvelope) -> Result<()> {
        let senders = {
            let subscribers = self.subscribers.lock().unwrap();
            subscribers.get(pubsub_channel).cloned().unwrap_or_default()
        };
        for sender in senders {
            let _ = sender.send(envelope.clone()).await;
        }
        Ok(())
    }

    async fn subscribe(&self, pubsub_channel: &str) -> Result<mpsc::Receiver<PubsubEnvelope>> {
        let (tx, rx) = mpsc::channel(64);
        self.subscribers
            .lock()
            .unwrap()
            .entry(pubsub_channel.to_owned())
            .or_default()
            .push(tx);
        Ok(rx)
    }
}
