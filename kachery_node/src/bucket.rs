//! Channel bucket access.
//!
//! Buckets are plain HTTPS object stores: unauthenticated HEAD/GET by
//! object path, writes only through pre-signed URLs minted elsewhere.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use rand::distr::{Alphanumeric, SampleString};
use std::sync::Arc;
use url::Url;

use kachery_core::{Error, FeedId, Result, Sha1Hash, SubfeedHash};
use kachery_store::ByteStream;

/// Map a bucket URI to its public https base URL:
/// `gs://B/P` becomes `https://storage.googleapis.com/B/P`; http(s) URIs
/// pass through.
pub fn bucket_uri_to_url(uri: &str) -> Result<Url> {
    if let Some(rest) = uri.strip_prefix("gs://") {
        return Url::parse(&format!("https://storage.googleapis.com/{rest}"))
            .map_err(|e| Error::protocol(format!("invalid bucket uri {uri}: {e}")));
    }
    if uri.starts_with("http://") || uri.starts_with("https://") {
        return Url::parse(uri)
            .map_err(|e| Error::protocol(format!("invalid bucket uri {uri}: {e}")));
    }
    Err(Error::protocol(format!(
        "unsupported bucket uri scheme: {uri}"
    )))
}

/// Bucket object path for file content.
pub fn bucket_file_path(sha1: &Sha1Hash) -> String {
    let (a, b, c) = sha1.fanout_prefixes();
    format!("sha1/{a}/{b}/{c}/{sha1}")
}

/// Bucket object directory for a subfeed (holds `subfeed.json` and one
/// object per message number).
pub fn bucket_subfeed_dir(feed_id: &FeedId, subfeed_hash: &SubfeedHash) -> String {
    let f = feed_id.as_str();
    let (a, b, c) = subfeed_hash.fanout_prefixes();
    format!(
        "feeds/{}/{}/{}/{}/subfeeds/{a}/{b}/{c}/{subfeed_hash}",
        &f[0..2],
        &f[2..4],
        &f[4..6],
        f
    )
}

/// Join an object path onto a bucket base URL.
pub fn object_url(base: &Url, path: &str) -> Result<Url> {
    let joined = format!(
        "{}/{}",
        base.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    Url::parse(&joined).map_err(|e| Error::protocol(format!("invalid object url: {e}")))
}

#[async_trait]
pub trait BucketClient: std::fmt::Debug + Send + Sync + 'static {
    /// Does an object exist at this URL?
    async fn head(&self, url: &Url) -> Result<bool>;

    /// Open a download stream; also reports Content-Length when the
    /// server provides one.
    async fn get_stream(&self, url: &Url) -> Result<(ByteStream, Option<u64>)>;

    /// Fetch and parse a JSON object; `None` on 404. `cache_bust` defeats
    /// stale CDN copies by appending a random query parameter.
    async fn get_json(&self, url: &Url, cache_bust: bool) -> Result<Option<serde_json::Value>>;

    /// Upload through a pre-signed URL.
    async fn put_signed(&self, url: &Url, bytes: Bytes) -> Result<()>;
}

pub type DynBucketClient = Arc<dyn BucketClient>;

#[derive(Debug, Clone, Default)]
pub struct HttpBucketClient {
    client: reqwest::Client,
}

impl HttpBucketClient {
    pub fn new() -> Self {
        Self::default()
    }
}

fn cache_busted(url: &Url) -> Url {
    let mut url = url.clone();
    let token = Alphanumeric.sample_string(&mut rand::rng(), 10);
    url.query_pairs_mut().append_pair("cb", &token);
    url
}

#[async_trait]
impl BucketClient for HttpBucketClient {
    async fn head(&self, url: &Url) -> Result<bool> {
        let response = self
            .client
            .head(url.clone())
            .send()
            .await
            .map_err(|e| Error::transient(format!("HEAD {url}: {e}")))?;
        match response.status() {
            s if s.is_success() => Ok(true),
            reqwest::StatusCode::NOT_FOUND => Ok(false),
            s => Err(Error::transient(format!("HEAD {url}: status {s}"))),
        }
    }

    async fn get_stream(&self, url: &Url) -> Result<(ByteStream, Option<u64>)> {
        let response = self
            .client
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
        let len = response.content_length();
        let stream = response.bytes_stream().map(|c| c.map_err(std::io::Error::other));
        Ok((Box::new(Box::pin(stream)), len))
    }

    async fn get_json(&self, url: &Url, cache_bust: bool) -> Result<Option<serde_json::Value>> {
        let url = if cache_bust { cache_busted(url) } else { url.clone() };
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| Error::transient(format!("GET {url}: {e}")))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Error::transient(format!(
                "GET {url}: status {}",
                response.status()
            )));
        }
        let value = response
            .json()
            .await
            .map_err(|e| Error::protocol(format!("GET {url}: invalid json: {e}")))?;
        Ok(Some(value))
    }

    async fn put_signed(&self, url: &Url, bytes: Bytes) -> Result<()> {
        let response = self
            .client
            .put(url.clone())
            .body(bytes)
            .send()
            .await
            .map_err(|e| Error::transient(format!("PUT {url}: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::transient(format!(
                "PUT {url}: status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gs_uri_mapping() {
        let url = bucket_uri_to_url("gs://my-bucket/some/prefix").unwrap();
        assert_eq!(
            url.as_str(),
            "https://storage.googleapis.com/my-bucket/some/prefix"
        );
        assert!(bucket_uri_to_url("s3://x").is_err());
        assert!(bucket_uri_to_url("http://127.0.0.1:8080/b").is_ok());
    }

    #[test]
    fn test_bucket_file_path() {
        let sha1 = Sha1Hash::new(b"hello\n");
        assert_eq!(
            bucket_file_path(&sha1),
            "sha1/f5/72/d3/f572d396fae9206628714fb2ce00f72e94f2258f"
        );
    }

    #[test]
    fn test_bucket_subfeed_dir() {
        let keypair = kachery_core::KeyPair::generate();
        let feed_id = keypair.public_key();
        let subfeed_hash = kachery_core::feed::subfeed_hash_for_name("default");
        let dir = bucket_subfeed_dir(&feed_id, &subfeed_hash);
        let f = feed_id.as_str();
        assert!(dir.starts_with(&format!("feeds/{}/{}/{}/{f}/subfeeds/", &f[0..2], &f[2..4], &f[4..6])));
        assert!(dir.ends_with(&subfeed_hash.to_hex()));
    }

    #[test]
    fn test_cache_bust_appends_query() {
        let url = Url::parse("https://example.org/feeds/subfeed.json").unwrap();
        let busted = cache_busted(&url);
        assert!(busted.query().unwrap().starts_with("cb="));
        assert_ne!(cache_busted(&url), cache_busted(&url));
    }

    #[tokio::test]
    async fn test_get_stream_reads_bucket_objects() {
        let server = crate::testing::TestBucketServer::start().await;
        let data: Vec<u8> = (0..50_000).map(|i| (i % 241) as u8).collect();
        server.insert("sha1/ab/cd/ef/object", data.clone());

        let client = HttpBucketClient::new();
        let (mut stream, len) = client
            .get_stream(&server.object_url("sha1/ab/cd/ef/object"))
            .await
            .unwrap();
        assert_eq!(len, Some(50_000));
        let mut received = Vec::new();
        while let Some(chunk) = stream.next().await {
            received.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(received, data);

        // A missing object maps to NotFound, not a transient failure.
        let err = client
            .get_stream(&server.object_url("sha1/ab/cd/ef/missing"))
            .await
            .map(|_| ())
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
