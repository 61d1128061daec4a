//! Link-file sidecars.
//!
//! A link file records that an external file mirrors a given hash, so the
//! store can serve it without copying the bytes in. The recorded stat is
//! re-checked on every resolution; a target that changed size invalidates
//! the link.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use kachery_core::Sha1Hash;

/// Allowed drift between a declared and an observed mtime. Filesystems
/// round sub-millisecond timestamps differently across stat calls.
pub const MTIME_TOLERANCE_MS: u64 = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkFile {
    pub path: PathBuf,

    #[serde(rename = "manifestSha1")]
    pub manifest_sha1: Option<Sha1Hash>,

    pub stat: LinkStat,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStat {
    pub size: u64,

    /// Milliseconds since the unix epoch.
    pub mtime: u64,
}

impl LinkFile {
    /// Stat the target and report whether the link still resolves to a
    /// file of the recorded size.
    pub async fn is_valid(&self) -> bool {
        match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta.is_file() && meta.len() == self.stat.size,
            Err(_) => false,
        }
    }
}

/// Observed size and mtime (ms) of a file on disk.
pub async fn stat_ms(path: &Path) -> std::io::Result<LinkStat> {
    let meta = tokio::fs::metadata(path).await?;
    let mtime = meta
        .modified()?
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    Ok(LinkStat {
        size: meta.len(),
        mtime,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_link_validity_tracks_target() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("data.bin");
        tokio::fs::write(&target, b"0123456789").await.unwrap();

        let stat = stat_ms(&target).await.unwrap();
        let link = LinkFile {
            path: target.clone(),
            manifest_sha1: None,
            stat: stat.clone(),
        };
        assert!(link.is_valid().await);

        tokio::fs::write(&target, b"0123").await.unwrap();
        assert!(!link.is_valid().await);

        tokio::fs::remove_file(&target).await.unwrap();
        assert!(!link.is_valid().await);
    }

    #[test]
    fn test_wire_form() {
        let link = LinkFile {
            path: PathBuf::from("/data/file.dat"),
            manifest_sha1: None,
            stat: LinkStat {
                size: 12,
                mtime: 1700000000000,
            },
        };
        let v = serde_json::to_value(&link).unwrap();
        assert_eq!(v["path"], "/data/file.dat");
        assert_eq!(v["manifestSha1"], serde_json::Value::Null);
        assert_eq!(v["stat"]["size"], 12);
    }
}
