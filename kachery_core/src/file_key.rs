//! File identity.
//!
//! A [`FileKey`] names file content by SHA-1. It may additionally carry a
//! `manifestSha1` (the file is large and delivered in chunks described by a
//! manifest) or a `chunkOf` reference (the content is a byte range of
//! another file). Exactly the fields present are meaningful: two keys are
//! equal iff their canonical serializations are equal, which the derived
//! equality reproduces.

use serde::{Deserialize, Serialize};

use crate::canonical::to_canonical_json;
use crate::hash::Sha1Hash;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileKey {
    pub sha1: Sha1Hash,

    #[serde(
        rename = "manifestSha1",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub manifest_sha1: Option<Sha1Hash>,

    #[serde(rename = "chunkOf", skip_serializing_if = "Option::is_none", default)]
    pub chunk_of: Option<Box<ChunkOf>>,
}

/// A byte range of another file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChunkOf {
    #[serde(rename = "fileKey")]
    pub file_key: FileKey,

    #[serde(rename = "startByte")]
    pub start_byte: u64,

    #[serde(rename = "endByte")]
    pub end_byte: u64,
}

impl FileKey {
    /// Key for whole-file content.
    pub fn from_sha1(sha1: Sha1Hash) -> Self {
        FileKey {
            sha1,
            manifest_sha1: None,
            chunk_of: None,
        }
    }

    /// Key for a large file whose chunk layout is described by the manifest
    /// stored under `manifest_sha1`.
    pub fn with_manifest(sha1: Sha1Hash, manifest_sha1: Sha1Hash) -> Self {
        FileKey {
            sha1,
            manifest_sha1: Some(manifest_sha1),
            chunk_of: None,
        }
    }

    /// Key for the byte range `[start_byte, end_byte)` of `parent`, whose
    /// own content hashes to `sha1`.
    pub fn chunk(sha1: Sha1Hash, parent: FileKey, start_byte: u64, end_byte: u64) -> Self {
        FileKey {
            sha1,
            manifest_sha1: None,
            chunk_of: Some(Box::new(ChunkOf {
                file_key: parent,
                start_byte,
                end_byte,
            })),
        }
    }

    /// The canonical serialization, usable as a map key.
    pub fn canonical_string(&self) -> String {
        // FileKey serialization cannot fail
        to_canonical_json(&serde_json::to_value(self).unwrap())
    }
}

impl std::fmt::Display for FileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.chunk_of {
            Some(c) => write!(
                f,
                "{} (chunk {}..{} of {})",
                self.sha1.fmt_short(),
                c.start_byte,
                c.end_byte,
                c.file_key.sha1.fmt_short()
            ),
            None => f.write_str(&self.sha1.fmt_short()),
        }
    }
}
