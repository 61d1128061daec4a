//! Chunk manifests for large files.
//!
//! A manifest describes the fixed-size chunk decomposition of a file so
//! that transfers can be bounded and parallelized. The manifest is itself
//! stored as a regular content-addressed file in its canonical JSON form.

use serde::{Deserialize, Serialize};

use crate::canonical::canonical_bytes;
use crate::error::{Error, Result};
use crate::hash::{Sha1Hash, Sha1Hasher};

/// Fixed chunk size: every chunk except possibly the last is exactly this
/// many bytes.
pub const CHUNK_SIZE: u64 = 20_000_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestChunk {
    pub start: u64,
    pub end: u64,
    pub sha1: Sha1Hash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileManifest {
    pub size: u64,
    pub sha1: Sha1Hash,
    pub chunks: Vec<ManifestChunk>,
}

impl FileManifest {
    /// Parse and validate manifest bytes fetched from disk or a bucket.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let manifest: FileManifest = serde_json::from_slice(bytes)
            .map_err(|e| Error::protocol(format!("malformed manifest: {e}")))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Check the chunk layout invariants: contiguous coverage from 0 to
    /// `size`, every chunk except possibly the last exactly [`CHUNK_SIZE`]
    /// bytes, none larger.
    pub fn validate(&self) -> Result<()> {
        if self.chunks.is_empty() {
            if self.size != 0 {
                return Err(Error::protocol("manifest has no chunks for nonzero size"));
            }
            return Ok(());
        }
        if self.chunks[0].start != 0 {
            return Err(Error::protocol("manifest chunks do not start at 0"));
        }
        for pair in self.chunks.windows(2) {
            if pair[0].end != pair[1].start {
                return Err(Error::protocol(format!(
                    "manifest chunks not contiguous at byte {}",
                    pair[0].end
                )));
            }
        }
        for (i, chunk) in self.chunks.iter().enumerate() {
            if chunk.end <= chunk.start {
                return Err(Error::protocol("manifest chunk has nonpositive length"));
            }
            let len = chunk.end - chunk.start;
            if len > CHUNK_SIZE {
                return Err(Error::protocol(format!(
                    "manifest chunk {i} exceeds {CHUNK_SIZE} bytes"
                )));
            }
            if len != CHUNK_SIZE && i + 1 != self.chunks.len() {
                return Err(Error::protocol(format!(
                    "manifest chunk {i} is short but not last"
                )));
            }
        }
        if self.chunks.last().unwrap().end != self.size {
            return Err(Error::protocol("manifest chunks do not cover the file"));
        }
        Ok(())
    }

    /// The canonical JSON bytes under which this manifest is stored.
    pub fn to_canonical_bytes(&self) -> Vec<u8> {
        // FileManifest serialization cannot fail
        canonical_bytes(self).unwrap()
    }
}

/// Accumulates chunk hashes while a stream is being ingested.
///
/// Feed bytes in arrival order via [`update`](Self::update); a chunk is cut
/// whenever the buffered window reaches the chunk size, and the trailing
/// remainder (if any) is emitted on [`finalize`](Self::finalize). Chunk
/// indices therefore come out strictly in stream order, but emissions are
/// not evenly spaced in time: a partial window sits buffered until enough
/// bytes arrive or the stream ends.
pub struct ManifestBuilder {
    chunk_size: u64,
    window: Vec<u8>,
    next_start: u64,
    chunks: Vec<ManifestChunk>,
}

impl ManifestBuilder {
    pub fn new() -> Self {
        Self::with_chunk_size(CHUNK_SIZE)
    }

    pub(crate) fn with_chunk_size(chunk_size: u64) -> Self {
        ManifestBuilder {
            chunk_size,
            window: Vec::new(),
            next_start: 0,
            chunks: Vec::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.window.extend_from_slice(data);
        while self.window.len() as u64 >= self.chunk_size {
            let rest = self.window.split_off(self.chunk_size as usize);
            self.emit_window();
            self.window = rest;
        }
    }

    fn emit_window(&mut self) {
        let mut hasher = Sha1Hasher::new();
        hasher.update(&self.window);
        let start = self.next_start;
        let end = start + self.window.len() as u64;
        self.chunks.push(ManifestChunk {
            start,
            end,
            sha1: hasher.finalize(),
        });
        self.next_start = end;
        self.window.clear();
    }

    /// Emit the trailing partial chunk and assemble the manifest for a file
    /// of the given total hash.
    pub fn finalize(mut self, total_sha1: Sha1Hash) -> FileManifest {
        if !self.window.is_empty() {
            self.emit_window();
        }
        FileManifest {
            size: self.next_start,
            sha1: total_sha1,
            chunks: self.chunks,
        }
    }
}

impl Default for ManifestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(data: &[u8], chunk_size: u64) -> FileManifest {
        let mut builder = ManifestBuilder::with_chunk_size(chunk_size);
        // Feed in uneven pieces to exercise window accumulation.
        for piece in data.chunks(7) {
            builder.update(piece);
        }
        builder.finalize(Sha1Hash::new(data))
    }

    #[test]
    fn test_single_chunk() {
        let data = vec![1u8; 100];
        let manifest = build(&data, 1000);
        assert_eq!(manifest.chunks.len(), 1);
        assert_eq!(manifest.size, 100);
        assert_eq!(manifest.chunks[0].start, 0);
        assert_eq!(manifest.chunks[0].end, 100);
        assert_eq!(manifest.chunks[0].sha1, Sha1Hash::new(&data));
        manifest.validate().unwrap();
    }

    #[test]
    fn test_exact_boundary_has_no_empty_tail() {
        let data = vec![2u8; 2000];
        let manifest = build(&data, 1000);
        assert_eq!(manifest.chunks.len(), 2);
        assert_eq!(
            manifest.chunks.iter().map(|c| (c.start, c.end)).collect::<Vec<_>>(),
            vec![(0, 1000), (1000, 2000)]
        );
    }

    #[test]
    fn test_trailing_remainder() {
        let data = vec![3u8; 2500];
        let manifest = build(&data, 1000);
        assert_eq!(manifest.chunks.len(), 3);
        assert_eq!(manifest.chunks[2].start, 2000);
        assert_eq!(manifest.chunks[2].end, 2500);
        assert_eq!(manifest.chunks[1].sha1, Sha1Hash::new(&data[1000..2000]));
    }

    #[test]
    fn test_validate_rejects_gap() {
        let mut manifest = build(&vec![0u8; 2000], 1000);
        manifest.chunks[1].start = 1001;
        assert!(matches!(
            manifest.validate(),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_validate_rejects_short_middle_chunk() {
        let data = vec![0u8; 2500];
        let mut manifest = build(&data, 1000);
        manifest.chunks[1].end = 1500;
        manifest.chunks[2].start = 1500;
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_parse_roundtrip_canonical() {
        let manifest = build(&vec![4u8; 1500], 1000);
        let bytes = manifest.to_canonical_bytes();
        let parsed = FileManifest::parse(&bytes).unwrap();
        assert_eq!(parsed, manifest);
        // Keys of the canonical form are sorted.
        let s = String::from_utf8(bytes).unwrap();
        assert!(s.starts_with(r#"{"chunks":"#));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(matches!(
            FileManifest::parse(b"{not json"),
            Err(Error::Protocol(_))
        ));
    }
}
