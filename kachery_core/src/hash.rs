//! The content hash type used by kachery (SHA-1, 20 bytes).

use sha1::{Digest, Sha1};
use std::fmt;
use subtle::ConstantTimeEq;

/// A SHA-1 content hash, rendered as 40 lowercase hex characters on the
/// wire and on disk.
#[derive(Clone, Copy, Eq, Hash)]
pub struct Sha1Hash([u8; 20]);

impl Sha1Hash {
    /// The size of the hash in bytes.
    pub const SIZE: usize = 20;

    /// Calculate the hash of the provided bytes.
    pub fn new(buf: impl AsRef<[u8]>) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(buf.as_ref());
        Sha1Hash(hasher.finalize().into())
    }

    /// Bytes of the hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Create a `Sha1Hash` from its raw bytes representation.
    pub const fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Parse a 40-character lowercase hex string.
    pub fn from_hex(s: &str) -> Result<Self, Sha1HashParseError> {
        if s.len() != 40 {
            return Err(Sha1HashParseError::InvalidLength(s.len()));
        }
        let bytes = hex::decode(s).map_err(|_| Sha1HashParseError::InvalidHex)?;
        let mut arr = [0u8; 20];
        arr.copy_from_slice(&bytes);
        Ok(Sha1Hash(arr))
    }

    /// Convert the hash to a lowercase hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First three hex-pair prefixes, used for directory fan-out.
    pub fn fanout_prefixes(&self) -> (String, String, String) {
        let h = self.to_hex();
        (h[0..2].to_owned(), h[2..4].to_owned(), h[4..6].to_owned())
    }

    /// Hex of the first 5 bytes for a friendly short representation.
    pub fn fmt_short(&self) -> String {
        hex::encode(&self.0[..5])
    }
}

/// Equality runs in constant time; digests are compared against untrusted
/// input during ingest verification.
impl PartialEq for Sha1Hash {
    fn eq(&self, other: &Self) -> bool {
        bool::from(self.0.ct_eq(&other.0))
    }
}

impl fmt::Debug for Sha1Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Sha1Hash").field(&self.to_hex()).finish()
    }
}

impl fmt::Display for Sha1Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl AsRef<[u8]> for Sha1Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; 20]> for Sha1Hash {
    fn from(value: [u8; 20]) -> Self {
        Sha1Hash(value)
    }
}

impl From<Sha1Hash> for [u8; 20] {
    fn from(value: Sha1Hash) -> Self {
        value.0
    }
}

impl std::str::FromStr for Sha1Hash {
    type Err = Sha1HashParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Sha1Hash::from_hex(s)
    }
}

impl serde::Serialize for Sha1Hash {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> serde::Deserialize<'de> for Sha1Hash {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Sha1Hash::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Sha1HashParseError {
    #[error("invalid sha1 hex length: expected 40, got {0}")]
    InvalidLength(usize),

    #[error("invalid sha1 hex")]
    InvalidHex,
}

/// Incremental SHA-1, for hashing streams without buffering them.
pub struct Sha1Hasher(Sha1);

impl Sha1Hasher {
    pub fn new() -> Self {
        Sha1Hasher(Sha1::new())
    }

    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    pub fn finalize(self) -> Sha1Hash {
        Sha1Hash(self.0.finalize().into())
    }
}

impl Default for Sha1Hasher {
    fn default() -> Self {
        Self::new()
    }
}
