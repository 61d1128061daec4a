//! Core kachery protocol types and crypto.
//!
//! This crate defines the shared types used by all kachery crates.
//!
//! ## Protocol types (wire-stable)
//!
//! The following modules define on-the-wire and on-disk formats:
//!
//! - Content hashes (`hash::Sha1Hash`)
//! - File identity and chunk manifests (`file_key::FileKey`,
//!   `manifest::FileManifest`)
//! - Signed subfeed messages (`feed::SignedSubfeedMessage`)
//! - The canonical JSON form (`canonical`) that is the pre-image for every
//!   signature and for manifest bytes
//!
//! These types appear in bucket objects and pubsub payloads shared with
//! other nodes; changes to them are protocol changes.
//!
//! ## Convenience APIs (non-wire)
//!
//! - Ed25519 keypair handling (`keys::KeyPair`)
//! - The observable `DataStream` handle used for long-running transfers
//! - The `error::Error` kinds surfaced by the storage and feed layers

pub mod canonical;
pub mod data_stream;
pub mod error;
pub mod feed;
pub mod file_key;
pub mod hash;
pub mod keys;
pub mod manifest;

pub use data_stream::DataStream;
pub use error::{Error, Result};
pub use feed::{FeedId, SignedSubfeedMessage, SubfeedHash, SubfeedMessageBody};
pub use file_key::{ChunkOf, FileKey};
pub use hash::{Sha1Hash, Sha1Hasher};
pub use keys::{KeyPair, NodeId, Signature};
pub use manifest::{CHUNK_SIZE, FileManifest, ManifestBuilder, ManifestChunk};
