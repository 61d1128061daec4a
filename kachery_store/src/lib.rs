//! Local content-addressed storage for the kachery daemon.
//!
//! Files are keyed by SHA-1 and live in a hex-pair fan-out tree under the
//! storage directory; there is no side-car index. Ingest is single-pass
//! (hash + chunk manifest + optional install), installs are atomic, and
//! deletions only ever move content into a parallel trash tree.

pub mod link;
pub mod manager;
pub mod paths;

pub use link::{LinkFile, LinkStat, MTIME_TOLERANCE_MS};
pub use manager::{ByteStream, FoundFile, IngestOutcome, KacheryStorageManager};
