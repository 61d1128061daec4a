//! Error kinds surfaced by the storage, download, and feed layers.

/// Result alias for fallible kachery operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The failure classes a caller can act on.
///
/// `Error` is `Clone` so that terminal states can be broadcast through
/// watch channels to every observer of a [`DataStream`](crate::DataStream).
/// Callers decide retry policy: `Transient` failures are retried at bounded
/// scope, everything else propagates.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Resource absent. Surfaced to the caller, never logged as a warning.
    #[error("not found: {0}")]
    NotFound(String),

    /// Hash mismatch, bad signature, or a broken subfeed chain. The
    /// operation is aborted, temp files are deleted, and nothing is
    /// auto-repaired.
    #[error("integrity violation: {0}")]
    IntegrityViolation(String),

    /// A declared precondition did not hold (link size/mtime mismatch,
    /// out-of-order append).
    #[error("precondition failure: {0}")]
    PreconditionFailure(String),

    /// Network or I/O failure that may succeed on retry.
    #[error("transient: {0}")]
    Transient(String),

    /// Malformed payload or a message on the wrong pubsub sub-channel.
    /// Dropped with a warning at the boundary.
    #[error("protocol: {0}")]
    Protocol(String),

    /// Consumer-initiated cancellation. Not logged; temp files are
    /// cleaned up.
    #[error("cancelled")]
    Cancelled,
}

impl Error {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    pub fn integrity(msg: impl Into<String>) -> Self {
        Error::IntegrityViolation(msg.into())
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        Error::PreconditionFailure(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        Error::Transient(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// True for failures worth another attempt within a bounded budget.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(e.to_string()),
            _ => Error::Transient(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Protocol(e.to_string())
    }
}
