//! Observable handle for a long-running transfer.
//!
//! A [`DataStream`] is shared between the task performing a transfer (the
//! producer, which reports progress and eventually finishes or fails) and
//! any number of observers. The terminal transition happens exactly once:
//! whichever of finish, fail, or cancel lands first wins, and later calls
//! are ignored. Cancellation is cooperative; producers watch for it and
//! are responsible for aborting I/O and removing temp files.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;

use crate::error::Error;

#[derive(Debug, Clone, PartialEq)]
enum Phase {
    Running,
    Finished,
    Failed(Error),
    Cancelled,
}

struct Shared {
    bytes_loaded: AtomicU64,
    size: std::sync::OnceLock<u64>,
    phase: watch::Sender<Phase>,
}

#[derive(Clone)]
pub struct DataStream {
    shared: Arc<Shared>,
}

impl DataStream {
    pub fn new() -> Self {
        let (phase, _) = watch::channel(Phase::Running);
        DataStream {
            shared: Arc::new(Shared {
                bytes_loaded: AtomicU64::new(0),
                size: std::sync::OnceLock::new(),
                phase,
            }),
        }
    }

    pub fn with_size(size: u64) -> Self {
        let stream = Self::new();
        stream.set_size(size);
        stream
    }

    /// A stream that is already complete (used for local cache hits).
    pub fn finished() -> Self {
        let stream = Self::new();
        stream.finish();
        stream
    }

    /// Total size, once known.
    pub fn size(&self) -> Option<u64> {
        self.shared.size.get().copied()
    }

    /// Record the total size when it becomes known. Later calls are no-ops.
    pub fn set_size(&self, size: u64) {
        let _ = self.shared.size.set(size);
    }

    pub fn bytes_loaded(&self) -> u64 {
        self.shared.bytes_loaded.load(Ordering::Relaxed)
    }

    /// Producer side: account `n` more transferred bytes.
    pub fn report_bytes(&self, n: u64) {
        self.shared.bytes_loaded.fetch_add(n, Ordering::Relaxed);
    }

    /// Producer side: set the absolute progress, for producers that
    /// aggregate the progress of child transfers.
    pub fn set_bytes_loaded(&self, n: u64) {
        self.shared.bytes_loaded.store(n, Ordering::Relaxed);
    }

    fn transition(&self, next: Phase) -> bool {
        self.shared.phase.send_if_modified(|phase| {
            if *phase == Phase::Running {
                *phase = next;
                true
            } else {
                false
            }
        })
    }

    /// Producer side: mark successful completion.
    pub fn finish(&self) {
        self.transition(Phase::Finished);
    }

    /// Producer side: mark failure.
    pub fn fail(&self, error: Error) {
        self.transition(Phase::Failed(error));
    }

    /// Consumer side: request cancellation. Has no effect after a terminal
    /// state has been reached.
    pub fn cancel(&self) {
        self.transition(Phase::Cancelled);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.shared.phase.borrow() == Phase::Cancelled
    }

    pub fn is_terminal(&self) -> bool {
        *self.shared.phase.borrow() != Phase::Running
    }

    /// Resolves when the stream is cancelled. Never resolves if the stream
    /// reaches another terminal state first; intended for `select!` arms on
    /// the producer side.
    pub async fn cancelled(&self) {
        let mut rx = self.shared.phase.subscribe();
        loop {
            if *rx.borrow() == Phase::Cancelled {
                return;
            }
            if rx.changed().await.is_err() {
                // Producer and all observers gone; park forever.
                std::future::pending::<()>().await;
            }
        }
    }

    /// Wait for the terminal state. Cancellation surfaces as
    /// [`Error::Cancelled`].
    pub async fn wait(&self) -> Result<(), Error> {
        let mut rx = self.shared.phase.subscribe();
        loop {
            match &*rx.borrow_and_update() {
                Phase::Running => {}
                Phase::Finished => return Ok(()),
                Phase::Failed(e) => return Err(e.clone()),
                Phase::Cancelled => return Err(Error::Cancelled),
            }
            if rx.changed().await.is_err() {
                return Err(Error::transient("stream abandoned without terminal"));
            }
        }
    }
}

impl Default for DataStream {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DataStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataStream")
            .field("bytes_loaded", &self.bytes_loaded())
            .field("size", &self.size())
            .field("phase", &*self.shared.phase.borrow())
            .finish()
    }
}
