use std::io;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors surfaced by the cachetable.
#[derive(Debug, Error)]
pub enum CacheError {
    /// A fetch or flush callback failed with an I/O error.
    #[error("IO: {0}")]
    Io(#[from] io::Error),
    /// Nonblocking operation hit contention; release coarse locks and retry.
    #[error("try again")]
    TryAgain,
    /// The requested pair or file is not available.
    #[error("not found")]
    NotFound,
    /// A pair with the same key is already resident.
    #[error("already exists")]
    AlreadyExists,
    /// The table hit a fatal checkpoint failure and refuses further work.
    #[error("cachetable panicked: {0}")]
    Panicked(String),
    /// The file or table has been closed.
    #[error("closed")]
    Closed,
    /// The API was used incorrectly.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// The API was used incorrectly (owned message).
    #[error("invalid argument: {0}")]
    InvalidOwned(String),
}

impl CacheError {
    /// Returns true for conditions the caller is expected to retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CacheError::TryAgain)
    }
}

/// Write-once fatal state shared by every entry point.
#[derive(Default)]
pub(crate) struct PanicState {
    reason: Mutex<Option<String>>,
}

impl PanicState {
    /// Records `reason` unless a failure is already stored.
    pub(crate) fn set(&self, reason: String) {
        let mut slot = self.reason.lock();
        if slot.is_none() {
            error!(reason = %reason, "cachetable.panic");
            *slot = Some(reason);
        }
    }

    /// Fails with the stored reason once the table has panicked.
    pub(crate) fn check(&self) -> Result<()> {
        match self.reason.lock().as_ref() {
            Some(reason) => Err(CacheError::Panicked(reason.clone())),
            None => Ok(()),
        }
    }

    pub(crate) fn reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }
}
