//! objsync Sync - Bidirectional local directory ↔ object store synchronization
//!
//! Provides:
//! - Per-key serialized / globally exclusive task queueing
//! - ETag-compatible content fingerprints with busy-file retry
//! - The sync manager propagating local and remote changes
//! - A debounced, pausable filesystem watch source
//!
//! ## Modules
//!
//! - [`queueing`] - Keyed and global task queues with ordering guarantees
//! - [`fingerprint`] - Chunked MD5 fingerprints and file/record equality
//! - [`manager`] - `SyncManager`: permission checks, reconciliation, remote events
//! - [`watcher`] - notify-based watcher, initial scan and debounce queue
//! - [`pause`] - Reference-counted pause gate for the watch source
//! - [`pump`] - Event loop feeding settled local events into the manager

pub mod fingerprint;
pub mod manager;
pub mod pause;
pub mod pump;
pub mod queueing;
pub mod watcher;

use std::fmt;

use objsync_core::domain::errors::DomainError;
use thiserror::Error;

pub use manager::SyncManager;
pub use queueing::{Completion, Queueing};

/// Errors that can occur during synchronization operations
#[derive(Debug, Error)]
pub enum SyncError {
    /// An I/O error occurred during file operations
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// A file stayed busy/locked after every retry attempt
    #[error(transparent)]
    Aggregate(#[from] AggregateError),

    /// The object store adapter failed
    #[error("Object store error: {0}")]
    Store(#[from] anyhow::Error),

    /// A domain-level error propagated from objsync-core
    #[error("Domain error: {0}")]
    DomainError(#[from] DomainError),

    /// A queued task panicked or was cancelled
    #[error("Task panicked: {0}")]
    TaskPanicked(String),

    /// The queue worker is gone and can no longer run or report tasks
    #[error("Queue closed")]
    QueueClosed,

    /// `sync()` was called before a watch control was set
    #[error("Watch control not wired: reconciliation cannot pause the watch source")]
    WatchNotWired,
}

/// Every distinct failure seen across the attempts of a retried operation
///
/// Causes are de-duplicated by their message text, in first-seen order.
#[derive(Debug)]
pub struct AggregateError {
    pub attempts: u32,
    pub causes: Vec<std::io::Error>,
}

impl AggregateError {
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts,
            causes: Vec::new(),
        }
    }

    /// Record a cause unless an error with the same message is already present
    pub fn push(&mut self, err: std::io::Error) {
        let message = err.to_string();
        if !self.causes.iter().any(|c| c.to_string() == message) {
            self.causes.push(err);
        }
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "all {} attempts failed", self.attempts)?;
        for (i, cause) in self.causes.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{sep}{cause}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

#[cfg(test)]
mod tests {
    use std::io::{Error, ErrorKind};

    use super::*;

    #[test]
    fn test_aggregate_dedups_by_message() {
        let mut agg = AggregateError::new(3);
        agg.push(Error::new(ErrorKind::WouldBlock, "resource busy"));
        agg.push(Error::new(ErrorKind::WouldBlock, "resource busy"));
        agg.push(Error::new(ErrorKind::Other, "text file busy"));
        assert_eq!(agg.causes.len(), 2);
        assert_eq!(
            agg.to_string(),
            "all 3 attempts failed: resource busy; text file busy"
        );
    }

    #[test]
    fn test_sync_error_from_anyhow() {
        let err: SyncError = anyhow::anyhow!("bucket unreachable").into();
        assert!(matches!(err, SyncError::Store(_)));
        assert_eq!(err.to_string(), "Object store error: bucket unreachable");
    }
}
