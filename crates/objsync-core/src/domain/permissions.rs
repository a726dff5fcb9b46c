//! Permission flags for the sync manager

use serde::{Deserialize, Serialize};

/// Which operation families the sync manager may perform
///
/// - `write` gates local → remote propagation (upload, update, delete)
/// - `read` gates remote → local propagation (reconciliation, remote events)
///
/// Supplied once at construction and never mutated afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    /// Remote objects may be downloaded / mirrored locally
    pub read: bool,
    /// Local changes may be pushed to the object store
    pub write: bool,
}

impl Permissions {
    /// Both read and write allowed
    pub fn all() -> Self {
        Self {
            read: true,
            write: true,
        }
    }

    /// Mirror the remote store locally, never push
    pub fn read_only() -> Self {
        Self {
            read: true,
            write: false,
        }
    }

    /// Push local changes, never download
    pub fn write_only() -> Self {
        Self {
            read: false,
            write: true,
        }
    }
}

impl Default for Permissions {
    fn default() -> Self {
        Self::all()
    }
}
