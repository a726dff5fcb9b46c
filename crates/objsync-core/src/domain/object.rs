//! Remote object records and change events
//!
//! An [`ObjectRecord`] is the object-store adapter's belief about one remote
//! object. The adapter owns the map of records; the sync manager only reads
//! snapshots of it.

use std::collections::HashMap;
use std::fmt;

/// Adapter's view of one remote object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRecord {
    /// Normalized object name (relative, `/`-separated)
    pub name: String,
    /// Object size in bytes
    pub size: u64,
    /// Content fingerprint (ETag-compatible), `None` when the store did not report one
    pub fingerprint: Option<String>,
}

impl ObjectRecord {
    pub fn new(name: impl Into<String>, size: u64, fingerprint: Option<String>) -> Self {
        Self {
            name: name.into(),
            size,
            fingerprint,
        }
    }
}

/// Snapshot of the adapter's object map: name → record
pub type ObjectMap = HashMap<String, ObjectRecord>;

/// Kind of remote change reported by the object store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectEventKind {
    /// An object was created or overwritten remotely
    Created,
    /// An object was removed remotely
    Deleted,
}

impl fmt::Display for ObjectEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectEventKind::Created => write!(f, "created"),
            ObjectEventKind::Deleted => write!(f, "deleted"),
        }
    }
}

/// A remote change notification, transient and never persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectEvent {
    pub kind: ObjectEventKind,
    pub object_name: String,
}

impl ObjectEvent {
    pub fn created(object_name: impl Into<String>) -> Self {
        Self {
            kind: ObjectEventKind::Created,
            object_name: object_name.into(),
        }
    }

    pub fn deleted(object_name: impl Into<String>) -> Self {
        Self {
            kind: ObjectEventKind::Deleted,
            object_name: object_name.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_constructors() {
        let created = ObjectEvent::created("a.txt");
        assert_eq!(created.kind, ObjectEventKind::Created);
        assert_eq!(created.object_name, "a.txt");

        let deleted = ObjectEvent::deleted("dir/b.txt");
        assert_eq!(deleted.kind, ObjectEventKind::Deleted);
        assert_eq!(deleted.object_name, "dir/b.txt");
    }

    #[test]
    fn test_event_kind_display() {
        assert_eq!(ObjectEventKind::Created.to_string(), "created");
        assert_eq!(ObjectEventKind::Deleted.to_string(), "deleted");
    }
}
