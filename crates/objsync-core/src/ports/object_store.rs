//! Object store port (driven/secondary port)
//!
//! This module defines the interface the sync engine uses to talk to the
//! remote object store. The primary implementation targets S3-compatible
//! stores (MinIO, AWS S3) in the `objsync-s3` crate; tests use in-memory
//! implementations.
//!
//! ## Design Notes
//!
//! - Uses `anyhow::Result` because errors at port boundaries are adapter-specific
//!   and don't need domain-level classification.
//! - Uses `#[async_trait]` for async trait methods.
//! - Object names passed in are already normalized by the caller
//!   (see [`normalize_object_name`](crate::domain::normalize_object_name));
//!   adapters normalize again at their own boundary.

use std::path::Path;
use std::sync::Weak;

use crate::domain::{ObjectEvent, ObjectMap, ObjectRecord};

/// Receiver of remote change notifications
///
/// The object store holds a single listener. It is registered as a `Weak`
/// reference so the store does not keep its consumer alive.
#[async_trait::async_trait]
pub trait IObjectEventListener: Send + Sync {
    /// Handle one remote change
    async fn on_object_event(&self, event: ObjectEvent) -> anyhow::Result<()>;
}

/// Port trait for remote object storage
///
/// The adapter owns the object map: its belief of what exists remotely,
/// keyed by object name. Upload/update/delete keep the map current before
/// the remote call completes so that the echo of our own change is
/// recognised.
#[async_trait::async_trait]
pub trait IObjectStore: Send + Sync {
    /// Snapshot of the current object map
    async fn objects(&self) -> ObjectMap;

    /// Whether the object map currently lists `name`
    async fn has_object(&self, name: &str) -> bool;

    /// The record for `name`, if known
    async fn get_object(&self, name: &str) -> Option<ObjectRecord>;

    /// Upload a local file as a new object
    ///
    /// # Arguments
    /// * `name` - Object name
    /// * `path` - Local file to read
    async fn upload(&self, name: &str, path: &Path) -> anyhow::Result<()>;

    /// Overwrite an existing object
    ///
    /// # Errors
    /// Fails when the object is not known to the store.
    async fn update(&self, name: &str, path: &Path) -> anyhow::Result<()>;

    /// Remove an existing object
    ///
    /// # Errors
    /// Fails when the object is not known to the store.
    async fn delete(&self, name: &str) -> anyhow::Result<()>;

    /// Download an object to the given local path, creating parent directories
    async fn download(&self, name: &str, path: &Path) -> anyhow::Result<()>;

    /// Register the single change listener, replacing any previous one
    fn set_event_listener(&self, listener: Weak<dyn IObjectEventListener>);

    /// Remove every object and the backing bucket/container
    async fn remove_all(&self) -> anyhow::Result<()>;
}
