//! objsync S3 - S3 / MinIO object store adapter
//!
//! Provides:
//! - [`S3ObjectStore`], the `IObjectStore` implementation backed by `aws-sdk-s3`
//! - A remote-change poller that turns bucket listings into object events
//!
//! ## Modules
//!
//! - [`store`] - Bucket setup, object map, upload/download/delete
//! - [`poller`] - Periodic re-listing and change dispatch

pub mod poller;
pub mod store;

pub use poller::RemotePoller;
pub use store::S3ObjectStore;

use objsync_sync::SyncError;
use thiserror::Error;

/// Errors raised by the S3 adapter
#[derive(Debug, Error)]
pub enum S3Error {
    /// A request to the object service failed
    #[error("S3 {op} failed: {message}")]
    Request {
        /// Operation name, e.g. `put_object`
        op: &'static str,
        message: String,
    },

    /// A listed object carried no ETag
    #[error("No ETag on object {0}")]
    MissingETag(String),

    /// The object is not present in the object map
    #[error("{op}: object {name} not found")]
    UnknownObject { op: &'static str, name: String },

    /// A multipart upload was created without an upload id
    #[error("No upload id returned for multipart upload of {0}")]
    MissingUploadId(String),

    #[error("Invalid endpoint configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Computing the local fingerprint failed
    #[error("Fingerprint error: {0}")]
    Fingerprint(#[from] SyncError),
}

impl S3Error {
    /// Wrap an SDK error with its full source chain
    pub(crate) fn request<E>(op: &'static str, err: E) -> Self
    where
        E: std::error::Error,
    {
        Self::Request {
            op,
            message: aws_sdk_s3::error::DisplayErrorContext(err).to_string(),
        }
    }
}
