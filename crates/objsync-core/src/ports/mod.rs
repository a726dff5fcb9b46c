//! Port definitions (hexagonal architecture interfaces)
//!
//! This module defines the port traits that form the boundaries of the
//! hexagonal architecture. Ports are interfaces that the sync engine
//! depends on, but whose implementations live in adapter crates.
//!
//! ## Ports Overview
//!
//! - [`IObjectStore`] - Remote object storage (S3, MinIO)
//! - [`IObjectEventListener`] - Receiver of remote change notifications
//! - [`IWatchControl`] - Pause/resume of the local watch source

pub mod object_store;
pub mod watch_control;

pub use object_store::{IObjectEventListener, IObjectStore};
pub use watch_control::IWatchControl;
