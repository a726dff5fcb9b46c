//! Domain types and rules
//!
//! This module contains the core domain types for objsync:
//! - Permission flags governing which operation families are allowed
//! - Remote object records and change events emitted by the object store
//! - Object-name normalization and mapping between names and local paths
//! - Ignore rules for VCS / package-manager directories
//! - Domain-specific error types

pub mod errors;
pub mod ignore;
pub mod object;
pub mod object_name;
pub mod permissions;

// Re-export commonly used types
pub use errors::DomainError;
pub use ignore::{IgnoreRules, PARTIAL_DOWNLOAD_SUFFIX};
pub use object::{ObjectEvent, ObjectEventKind, ObjectMap, ObjectRecord};
pub use object_name::{local_path_for, normalize_object_name, object_name_for};
pub use permissions::Permissions;
