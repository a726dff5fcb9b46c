//! objsync Core - Domain types, ports and configuration
//!
//! This crate contains the hexagonal core shared by the sync engine and its
//! adapters:
//! - **Domain types** - `Permissions`, `ObjectRecord`, `ObjectEvent`, object-name rules
//! - **Port definitions** - `IObjectStore`, `IObjectEventListener`, `IWatchControl`
//! - **Configuration** - YAML-backed `Config` with validation and a builder
//!
//! # Architecture
//!
//! The domain module has no I/O. Ports define the trait interfaces the sync
//! engine depends on; the S3 adapter and the filesystem watch source
//! implement them in their own crates.

pub mod config;
pub mod domain;
pub mod ports;
