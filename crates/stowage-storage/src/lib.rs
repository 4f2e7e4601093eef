//! Storage providers for stowage
//!
//! - **provider**: the [`StorageProvider`] capability trait, the
//!   [`ProviderKind`] factory and the `object_store` adapter
//! - **s3**: S3 and S3-compatible backends
//! - **registry**: live providers keyed by BackupStorage name, with
//!   configuration-hash change detection
//! - **controller**: the BackupStorage reconciler

#![deny(missing_docs)]

pub mod controller;
pub mod provider;
pub mod registry;
pub mod s3;

pub use provider::{BoxReader, ObjectStoreProvider, ProviderKind, StorageProvider};
pub use registry::ProviderRegistry;
