// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Storage collaborator.
//!
//! A key-value store keyed by `(collection, key)`. The node keeps app
//! manifests, engine profiles, runlists and deployable code blobs here:
//!
//! - `manifests/<app>`: app manifest document
//! - `profiles/<profile>`: engine policy document
//! - `runlists/<runlist>`: map of app name to profile name
//! - `apps/<app>`: opaque code blob handed to the isolate
//!
//! Both failure modes are recoverable at the caller: `not_found` and
//! `unavailable` skip the affected app at boot and fail only the affected
//! operation at runtime.

mod memory;

pub use memory::MemoryStorage;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Collection holding app manifest documents.
pub const COLLECTION_MANIFESTS: &str = "manifests";
/// Collection holding engine profile documents.
pub const COLLECTION_PROFILES: &str = "profiles";
/// Collection holding runlist documents.
pub const COLLECTION_RUNLISTS: &str = "runlists";
/// Collection holding deployable app code blobs.
pub const COLLECTION_APPS: &str = "apps";

/// Errors from storage operations.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// The object does not exist.
    #[error("'{collection}/{key}' not found")]
    NotFound { collection: String, key: String },

    /// The backend is temporarily unreachable.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    pub fn not_found(collection: &str, key: &str) -> Self {
        Self::NotFound {
            collection: collection.to_string(),
            key: key.to_string(),
        }
    }
}

/// Capability set for the storage collaborator.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Fetch one object.
    async fn get(&self, collection: &str, key: &str) -> Result<Bytes, StorageError>;

    /// Store one object, replacing any previous value.
    async fn put(&self, collection: &str, key: &str, blob: Bytes) -> Result<(), StorageError>;

    /// List the keys of a collection.
    async fn list(&self, collection: &str) -> Result<Vec<String>, StorageError>;
}
