// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory storage backend.
//!
//! Used by tests and embedded deployments. The `set_unavailable` switch
//! simulates a backend outage for the boot-reconciliation paths.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;

use super::{Storage, StorageError};

/// Memory-backed storage.
#[derive(Default)]
pub struct MemoryStorage {
    objects: RwLock<HashMap<(String, String), Bytes>>,
    unavailable: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize a document as JSON and store it. Convenience for seeding
    /// manifests, profiles and runlists.
    pub fn put_json<T: Serialize>(&self, collection: &str, key: &str, document: &T) {
        let blob = serde_json::to_vec(document).expect("document serialization failed");
        self.objects
            .write()
            .expect("storage poisoned")
            .insert((collection.to_string(), key.to_string()), Bytes::from(blob));
    }

    /// Flip the simulated-outage switch.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StorageError::Unavailable("memory storage offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, collection: &str, key: &str) -> Result<Bytes, StorageError> {
        self.check_available()?;
        self.objects
            .read()
            .expect("storage poisoned")
            .get(&(collection.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| StorageError::not_found(collection, key))
    }

    async fn put(&self, collection: &str, key: &str, blob: Bytes) -> Result<(), StorageError> {
        self.check_available()?;
        self.objects
            .write()
            .expect("storage poisoned")
            .insert((collection.to_string(), key.to_string()), blob);
        Ok(())
    }

    async fn list(&self, collection: &str) -> Result<Vec<String>, StorageError> {
        self.check_available()?;
        let mut keys: Vec<String> = self
            .objects
            .read()
            .expect("storage poisoned")
            .keys()
            .filter(|(c, _)| c == collection)
            .map(|(_, k)| k.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}
