//! Implementation of the in-memory cache storage.
//!
//! The storage has no TTL on the entries and does not perform any automatic
//! evictions; it lives as long as the process.

use std::collections::HashMap;

use anyhow::Result;
use bytes::Bytes;
use tokio::sync::RwLock;

use crate::storage::KvStore;

/// A key/value storage held in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    /// The stored values.
    entries: RwLock<HashMap<String, Bytes>>,
}

impl MemoryStore {
    /// Constructs a new, empty memory storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets the number of stored values.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Checks whether the storage holds no values.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Gets the stored keys in no particular order.
    pub async fn keys(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }
}

impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }
}
