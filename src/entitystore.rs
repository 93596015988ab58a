//! Implementation of the entitystore.
//!
//! Response bodies are stored apart from their metadata, under
//! `body:<digest>` where the digest is computed from the body itself.
//! Identical bodies stored for different requests or variants therefore
//! share a single entry.

use anyhow::Context;
use anyhow::Result;
use bytes::Bytes;
use tracing::debug;

use crate::digest;
use crate::storage::KvStore;

/// The prefix of entitystore keys.
const KEY_PREFIX: &str = "body:";

/// The entitystore.
#[derive(Debug)]
pub struct EntityStore<S> {
    /// The underlying storage.
    storage: S,
}

impl<S> EntityStore<S>
where
    S: KvStore,
{
    /// Constructs a new entitystore over the given storage.
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    /// Gets the underlying storage.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Writes a body to the store.
    ///
    /// Returns the digest referencing the body.
    pub async fn write(&self, body: &Bytes) -> Result<String> {
        let digest = digest::content_digest(body);
        self.storage
            .set(&physical_key(&digest), body.clone())
            .await
            .with_context(|| format!("failed to store body `{digest}`"))?;
        Ok(digest)
    }

    /// Reads the body referenced by a digest.
    ///
    /// Returns `Ok(None)` if the body is not present or if its content no
    /// longer matches the digest.
    pub async fn read(&self, digest: &str) -> Result<Option<Bytes>> {
        let Some(body) = self
            .storage
            .get(&physical_key(digest))
            .await
            .with_context(|| format!("failed to get body `{digest}`"))?
        else {
            return Ok(None);
        };

        if digest::content_digest(&body) != digest {
            debug!("body `{digest}` does not match its digest: treating as not present");
            return Ok(None);
        }

        Ok(Some(body))
    }

    /// Purges the body referenced by a digest.
    ///
    /// Purging a body that does not exist is not an error.
    pub async fn purge(&self, digest: &str) -> Result<()> {
        self.storage
            .delete(&physical_key(digest))
            .await
            .with_context(|| format!("failed to purge body `{digest}`"))
    }
}

/// Gets the storage key for a body digest.
fn physical_key(digest: &str) -> String {
    format!("{KEY_PREFIX}{digest}")
}
