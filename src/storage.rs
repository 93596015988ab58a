//! Implementation of cache storage.
//!
//! Both the metastore and the entitystore persist their data through a
//! [`KvStore`]: an opaque string key mapped to an opaque byte value.

use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;

mod memory;

pub use memory::*;

/// A trait implemented on key/value cache storage.
pub trait KvStore: Send + Sync + 'static {
    /// Gets the value for the given key.
    ///
    /// Returns `Ok(None)` if no value exists in the storage for the given
    /// key.
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Bytes>>> + Send;

    /// Sets the value for the given key, replacing any previous value.
    fn set(&self, key: &str, value: Bytes) -> impl Future<Output = Result<()>> + Send;

    /// Deletes the value for the given key.
    ///
    /// Does not return error for unrecognized keys.
    fn delete(&self, key: &str) -> impl Future<Output = Result<()>> + Send;
}

impl<S: KvStore> KvStore for Arc<S> {
    fn get(&self, key: &str) -> impl Future<Output = Result<Option<Bytes>>> + Send {
        self.as_ref().get(key)
    }

    fn set(&self, key: &str, value: Bytes) -> impl Future<Output = Result<()>> + Send {
        self.as_ref().set(key, value)
    }

    fn delete(&self, key: &str) -> impl Future<Output = Result<()>> + Send {
        self.as_ref().delete(key)
    }
}
