//! An implementation of [`http-cache-store`][http-cache-store] key/value
//! storage backed by [Redis][redis].
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use http_cache_store::Cache;
//! use http_cache_store_redis::RedisConfig;
//! use http_cache_store_redis::RedisStore;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let store = RedisStore::connect(&RedisConfig {
//!     url: "redis://127.0.0.1:6379/0".to_string(),
//!     ..Default::default()
//! })
//! .await?;
//! let cache = Cache::with_storage(Arc::new(store));
//! # Ok(())
//! # }
//! ```
//!
//! [http-cache-store]: https://github.com/stjude-rust-labs/http-cache-store
//! [redis]: https://redis.io

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![warn(rust_2021_compatibility)]
#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::broken_intra_doc_links)]

use anyhow::Context;
use anyhow::Result;
use bytes::Bytes;
use http_cache_store::storage::KvStore;
use redis::Client;
use redis::aio::ConnectionManager;
use serde::Deserialize;
use tracing::debug;

/// The configuration of a [`RedisStore`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// The Redis connection URL.
    ///
    /// The database is selected by the URL path, e.g.
    /// `redis://127.0.0.1:6379/2`.
    pub url: String,

    /// The prefix added to every key written by the store.
    pub key_prefix: String,

    /// The time to live, in seconds, of every value written by the store.
    ///
    /// Defaults to `None`: values never expire.
    pub ttl_secs: Option<u64>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_string(),
            key_prefix: "http-cache:".to_string(),
            ttl_secs: None,
        }
    }
}

/// A key/value cache storage backed by Redis.
#[derive(Clone)]
pub struct RedisStore {
    /// The Redis connection manager.
    manager: ConnectionManager,
    /// The prefix added to every key.
    prefix: String,
    /// The time to live of every value, in seconds.
    ttl_secs: Option<u64>,
}

impl RedisStore {
    /// Connects to Redis with the given configuration.
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())
            .with_context(|| format!("invalid Redis URL `{url}`", url = config.url))?;

        let manager = ConnectionManager::new(client)
            .await
            .with_context(|| format!("failed to connect to Redis at `{url}`", url = config.url))?;

        debug!(url = config.url, "connected to Redis");
        Ok(Self::from_manager(manager, config))
    }

    /// Constructs a store from an existing connection manager.
    ///
    /// The URL of the configuration is not used.
    pub fn from_manager(manager: ConnectionManager, config: &RedisConfig) -> Self {
        Self {
            manager,
            prefix: config.key_prefix.clone(),
            ttl_secs: config.ttl_secs,
        }
    }

    /// Gets the Redis key for a storage key.
    fn key(&self, key: &str) -> String {
        prefixed_key(&self.prefix, key)
    }
}

/// Joins a key prefix and a storage key.
fn prefixed_key(prefix: &str, key: &str) -> String {
    format!("{prefix}{key}")
}

impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let key = self.key(key);
        let mut conn = self.manager.clone();
        let data: Option<Vec<u8>> = redis::cmd("GET")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("failed to get Redis key `{key}`"))?;

        Ok(data.map(Bytes::from))
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<()> {
        let key = self.key(key);
        let mut conn = self.manager.clone();
        let mut cmd = match self.ttl_secs {
            Some(ttl) => {
                let mut cmd = redis::cmd("SETEX");
                cmd.arg(&key).arg(ttl);
                cmd
            }
            None => {
                let mut cmd = redis::cmd("SET");
                cmd.arg(&key);
                cmd
            }
        };

        cmd.arg(&value[..]);
        let _: () = cmd
            .query_async(&mut conn)
            .await
            .with_context(|| format!("failed to set Redis key `{key}`"))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let key = self.key(key);
        let mut conn = self.manager.clone();
        let _: () = redis::cmd("DEL")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("failed to delete Redis key `{key}`"))?;
        Ok(())
    }
}
