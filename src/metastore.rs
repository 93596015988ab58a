//! Implementation of the metastore.
//!
//! The metastore maps a logical request key to the list of response variants
//! stored for it. Responses may vary on request headers (for example
//! `Accept-Encoding`), so several variants accumulate under one key.
//!
//! ## Layout
//!
//! Each key is stored under `meta:v1:<sha256 of the logical key>` and holds
//! the bincode-encoded variant list, most recently stored variant first.
//!
//! ## Consistency
//!
//! Storing a variant reads the whole list, modifies it and writes it back.
//! The read and the write are not atomic: concurrent stores for the same key
//! may lose one of the updates.

use anyhow::Context;
use anyhow::Result;
use bytes::Bytes;
use http::HeaderMap;
use http::HeaderName;
use http::StatusCode;
use http::Version;
use http::header;
use http::response::Parts;
use http_cache_semantics::CachePolicy;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;
use tracing::warn;

use crate::digest;
use crate::storage::KvStore;

/// The prefix of metastore keys, including the layout version.
const KEY_PREFIX: &str = "meta:v1:";

/// Represents a stored response variant.
///
/// This type is serialized into the metastore.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredVariant {
    /// The request headers named by the response's `Vary` header.
    #[serde(with = "http_serde::header_map")]
    pub request_headers: HeaderMap,

    /// The response's status.
    #[serde(with = "http_serde::status_code")]
    pub status: StatusCode,

    /// The response's version.
    #[serde(with = "http_serde::version")]
    pub version: Version,

    /// The response's headers.
    #[serde(with = "http_serde::header_map")]
    pub response_headers: HeaderMap,

    /// The entitystore digest of the response body.
    pub digest: String,

    /// The last used cache policy.
    pub policy: CachePolicy,
}

impl StoredVariant {
    /// Constructs a new variant for a response to a request with the given
    /// headers.
    ///
    /// Only the request headers named by the response's `Vary` header are
    /// kept.
    pub fn new(
        request_headers: &HeaderMap,
        parts: &Parts,
        policy: CachePolicy,
        digest: impl Into<String>,
    ) -> Self {
        let mut projected = HeaderMap::new();
        for field in vary_fields(&parts.headers) {
            let Ok(name) = HeaderName::from_bytes(field.as_bytes()) else {
                continue;
            };

            for value in request_headers.get_all(&name) {
                projected.append(name.clone(), value.clone());
            }
        }

        Self {
            request_headers: projected,
            status: parts.status,
            version: parts.version,
            response_headers: parts.headers.clone(),
            digest: digest.into(),
            policy,
        }
    }

    /// Gets the lowercased field names of the response's `Vary` header.
    pub fn vary(&self) -> Vec<String> {
        vary_fields(&self.response_headers)
    }

    /// Checks whether a request with the given headers may be served this
    /// variant.
    ///
    /// Every field named by `Vary` must have the same values in the request
    /// as in the request that produced the variant. `Vary: *` never matches.
    pub fn matches(&self, request_headers: &HeaderMap) -> bool {
        self.vary().iter().all(|field| {
            field != "*"
                && self
                    .request_headers
                    .get_all(field.as_str())
                    .iter()
                    .eq(request_headers.get_all(field.as_str()).iter())
        })
    }
}

/// Gets the lowercased field names listed by the `Vary` headers.
pub(crate) fn vary_fields(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::VARY)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|field| field.trim().to_ascii_lowercase())
        .filter(|field| !field.is_empty())
        .collect()
}

/// Selects the variant to serve for a request with the given headers.
///
/// Variants are ordered most recent first, so the most recently stored
/// matching variant is selected.
pub fn select<'a>(
    variants: &'a [StoredVariant],
    request_headers: &HeaderMap,
) -> Option<&'a StoredVariant> {
    variants.iter().find(|v| v.matches(request_headers))
}

/// The metastore.
///
/// Failures of the underlying storage never surface from the public
/// operations; they are logged and degrade to a miss or a skipped write.
#[derive(Debug)]
pub struct MetaStore<S> {
    /// The underlying storage.
    storage: S,
}

impl<S> MetaStore<S>
where
    S: KvStore,
{
    /// Constructs a new metastore over the given storage.
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    /// Gets the underlying storage.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Looks up the variants stored for a key.
    ///
    /// Returns an empty list if nothing is stored for the key, if the storage
    /// fails, or if the stored list cannot be decoded.
    pub async fn lookup(&self, key: &str) -> Vec<StoredVariant> {
        match self.read(key).await {
            Ok(variants) => variants,
            Err(e) => {
                warn!(
                    key,
                    error = format!("{e:?}"),
                    "failed to read from metastore: treating as a miss"
                );
                Vec::new()
            }
        }
    }

    /// Stores a variant for a key.
    ///
    /// Any variant the new one supersedes (same `Vary` fields and matching
    /// request headers) is removed and the new variant is placed first.
    ///
    /// Returns `true` if the variant was written.
    pub async fn store(&self, key: &str, variant: StoredVariant) -> bool {
        let result = self
            .update(key, |mut variants| {
                let vary = variant.vary();
                variants.retain(|v| !(v.vary() == vary && v.matches(&variant.request_headers)));
                variants.insert(0, variant);
                variants
            })
            .await;

        match result {
            Ok(()) => {
                debug!(key, "stored variant in metastore");
                true
            }
            Err(e) => {
                warn!(
                    key,
                    error = format!("{e:?}"),
                    "failed to store variant in metastore"
                );
                false
            }
        }
    }

    /// Purges every variant stored for a key.
    ///
    /// Purging a key that does not exist is not an error.
    pub async fn purge(&self, key: &str) {
        if let Err(e) = self.storage.delete(&physical_key(key)).await {
            warn!(
                key,
                error = format!("{e:?}"),
                "failed to purge key from metastore"
            );
        }
    }

    /// Reads the variant list for a key.
    ///
    /// An undecodable list is treated as empty.
    async fn read(&self, key: &str) -> Result<Vec<StoredVariant>> {
        let physical = physical_key(key);
        let Some(data) = self
            .storage
            .get(&physical)
            .await
            .with_context(|| format!("failed to get metastore entry `{physical}`"))?
        else {
            return Ok(Vec::new());
        };

        match bincode::serde::decode_from_slice::<Vec<StoredVariant>, _>(
            &data,
            bincode::config::standard(),
        ) {
            Ok((variants, _)) => Ok(variants),
            Err(e) => {
                debug!(
                    key,
                    "failed to deserialize metastore entry `{physical}`: {e} (entry will be \
                     ignored)"
                );
                Ok(Vec::new())
            }
        }
    }

    /// Writes the variant list for a key, replacing the previous one.
    async fn write(&self, key: &str, variants: &[StoredVariant]) -> Result<()> {
        let physical = physical_key(key);
        let data = bincode::serde::encode_to_vec(variants, bincode::config::standard())
            .with_context(|| format!("failed to serialize metastore entry `{physical}`"))?;

        self.storage
            .set(&physical, Bytes::from(data))
            .await
            .with_context(|| format!("failed to set metastore entry `{physical}`"))
    }

    /// Replaces the variant list for a key with the result of `f`.
    ///
    /// This is a read followed by a write; a concurrent update of the same
    /// key between the two is overwritten.
    async fn update<F>(&self, key: &str, f: F) -> Result<()>
    where
        F: FnOnce(Vec<StoredVariant>) -> Vec<StoredVariant>,
    {
        let variants = self.read(key).await?;
        self.write(key, &f(variants)).await
    }
}

/// Gets the storage key for a logical key.
fn physical_key(key: &str) -> String {
    format!("{KEY_PREFIX}{hash}", hash = digest::storage_key(key))
}
