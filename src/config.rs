//! Implementation of the cache configuration.

use std::time::Duration;

use http_cache_semantics::CacheOptions;
use serde::Deserialize;

/// The configuration of a [`Cache`](crate::Cache).
///
/// The configuration is passed explicitly when the cache is constructed.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether the cache is shared between users.
    ///
    /// A shared cache does not store responses marked `private` or responses
    /// to authorized requests. Defaults to `true`.
    pub shared: bool,

    /// The freshness lifetime, in seconds, given to responses that declare
    /// neither `Cache-Control` freshness directives nor `Expires`.
    ///
    /// Defaults to `None`, leaving such responses to heuristic freshness.
    pub default_ttl_secs: Option<u64>,

    /// The fraction of a response's age since `Last-Modified` used as its
    /// heuristic freshness lifetime.
    ///
    /// Defaults to `0.1`.
    pub cache_heuristic: f32,

    /// The response headers removed from stored responses.
    ///
    /// The response sent to the client keeps these headers. Defaults to
    /// `set-cookie`.
    pub ignore_headers: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            shared: true,
            default_ttl_secs: None,
            cache_heuristic: 0.1,
            ignore_headers: vec!["set-cookie".to_string()],
        }
    }
}

impl CacheConfig {
    /// Gets the default freshness lifetime.
    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl_secs.map(Duration::from_secs)
    }

    /// Converts the configuration into options for the cache policy.
    pub fn policy_options(&self) -> CacheOptions {
        CacheOptions {
            shared: self.shared,
            cache_heuristic: self.cache_heuristic,
            ..Default::default()
        }
    }
}
