//! An implementation of an HTTP response cache with content-derived
//! validators, built on `http-cache-semantics`.
//!
//! The crate is made of two cooperating layers:
//!
//! * The [`ETag`] middleware stamps every response leaving the application
//!   handler with a strong validator (a quoted SHA-1 digest of the body),
//!   unless the response already carries one.
//! * The [`Cache`] answers requests from previously stored responses. Response
//!   metadata is kept in a [`MetaStore`](metastore::MetaStore) keyed by the
//!   request, and bodies in an [`EntityStore`](entitystore::EntityStore) keyed
//!   by their content digest. Stale responses are revalidated with the
//!   application handler using `If-None-Match`.
//!
//! Both stores persist through the [`KvStore`](storage::KvStore) trait. An
//! in-memory implementation is provided; a Redis implementation lives in the
//! `http-cache-store-redis` crate.
//!
//! The [`Pipeline`] composes the cache, the ETag middleware and an
//! application [`Handler`]:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use http_cache_store::Buffered;
//! use http_cache_store::Cache;
//! use http_cache_store::ETag;
//! use http_cache_store::Pipeline;
//! use http_cache_store::http::Request;
//! use http_cache_store::http::Response;
//! use http_cache_store::storage::MemoryStore;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let cache = Cache::with_storage(Arc::new(MemoryStore::new()));
//! let pipeline = Pipeline::new(cache, ETag::new(), |_: Request<()>| async {
//!     anyhow::Ok(
//!         Response::builder()
//!             .header("cache-control", "max-age=60")
//!             .body(Buffered::from("Hello, world!"))?,
//!     )
//! });
//!
//! let request = Request::get("http://example.com/").body(())?;
//! let response = pipeline.call(request).await?;
//! assert!(response.headers().contains_key("etag"));
//! # Ok(())
//! # }
//! ```
//!
//! Failures of the cache storage never fail a request: the request is served
//! by the application handler as if nothing was cached.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![warn(rust_2021_compatibility)]
#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::broken_intra_doc_links)]

mod body;
mod cache;
mod config;
pub mod digest;
pub mod entitystore;
mod etag;
mod key;
pub mod metastore;
mod pipeline;
pub mod storage;

pub use body::*;
pub use cache::*;
pub use config::*;
pub use etag::*;
pub use key::*;
pub use pipeline::*;
// Re-export the http crate.
pub use http;
// Re-export the http-body crate.
pub use http_body;
// Re-export the semantics crate
pub use http_cache_semantics as semantics;
