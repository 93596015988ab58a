//! Implementation of the HTTP cache.

use std::fmt;
use std::time::SystemTime;

use anyhow::Result;
use bytes::Bytes;
use http::HeaderMap;
use http::HeaderName;
use http::HeaderValue;
use http::Method;
use http::Response;
use http::StatusCode;
use http::Uri;
use http::Version;
use http::header;
use http::header::CACHE_CONTROL;
use http::response::Parts;
use http_cache_semantics::AfterResponse;
use http_cache_semantics::BeforeRequest;
use http_cache_semantics::CacheOptions;
use http_cache_semantics::CachePolicy;
use tracing::debug;
use tracing::warn;

use crate::body::Body;
use crate::body::HttpBody;
use crate::config::CacheConfig;
use crate::entitystore::EntityStore;
use crate::etag;
use crate::key::request_key;
use crate::metastore;
use crate::metastore::MetaStore;
use crate::metastore::StoredVariant;
use crate::storage::KvStore;

/// The name of the `x-cache-lookup` custom header.
///
/// Value will be `HIT` if a response existed in cache, `MISS` if not.
pub const X_CACHE_LOOKUP: &str = "x-cache-lookup";

/// The name of the `x-cache` custom header.
///
/// Value will be `HIT` if a response was served from the cache, `MISS` if not.
pub const X_CACHE: &str = "x-cache";

/// The name of the `x-cache-digest` custom header.
///
/// Value will be the entitystore digest of a body served from the cache.
pub const X_CACHE_DIGEST: &str = "x-cache-digest";

/// Represents a basic cache lookup status.
///
/// Used in the custom header `x-cache-lookup`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CacheLookupStatus {
    /// A response exists in the cache.
    Hit,
    /// A response does not exist in the cache.
    Miss,
}

impl fmt::Display for CacheLookupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hit => write!(f, "HIT"),
            Self::Miss => write!(f, "MISS"),
        }
    }
}

/// Represents a cache status.
///
/// Used in the custom header `x-cache`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CacheStatus {
    /// The response was served from the cache.
    Hit,
    /// The response was not served from the cache.
    Miss,
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hit => write!(f, "HIT"),
            Self::Miss => write!(f, "MISS"),
        }
    }
}

/// An extension trait for [`Response`].
trait ResponseExt {
    /// Adds a warning header to the response.
    fn add_warning(&mut self, uri: &Uri, code: usize, message: &str);

    /// Sets the cache status headers of the response.
    fn set_cache_status(&mut self, lookup: CacheLookupStatus, status: CacheStatus);
}

impl<B> ResponseExt for Response<B> {
    fn add_warning(&mut self, uri: &Uri, code: usize, message: &str) {
        // warning    = "warning" ":" 1#warning-value
        // warning-value = warn-code SP warn-agent SP warn-text [SP warn-date]
        // warn-code  = 3DIGIT
        // warn-agent = ( host [ ":" port ] ) | pseudonym
        // warn-text  = quoted-string
        // warn-date  = <"> HTTP-date <">
        // (https://tools.ietf.org/html/rfc2616#section-14.46)
        let agent = uri.host().unwrap_or("-");
        if let Ok(value) = HeaderValue::from_str(&format!(
            "{code} {agent} {message:?} \"{date}\"",
            date = httpdate::fmt_http_date(SystemTime::now())
        )) {
            self.headers_mut().insert(header::WARNING, value);
        }
    }

    fn set_cache_status(&mut self, lookup: CacheLookupStatus, status: CacheStatus) {
        self.headers_mut().insert(
            X_CACHE_LOOKUP,
            lookup.to_string().parse().expect("value should parse"),
        );
        self.headers_mut().insert(
            X_CACHE,
            status.to_string().parse().expect("value should parse"),
        );
    }
}

/// An abstraction of an HTTP request entering the cache.
///
/// Sending the request runs everything behind the cache: the application
/// handler and any middleware wrapped around it.
pub trait Request<B: HttpBody>: Send {
    /// Gets the request's version.
    fn version(&self) -> Version;

    /// Gets the request's method.
    fn method(&self) -> &Method;

    /// Gets the request's URI.
    fn uri(&self) -> &Uri;

    /// Gets the request's headers.
    fn headers(&self) -> &HeaderMap;

    /// Sends the request to the application handler and gets the response.
    ///
    /// If `headers` is `Some`, the supplied headers should override any
    /// matching headers in the original request.
    fn send(
        self,
        headers: Option<HeaderMap>,
    ) -> impl Future<Output = Result<Response<Body<B>>>> + Send;
}

/// Provides an implementation of `RequestLike` for `http-cache-semantics`.
struct RequestLike {
    /// The request method.
    method: Method,
    /// The request URI.
    uri: Uri,
    /// The request headers.
    headers: HeaderMap,
}

impl RequestLike {
    /// Constructs a new `RequestLike` for the given request.
    fn new<R: Request<B>, B: HttpBody>(request: &R) -> Self {
        // Unfortunate we have to clone the header map here
        Self {
            method: request.method().clone(),
            uri: request.uri().clone(),
            headers: request.headers().clone(),
        }
    }

    /// Checks whether the request method allows reading from and writing to
    /// the cache.
    fn is_cacheable_method(&self) -> bool {
        matches!(self.method, Method::GET | Method::HEAD)
    }
}

impl http_cache_semantics::RequestLike for RequestLike {
    fn uri(&self) -> Uri {
        // Note: URI is cheaply cloned
        self.uri.clone()
    }

    fn is_same_uri(&self, other: &Uri) -> bool {
        self.uri.eq(other)
    }

    fn method(&self) -> &Method {
        &self.method
    }

    fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

/// Represents a variant selected from the cache along with its body.
struct StoredResponse {
    /// The selected variant.
    variant: StoredVariant,
    /// The variant's body.
    body: Bytes,
}

impl StoredResponse {
    /// Builds a response from the stored variant with the given headers.
    fn into_response<B: HttpBody>(self, headers: HeaderMap) -> Response<Body<B>> {
        let mut response = Response::new(Body::from_bytes(self.body));
        *response.status_mut() = self.variant.status;
        *response.version_mut() = self.variant.version;
        *response.headers_mut() = headers;
        if let Ok(value) = HeaderValue::from_str(&self.variant.digest) {
            response.headers_mut().insert(X_CACHE_DIGEST, value);
        }
        response
    }
}

/// Implement a HTTP cache.
///
/// Response metadata lives in a [`MetaStore`] and response bodies in an
/// [`EntityStore`]; failures of either are logged and the request is served
/// as if uncached.
pub struct Cache<M, E> {
    /// The metastore.
    metastore: MetaStore<M>,
    /// The entitystore.
    entitystore: EntityStore<E>,
    /// The cache configuration.
    config: CacheConfig,
    /// The cache policy options derived from the configuration.
    options: CacheOptions,
}

impl<S> Cache<S, S>
where
    S: KvStore + Clone,
{
    /// Construct a new cache keeping both metadata and bodies in the given
    /// storage.
    pub fn with_storage(storage: S) -> Self {
        Self::new(MetaStore::new(storage.clone()), EntityStore::new(storage))
    }
}

impl<M, E> Cache<M, E>
where
    M: KvStore,
    E: KvStore,
{
    /// Construct a new cache with the given stores.
    ///
    /// Defaults to a shared cache.
    pub fn new(metastore: MetaStore<M>, entitystore: EntityStore<E>) -> Self {
        Self::new_with_config(metastore, entitystore, CacheConfig::default())
    }

    /// Construct a new cache with the given stores and configuration.
    pub fn new_with_config(
        metastore: MetaStore<M>,
        entitystore: EntityStore<E>,
        config: CacheConfig,
    ) -> Self {
        let options = config.policy_options();
        Self {
            metastore,
            entitystore,
            config,
            options,
        }
    }

    /// Gets the metastore used by the cache.
    pub fn metastore(&self) -> &MetaStore<M> {
        &self.metastore
    }

    /// Gets the entitystore used by the cache.
    pub fn entitystore(&self) -> &EntityStore<E> {
        &self.entitystore
    }

    /// Gets the configuration of the cache.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Sends a HTTP request through the cache.
    ///
    /// If a previous response is cached and not stale, the request is not sent
    /// upstream and the cached response is returned.
    ///
    /// If a previous response is cached and is stale, the response is
    /// revalidated, the cache is updated, and the cached response returned.
    ///
    /// If a previous response is not in the cache, the request is sent upstream
    /// and the response is cached, if it is cacheable.
    ///
    /// Errors from the cache storage never fail the request.
    pub async fn send<B: HttpBody>(&self, request: impl Request<B>) -> Result<Response<Body<B>>> {
        let method = request.method();
        let uri = request.uri();

        let key = request_key(method, uri, request.headers());
        if matches!(*method, Method::GET | Method::HEAD) {
            let variants = self.metastore.lookup(&key).await;
            match metastore::select(&variants, request.headers()) {
                Some(variant) => match self.entitystore.read(&variant.digest).await {
                    Ok(Some(body)) => {
                        debug!(
                            method = method.as_str(),
                            path = uri.path(),
                            key,
                            digest = variant.digest,
                            "cache hit"
                        );
                        let stored = StoredResponse {
                            variant: variant.clone(),
                            body,
                        };
                        return self.conditional_send_upstream(key, request, stored).await;
                    }
                    Ok(None) => {
                        debug!(
                            method = method.as_str(),
                            path = uri.path(),
                            key,
                            digest = variant.digest,
                            "stored body is missing: treating as not cached"
                        );
                    }
                    Err(e) => {
                        warn!(
                            method = method.as_str(),
                            path = uri.path(),
                            key,
                            error = format!("{e:?}"),
                            "failed to get body from storage: treating as not cached"
                        );
                    }
                },
                None => {
                    debug!(
                        method = method.as_str(),
                        path = uri.path(),
                        key,
                        variants = variants.len(),
                        "cache miss"
                    );
                }
            }
        }

        self.send_upstream(key, request, CacheLookupStatus::Miss)
            .await
    }

    /// Sends the original request upstream.
    ///
    /// Caches the response if the response is cacheable.
    async fn send_upstream<B: HttpBody>(
        &self,
        key: String,
        request: impl Request<B>,
        lookup_status: CacheLookupStatus,
    ) -> Result<Response<Body<B>>> {
        let request_like: RequestLike = RequestLike::new(&request);

        let mut response = request.send(None).await?;
        let policy = self.policy(&request_like, &response);
        if request_like.is_cacheable_method() && is_storable(&response, &policy) {
            let mut response = self.store(&key, &request_like, response, policy).await?;
            response.set_cache_status(lookup_status, CacheStatus::Miss);
            return Ok(response);
        }

        debug!(
            method = request_like.method.as_str(),
            path = request_like.uri.path(),
            key,
            status = response.status().as_u16(),
            "response is not cacheable"
        );

        if !request_like.method.is_safe() {
            // If the request is not safe, assume the resource has been modified and delete
            // any cached responses we may have for HEAD/GET
            for method in [Method::HEAD, Method::GET] {
                let key = request_key(&method, &request_like.uri, &request_like.headers);
                self.metastore.purge(&key).await;
            }
        }

        response.set_cache_status(lookup_status, CacheStatus::Miss);
        Ok(response)
    }

    /// Performs a conditional send to upstream.
    ///
    /// If a cached request is still fresh, it is returned.
    ///
    /// If a cached request is stale, an attempt is made to revalidate it.
    async fn conditional_send_upstream<B: HttpBody>(
        &self,
        key: String,
        request: impl Request<B>,
        stored: StoredResponse,
    ) -> Result<Response<Body<B>>> {
        let request_like = RequestLike::new(&request);

        let headers = match stored
            .variant
            .policy
            .before_request(&request_like, SystemTime::now())
        {
            BeforeRequest::Fresh(parts) => {
                // The cached response is still fresh, return it
                debug!(
                    method = request_like.method.as_str(),
                    path = request_like.uri.path(),
                    key,
                    digest = stored.variant.digest,
                    "response is still fresh: responding with body from storage"
                );

                let mut response = stored.into_response::<B>(parts.headers);
                response.set_cache_status(CacheLookupStatus::Hit, CacheStatus::Hit);
                return Ok(etag::not_modified(&request_like.headers, response));
            }
            BeforeRequest::Stale {
                request: http::request::Parts { headers, .. },
                matches,
            } => {
                // Cached response is stale and needs to be revalidated
                if matches { Some(headers) } else { None }
            }
        };

        debug!(
            method = request_like.method.as_str(),
            path = request_like.uri.path(),
            key,
            "response is stale: sending request upstream for validation"
        );

        // Revalidate the request
        match request.send(headers).await {
            Ok(mut response) if response.status().is_success() => {
                debug!(
                    method = request_like.method.as_str(),
                    path = request_like.uri.path(),
                    key,
                    "server responded with a new response"
                );

                // The server responded with the body, the cached body is no longer valid
                let policy = self.policy(&request_like, &response);
                if !is_storable(&response, &policy) {
                    self.metastore.purge(&key).await;
                    response.set_cache_status(CacheLookupStatus::Hit, CacheStatus::Miss);
                    return Ok(response);
                }

                let mut response = self.store(&key, &request_like, response, policy).await?;
                response.set_cache_status(CacheLookupStatus::Hit, CacheStatus::Miss);
                Ok(response)
            }
            Ok(response) if response.status() == StatusCode::NOT_MODIFIED => {
                debug!(
                    method = request_like.method.as_str(),
                    path = request_like.uri.path(),
                    key,
                    "server responded with a not modified status"
                );

                // The server informed us that our response hasn't been modified
                // Note that the response body for this code is always empty
                match stored
                    .variant
                    .policy
                    .after_response(&request_like, &response, SystemTime::now())
                {
                    AfterResponse::Modified(..) => {
                        // The 304 response did not carry the validators of the stored response,
                        // so the stored policy can't be refreshed; serve the stored body as
                        // stale and revalidate again next time
                        debug!(
                            method = request_like.method.as_str(),
                            path = request_like.uri.path(),
                            key,
                            "cached response was considered modified despite revalidation \
                             replying with not modified"
                        );

                        let headers = stored.variant.response_headers.clone();
                        let mut response = stored.into_response::<B>(headers);
                        Self::prepare_stale_response(&request_like.uri, &mut response);
                        Ok(response)
                    }
                    AfterResponse::NotModified(policy, parts) => {
                        let parts = self.storable_parts(&parts);
                        let variant = StoredVariant::new(
                            &request_like.headers,
                            &parts,
                            policy,
                            stored.variant.digest.clone(),
                        );

                        if self.metastore.store(&key, variant).await {
                            debug!(
                                method = request_like.method.as_str(),
                                path = request_like.uri.path(),
                                key,
                                digest = stored.variant.digest,
                                "response updated in cache successfully"
                            );
                        }

                        // The body comes from storage
                        let mut response = stored.into_response::<B>(parts.headers);
                        response.set_cache_status(CacheLookupStatus::Hit, CacheStatus::Hit);
                        Ok(etag::not_modified(&request_like.headers, response))
                    }
                }
            }
            Ok(response)
                if response.status().is_server_error()
                    && !must_revalidate(&stored.variant.response_headers) =>
            {
                debug!(
                    method = request_like.method.as_str(),
                    path = request_like.uri.path(),
                    key,
                    digest = stored.variant.digest,
                    "failed to revalidate response: serving potentially stale body from storage \
                     with a warning"
                );

                let headers = stored.variant.response_headers.clone();
                let mut response = stored.into_response::<B>(headers);
                Self::prepare_stale_response(&request_like.uri, &mut response);
                Ok(response)
            }
            Ok(mut response) => {
                debug!(
                    method = request_like.method.as_str(),
                    path = request_like.uri.path(),
                    key,
                    status = response.status().as_u16(),
                    "failed to revalidate response: returning response from server uncached"
                );

                // Otherwise, don't serve the cached response at all
                response.set_cache_status(CacheLookupStatus::Hit, CacheStatus::Miss);
                Ok(response)
            }
            Err(e) => {
                if must_revalidate(&stored.variant.response_headers) {
                    Err(e)
                } else {
                    debug!(
                        method = request_like.method.as_str(),
                        path = request_like.uri.path(),
                        key,
                        digest = stored.variant.digest,
                        error = format!("{e:?}"),
                        "failed to revalidate response: serving potentially stale body from \
                         storage with a warning"
                    );

                    let headers = stored.variant.response_headers.clone();
                    let mut response = stored.into_response::<B>(headers);
                    Self::prepare_stale_response(&request_like.uri, &mut response);
                    Ok(response)
                }
            }
        }
    }

    /// Stores a response in the cache.
    ///
    /// The body is read in full; an error reading it is returned. Failing to
    /// write to the stores is logged and the response is still returned.
    async fn store<B: HttpBody>(
        &self,
        key: &str,
        request_like: &RequestLike,
        response: Response<Body<B>>,
        policy: CachePolicy,
    ) -> Result<Response<Body<B>>> {
        let (parts, body) = response.into_parts();
        let body = body.collect().await?;

        match self.entitystore.write(&body).await {
            Ok(digest) => {
                let stored = self.storable_parts(&parts);
                let variant = StoredVariant::new(&request_like.headers, &stored, policy, digest);
                if self.metastore.store(key, variant).await {
                    debug!(
                        method = request_like.method.as_str(),
                        path = request_like.uri.path(),
                        key,
                        "response stored in cache"
                    );
                }
            }
            Err(e) => {
                warn!(
                    method = request_like.method.as_str(),
                    path = request_like.uri.path(),
                    key,
                    error = format!("{e:?}"),
                    "failed to put body into cache storage"
                );
            }
        }

        Ok(Response::from_parts(parts, Body::from_bytes(body)))
    }

    /// Creates the cache policy for a response.
    ///
    /// The policy is built from the headers as they would be stored.
    fn policy<B>(&self, request_like: &RequestLike, response: &Response<B>) -> CachePolicy {
        let mut head = Response::new(());
        *head.status_mut() = response.status();
        *head.version_mut() = response.version();
        *head.headers_mut() = self.storable_headers(response.status(), response.headers());
        CachePolicy::new_options(request_like, &head, SystemTime::now(), self.options)
    }

    /// Gets the response parts that are written to the metastore.
    fn storable_parts(&self, parts: &Parts) -> Parts {
        let (mut stored, _) = Response::new(()).into_parts();
        stored.status = parts.status;
        stored.version = parts.version;
        stored.headers = self.storable_headers(parts.status, &parts.headers);
        stored
    }

    /// Gets the copy of the headers that is written to the metastore.
    ///
    /// The configured ignored headers are removed and successful responses
    /// get the default freshness lifetime. The response sent to the client is
    /// left untouched.
    fn storable_headers(&self, status: StatusCode, headers: &HeaderMap) -> HeaderMap {
        let mut headers = headers.clone();
        for name in &self.config.ignore_headers {
            if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
                headers.remove(name);
            }
        }

        if status.is_success() {
            self.apply_default_ttl(&mut headers);
        }

        headers
    }

    /// Gives a response without explicit freshness the configured default
    /// freshness lifetime.
    fn apply_default_ttl(&self, headers: &mut HeaderMap) {
        let Some(ttl) = self.config.default_ttl() else {
            return;
        };

        let explicit = headers.contains_key(header::EXPIRES)
            || headers
                .get_all(CACHE_CONTROL)
                .iter()
                .filter_map(|value| value.to_str().ok())
                .flat_map(|value| value.split(','))
                .map(|directive| directive.trim().to_ascii_lowercase())
                .any(|directive| {
                    directive.starts_with("max-age")
                        || directive.starts_with("s-maxage")
                        || directive == "no-cache"
                        || directive == "no-store"
                        || directive == "private"
                });
        if explicit {
            return;
        }

        headers.append(
            CACHE_CONTROL,
            format!("max-age={secs}", secs = ttl.as_secs())
                .parse()
                .expect("value should parse"),
        );
    }

    /// Prepares a stale response for sending back to the client.
    fn prepare_stale_response<B>(uri: &Uri, response: &mut Response<Body<B>>) {
        // If the server failed to give us a response, add the required warning to the
        // cached response:
        //   111 Revalidation failed
        //   MUST be included if a cache returns a stale response
        //   because an attempt to revalidate the response failed,
        //   due to an inability to reach the server.
        // (https://tools.ietf.org/html/rfc2616#section-14.46)
        response.add_warning(uri, 111, "Revalidation failed");
        response.set_cache_status(CacheLookupStatus::Hit, CacheStatus::Hit);
    }
}

/// Checks whether a response may be written to the cache.
///
/// A response varying on `*` never matches a later request, so it is not
/// stored.
fn is_storable<B>(response: &Response<B>, policy: &CachePolicy) -> bool {
    response.status().is_success()
        && policy.is_storable()
        && !metastore::vary_fields(response.headers())
            .iter()
            .any(|field| field == "*")
}

/// Checks if the Cache-Control header contains the must-revalidate directive.
fn must_revalidate(headers: &HeaderMap) -> bool {
    headers.get(CACHE_CONTROL).is_some_and(|val| {
        val.to_str()
            .unwrap_or("")
            .to_lowercase()
            .contains("must-revalidate")
    })
}
