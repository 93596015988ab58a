//! Implementation of the request pipeline.
//!
//! A request enters the [`Cache`] first. When the cache needs a response from
//! the application, the request is passed to the [`Handler`]; the handler's
//! response is stamped by the [`ETag`] middleware, answered against the
//! request's `If-None-Match` header and then flows back through the cache.

use anyhow::Result;
use http::HeaderMap;
use http::Method;
use http::Response;
use http::Uri;
use http::Version;

use crate::body::Body;
use crate::body::HttpBody;
use crate::cache::Cache;
use crate::cache::Request;
use crate::etag;
use crate::etag::ETag;
use crate::storage::KvStore;

/// A trait implemented on application handlers.
///
/// The trait is implemented for async functions and closures taking an
/// [`http::Request`] and returning a response.
pub trait Handler<Q, B>: Send + Sync {
    /// Handles a request.
    fn call(&self, request: http::Request<Q>) -> impl Future<Output = Result<Response<B>>> + Send;
}

impl<F, Fut, Q, B> Handler<Q, B> for F
where
    F: Fn(http::Request<Q>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Response<B>>> + Send,
{
    fn call(&self, request: http::Request<Q>) -> impl Future<Output = Result<Response<B>>> + Send {
        self(request)
    }
}

/// Represents a request flowing through the pipeline.
struct PipelineRequest<'a, H, Q> {
    /// The request sent to the pipeline.
    request: http::Request<Q>,
    /// The application handler.
    handler: &'a H,
    /// The ETag middleware.
    etag: &'a ETag,
}

impl<H, Q, B> Request<B> for PipelineRequest<'_, H, Q>
where
    H: Handler<Q, B>,
    Q: Send,
    B: HttpBody,
{
    fn version(&self) -> Version {
        self.request.version()
    }

    fn method(&self) -> &Method {
        self.request.method()
    }

    fn uri(&self) -> &Uri {
        self.request.uri()
    }

    fn headers(&self) -> &HeaderMap {
        self.request.headers()
    }

    async fn send(mut self, headers: Option<HeaderMap>) -> Result<Response<Body<B>>> {
        // Override the specified headers
        if let Some(headers) = headers {
            self.request.headers_mut().extend(headers);
        }

        let request_headers = self.request.headers().clone();
        let response = self.handler.call(self.request).await?;
        let response = self.etag.stamp(response.map(Body::from_upstream)).await?;
        Ok(etag::not_modified(&request_headers, response))
    }
}

/// The composed request pipeline: cache, ETag middleware and handler.
pub struct Pipeline<H, M, E> {
    /// The HTTP cache.
    cache: Cache<M, E>,
    /// The ETag middleware.
    etag: ETag,
    /// The application handler.
    handler: H,
}

impl<H, M, E> Pipeline<H, M, E>
where
    M: KvStore,
    E: KvStore,
{
    /// Constructs a new pipeline.
    pub fn new(cache: Cache<M, E>, etag: ETag, handler: H) -> Self {
        Self {
            cache,
            etag,
            handler,
        }
    }

    /// Gets the cache of the pipeline.
    pub fn cache(&self) -> &Cache<M, E> {
        &self.cache
    }

    /// Gets the application handler of the pipeline.
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Sends a request through the pipeline.
    ///
    /// Returns an error if the handler fails on a request that cannot be
    /// served from the cache, or if a response body cannot be read.
    pub async fn call<Q, B>(&self, request: http::Request<Q>) -> Result<Response<Body<B>>>
    where
        H: Handler<Q, B>,
        Q: Send,
        B: HttpBody,
    {
        self.cache
            .send(PipelineRequest {
                request,
                handler: &self.handler,
                etag: &self.etag,
            })
            .await
    }
}
