//! Implementation of the ETag middleware.
//!
//! The middleware stamps every response leaving the application handler with
//! a strong validator derived from the response body, unless the response
//! already carries one.
//!
//! Stamping requires the whole body in memory: the body is buffered, hashed
//! and handed on as a buffered body with identical bytes.

use std::io;

use http::HeaderMap;
use http::HeaderValue;
use http::Response;
use http::StatusCode;
use http::header;
use http_body::Body as _;
use tracing::debug;

use crate::body::Body;
use crate::body::HttpBody;
use crate::digest;

/// Options for the ETag middleware.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ETagOptions {
    /// Whether responses that never carry a body (1xx, 204 and 304) are left
    /// without a validator.
    ///
    /// Defaults to `true`.
    pub skip_bodyless: bool,
    /// Whether bodies of unknown length are passed through without a
    /// validator instead of being buffered.
    ///
    /// Defaults to `false`.
    pub skip_streaming: bool,
}

impl Default for ETagOptions {
    fn default() -> Self {
        Self {
            skip_bodyless: true,
            skip_streaming: false,
        }
    }
}

/// The ETag middleware.
#[derive(Debug, Default, Clone, Copy)]
pub struct ETag {
    /// The middleware options.
    options: ETagOptions,
}

impl ETag {
    /// Constructs a new ETag middleware with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Constructs a new ETag middleware with the given options.
    pub fn new_with_options(options: ETagOptions) -> Self {
        Self { options }
    }

    /// Gets the options of the middleware.
    pub fn options(&self) -> &ETagOptions {
        &self.options
    }

    /// Stamps the response with a validator if it lacks one.
    ///
    /// Returns an error if the body could not be read in full.
    pub async fn stamp<B: HttpBody>(
        &self,
        response: Response<Body<B>>,
    ) -> io::Result<Response<Body<B>>> {
        if response.headers().contains_key(header::ETAG) {
            return Ok(response);
        }

        if self.options.skip_bodyless && is_bodyless(response.status()) {
            return Ok(response);
        }

        if self.options.skip_streaming && response.body().size_hint().upper().is_none() {
            debug!(
                status = response.status().as_u16(),
                "response body has no known length: skipping validator"
            );
            return Ok(response);
        }

        let (mut parts, body) = response.into_parts();
        let data = body.collect().await?;
        let etag = digest::etag(&data);
        parts.headers.insert(
            header::ETAG,
            HeaderValue::from_str(&etag).expect("digest should be a valid header value"),
        );

        Ok(Response::from_parts(parts, Body::from_bytes(data)))
    }
}

/// Answers a conditional request from a response's validator.
///
/// If the request's `If-None-Match` header matches the `ETag` of a `200 OK`
/// response, the response is replaced with a `304 Not Modified` response
/// without a body. Other headers are kept.
pub fn not_modified<B: HttpBody>(
    request_headers: &HeaderMap,
    response: Response<Body<B>>,
) -> Response<Body<B>> {
    if response.status() != StatusCode::OK {
        return response;
    }

    let matches = response
        .headers()
        .get(header::ETAG)
        .is_some_and(|etag| if_none_match(request_headers, etag));
    if !matches {
        return response;
    }

    let (mut parts, _) = response.into_parts();
    parts.status = StatusCode::NOT_MODIFIED;
    parts.headers.remove(header::CONTENT_LENGTH);
    Response::from_parts(parts, Body::empty())
}

/// Checks if a status code never carries a response body.
fn is_bodyless(status: StatusCode) -> bool {
    status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
}

/// Strips the weak indicator from an entity tag.
fn opaque(tag: &str) -> &str {
    tag.trim().strip_prefix("W/").unwrap_or(tag.trim())
}

/// Checks whether the request's `If-None-Match` header matches the given
/// entity tag.
///
/// Uses the weak comparison function; `*` matches any tag.
pub fn if_none_match(request_headers: &HeaderMap, etag: &HeaderValue) -> bool {
    let Ok(etag) = etag.to_str() else {
        return false;
    };

    let etag = opaque(etag);
    request_headers
        .get_all(header::IF_NONE_MATCH)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(opaque)
        .any(|candidate| candidate == "*" || candidate == etag)
}
