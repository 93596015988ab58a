//! Implementation of request key derivation.

use http::HeaderMap;
use http::Method;
use http::Uri;
use http::header;
use http::uri::Authority;

/// Derives the logical cache key for a request.
///
/// The key is made of the request method and the normalized URL:
///
/// * the scheme and host are lowercased, the scheme defaulting to `http`;
/// * the default port of the scheme is dropped;
/// * a URI without an authority uses the `Host` request header;
/// * an empty path becomes `/`;
/// * query parameters are sorted.
///
/// Only the `Host` header is consulted, so header order never affects the
/// key.
pub fn request_key(method: &Method, uri: &Uri, headers: &HeaderMap) -> String {
    let scheme = uri.scheme_str().unwrap_or("http").to_ascii_lowercase();

    let host = match uri.authority() {
        Some(authority) => host(&scheme, authority),
        None => headers
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .map(|value| match value.parse::<Authority>() {
                Ok(authority) => host(&scheme, &authority),
                Err(_) => value.to_ascii_lowercase(),
            })
            .unwrap_or_default(),
    };

    let path = match uri.path() {
        "" => "/",
        path => path,
    };

    let mut key = format!("{method} {scheme}://{host}{path}");
    if let Some(query) = uri.query().filter(|q| !q.is_empty()) {
        let mut params: Vec<_> = query.split('&').filter(|p| !p.is_empty()).collect();
        params.sort_unstable();
        key.push('?');
        key.push_str(&params.join("&"));
    }

    key
}

/// Formats the lowercased host of an authority, keeping the port only when it
/// is not the default port of the scheme.
fn host(scheme: &str, authority: &Authority) -> String {
    let host = authority.host().to_ascii_lowercase();
    match (scheme, authority.port_u16()) {
        ("http", Some(80)) | ("https", Some(443)) | (_, None) => host,
        (_, Some(port)) => format!("{host}:{port}"),
    }
}
