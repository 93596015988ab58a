//! Implementation of the content-hash primitives.

use sha1::Digest;
use sha1::Sha1;
use sha2::Sha256;

/// Computes the strong validator for a response body.
///
/// The validator is the lowercase hexadecimal SHA-1 digest of the exact body
/// bytes, wrapped in double quotes.
pub fn etag(data: &[u8]) -> String {
    let digest = Sha1::digest(data);
    format!("\"{digest}\"", digest = hex::encode(digest))
}

/// Computes the content digest used to reference a body in the entitystore.
pub fn content_digest(data: &[u8]) -> String {
    hex::encode(blake3::hash(data).as_bytes())
}

/// Hashes a logical cache key into a fixed-length storage key.
pub(crate) fn storage_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}
