//! Cache key derivation.
//!
//! Keys have the form `cacheable-request:<METHOD>:<url>[:<body hash>]`.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::request::{RequestBody, RequestDescriptor};

/// Namespace prefixed to every key.
pub const KEY_PREFIX: &str = "cacheable-request";

/// Canonical identifier of a cacheable request's equivalence class.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Format the request target as it appears in a cache key.
///
/// A missing, empty or bare `/` path is dropped so that `http://host` and
/// `http://host/` share a key; every other path is kept verbatim.
pub fn request_url(desc: &RequestDescriptor) -> String {
    let mut url = format!("{}//", desc.protocol_str());

    if let Some(auth) = desc.auth.as_deref().filter(|a| !a.is_empty()) {
        url.push_str(auth);
        url.push('@');
    }

    url.push_str(desc.host_str());

    if let Some(port) = desc.explicit_port() {
        url.push(':');
        url.push_str(&port.to_string());
    }

    match desc.path.as_deref() {
        None | Some("") | Some("/") => {}
        Some(path) => url.push_str(path),
    }

    url
}

/// Hash a finite request body for use as a key suffix.
pub fn body_hash(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    hex::encode(hasher.finalize())
}

/// Compute the cache key for a request.
///
/// Returns `None` when the request carries a streamed body: its content cannot be
/// known up front, so the request is never cached.
pub fn cache_key(desc: &RequestDescriptor) -> Option<CacheKey> {
    if desc.has_stream_body() {
        return None;
    }

    let mut key = format!("{KEY_PREFIX}:{}:{}", desc.method_str(), request_url(desc));
    if let Some(RequestBody::Bytes(bytes)) = &desc.body {
        key.push(':');
        key.push_str(&body_hash(bytes));
    }

    Some(CacheKey(key))
}
